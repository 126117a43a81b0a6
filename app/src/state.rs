use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use screen_capture::{CandidateList, CaptureBackend, CaptureSession, DisplayMetrics, FfmpegBackend, RecordingConfig};
use serde::{Deserialize, Serialize};

/// User settings, read from `settings.json`. Missing fields take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub output_folder: PathBuf,
    /// Grabber input for ffmpeg (None = platform default)
    pub capture_target: Option<String>,
    /// Display size to capture (None = query the platform)
    pub display_size: Option<DisplayMetrics>,
    pub candidate_widths: CandidateList,
    pub fps: u32,
    pub video_bitrate: u32,
    pub capture_cursor: bool,
    pub ffmpeg_path: Option<PathBuf>,
    pub stop_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let recording = RecordingConfig::default();
        Self {
            output_folder: default_output_folder(),
            capture_target: None,
            display_size: None,
            candidate_widths: recording.candidates,
            fps: recording.fps,
            video_bitrate: recording.video_bitrate,
            capture_cursor: recording.capture_cursor,
            ffmpeg_path: None,
            stop_grace_ms: recording.stop_grace.as_millis() as u64,
        }
    }
}

impl Settings {
    /// Load from `path`, or from the default location when `path` is None.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match default_settings_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if required {
                anyhow::bail!("Settings file {:?} does not exist", path);
            }
            debug!("No settings at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings {:?}", path))?;
        let settings = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid settings file {:?}", path))?;
        info!("📄 Loaded settings from {:?}", path);
        Ok(settings)
    }

    pub fn recording_config(&self) -> RecordingConfig {
        RecordingConfig {
            output_dir: self.output_folder.clone(),
            candidates: self.candidate_widths.clone(),
            fps: self.fps,
            video_bitrate: self.video_bitrate,
            capture_cursor: self.capture_cursor,
            ffmpeg_path: self.ffmpeg_path.clone(),
            stop_grace: std::time::Duration::from_millis(self.stop_grace_ms),
            ..RecordingConfig::default()
        }
    }
}

/// Application state for one recorder process
pub struct AppState<B: CaptureBackend = FfmpegBackend> {
    pub settings: Settings,
    pub session: CaptureSession<B>,
}

impl AppState {
    pub fn new(settings: Settings) -> Result<Self> {
        let backend = FfmpegBackend::new(settings.recording_config());
        Self::with_backend(settings, backend)
    }
}

impl<B: CaptureBackend> AppState<B> {
    pub fn with_backend(settings: Settings, backend: B) -> Result<Self> {
        let session = CaptureSession::new(backend, settings.recording_config())
            .context("Failed to start capture worker")?;
        Ok(Self { settings, session })
    }
}

/// Default output folder: `ScreenRecorder` under the user's videos folder
/// (`~/Movies` on macOS).
pub fn default_output_folder() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|p| p.join("Videos")))
        .map(|p| p.join("ScreenRecorder"))
        .unwrap_or_else(|| PathBuf::from("ScreenRecorder"))
}

pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("screen-recorder").join("settings.json"))
}
