// ffmpeg-driven capture backend
//
// The encoder is an ffmpeg process writing H.264 into an MP4 container. The
// platform screen grabber (x11grab / avfoundation / gdigrab) is its capture
// source, scaled to the encoder size so the whole display is mirrored.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::backend::{CaptureBackend, CaptureToken, EncoderRequest};
use crate::{BackendError, DisplayMetrics, RecordingConfig, Resolution};

/// How long a freshly spawned recorder must stay up before it counts as started.
const STARTUP_CHECK: Duration = Duration::from_millis(300);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[cfg(target_os = "macos")]
const COMMON_PATHS: &[&str] = &[
    "/opt/homebrew/bin/ffmpeg",
    "/usr/local/bin/ffmpeg",
    "/opt/local/bin/ffmpeg",
];
#[cfg(not(target_os = "macos"))]
const COMMON_PATHS: &[&str] = &["/usr/local/bin/ffmpeg", "/usr/bin/ffmpeg"];

/// Screen grabbers understood by ffmpeg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Grabber {
    X11,
    AvFoundation,
    Gdi,
}

impl Grabber {
    fn native() -> Option<Self> {
        if cfg!(target_os = "linux") {
            Some(Grabber::X11)
        } else if cfg!(target_os = "macos") {
            Some(Grabber::AvFoundation)
        } else if cfg!(target_os = "windows") {
            Some(Grabber::Gdi)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct GrabInput {
    grabber: Grabber,
    target: String,
    display: DisplayMetrics,
}

/// A prepared ffmpeg encoder; the recording process exists once started.
pub struct FfmpegEncoder {
    binary: PathBuf,
    request: EncoderRequest,
    input: Option<GrabInput>,
    child: Option<Child>,
}

impl FfmpegEncoder {
    pub fn resolution(&self) -> Resolution {
        self.request.resolution
    }

    pub fn is_started(&self) -> bool {
        self.child.is_some()
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            warn!("⚠️  ffmpeg encoder dropped without release; killing pid {}", child.id());
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// The grabber attached to an encoder.
#[derive(Debug)]
pub struct FfmpegBinding {
    target: String,
}

pub struct FfmpegBackend {
    config: RecordingConfig,
    binary: Option<PathBuf>,
}

impl FfmpegBackend {
    pub fn new(config: RecordingConfig) -> Self {
        Self { config, binary: None }
    }

    fn binary(&mut self) -> Result<PathBuf, BackendError> {
        if let Some(binary) = &self.binary {
            return Ok(binary.clone());
        }
        let binary = locate_ffmpeg(self.config.ffmpeg_path.as_deref())?;
        self.binary = Some(binary.clone());
        Ok(binary)
    }
}

impl CaptureBackend for FfmpegBackend {
    type Encoder = FfmpegEncoder;
    type Binding = FfmpegBinding;

    fn acquire_encoder(&mut self, request: &EncoderRequest) -> Result<FfmpegEncoder, BackendError> {
        let binary = self.binary()?;
        debug!("Probing ffmpeg encoder at {}", request.resolution);

        let output = Command::new(&binary)
            .args(probe_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| BackendError::EncoderUnavailable {
                reason: format!("cannot run {:?}: {}", binary, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("probe encode failed")
                .to_string();
            return Err(BackendError::EncoderRejected {
                resolution: request.resolution.to_string(),
                reason,
            });
        }

        Ok(FfmpegEncoder {
            binary,
            request: request.clone(),
            input: None,
            child: None,
        })
    }

    fn bind_capture_source(
        &mut self,
        encoder: &mut FfmpegEncoder,
        token: &CaptureToken,
        display: DisplayMetrics,
    ) -> Result<FfmpegBinding, BackendError> {
        let grabber = Grabber::native().ok_or_else(|| BackendError::CaptureSource {
            reason: "no ffmpeg screen grabber for this platform".into(),
        })?;
        let target = token.as_str().trim();
        if target.is_empty() {
            return Err(BackendError::CaptureSource {
                reason: "capture token names no input".into(),
            });
        }

        encoder.input = Some(GrabInput {
            grabber,
            target: target.to_string(),
            display,
        });
        Ok(FfmpegBinding {
            target: target.to_string(),
        })
    }

    fn start(&mut self, encoder: &mut FfmpegEncoder) -> Result<(), BackendError> {
        let input = encoder.input.as_ref().ok_or_else(|| BackendError::CaptureSource {
            reason: "encoder has no capture source bound".into(),
        })?;
        let args = recording_args(input, &encoder.request);
        debug!("ffmpeg {}", args.join(" "));

        let mut child = Command::new(&encoder.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        std::thread::sleep(STARTUP_CHECK);
        if let Some(status) = child.try_wait()? {
            return Err(BackendError::EncoderExited {
                reason: format!("recorder exited during startup ({})", status),
            });
        }

        info!("▶️  ffmpeg recording pid {} -> {:?}", child.id(), encoder.request.output_path);
        encoder.child = Some(child);
        Ok(())
    }

    fn check(&mut self, encoder: &mut FfmpegEncoder) -> Result<(), BackendError> {
        let Some(child) = encoder.child.as_mut() else {
            return Ok(());
        };
        match child.try_wait()? {
            Some(status) => Err(BackendError::EncoderExited {
                reason: status.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn release_binding(&mut self, encoder: &mut FfmpegEncoder, binding: FfmpegBinding) -> Result<(), BackendError> {
        debug!("Detaching capture source {}", binding.target);
        encoder.input = None;

        let Some(child) = encoder.child.as_mut() else {
            return Ok(());
        };
        // 'q' makes ffmpeg stop grabbing and finalize the file.
        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(b"q") {
                Ok(()) => debug!("Sent 'q' to ffmpeg pid {}", child.id()),
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    debug!("ffmpeg pid {} already closed its input", child.id())
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn release_encoder(&mut self, mut encoder: FfmpegEncoder) -> Result<(), BackendError> {
        let Some(mut child) = encoder.child.take() else {
            remove_unfinished(&encoder.request.output_path);
            return Ok(());
        };

        drop(child.stdin.take());
        let deadline = Instant::now() + self.config.stop_grace;
        loop {
            if let Some(status) = child.try_wait()? {
                info!("⏹️  ffmpeg pid {} exited: {}", child.id(), status);
                return if status.success() {
                    Ok(())
                } else {
                    Err(BackendError::EncoderExited {
                        reason: status.to_string(),
                    })
                };
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        warn!("⚠️  ffmpeg pid {} still running after {:?}; killing", child.id(), self.config.stop_grace);
        child.kill()?;
        child.wait()?;
        Ok(())
    }
}

fn remove_unfinished(path: &Path) {
    if path.exists() {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed unfinished output {:?}", path),
            Err(e) => warn!("⚠️  Failed to remove unfinished output {:?}: {}", path, e),
        }
    }
}

fn runs(binary: &Path) -> bool {
    Command::new(binary)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Configured path first, then well-known install locations, then `PATH`.
fn locate_ffmpeg(configured: Option<&Path>) -> Result<PathBuf, BackendError> {
    if let Some(path) = configured {
        if runs(path) {
            info!("Using configured ffmpeg: {:?}", path);
            return Ok(path.to_path_buf());
        }
        return Err(BackendError::EncoderUnavailable {
            reason: format!("configured ffmpeg {:?} does not run", path),
        });
    }

    for candidate in COMMON_PATHS {
        let path = PathBuf::from(candidate);
        if path.exists() && runs(&path) {
            info!("Using ffmpeg: {:?}", path);
            return Ok(path);
        }
    }

    let on_path = PathBuf::from("ffmpeg");
    if runs(&on_path) {
        info!("Using ffmpeg from PATH");
        return Ok(on_path);
    }

    Err(BackendError::EncoderUnavailable {
        reason: "ffmpeg not found; install it or set ffmpeg_path".into(),
    })
}

fn base_args() -> Vec<String> {
    ["-hide_banner", "-nostats", "-loglevel", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn codec_args(request: &EncoderRequest) -> Vec<String> {
    vec![
        "-c:v".into(),
        "libx264".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-b:v".into(),
        request.video_bitrate.to_string(),
        "-r".into(),
        request.fps.to_string(),
    ]
}

/// One-frame encode of a synthetic source at the requested size.
fn probe_args(request: &EncoderRequest) -> Vec<String> {
    let Resolution { width, height } = request.resolution;
    let mut args = base_args();
    args.extend([
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        format!("color=c=black:s={}x{}:r={}", width, height, request.fps),
        "-frames:v".into(),
        "1".into(),
    ]);
    args.extend(codec_args(request));
    args.extend(["-f", "null", "-"].map(String::from));
    args
}

fn grab_args(input: &GrabInput, request: &EncoderRequest) -> Vec<String> {
    let cursor = if request.capture_cursor { "1" } else { "0" };
    let fps = request.fps.to_string();
    let mut args: Vec<String> = Vec::new();
    match input.grabber {
        Grabber::X11 => {
            args.extend([
                "-f".into(),
                "x11grab".into(),
                "-framerate".into(),
                fps,
                "-video_size".into(),
                input.display.to_string(),
                "-draw_mouse".into(),
                cursor.into(),
            ]);
        }
        Grabber::AvFoundation => {
            args.extend([
                "-f".into(),
                "avfoundation".into(),
                "-framerate".into(),
                fps,
                "-capture_cursor".into(),
                cursor.into(),
            ]);
        }
        Grabber::Gdi => {
            args.extend([
                "-f".into(),
                "gdigrab".into(),
                "-framerate".into(),
                fps,
                "-draw_mouse".into(),
                cursor.into(),
            ]);
        }
    }
    args.extend(["-i".into(), input.target.clone()]);
    args
}

fn recording_args(input: &GrabInput, request: &EncoderRequest) -> Vec<String> {
    let Resolution { width, height } = request.resolution;
    let mut args = base_args();
    args.extend(grab_args(input, request));
    args.extend(["-vf".into(), format!("scale={}:{}", width, height)]);
    args.extend(codec_args(request));
    args.extend([
        "-movflags".into(),
        "+faststart".into(),
        "-y".into(),
        request.output_path.to_string_lossy().into_owned(),
    ]);
    args
}
