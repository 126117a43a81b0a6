// Screen recording core: resolution selection and capture-session lifecycle
//!
//! # screen-capture
//!
//! Records a display to an MP4 file through a platform capture backend:
//! - [`resolution`] picks an encoder-safe size strictly smaller than the display
//! - [`CaptureSession`] binds a capture source to an encoder on a background
//!   worker and tears it down exactly once
//! - [`FfmpegBackend`] drives an `ffmpeg` process (x11grab / avfoundation / gdigrab)
//!
//! ## Example
//! ```no_run
//! use screen_capture::{CaptureSession, CaptureToken, DisplayMetrics, FfmpegBackend, RecordingConfig};
//!
//! let config = RecordingConfig {
//!     output_dir: "/tmp/recordings".into(),
//!     ..Default::default()
//! };
//!
//! let backend = FfmpegBackend::new(config.clone());
//! let session = CaptureSession::new(backend, config)?;
//! let handle = session
//!     .open(DisplayMetrics::new(1920, 1080), CaptureToken::new(":0.0"))
//!     .wait()?;
//! // ... record for some time ...
//! session.stop(&handle);
//! println!("saved {:?}", handle.output_path());
//! # Ok::<(), screen_capture::CaptureError>(())
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod backend;
mod error;
mod ffmpeg;
mod output;
pub mod resolution;
mod session;
mod worker;

pub use backend::{CaptureBackend, CaptureToken, EncoderRequest};
pub use error::{BackendError, CaptureError};
pub use ffmpeg::{FfmpegBackend, FfmpegBinding, FfmpegEncoder};
pub use output::{video_file_name, VideoFile};
pub use resolution::{CandidateList, DisplayMetrics, Resolution};
pub use session::{CaptureSession, PendingOpen, SessionEvent, SessionHandle, SessionId};

/// Video codec used by the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
}

/// Container format of the output file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Mp4,
}

impl ContainerFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
        }
    }
}

/// Configuration for screen recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Directory that receives `video_<epoch-millis>.mp4` files
    pub output_dir: PathBuf,

    /// Preferred encoder widths, tried in order
    pub candidates: CandidateList,

    /// Frames per second (default: 30)
    pub fps: u32,

    /// Video bitrate in bits per second (default: 4 Mbit/s)
    pub video_bitrate: u32,

    pub codec: VideoCodec,

    pub container: ContainerFormat,

    /// Capture mouse cursor (default: true)
    pub capture_cursor: bool,

    /// Explicit ffmpeg binary (None = search well-known paths, then PATH)
    pub ffmpeg_path: Option<PathBuf>,

    /// How often the worker checks a running encoder for faults
    #[serde(with = "millis")]
    pub health_interval: Duration,

    /// How long a stopping encoder may take to finalize before it is killed
    #[serde(with = "millis")]
    pub stop_grace: Duration,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            candidates: CandidateList::default(),
            fps: 30,
            video_bitrate: 4 * 1000 * 1000,
            codec: VideoCodec::H264,
            container: ContainerFormat::Mp4,
            capture_cursor: true,
            ffmpeg_path: None,
            health_interval: Duration::from_millis(500),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Recording state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Idle,
    Preparing,
    Running,
    Stopping,
    Closed,
    Failed,
}

impl RecordingState {
    /// A session in this state holds (or is acquiring) platform resources
    pub fn is_live(self) -> bool {
        matches!(
            self,
            RecordingState::Preparing | RecordingState::Running | RecordingState::Stopping
        )
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
