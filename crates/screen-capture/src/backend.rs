// Platform capture backend seam
//
// A backend hands out an encoder for a given size, mirrors the display into the
// encoder's input surface, and releases both. The session drives these calls
// from its worker thread and owns the release discipline.

use std::fmt;
use std::path::PathBuf;

use crate::{BackendError, DisplayMetrics, RecordingConfig, Resolution};

/// Opaque capture authorization obtained by the host out of band.
///
/// Backends decide what the token names; for [`crate::FfmpegBackend`] it is
/// the grabber input (an X display such as `:0.0`, an avfoundation device
/// index, or `desktop` on Windows).
#[derive(Clone, PartialEq, Eq)]
pub struct CaptureToken(String);

impl CaptureToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CaptureToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CaptureToken(..)")
    }
}

/// Everything a backend needs to prepare one encoder.
#[derive(Debug, Clone)]
pub struct EncoderRequest {
    pub resolution: Resolution,
    pub output_path: PathBuf,
    pub fps: u32,
    pub video_bitrate: u32,
    pub capture_cursor: bool,
}

impl EncoderRequest {
    pub fn new(resolution: Resolution, output_path: PathBuf, config: &RecordingConfig) -> Self {
        Self {
            resolution,
            output_path,
            fps: config.fps,
            video_bitrate: config.video_bitrate,
            capture_cursor: config.capture_cursor,
        }
    }
}

pub trait CaptureBackend: Send + 'static {
    /// A prepared encoder for one resolution.
    type Encoder: Send + 'static;
    /// The capture source mirrored into an encoder's input surface.
    type Binding: Send + 'static;

    fn acquire_encoder(&mut self, request: &EncoderRequest) -> Result<Self::Encoder, BackendError>;

    fn bind_capture_source(
        &mut self,
        encoder: &mut Self::Encoder,
        token: &CaptureToken,
        display: DisplayMetrics,
    ) -> Result<Self::Binding, BackendError>;

    fn start(&mut self, encoder: &mut Self::Encoder) -> Result<(), BackendError>;

    /// Called periodically while running; an error means the encoder faulted.
    fn check(&mut self, encoder: &mut Self::Encoder) -> Result<(), BackendError>;

    fn release_binding(&mut self, encoder: &mut Self::Encoder, binding: Self::Binding) -> Result<(), BackendError>;

    fn release_encoder(&mut self, encoder: Self::Encoder) -> Result<(), BackendError>;
}
