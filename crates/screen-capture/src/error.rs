use std::path::PathBuf;

use thiserror::Error;

use crate::DisplayMetrics;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No candidate resolution fits display {display}")]
    NoCandidateFits { display: DisplayMetrics },

    #[error("Could not acquire encoder after {attempts} attempt(s): {last}")]
    ResourceAcquisitionFailed { attempts: usize, last: BackendError },

    #[error("Session is already closed")]
    AlreadyClosed,

    #[error("Teardown fault: {0}")]
    TeardownFault(BackendError),

    #[error("Display has an empty dimension: {display}")]
    InvalidDisplay { display: DisplayMetrics },

    #[error("A recording session is already active")]
    SessionActive,

    #[error("Session was stopped before it started running")]
    Cancelled,

    #[error("Capture worker is not running")]
    WorkerUnavailable,

    #[error("Cannot prepare output directory {path:?}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure reported by a platform capture backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Encoder unavailable: {reason}")]
    EncoderUnavailable { reason: String },

    #[error("Encoder rejected {resolution}: {reason}")]
    EncoderRejected { resolution: String, reason: String },

    #[error("Capture source error: {reason}")]
    CaptureSource { reason: String },

    #[error("Encoder stopped unexpectedly: {reason}")]
    EncoderExited { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
