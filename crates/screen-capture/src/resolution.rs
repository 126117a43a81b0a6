//! Encoder resolution selection.
//!
//! The encoder is never configured at the full display size: a candidate
//! width only qualifies when both it and the height derived from the display
//! aspect ratio are strictly smaller than the display. The first qualifying
//! candidate wins and is rounded down to even dimensions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::CaptureError;

/// Widths tried by default, largest first.
pub const DEFAULT_CANDIDATE_WIDTHS: [u32; 6] = [1920, 1440, 1280, 720, 640, 320];

/// Round `size` down to the nearest even value.
pub fn ensure_even(size: u32) -> u32 {
    if size % 2 == 0 {
        size
    } else {
        size - 1
    }
}

/// Size of the display being captured, in physical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplayMetrics {
    pub width: u32,
    pub height: u32,
}

impl DisplayMetrics {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Both dimensions rounded down to even values.
    pub fn evened(self) -> Self {
        Self {
            width: ensure_even(self.width),
            height: ensure_even(self.height),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for DisplayMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// An encoder size. Produced by this module it is always even in both dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Ordered list of preferred encoder widths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateList(Vec<u32>);

impl CandidateList {
    pub fn new(widths: impl Into<Vec<u32>>) -> Self {
        Self(widths.into())
    }

    pub fn widths(&self) -> &[u32] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for CandidateList {
    fn default() -> Self {
        Self(DEFAULT_CANDIDATE_WIDTHS.to_vec())
    }
}

/// Every qualifying resolution for `display`, in candidate order.
///
/// The derived height is `floor(w * display.height / display.width)`, which is
/// `w / aspect_ratio` rounded down, computed without floating-point drift.
pub fn qualifying<'a>(
    display: DisplayMetrics,
    candidates: &'a CandidateList,
) -> impl Iterator<Item = Resolution> + 'a {
    candidates.widths().iter().filter_map(move |&width| {
        if display.is_empty() {
            return None;
        }
        let height = (u64::from(width) * u64::from(display.height) / u64::from(display.width)) as u32;
        if width >= display.width || height >= display.height {
            return None;
        }
        let resolution = Resolution {
            width: ensure_even(width),
            height: ensure_even(height),
        };
        // Tiny candidates even down to an empty frame.
        (resolution.width > 0 && resolution.height > 0).then_some(resolution)
    })
}

/// Pick the first candidate that fits strictly inside `display`.
///
/// `display` is expected to be evened already (see [`DisplayMetrics::evened`]).
pub fn select(display: DisplayMetrics, candidates: &CandidateList) -> Result<Resolution, CaptureError> {
    qualifying(display, candidates)
        .next()
        .ok_or(CaptureError::NoCandidateFits { display })
}
