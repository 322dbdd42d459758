// src/error.rs

use std::fmt;
use thiserror::Error;

/// Errors that end a playback run.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("failed to open video source {path:?}: {reason}")]
    OpenFailed { path: String, reason: String },
    #[error("failed to open display: {0}")]
    DisplayFailed(String),
    #[error("playback controller already ran")]
    AlreadyClosed,
}

impl PlaybackError {
    pub fn open_failed(path: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::OpenFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionFailureKind {
    /// The detector returned an error
    Failed,
    /// The detector panicked
    Panicked,
    /// The detector returned something that is not an (N, 4) numeric table
    Malformed,
}

impl fmt::Display for DetectionFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Failed => "detection failed",
            Self::Panicked => "detector panicked",
            Self::Malformed => "malformed detection result",
        };
        f.write_str(s)
    }
}

/// A contained detector failure. Never ends the run.
#[derive(Debug, Clone, Error)]
#[error("frame {frame_index}: {kind}: {reason}")]
pub struct DetectionFailure {
    pub frame_index: u64,
    pub kind: DetectionFailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("frame has zero area ({width}x{height})")]
    ZeroArea { width: usize, height: usize },
    #[error("frame has zero channels")]
    NoChannels,
    #[error("frame buffer is {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
}
