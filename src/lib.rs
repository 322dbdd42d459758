// src/lib.rs

pub mod config;
pub mod error;
pub mod lane_detection;
pub mod playback;
pub mod preprocessing;
pub mod road_overlay;
pub mod types;
pub mod video_processor;

pub use error::{DetectionFailure, DetectionFailureKind, NormalizeError, PlaybackError};
pub use lane_detection::{LaneDetector, LaneDetectorClient};
pub use playback::{PlaybackController, PlaybackReport, PlaybackSettings, PlaybackState, StopReason};
pub use types::{Config, Frame, Key, LaneSegment};
