// src/types.rs

use serde::{Deserialize, Serialize};

/// Fixed processing resolution every frame is normalized to.
pub const PROCESSING_WIDTH: usize = 1280;
pub const PROCESSING_HEIGHT: usize = 720;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub video: VideoConfig,
    pub display: DisplayConfig,
    pub detector: DetectorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Directory of still images (or a single image), decoded with `image`
    Images,
    /// OpenCV `VideoCapture` + `highgui` window
    Opencv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub source: String,
    pub backend: BackendKind,
    /// Used to stamp frame timestamps when the source has no timing of its own
    pub nominal_fps: f64,
    pub output_dir: String,
    pub save_annotated: bool,
    pub headless: bool,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            source: "assets/videos".to_string(),
            backend: BackendKind::Images,
            nominal_fps: 30.0,
            output_dir: "output".to_string(),
            save_annotated: false,
            headless: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub window_title: String,
    /// Per-iteration quit-key poll budget; doubles as the playback cadence
    pub wait_key_ms: u64,
    pub quit_keys: Vec<char>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            window_title: "ADAS Pilot - Lane Detection".to_string(),
            wait_key_ms: 30,
            quit_keys: vec!['q'],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// argv of an external detector process; empty disables detection
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Interleaved 8-bit pixel buffer. Three-channel frames are BGR.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub index: u64,
    pub timestamp_ms: f64,
}

impl Frame {
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            data: vec![0u8; width * height * channels],
            width,
            height,
            channels,
            index: 0,
            timestamp_ms: 0.0,
        }
    }

    pub fn filled(width: usize, height: usize, channels: usize, value: u8) -> Self {
        let mut frame = Self::new(width, height, channels);
        frame.data.fill(value);
        frame
    }

    pub fn with_index(mut self, index: u64, timestamp_ms: f64) -> Self {
        self.index = index;
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn is_processing_size(&self) -> bool {
        self.width == PROCESSING_WIDTH && self.height == PROCESSING_HEIGHT
    }

    pub fn pixel(&self, x: usize, y: usize) -> &[u8] {
        let start = (y * self.width + x) * self.channels;
        &self.data[start..start + self.channels]
    }

    pub fn pixel_mut(&mut self, x: usize, y: usize) -> &mut [u8] {
        let start = (y * self.width + x) * self.channels;
        &mut self.data[start..start + self.channels]
    }
}

/// One detected lane line in processing-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneSegment {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl LaneSegment {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

/// A key reported by the display's poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Other(i32),
}

impl Key {
    /// Maps an OpenCV-style key code (low byte is the character).
    pub fn from_code(code: i32) -> Option<Self> {
        if code < 0 {
            return None;
        }
        let low = (code & 0xFF) as u8;
        if low.is_ascii_graphic() || low == b' ' {
            Some(Key::Char(low as char))
        } else {
            Some(Key::Other(code))
        }
    }
}
