// src/playback.rs
//
// Top-level per-frame loop:
//
//   read → normalize → detect → render → present → poll quit key
//
// State machine:
//
//   Opening ──▶ Running ──▶ Stopping ──▶ Closed
//      │           │                       ▲
//      └───────────┴──────▶ Faulted ───────┘
//
// Only a failed open leaves an iteration. A read error ends the stream like
// end-of-file; present, key-poll, detection and normalization failures degrade
// the current frame and the loop goes on.

use crate::error::PlaybackError;
use crate::lane_detection::{LaneDetector, LaneDetectorClient};
use crate::preprocessing::FrameNormalizer;
use crate::road_overlay::OverlayRenderer;
use crate::types::{DisplayConfig, Key};
use crate::video_processor::{Display, FrameSource, VideoBackend};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Opening,
    Running,
    Stopping,
    Faulted,
    Closed,
}

impl PlaybackState {
    pub fn can_transition_to(self, next: PlaybackState) -> bool {
        use PlaybackState::*;
        matches!(
            (self, next),
            (Opening, Running)
                | (Opening, Faulted)
                | (Running, Stopping)
                | (Running, Faulted)
                | (Stopping, Closed)
                | (Faulted, Closed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackState::Opening => "OPENING",
            PlaybackState::Running => "RUNNING",
            PlaybackState::Stopping => "STOPPING",
            PlaybackState::Faulted => "FAULTED",
            PlaybackState::Closed => "CLOSED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    QuitRequested,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub frames_read: u64,
    pub frames_presented: u64,
    pub frames_with_overlay: u64,
    pub lines_drawn: u64,
    pub detection_failures: u64,
    pub normalize_failures: u64,
    pub display_errors: u64,
    pub duration_secs: f64,
}

impl RunSummary {
    pub fn avg_fps(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.frames_presented as f64 / self.duration_secs
        } else {
            0.0
        }
    }

    fn log(&self) {
        info!("  Frames read: {}", self.frames_read);
        info!("  Frames presented: {}", self.frames_presented);
        info!(
            "  Frames with lane overlay: {} ({} line(s))",
            self.frames_with_overlay, self.lines_drawn
        );
        if self.detection_failures > 0 {
            warn!("  ⚠️  Detection failures: {}", self.detection_failures);
        } else {
            info!("  Detection failures: 0");
        }
        if self.normalize_failures > 0 {
            warn!("  ⚠️  Skipped frames: {}", self.normalize_failures);
        }
        if self.display_errors > 0 {
            warn!("  ⚠️  Display errors: {}", self.display_errors);
        }
        info!("  Processing Speed: {:.1} FPS", self.avg_fps());
    }
}

#[derive(Debug, Clone)]
pub struct PlaybackReport {
    pub reason: StopReason,
    pub summary: RunSummary,
}

/// Cadence and quit handling for the loop.
#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub wait_key: Duration,
    pub quit_keys: Vec<char>,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self::from_display_config(&DisplayConfig::default())
    }
}

impl PlaybackSettings {
    pub fn from_display_config(config: &DisplayConfig) -> Self {
        Self {
            wait_key: Duration::from_millis(config.wait_key_ms),
            quit_keys: config.quit_keys.clone(),
        }
    }

    fn is_quit(&self, key: Key) -> bool {
        match key {
            Key::Char(c) => self.quit_keys.contains(&c),
            Key::Other(_) => false,
        }
    }
}

/// Source and display for one run. Released exactly once, on `close` or on
/// drop, whichever comes first.
struct Session {
    source: Box<dyn FrameSource>,
    display: Option<Box<dyn Display>>,
    closed: bool,
}

impl Session {
    fn new(source: Box<dyn FrameSource>) -> Self {
        Self {
            source,
            display: None,
            closed: false,
        }
    }

    fn display(&mut self) -> Result<&mut dyn Display, PlaybackError> {
        match self.display.as_deref_mut() {
            Some(display) => Ok(display),
            None => Err(PlaybackError::DisplayFailed("display not open".to_string())),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.source.release();
        if let Some(display) = self.display.as_mut() {
            display.close();
        }
        debug!("Video source and display released");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

enum Step {
    Continue,
    Stop(StopReason),
}

pub struct PlaybackController {
    backend: Box<dyn VideoBackend>,
    normalizer: FrameNormalizer,
    detector: LaneDetectorClient,
    renderer: OverlayRenderer,
    settings: PlaybackSettings,
    state: PlaybackState,
    summary: RunSummary,
}

impl PlaybackController {
    pub fn new(
        backend: Box<dyn VideoBackend>,
        detector: Box<dyn LaneDetector>,
        settings: PlaybackSettings,
    ) -> Self {
        Self {
            backend,
            normalizer: FrameNormalizer::new(),
            detector: LaneDetectorClient::new(detector),
            renderer: OverlayRenderer::new(),
            settings,
            state: PlaybackState::Opening,
            summary: RunSummary::default(),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    fn transition(&mut self, next: PlaybackState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state.as_str(),
            next.as_str()
        );
        debug!("Playback: {} → {}", self.state.as_str(), next.as_str());
        self.state = next;
    }

    fn fault(&mut self, err: PlaybackError) -> PlaybackError {
        error!("{}", err);
        self.transition(PlaybackState::Faulted);
        self.transition(PlaybackState::Closed);
        err
    }

    /// Plays `path` to the end or until a quit key. Runs once per controller.
    pub fn run(&mut self, path: &str) -> Result<PlaybackReport, PlaybackError> {
        if self.state != PlaybackState::Opening {
            return Err(PlaybackError::AlreadyClosed);
        }

        let started = Instant::now();

        let source = match self.backend.open_source(path) {
            Ok(source) => source,
            Err(e) => return Err(self.fault(e)),
        };
        let mut session = Session::new(source);

        match self.backend.open_display() {
            Ok(display) => session.display = Some(display),
            Err(e) => {
                session.close();
                return Err(self.fault(e));
            }
        }

        self.transition(PlaybackState::Running);
        info!(
            "▶️  Playing {} (detector: {})",
            path,
            self.detector.detector_name()
        );

        let result = loop {
            match self.step(&mut session) {
                Ok(Step::Continue) => {}
                Ok(Step::Stop(reason)) => break Ok(reason),
                Err(e) => break Err(e),
            }
        };

        let result = match result {
            Ok(reason) => {
                self.transition(PlaybackState::Stopping);
                session.close();
                self.transition(PlaybackState::Closed);
                Ok(reason)
            }
            Err(e) => {
                session.close();
                Err(self.fault(e))
            }
        };

        self.summary.detection_failures = self.detector.failures();
        self.summary.duration_secs = started.elapsed().as_secs_f64();

        let reason = result?;
        match reason {
            StopReason::EndOfStream => info!("✓ End of stream"),
            StopReason::QuitRequested => info!("⏹️  Stopped by user"),
        }
        self.summary.log();

        Ok(PlaybackReport {
            reason,
            summary: self.summary.clone(),
        })
    }

    fn step(&mut self, session: &mut Session) -> Result<Step, PlaybackError> {
        let raw = match session.source.read() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(Step::Stop(StopReason::EndOfStream)),
            Err(e) => {
                warn!("⚠️  Frame read failed, treating as end of stream: {:#}", e);
                return Ok(Step::Stop(StopReason::EndOfStream));
            }
        };
        self.summary.frames_read += 1;

        match self.normalizer.normalize(&raw) {
            Ok(mut frame) => {
                // Detection failures are already logged by the client
                let segments = self.detector.detect(&frame).unwrap_or_default();
                let drawn = self.renderer.render(&mut frame, &segments);
                if drawn > 0 {
                    self.summary.frames_with_overlay += 1;
                    self.summary.lines_drawn += drawn as u64;
                }

                debug_assert!(frame.is_processing_size());
                match session.display()?.present(&frame) {
                    Ok(()) => self.summary.frames_presented += 1,
                    Err(e) => {
                        self.summary.display_errors += 1;
                        warn!("Failed to present frame {}: {:#}", frame.index, e);
                    }
                }
            }
            Err(e) => {
                self.summary.normalize_failures += 1;
                warn!("Skipping frame {}: {}", raw.index, e);
            }
        }

        let key = match session.display()?.poll_key(self.settings.wait_key) {
            Ok(key) => key,
            Err(e) => {
                self.summary.display_errors += 1;
                warn!("Key poll failed: {:#}", e);
                None
            }
        };
        if let Some(key) = key {
            if self.settings.is_quit(key) {
                return Ok(Step::Stop(StopReason::QuitRequested));
            }
            debug!("Ignoring key {:?}", key);
        }

        Ok(Step::Continue)
    }
}

/// Process exit code for a finished run: 0 on end-of-stream or quit.
pub fn exit_code(result: &Result<PlaybackReport, PlaybackError>) -> u8 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}
