// src/lane_detection.rs

use crate::error::{DetectionFailure, DetectionFailureKind};
use crate::types::{Frame, LaneSegment};
use anyhow::{bail, Context, Result};
use ndarray::Array2;
use serde::Serialize;
use std::any::Any;
use std::io::{BufRead, BufReader, Write};
use std::panic::{self, AssertUnwindSafe};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};

/// External lane detection capability.
///
/// Takes a normalized frame and returns an `(N, 4)` table of
/// `(x1, y1, x2, y2)` rows, most significant lane first. Implementations may
/// fail or panic for any reason; [`LaneDetectorClient`] contains both.
pub trait LaneDetector {
    fn detect_lanes(&mut self, frame: &Frame) -> Result<Array2<f64>>;

    fn name(&self) -> &str {
        "detector"
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Wraps a [`LaneDetector`] so that no detector outcome can escape a frame.
pub struct LaneDetectorClient {
    detector: Box<dyn LaneDetector>,
    failures: u64,
}

impl LaneDetectorClient {
    pub fn new(detector: Box<dyn LaneDetector>) -> Self {
        Self {
            detector,
            failures: 0,
        }
    }

    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Runs detection on one frame. Errors, panics and malformed tables all
    /// come back as `Err`, already logged.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<LaneSegment>, DetectionFailure> {
        let detector = &mut self.detector;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| detector.detect_lanes(frame)));

        let result = match outcome {
            Ok(Ok(table)) => parse_segments(&table).map_err(|reason| DetectionFailure {
                frame_index: frame.index,
                kind: DetectionFailureKind::Malformed,
                reason,
            }),
            Ok(Err(e)) => {
                let kind = if e.downcast_ref::<MalformedOutput>().is_some() {
                    DetectionFailureKind::Malformed
                } else {
                    DetectionFailureKind::Failed
                };
                Err(DetectionFailure {
                    frame_index: frame.index,
                    kind,
                    reason: format!("{:#}", e),
                })
            }
            Err(payload) => Err(DetectionFailure {
                frame_index: frame.index,
                kind: DetectionFailureKind::Panicked,
                reason: panic_message(payload.as_ref()),
            }),
        };

        match &result {
            Ok(segments) => debug!(
                "Frame {}: {} lane segment(s) detected",
                frame.index,
                segments.len()
            ),
            Err(failure) => {
                self.failures += 1;
                warn!("Call failed: {}", failure);
            }
        }

        result
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Converts a detector table into lane segments.
///
/// Every row must coerce to four integers or the whole table is rejected.
/// Coercion truncates toward zero.
pub fn parse_segments(table: &Array2<f64>) -> Result<Vec<LaneSegment>, String> {
    let (rows, cols) = table.dim();
    if rows == 0 {
        return Ok(Vec::new());
    }
    if cols != 4 {
        return Err(format!("expected shape (N, 4), got ({}, {})", rows, cols));
    }

    table
        .outer_iter()
        .enumerate()
        .map(|(i, row)| {
            let mut coords = [0i32; 4];
            for (j, &v) in row.iter().enumerate() {
                coords[j] = coerce_coordinate(v)
                    .ok_or_else(|| format!("row {} column {}: {} is not a coordinate", i, j, v))?;
            }
            Ok(LaneSegment::new(coords[0], coords[1], coords[2], coords[3]))
        })
        .collect()
}

fn coerce_coordinate(v: f64) -> Option<i32> {
    if !v.is_finite() {
        return None;
    }
    let t = v.trunc();
    if t < i32::MIN as f64 || t > i32::MAX as f64 {
        return None;
    }
    Some(t as i32)
}

/// Detector output that is not an `(N, 4)` numeric table.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct MalformedOutput(pub String);

/// Builds a dense table from JSON rows. Ragged rows and non-numeric cells
/// are rejected.
pub fn table_from_json(value: &serde_json::Value) -> Result<Array2<f64>, MalformedOutput> {
    let rows = value
        .as_array()
        .ok_or_else(|| MalformedOutput("detector output is not a JSON array".to_string()))?;

    if rows.is_empty() {
        return Ok(Array2::zeros((0, 4)));
    }

    let mut width = None;
    let mut data = Vec::with_capacity(rows.len() * 4);
    for (i, row) in rows.iter().enumerate() {
        let cells = row
            .as_array()
            .ok_or_else(|| MalformedOutput(format!("row {} is not an array", i)))?;
        match width {
            None => width = Some(cells.len()),
            Some(w) if w != cells.len() => {
                return Err(MalformedOutput(format!(
                    "row {} has {} values, expected {}",
                    i,
                    cells.len(),
                    w
                )));
            }
            Some(_) => {}
        }
        for (j, cell) in cells.iter().enumerate() {
            let v = cell.as_f64().ok_or_else(|| {
                MalformedOutput(format!("row {} column {}: {} is not a number", i, j, cell))
            })?;
            data.push(v);
        }
    }

    Array2::from_shape_vec((rows.len(), width.unwrap_or(0)), data)
        .map_err(|e| MalformedOutput(format!("Array creation failed: {}", e)))
}

// ============================================================================
// BINDINGS
// ============================================================================

/// Stand-in used when no detector is configured. Never finds lanes.
pub struct NoopDetector;

impl LaneDetector for NoopDetector {
    fn detect_lanes(&mut self, _frame: &Frame) -> Result<Array2<f64>> {
        Ok(Array2::zeros((0, 4)))
    }

    fn name(&self) -> &str {
        "noop"
    }
}

#[derive(Serialize)]
struct FrameHeader {
    index: u64,
    width: usize,
    height: usize,
    channels: usize,
}

/// Detector running in a child process.
///
/// Per frame: one JSON header line, then `width * height * channels` raw
/// bytes on the child's stdin. The child answers with one JSON line, an
/// array of `[x1, y1, x2, y2]` rows.
///
/// A reply that is not a single JSON line leaves the request/reply pairing
/// unknown, so the child is restarted before the next frame.
pub struct CommandDetector {
    name: String,
    argv: Vec<String>,
    process: Option<DetectorProcess>,
    line: String,
}

impl CommandDetector {
    pub fn spawn(argv: &[String]) -> Result<Self> {
        let (program, _) = argv.split_first().context("Empty detector command")?;
        let process = DetectorProcess::spawn(argv)?;

        Ok(Self {
            name: program.clone(),
            argv: argv.to_vec(),
            process: Some(process),
            line: String::new(),
        })
    }

    /// OS pid of the current child, if one is running.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.child.id())
    }

    fn restart(&mut self) {
        // Dropping the old process kills and reaps it
        self.process = None;
        match DetectorProcess::spawn(&self.argv) {
            Ok(process) => {
                info!("Detector process restarted");
                self.process = Some(process);
            }
            Err(e) => warn!("⚠️  Failed to restart detector: {:#}", e),
        }
    }

    fn exchange(&mut self, frame: &Frame) -> Result<Array2<f64>> {
        let process = self
            .process
            .as_mut()
            .context("detector process is not running")?;

        if let Some(status) = process.child.try_wait()? {
            bail!("detector process exited ({})", status);
        }

        process
            .send_frame(frame)
            .context("Failed to send frame to detector")?;

        self.line.clear();
        let n = process.stdout.read_line(&mut self.line)?;
        if n == 0 {
            bail!("detector closed its output");
        }
        if !process.stdout.buffer().is_empty() {
            return Err(MalformedOutput("detector wrote more than one reply line".to_string()).into());
        }

        let value: serde_json::Value = serde_json::from_str(self.line.trim())
            .map_err(|e| MalformedOutput(format!("detector output is not JSON: {}", e)))?;
        Ok(table_from_json(&value)?)
    }
}

impl LaneDetector for CommandDetector {
    fn detect_lanes(&mut self, frame: &Frame) -> Result<Array2<f64>> {
        let result = self.exchange(frame);
        if let Err(e) = &result {
            if e.downcast_ref::<MalformedOutput>().is_some() {
                self.restart();
            }
        }
        result
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct DetectorProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl DetectorProcess {
    fn spawn(argv: &[String]) -> Result<Self> {
        let (program, args) = argv.split_first().context("Empty detector command")?;

        info!("Starting detector process: {}", argv.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to start detector {}", program))?;

        let stdin = child.stdin.take().context("Detector stdin not piped")?;
        let stdout = child.stdout.take().context("Detector stdout not piped")?;

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
        })
    }

    fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let stdin = self.stdin.as_mut().context("Detector stdin closed")?;
        let header = FrameHeader {
            index: frame.index,
            width: frame.width,
            height: frame.height,
            channels: frame.channels,
        };
        serde_json::to_writer(&mut *stdin, &header)?;
        stdin.write_all(b"\n")?;
        stdin.write_all(&frame.data)?;
        stdin.flush()?;
        Ok(())
    }
}

impl Drop for DetectorProcess {
    fn drop(&mut self) {
        // Closing stdin lets a well-behaved child exit on its own
        drop(self.stdin.take());
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

/// Builds the configured detector binding.
pub fn build_detector(command: &[String]) -> Result<Box<dyn LaneDetector>> {
    if command.is_empty() {
        warn!("⚠️  No detector command configured, playing without lane overlay");
        return Ok(Box::new(NoopDetector));
    }
    Ok(Box::new(CommandDetector::spawn(command)?))
}
