// tests/playback.rs
//
// Drives the controller end-to-end against scripted sources, displays and
// detectors.

use adas_pilot::playback::exit_code;
use adas_pilot::video_processor::{Display, FrameSource, VideoBackend};
use adas_pilot::{
    Frame, Key, LaneDetector, PlaybackController, PlaybackError, PlaybackSettings, PlaybackState,
    StopReason,
};
use anyhow::{anyhow, Result};
use ndarray::{array, Array2};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

const GREEN: [u8; 3] = [0, 255, 0];

#[derive(Default)]
struct Log {
    open_display_calls: u32,
    releases: u32,
    closes: u32,
    presented: Vec<Frame>,
    reads: u32,
}

enum SourceItem {
    Frame(Frame),
    Fault,
}

struct ScriptedBackend {
    log: Rc<RefCell<Log>>,
    items: Option<VecDeque<SourceItem>>,
    keys: VecDeque<Option<Key>>,
    fail_open: bool,
    fail_display: bool,
    present_faults: u32,
    key_faults: u32,
}

impl ScriptedBackend {
    fn new(log: Rc<RefCell<Log>>, items: Vec<SourceItem>) -> Self {
        Self {
            log,
            items: Some(items.into()),
            keys: VecDeque::new(),
            fail_open: false,
            fail_display: false,
            present_faults: 0,
            key_faults: 0,
        }
    }

    fn with_keys(mut self, keys: Vec<Option<Key>>) -> Self {
        self.keys = keys.into();
        self
    }
}

impl VideoBackend for ScriptedBackend {
    fn open_source(&mut self, path: &str) -> Result<Box<dyn FrameSource>, PlaybackError> {
        if self.fail_open {
            return Err(PlaybackError::open_failed(path, "no such file"));
        }
        Ok(Box::new(ScriptedSource {
            log: self.log.clone(),
            items: self.items.take().unwrap_or_default(),
        }))
    }

    fn open_display(&mut self) -> Result<Box<dyn Display>, PlaybackError> {
        self.log.borrow_mut().open_display_calls += 1;
        if self.fail_display {
            return Err(PlaybackError::DisplayFailed("no window system".to_string()));
        }
        Ok(Box::new(ScriptedDisplay {
            log: self.log.clone(),
            keys: std::mem::take(&mut self.keys),
            present_faults: self.present_faults,
            key_faults: self.key_faults,
        }))
    }
}

struct ScriptedSource {
    log: Rc<RefCell<Log>>,
    items: VecDeque<SourceItem>,
}

impl FrameSource for ScriptedSource {
    fn read(&mut self) -> Result<Option<Frame>> {
        self.log.borrow_mut().reads += 1;
        match self.items.pop_front() {
            Some(SourceItem::Frame(frame)) => Ok(Some(frame)),
            Some(SourceItem::Fault) => Err(anyhow!("decoder crashed")),
            None => Ok(None),
        }
    }

    fn release(&mut self) {
        self.log.borrow_mut().releases += 1;
    }
}

struct ScriptedDisplay {
    log: Rc<RefCell<Log>>,
    keys: VecDeque<Option<Key>>,
    // The first N calls fail
    present_faults: u32,
    key_faults: u32,
}

impl Display for ScriptedDisplay {
    fn present(&mut self, frame: &Frame) -> Result<()> {
        if self.present_faults > 0 {
            self.present_faults -= 1;
            return Err(anyhow!("window lost"));
        }
        self.log.borrow_mut().presented.push(frame.clone());
        Ok(())
    }

    fn poll_key(&mut self, _timeout: Duration) -> Result<Option<Key>> {
        let key = self.keys.pop_front().flatten();
        if self.key_faults > 0 {
            self.key_faults -= 1;
            return Err(anyhow!("event queue closed"));
        }
        Ok(key)
    }

    fn close(&mut self) {
        self.log.borrow_mut().closes += 1;
    }
}

enum Reply {
    Table(Array2<f64>),
    Error(&'static str),
    Panic,
}

struct ScriptedDetector {
    replies: VecDeque<Reply>,
}

impl ScriptedDetector {
    fn boxed(replies: Vec<Reply>) -> Box<dyn LaneDetector> {
        Box::new(Self {
            replies: replies.into(),
        })
    }
}

impl LaneDetector for ScriptedDetector {
    fn detect_lanes(&mut self, frame: &Frame) -> Result<Array2<f64>> {
        assert_eq!((frame.width, frame.height, frame.channels), (1280, 720, 3));
        match self.replies.pop_front() {
            Some(Reply::Table(table)) => Ok(table),
            Some(Reply::Error(msg)) => Err(anyhow!(msg)),
            Some(Reply::Panic) => panic!("binding blew up"),
            None => Ok(Array2::zeros((0, 4))),
        }
    }
}

fn source_frames(count: usize) -> Vec<SourceItem> {
    (0..count)
        .map(|i| SourceItem::Frame(Frame::filled(640, 480, 3, 60).with_index(i as u64, 0.0)))
        .collect()
}

fn settings() -> PlaybackSettings {
    PlaybackSettings {
        wait_key: Duration::ZERO,
        quit_keys: vec!['q'],
    }
}

fn green_pixels(frame: &Frame) -> usize {
    frame
        .data
        .chunks_exact(3)
        .filter(|px| *px == GREEN)
        .count()
}

#[test]
fn three_frame_scenario() {
    let log = Rc::new(RefCell::new(Log::default()));
    let backend = ScriptedBackend::new(log.clone(), source_frames(3));
    let detector = ScriptedDetector::boxed(vec![
        Reply::Table(array![
            [10.0, 10.0, 50.0, 600.0],
            [1200.0, 10.0, 1250.0, 600.0]
        ]),
        Reply::Error("model error"),
        Reply::Table(Array2::zeros((0, 4))),
    ]);

    let mut controller = PlaybackController::new(Box::new(backend), detector, settings());
    let result = controller.run("clip.mp4");
    assert_eq!(exit_code(&result), 0);

    let report = result.unwrap();
    assert_eq!(report.reason, StopReason::EndOfStream);
    assert_eq!(report.summary.frames_read, 3);
    assert_eq!(report.summary.frames_presented, 3);
    assert_eq!(report.summary.frames_with_overlay, 1);
    assert_eq!(report.summary.lines_drawn, 2);
    assert_eq!(report.summary.detection_failures, 1);
    assert_eq!(controller.state(), PlaybackState::Closed);

    let log = log.borrow();
    assert_eq!(log.presented.len(), 3);
    for frame in &log.presented {
        assert_eq!((frame.width, frame.height), (1280, 720));
    }

    let first = &log.presented[0];
    assert_eq!(first.pixel(10, 10), GREEN);
    assert_eq!(first.pixel(30, 305), GREEN);
    assert_eq!(first.pixel(1250, 600), GREEN);
    assert_eq!(first.pixel(640, 360), &[60, 60, 60]);

    assert_eq!(green_pixels(&log.presented[1]), 0);
    assert_eq!(green_pixels(&log.presented[2]), 0);

    assert_eq!(log.releases, 1);
    assert_eq!(log.closes, 1);
}

#[test]
fn quit_key_stops_after_failed_detection() {
    let log = Rc::new(RefCell::new(Log::default()));
    let backend = ScriptedBackend::new(log.clone(), source_frames(5))
        .with_keys(vec![None, Some(Key::Char('q'))]);
    let detector = ScriptedDetector::boxed(vec![
        Reply::Table(array![[100.0, 100.0, 100.0, 600.0]]),
        Reply::Error("timeout"),
    ]);

    let mut controller = PlaybackController::new(Box::new(backend), detector, settings());
    let result = controller.run("clip.mp4");
    assert_eq!(exit_code(&result), 0);

    let report = result.unwrap();
    assert_eq!(report.reason, StopReason::QuitRequested);
    assert_eq!(report.summary.frames_read, 2);
    assert_eq!(report.summary.detection_failures, 1);

    let log = log.borrow();
    assert_eq!(log.presented.len(), 2);
    assert!(green_pixels(&log.presented[0]) > 0);
    assert_eq!(green_pixels(&log.presented[1]), 0);
    assert_eq!(log.releases, 1);
    assert_eq!(log.closes, 1);
}

#[test]
fn other_keys_do_not_stop_playback() {
    let log = Rc::new(RefCell::new(Log::default()));
    let backend = ScriptedBackend::new(log.clone(), source_frames(3)).with_keys(vec![
        Some(Key::Char('p')),
        Some(Key::Other(27)),
        Some(Key::Char('Q')),
    ]);

    let mut controller =
        PlaybackController::new(Box::new(backend), ScriptedDetector::boxed(vec![]), settings());
    let report = controller.run("clip.mp4").unwrap();
    assert_eq!(report.reason, StopReason::EndOfStream);
    assert_eq!(log.borrow().presented.len(), 3);
}

#[test]
fn open_failure_never_opens_display() {
    let log = Rc::new(RefCell::new(Log::default()));
    let mut backend = ScriptedBackend::new(log.clone(), source_frames(3));
    backend.fail_open = true;

    let mut controller =
        PlaybackController::new(Box::new(backend), ScriptedDetector::boxed(vec![]), settings());
    let result = controller.run("missing.mp4");

    assert!(matches!(result, Err(PlaybackError::OpenFailed { .. })));
    assert_ne!(exit_code(&result), 0);
    assert_eq!(controller.state(), PlaybackState::Closed);

    let log = log.borrow();
    assert_eq!(log.open_display_calls, 0);
    assert_eq!(log.reads, 0);
    assert!(log.presented.is_empty());
}

#[test]
fn display_failure_releases_source() {
    let log = Rc::new(RefCell::new(Log::default()));
    let mut backend = ScriptedBackend::new(log.clone(), source_frames(3));
    backend.fail_display = true;

    let mut controller =
        PlaybackController::new(Box::new(backend), ScriptedDetector::boxed(vec![]), settings());
    let result = controller.run("clip.mp4");

    assert!(matches!(result, Err(PlaybackError::DisplayFailed(_))));
    assert_ne!(exit_code(&result), 0);
    let log = log.borrow();
    assert_eq!(log.releases, 1);
    assert_eq!(log.closes, 0);
}

#[test]
fn read_fault_ends_the_stream_cleanly() {
    let log = Rc::new(RefCell::new(Log::default()));
    let mut items = source_frames(1);
    items.push(SourceItem::Fault);
    items.extend(source_frames(2));
    let backend = ScriptedBackend::new(log.clone(), items);

    let mut controller =
        PlaybackController::new(Box::new(backend), ScriptedDetector::boxed(vec![]), settings());
    let result = controller.run("clip.mp4");
    assert_eq!(exit_code(&result), 0);
    assert_eq!(controller.state(), PlaybackState::Closed);

    let report = result.unwrap();
    assert_eq!(report.reason, StopReason::EndOfStream);
    assert_eq!(report.summary.frames_read, 1);

    let log = log.borrow();
    assert_eq!(log.reads, 2);
    assert_eq!(log.presented.len(), 1);
    assert_eq!(log.releases, 1);
    assert_eq!(log.closes, 1);
}

#[test]
fn display_errors_do_not_stop_playback() {
    let log = Rc::new(RefCell::new(Log::default()));
    let mut backend = ScriptedBackend::new(log.clone(), source_frames(4))
        .with_keys(vec![Some(Key::Char('p')), None, None, Some(Key::Char('q'))]);
    backend.present_faults = 2;
    backend.key_faults = 1;

    let mut controller =
        PlaybackController::new(Box::new(backend), ScriptedDetector::boxed(vec![]), settings());
    let result = controller.run("clip.mp4");
    assert_eq!(exit_code(&result), 0);

    let report = result.unwrap();
    assert_eq!(report.reason, StopReason::QuitRequested);
    assert_eq!(report.summary.frames_read, 4);
    assert_eq!(report.summary.frames_presented, 2);
    assert_eq!(report.summary.display_errors, 3);

    let log = log.borrow();
    assert_eq!(log.presented.len(), 2);
    assert_eq!(log.releases, 1);
    assert_eq!(log.closes, 1);
}

#[test]
fn malformed_and_panicking_detector_never_stop_the_loop() {
    let log = Rc::new(RefCell::new(Log::default()));
    let backend = ScriptedBackend::new(log.clone(), source_frames(4));
    let detector = ScriptedDetector::boxed(vec![
        Reply::Table(array![[1.0, 2.0, 3.0]]),
        Reply::Panic,
        Reply::Table(array![[10.0, 10.0, 50.0, 600.0], [f64::NAN, 0.0, 0.0, 0.0]]),
        Reply::Table(array![[640.0, 100.0, 640.0, 700.0]]),
    ]);

    let mut controller = PlaybackController::new(Box::new(backend), detector, settings());
    let report = controller.run("clip.mp4").unwrap();

    assert_eq!(report.reason, StopReason::EndOfStream);
    assert_eq!(report.summary.detection_failures, 3);
    assert_eq!(report.summary.lines_drawn, 1);

    let log = log.borrow();
    assert_eq!(log.presented.len(), 4);
    for frame in &log.presented[..3] {
        assert_eq!(green_pixels(frame), 0);
    }
    assert_eq!(log.presented[3].pixel(640, 400), GREEN);
}

#[test]
fn bad_frame_is_skipped_and_loop_continues() {
    let log = Rc::new(RefCell::new(Log::default()));
    let mut corrupt = Frame::filled(640, 480, 3, 0);
    corrupt.data.truncate(10);
    let items = vec![
        SourceItem::Frame(Frame::new(0, 0, 3)),
        SourceItem::Frame(corrupt),
        SourceItem::Frame(Frame::filled(1920, 1080, 3, 5)),
    ];
    let backend = ScriptedBackend::new(log.clone(), items);

    let mut controller =
        PlaybackController::new(Box::new(backend), ScriptedDetector::boxed(vec![]), settings());
    let report = controller.run("clip.mp4").unwrap();

    assert_eq!(report.summary.frames_read, 3);
    assert_eq!(report.summary.normalize_failures, 2);
    assert_eq!(report.summary.frames_presented, 1);

    let log = log.borrow();
    assert_eq!(log.presented.len(), 1);
    assert_eq!((log.presented[0].width, log.presented[0].height), (1280, 720));
}

#[test]
fn empty_source_ends_cleanly() {
    let log = Rc::new(RefCell::new(Log::default()));
    let backend = ScriptedBackend::new(log.clone(), vec![]);

    let mut controller =
        PlaybackController::new(Box::new(backend), ScriptedDetector::boxed(vec![]), settings());
    let result = controller.run("clip.mp4");
    assert_eq!(exit_code(&result), 0);
    assert_eq!(result.unwrap().summary.frames_read, 0);
    assert_eq!(log.borrow().releases, 1);
}

#[test]
fn controller_runs_once() {
    let log = Rc::new(RefCell::new(Log::default()));
    let backend = ScriptedBackend::new(log.clone(), source_frames(1));

    let mut controller =
        PlaybackController::new(Box::new(backend), ScriptedDetector::boxed(vec![]), settings());
    assert!(controller.run("clip.mp4").is_ok());
    assert!(matches!(
        controller.run("clip.mp4"),
        Err(PlaybackError::AlreadyClosed)
    ));
    assert_eq!(log.borrow().releases, 1);
}
