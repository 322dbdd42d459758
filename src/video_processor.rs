// src/video_processor.rs

use crate::error::PlaybackError;
use crate::types::{BackendKind, Config, Frame, Key, VideoConfig};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

// ============================================================================
// BACKEND TRAITS
// ============================================================================

/// An open video source. `Ok(None)` is end-of-stream.
pub trait FrameSource {
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Releases the underlying handle. Called exactly once by the controller.
    fn release(&mut self);
}

/// Where processed frames go, plus the operator's key input.
pub trait Display {
    fn present(&mut self, frame: &Frame) -> Result<()>;

    /// Waits up to `timeout` for a key press.
    fn poll_key(&mut self, timeout: Duration) -> Result<Option<Key>>;

    /// Tears the display down. Called exactly once by the controller.
    fn close(&mut self);
}

pub trait VideoBackend {
    fn open_source(&mut self, path: &str) -> Result<Box<dyn FrameSource>, PlaybackError>;

    /// Only called after the source opened.
    fn open_display(&mut self) -> Result<Box<dyn Display>, PlaybackError>;
}

pub fn build_backend(config: &Config) -> Result<Box<dyn VideoBackend>> {
    match config.video.backend {
        BackendKind::Images => Ok(Box::new(ImageSequenceBackend::new(config))),
        #[cfg(feature = "opencv")]
        BackendKind::Opencv => Ok(Box::new(capture::OpencvBackend::new(config))),
        #[cfg(not(feature = "opencv"))]
        BackendKind::Opencv => {
            anyhow::bail!("backend `opencv` requested but this build has no `opencv` feature")
        }
    }
}

/// Rate reported by the container, or `nominal` when it reports none.
pub fn effective_fps(reported: f64, nominal: f64) -> f64 {
    if reported.is_finite() && reported > 0.0 {
        reported
    } else {
        nominal
    }
}

fn frame_timestamp_ms(index: u64, fps: f64) -> f64 {
    if fps > 0.0 {
        (index as f64 / fps) * 1000.0
    } else {
        0.0
    }
}

// ============================================================================
// IMAGE SEQUENCE BACKEND
// ============================================================================

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Plays a directory of still images (sorted by path) or a single image.
pub struct ImageSequenceBackend {
    video: VideoConfig,
}

impl ImageSequenceBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            video: config.video.clone(),
        }
    }

    pub fn find_image_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut images: Vec<PathBuf> = WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_image_file(e.path()))
            .map(|e| e.path().to_path_buf())
            .collect();
        images.sort();
        images
    }
}

impl VideoBackend for ImageSequenceBackend {
    fn open_source(&mut self, path: &str) -> Result<Box<dyn FrameSource>, PlaybackError> {
        info!("Opening image sequence: {}", path);
        let root = Path::new(path);

        if !root.exists() {
            return Err(PlaybackError::open_failed(
                path,
                "no such file or directory, ensure that it exists",
            ));
        }

        let files = if root.is_dir() {
            self.find_image_files(root)
        } else if is_image_file(root) {
            vec![root.to_path_buf()]
        } else {
            return Err(PlaybackError::open_failed(path, "not an image file"));
        };

        if files.is_empty() {
            return Err(PlaybackError::open_failed(path, "no image files found"));
        }

        info!("Found {} image file(s)", files.len());
        Ok(Box::new(ImageSequenceSource {
            files,
            next: 0,
            frames_read: 0,
            fps: self.video.nominal_fps,
            released: false,
        }))
    }

    fn open_display(&mut self) -> Result<Box<dyn Display>, PlaybackError> {
        let output_dir = if self.video.save_annotated {
            let dir = PathBuf::from(&self.video.output_dir);
            std::fs::create_dir_all(&dir).map_err(|e| {
                PlaybackError::DisplayFailed(format!("cannot create {}: {}", dir.display(), e))
            })?;
            info!("Annotated frames: {}", dir.display());
            Some(dir)
        } else {
            None
        };

        Ok(Box::new(FrameDumpDisplay {
            output_dir,
            frames_written: 0,
        }))
    }
}

pub struct ImageSequenceSource {
    files: Vec<PathBuf>,
    next: usize,
    frames_read: u64,
    fps: f64,
    released: bool,
}

impl FrameSource for ImageSequenceSource {
    fn read(&mut self) -> Result<Option<Frame>> {
        if self.released {
            anyhow::bail!("read after release");
        }

        while let Some(path) = self.files.get(self.next) {
            self.next += 1;

            // Undecodable files are skipped rather than ending the run
            let image = match image::open(path) {
                Ok(image) => image,
                Err(e) => {
                    warn!("Skipping unreadable image {}: {}", path.display(), e);
                    continue;
                }
            };

            let rgb = image.to_rgb8();
            let (width, height) = (rgb.width() as usize, rgb.height() as usize);
            let mut data = rgb.into_raw();
            for px in data.chunks_exact_mut(3) {
                px.swap(0, 2);
            }

            let index = self.frames_read;
            self.frames_read += 1;
            debug!("Read {} as frame {}", path.display(), index);

            return Ok(Some(Frame {
                data,
                width,
                height,
                channels: 3,
                index,
                timestamp_ms: frame_timestamp_ms(index, self.fps),
            }));
        }

        Ok(None)
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            debug!("Image sequence released after {} frame(s)", self.frames_read);
        }
    }
}

/// Windowless display: paces the loop and optionally dumps annotated frames
/// as PNG files.
pub struct FrameDumpDisplay {
    output_dir: Option<PathBuf>,
    frames_written: u64,
}

impl FrameDumpDisplay {
    pub fn new(output_dir: Option<PathBuf>) -> Self {
        Self {
            output_dir,
            frames_written: 0,
        }
    }
}

impl Display for FrameDumpDisplay {
    fn present(&mut self, frame: &Frame) -> Result<()> {
        let Some(dir) = &self.output_dir else {
            return Ok(());
        };

        let path = dir.join(format!("frame_{:06}.png", frame.index));
        save_frame(frame, &path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        self.frames_written += 1;
        Ok(())
    }

    fn poll_key(&mut self, timeout: Duration) -> Result<Option<Key>> {
        std::thread::sleep(timeout);
        Ok(None)
    }

    fn close(&mut self) {
        if self.output_dir.is_some() {
            info!("Wrote {} annotated frame(s)", self.frames_written);
        }
    }
}

/// Saves a BGR/BGRA/gray frame as an image file.
fn save_frame(frame: &Frame, path: &Path) -> Result<()> {
    let (width, height) = (frame.width as u32, frame.height as u32);
    match frame.channels {
        1 => image::save_buffer(path, &frame.data, width, height, image::ColorType::L8)?,
        3 | 4 => {
            let mut data = frame.data.clone();
            for px in data.chunks_exact_mut(frame.channels) {
                px.swap(0, 2);
            }
            let color = if frame.channels == 3 {
                image::ColorType::Rgb8
            } else {
                image::ColorType::Rgba8
            };
            image::save_buffer(path, &data, width, height, color)?;
        }
        n => anyhow::bail!("cannot save a {}-channel frame", n),
    }
    Ok(())
}

// ============================================================================
// OPENCV BACKEND
// ============================================================================

#[cfg(feature = "opencv")]
pub mod capture {
    use super::*;
    use crate::types::DisplayConfig;
    use opencv::{
        core::{self, Mat},
        highgui,
        prelude::*,
        videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst, VideoWriter},
    };

    pub struct OpencvBackend {
        video: VideoConfig,
        display: DisplayConfig,
        source_path: Option<PathBuf>,
        source_fps: f64,
    }

    impl OpencvBackend {
        pub fn new(config: &Config) -> Self {
            Self {
                video: config.video.clone(),
                display: config.display.clone(),
                source_path: None,
                source_fps: config.video.nominal_fps,
            }
        }

        fn output_path(&self) -> PathBuf {
            let stem = self
                .source_path
                .as_deref()
                .and_then(|p| p.file_stem())
                .and_then(|s| s.to_str())
                .unwrap_or("output");
            PathBuf::from(&self.video.output_dir).join(format!("{}_annotated.mp4", stem))
        }
    }

    impl VideoBackend for OpencvBackend {
        fn open_source(&mut self, path: &str) -> Result<Box<dyn FrameSource>, PlaybackError> {
            info!("Opening video: {}", path);

            let cap = VideoCapture::from_file(path, videoio::CAP_ANY)
                .map_err(|e| PlaybackError::open_failed(path, e))?;

            if !cap.is_opened().map_err(|e| PlaybackError::open_failed(path, e))? {
                return Err(PlaybackError::open_failed(
                    path,
                    "could not open the video file, ensure that it exists",
                ));
            }

            let prop = |id| VideoCaptureTraitConst::get(&cap, id).unwrap_or(0.0);
            let fps = prop(videoio::CAP_PROP_FPS);
            let total_frames = prop(videoio::CAP_PROP_FRAME_COUNT) as i64;
            let width = prop(videoio::CAP_PROP_FRAME_WIDTH) as i32;
            let height = prop(videoio::CAP_PROP_FRAME_HEIGHT) as i32;

            info!(
                "Video properties: {}x{} @ {:.1} FPS, {} frames",
                width, height, fps, total_frames
            );

            self.source_path = Some(PathBuf::from(path));
            let fps = effective_fps(fps, self.video.nominal_fps);
            self.source_fps = fps;
            Ok(Box::new(OpencvSource {
                cap,
                fps,
                frames_read: 0,
            }))
        }

        fn open_display(&mut self) -> Result<Box<dyn Display>, PlaybackError> {
            let headless = self.video.headless;
            if !headless {
                highgui::named_window(&self.display.window_title, highgui::WINDOW_AUTOSIZE)
                    .map_err(|e| PlaybackError::DisplayFailed(e.to_string()))?;
            }

            let output_path = if self.video.save_annotated {
                std::fs::create_dir_all(&self.video.output_dir)
                    .map_err(|e| PlaybackError::DisplayFailed(e.to_string()))?;
                let path = self.output_path();
                info!("Output video: {}", path.display());
                Some(path)
            } else {
                None
            };

            Ok(Box::new(OpencvDisplay {
                window_title: self.display.window_title.clone(),
                headless,
                fps: self.source_fps,
                output_path,
                writer: None,
            }))
        }
    }

    pub struct OpencvSource {
        cap: VideoCapture,
        fps: f64,
        frames_read: u64,
    }

    impl FrameSource for OpencvSource {
        fn read(&mut self) -> Result<Option<Frame>> {
            let mut mat = Mat::default();

            if !VideoCaptureTrait::read(&mut self.cap, &mut mat)? || mat.empty() {
                return Ok(None);
            }

            let index = self.frames_read;
            self.frames_read += 1;

            // An unconvertible frame goes out empty so the normalizer skips it
            let mut frame = mat_to_frame(&mat).unwrap_or_else(|e| {
                warn!("Frame {} could not be decoded: {:#}", index, e);
                Frame {
                    data: Vec::new(),
                    width: mat.cols().max(0) as usize,
                    height: mat.rows().max(0) as usize,
                    channels: mat.channels().max(0) as usize,
                    index,
                    timestamp_ms: 0.0,
                }
            });
            frame.index = index;
            frame.timestamp_ms = frame_timestamp_ms(index, self.fps);
            Ok(Some(frame))
        }

        fn release(&mut self) {
            if let Err(e) = self.cap.release() {
                warn!("Failed to release video capture: {}", e);
            }
        }
    }

    pub struct OpencvDisplay {
        window_title: String,
        headless: bool,
        fps: f64,
        output_path: Option<PathBuf>,
        writer: Option<VideoWriter>,
    }

    impl OpencvDisplay {
        fn writer_for(&mut self, frame: &Frame) -> Result<Option<&mut VideoWriter>> {
            if self.writer.is_none() {
                if let Some(path) = &self.output_path {
                    let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
                    let writer = VideoWriter::new(
                        path.to_str().context("Output path is not UTF-8")?,
                        fourcc,
                        self.fps,
                        core::Size::new(frame.width as i32, frame.height as i32),
                        frame.channels == 3,
                    )?;
                    self.writer = Some(writer);
                }
            }
            Ok(self.writer.as_mut())
        }
    }

    impl Display for OpencvDisplay {
        fn present(&mut self, frame: &Frame) -> Result<()> {
            let mat = frame_to_mat(frame)?;

            if !self.headless {
                highgui::imshow(&self.window_title, &mat)?;
            }
            if let Some(writer) = self.writer_for(frame)? {
                writer.write(&mat)?;
            }
            Ok(())
        }

        fn poll_key(&mut self, timeout: Duration) -> Result<Option<Key>> {
            if self.headless {
                std::thread::sleep(timeout);
                return Ok(None);
            }
            let code = highgui::wait_key(timeout.as_millis().max(1) as i32)?;
            Ok(Key::from_code(code))
        }

        fn close(&mut self) {
            if let Some(mut writer) = self.writer.take() {
                if let Err(e) = writer.release() {
                    warn!("Failed to finalize output video: {}", e);
                }
            }
            if !self.headless {
                if let Err(e) = highgui::destroy_all_windows() {
                    warn!("Failed to destroy windows: {}", e);
                }
            }
        }
    }

    fn mat_to_frame(mat: &Mat) -> Result<Frame> {
        if mat.depth() != core::CV_8U {
            anyhow::bail!("unsupported frame depth {}", mat.depth());
        }
        let owned;
        let mat = if mat.is_continuous() {
            mat
        } else {
            owned = mat.try_clone()?;
            &owned
        };

        Ok(Frame {
            data: mat.data_bytes()?.to_vec(),
            width: mat.cols() as usize,
            height: mat.rows() as usize,
            channels: mat.channels() as usize,
            index: 0,
            timestamp_ms: 0.0,
        })
    }

    fn frame_to_mat(frame: &Frame) -> Result<Mat> {
        let mat = Mat::from_slice(&frame.data)?;
        let mat = mat.reshape(frame.channels as i32, frame.height as i32)?;
        Ok(mat.try_clone()?)
    }
}
