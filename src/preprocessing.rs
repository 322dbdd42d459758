// src/preprocessing.rs

use crate::error::NormalizeError;
use crate::types::{Frame, PROCESSING_HEIGHT, PROCESSING_WIDTH};

/// Resizes frames to the fixed processing resolution.
#[derive(Debug, Clone, Copy)]
pub struct FrameNormalizer {
    width: usize,
    height: usize,
}

impl Default for FrameNormalizer {
    fn default() -> Self {
        Self {
            width: PROCESSING_WIDTH,
            height: PROCESSING_HEIGHT,
        }
    }
}

impl FrameNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bilinear resize to 1280x720. Channel count, index and timestamp carry over.
    pub fn normalize(&self, frame: &Frame) -> Result<Frame, NormalizeError> {
        validate(frame)?;

        let data = if frame.width == self.width && frame.height == self.height {
            frame.data.clone()
        } else {
            resize_bilinear(
                &frame.data,
                frame.width,
                frame.height,
                frame.channels,
                self.width,
                self.height,
            )
        };

        Ok(Frame {
            data,
            width: self.width,
            height: self.height,
            channels: frame.channels,
            index: frame.index,
            timestamp_ms: frame.timestamp_ms,
        })
    }
}

fn validate(frame: &Frame) -> Result<(), NormalizeError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(NormalizeError::ZeroArea {
            width: frame.width,
            height: frame.height,
        });
    }
    if frame.channels == 0 {
        return Err(NormalizeError::NoChannels);
    }
    let expected = frame.width * frame.height * frame.channels;
    if frame.data.len() != expected {
        return Err(NormalizeError::BufferSize {
            expected,
            actual: frame.data.len(),
        });
    }
    Ok(())
}

/// Bilinear image resize over interleaved `channels`-wide pixels
fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    channels: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * channels];

    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        // Pixel-center alignment, clamped at the borders
        let sy = ((dy as f32 + 0.5) * y_ratio - 0.5).max(0.0);
        let sy0 = (sy.floor() as usize).min(src_h - 1);
        let sy1 = (sy0 + 1).min(src_h - 1);
        let fy = sy - sy0 as f32;

        for dx in 0..dst_w {
            let sx = ((dx as f32 + 0.5) * x_ratio - 0.5).max(0.0);
            let sx0 = (sx.floor() as usize).min(src_w - 1);
            let sx1 = (sx0 + 1).min(src_w - 1);
            let fx = sx - sx0 as f32;

            for c in 0..channels {
                let p00 = src[(sy0 * src_w + sx0) * channels + c] as f32;
                let p10 = src[(sy0 * src_w + sx1) * channels + c] as f32;
                let p01 = src[(sy1 * src_w + sx0) * channels + c] as f32;
                let p11 = src[(sy1 * src_w + sx1) * channels + c] as f32;

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                dst[(dy * dst_w + dx) * channels + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_any_resolution() {
        let normalizer = FrameNormalizer::new();
        for (w, h) in [(640, 480), (1920, 1080), (1, 1), (1281, 719), (3840, 2160)] {
            let frame = Frame::filled(w, h, 3, 90);
            let out = normalizer.normalize(&frame).unwrap();
            assert_eq!((out.width, out.height), (1280, 720));
            assert_eq!(out.channels, 3);
            assert_eq!(out.data.len(), 1280 * 720 * 3);
        }
    }

    #[test]
    fn test_normalize_preserves_channels() {
        let normalizer = FrameNormalizer::new();
        for channels in [1, 3, 4] {
            let frame = Frame::filled(320, 240, channels, 17);
            let out = normalizer.normalize(&frame).unwrap();
            assert_eq!(out.channels, channels);
            assert_eq!(out.data.len(), 1280 * 720 * channels);
            // Uniform input stays uniform under bilinear interpolation
            assert!(out.data.iter().all(|&v| v == 17));
        }
    }

    #[test]
    fn test_normalize_keeps_frame_identity() {
        let frame = Frame::filled(64, 36, 3, 0).with_index(7, 233.3);
        let out = FrameNormalizer::new().normalize(&frame).unwrap();
        assert_eq!(out.index, 7);
        assert_eq!(out.timestamp_ms, 233.3);
    }

    #[test]
    fn test_processing_size_is_passthrough() {
        let mut frame = Frame::new(1280, 720, 3);
        for (i, v) in frame.data.iter_mut().enumerate() {
            *v = (i % 251) as u8;
        }
        let out = FrameNormalizer::new().normalize(&frame).unwrap();
        assert_eq!(out.data, frame.data);
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let mut frame = Frame::new(97, 53, 3);
        for (i, v) in frame.data.iter_mut().enumerate() {
            *v = (i * 31 % 256) as u8;
        }
        let normalizer = FrameNormalizer::new();
        let a = normalizer.normalize(&frame).unwrap();
        let b = normalizer.normalize(&frame).unwrap();
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn test_upscale_left_right_halves() {
        // 2x1 frame: black left pixel, white right pixel
        let mut frame = Frame::new(2, 1, 1);
        frame.data = vec![0, 255];
        let out = FrameNormalizer::new().normalize(&frame).unwrap();
        assert_eq!(out.pixel(0, 0), &[0]);
        assert_eq!(out.pixel(1279, 719), &[255]);
    }

    #[test]
    fn test_invalid_frames_rejected() {
        let normalizer = FrameNormalizer::new();

        let empty = Frame::new(0, 720, 3);
        assert!(matches!(
            normalizer.normalize(&empty),
            Err(NormalizeError::ZeroArea { .. })
        ));

        let no_channels = Frame::new(10, 10, 0);
        assert_eq!(
            normalizer.normalize(&no_channels),
            Err(NormalizeError::NoChannels)
        );

        let mut corrupt = Frame::new(10, 10, 3);
        corrupt.data.truncate(100);
        assert_eq!(
            normalizer.normalize(&corrupt),
            Err(NormalizeError::BufferSize {
                expected: 300,
                actual: 100
            })
        );
    }
}
