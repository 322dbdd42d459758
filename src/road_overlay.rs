// src/road_overlay.rs
//
// Lane overlay: the first two detected segments are drawn as thick,
// round-capped lines straight onto the frame buffer with `imageproc`.
//
// The detector ranks its segments, so the first two are taken as the
// left/right lane boundaries of this frame only. Nothing is carried over
// between frames.

use crate::types::{Frame, LaneSegment};
use image::{GrayImage, ImageBuffer, Luma, Rgb, Rgba};
use imageproc::drawing::{draw_filled_circle_mut, draw_polygon_mut, Canvas};
use imageproc::point::Point;

/// Segments drawn per frame.
pub const MAX_LANES: usize = 2;
/// Line width in pixels.
pub const LANE_THICKNESS: u32 = 10;
/// Saturated green, BGR.
pub const LANE_COLOR_BGR: [u8; 3] = [0, 255, 0];

#[derive(Debug, Clone, Copy)]
pub struct OverlayRenderer {
    max_lanes: usize,
    thickness: u32,
    color: [u8; 3],
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self {
            max_lanes: MAX_LANES,
            thickness: LANE_THICKNESS,
            color: LANE_COLOR_BGR,
        }
    }
}

impl OverlayRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws up to the first two segments in place and returns how many were
    /// drawn. Out-of-frame pixels are clipped; never fails.
    pub fn render(&self, frame: &mut Frame, segments: &[LaneSegment]) -> usize {
        let mut drawn = 0;
        for segment in segments.iter().take(self.max_lanes) {
            draw_segment(frame, segment, self.thickness, self.color);
            drawn += 1;
        }
        drawn
    }
}

/// Draws one segment onto the frame buffer, picking the pixel layout from
/// the channel count. Frames whose buffer does not match their size are left
/// alone.
fn draw_segment(frame: &mut Frame, segment: &LaneSegment, thickness: u32, color: [u8; 3]) {
    if frame.width == 0 || frame.height == 0 || frame.channels == 0 {
        return;
    }
    let (width, height) = (frame.width as u32, frame.height as u32);
    let Some(segment) = clip_segment(segment, width, height, thickness) else {
        return;
    };
    let data = frame.data.as_mut_slice();

    match frame.channels {
        1 => {
            if let Some(mut canvas) = ImageBuffer::<Luma<u8>, _>::from_raw(width, height, data) {
                draw_thick_line(&mut canvas, &segment, thickness, Luma([255]));
            }
        }
        3 => {
            if let Some(mut canvas) = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, data) {
                draw_thick_line(&mut canvas, &segment, thickness, Rgb(color));
            }
        }
        4 => {
            if let Some(mut canvas) = ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, data) {
                let [b, g, r] = color;
                draw_thick_line(&mut canvas, &segment, thickness, Rgba([b, g, r, 255]));
            }
        }
        channels => {
            // No pixel type for this layout: draw a mask, then copy it over
            let mut mask = GrayImage::new(width, height);
            draw_thick_line(&mut mask, &segment, thickness, Luma([255]));
            for (pixel, m) in data.chunks_exact_mut(channels).zip(mask.pixels()) {
                if m.0[0] > 0 {
                    for (c, v) in pixel.iter_mut().enumerate() {
                        *v = color.get(c).copied().unwrap_or(255);
                    }
                }
            }
        }
    }
}

/// Clipped endpoints, `(x1, y1, x2, y2)`.
type Segment = (f64, f64, f64, f64);

/// Round-capped line: a filled quad for the body plus a disc on each end.
fn draw_thick_line<C: Canvas>(canvas: &mut C, segment: &Segment, thickness: u32, color: C::Pixel) {
    let radius = thickness as f64 / 2.0;
    let (x1, y1, x2, y2) = *segment;
    let (dx, dy) = (x2 - x1, y2 - y1);
    let len = dx.hypot(dy);

    if len >= 1.0 {
        let (nx, ny) = (-dy / len * radius, dx / len * radius);
        let corner = |x: f64, y: f64| Point::new(x.round() as i32, y.round() as i32);
        let body = [
            corner(x1 + nx, y1 + ny),
            corner(x2 + nx, y2 + ny),
            corner(x2 - nx, y2 - ny),
            corner(x1 - nx, y1 - ny),
        ];
        if body[0] != body[3] {
            draw_polygon_mut(canvas, &body, color);
        }
    }

    let r = radius.round() as i32;
    for (x, y) in [(x1, y1), (x2, y2)] {
        draw_filled_circle_mut(canvas, (x.round() as i32, y.round() as i32), r, color);
    }
}

/// Clips a segment to the frame grown by `margin` on every side
/// (Liang-Barsky). `None` when nothing of it can reach the frame.
fn clip_segment(segment: &LaneSegment, width: u32, height: u32, margin: u32) -> Option<Segment> {
    let m = margin as f64;
    let (min_x, max_x) = (-m, width as f64 - 1.0 + m);
    let (min_y, max_y) = (-m, height as f64 - 1.0 + m);

    let (x1, y1) = (segment.x1 as f64, segment.y1 as f64);
    let (dx, dy) = (segment.x2 as f64 - x1, segment.y2 as f64 - y1);

    let mut t0 = 0.0_f64;
    let mut t1 = 1.0_f64;
    for (p, q) in [
        (-dx, x1 - min_x),
        (dx, max_x - x1),
        (-dy, y1 - min_y),
        (dy, max_y - y1),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
        } else {
            let t = q / p;
            if p < 0.0 {
                t0 = t0.max(t);
            } else {
                t1 = t1.min(t);
            }
        }
    }
    if t0 > t1 {
        return None;
    }

    Some((x1 + t0 * dx, y1 + t0 * dy, x1 + t1 * dx, y1 + t1 * dy))
}
