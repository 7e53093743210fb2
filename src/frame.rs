//! Frames as they move from capture sources through detection to viewers.
//!
//! - `Frame`: tightly packed RGB24 pixels plus dimensions and capture instant.
//! - `annotate`: draws detection boxes and an occupancy marker strip.
//! - `encode_jpeg`: what `get_frame` hands to the serving layer.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, Rgb, RgbImage};
use std::time::Instant;

use crate::detect::{Detection, ObjectClass};

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Count markers drawn before the strip is considered full.
const MAX_COUNT_MARKERS: u32 = 20;
const MARKER_SIZE: u32 = 8;
const MARKER_GAP: u32 = 4;
const BOX_THICKNESS: u32 = 2;

const PERSON_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const OTHER_COLOR: Rgb<u8> = Rgb([255, 200, 0]);
const STRIP_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const OVERFLOW_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// A single RGB frame.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    captured_at: Instant,
}

impl Frame {
    /// Wrap RGB24 pixels, validating the buffer length.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
        })
    }

    /// Uniform frame, mostly useful for tests and synthetic sources.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Draw detection boxes and the person count onto the frame.
    ///
    /// The count is rendered as a row of square markers in the top-left
    /// corner, one per person; a red marker closes the row when the count
    /// exceeds what fits.
    pub fn annotate(self, detections: &[Detection], person_count: u32) -> Self {
        let Frame {
            data,
            width,
            height,
            captured_at,
        } = self;
        let Some(mut image) = RgbImage::from_raw(width, height, data) else {
            // from_rgb/solid guarantee the length, so this is unreachable in practice.
            return Frame::solid(width, height, [0, 0, 0]);
        };

        for detection in detections {
            let color = if detection.class == ObjectClass::Person {
                PERSON_COLOR
            } else {
                OTHER_COLOR
            };
            let b = detection.bbox;
            let x0 = scale(b.x, width);
            let y0 = scale(b.y, height);
            let x1 = scale(b.x + b.w, width);
            let y1 = scale(b.y + b.h, height);
            draw_hollow_rect(&mut image, x0, y0, x1, y1, color);
        }

        draw_count_strip(&mut image, person_count);

        Frame {
            data: image.into_raw(),
            width,
            height,
            captured_at,
        }
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
        encoder
            .encode(&self.data, self.width, self.height, ExtendedColorType::Rgb8)
            .context("encode frame as jpeg")?;
        Ok(out)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

fn scale(normalized: f32, extent: u32) -> u32 {
    if extent == 0 {
        return 0;
    }
    let px = (normalized.clamp(0.0, 1.0) * extent as f32).round() as u32;
    px.min(extent - 1)
}

fn draw_hollow_rect(image: &mut RgbImage, x0: u32, y0: u32, x1: u32, y1: u32, color: Rgb<u8>) {
    for t in 0..BOX_THICKNESS {
        for x in x0..=x1 {
            put(image, x, y0 + t, color);
            put(image, x, y1.saturating_sub(t), color);
        }
        for y in y0..=y1 {
            put(image, x0 + t, y, color);
            put(image, x1.saturating_sub(t), y, color);
        }
    }
}

fn draw_count_strip(image: &mut RgbImage, person_count: u32) {
    let shown = person_count.min(MAX_COUNT_MARKERS);
    let overflow = person_count > MAX_COUNT_MARKERS;
    let slots = shown + u32::from(overflow);
    let strip_w = MARKER_GAP + slots.max(1) * (MARKER_SIZE + MARKER_GAP);
    let strip_h = MARKER_SIZE + 2 * MARKER_GAP;

    fill_rect(image, 0, 0, strip_w, strip_h, STRIP_COLOR);
    for i in 0..slots {
        let color = if overflow && i == shown {
            OVERFLOW_COLOR
        } else {
            PERSON_COLOR
        };
        let x = MARKER_GAP + i * (MARKER_SIZE + MARKER_GAP);
        fill_rect(image, x, MARKER_GAP, MARKER_SIZE, MARKER_SIZE, color);
    }
}

fn fill_rect(image: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>) {
    for yy in y..y.saturating_add(h) {
        for xx in x..x.saturating_add(w) {
            put(image, xx, yy, color);
        }
    }
}

fn put(image: &mut RgbImage, x: u32, y: u32, color: Rgb<u8>) {
    if x < image.width() && y < image.height() {
        image.put_pixel(x, y, color);
    }
}
