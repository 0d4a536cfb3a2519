//! Conversion of raw device frames into display-ready RGB buffers.

use chrono::{DateTime, Utc};
use image::RgbImage;

use crate::types::{CaptureError, RawFrame};

/// Frame ready for presentation. Owns its pixels; never aliases a device buffer.
#[derive(Clone, Debug)]
pub struct NormalizedFrame {
    pub width: u32,
    pub height: u32,
    /// 3 for RGB output; other values mean the source layout was passed through.
    pub channels: u8,
    pub pixels: Vec<u8>,
    /// Position of the frame within its session, starting at 1.
    pub sequence: u64,
    /// When the read that produced the frame completed.
    pub captured_at: DateTime<Utc>,
}

impl NormalizedFrame {
    pub fn is_rgb(&self) -> bool {
        self.channels == 3
    }

    /// Bytes per row of the packed buffer.
    pub fn stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    /// Copy into an [`RgbImage`]. Layouts wider than RGB keep their first
    /// three channels; two-channel frames use the first as intensity.
    /// Returns `None` for zero-channel or truncated buffers.
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        let channels = self.channels as usize;
        if channels == 0 || self.pixels.len() != self.stride() * self.height as usize {
            return None;
        }
        if channels == 3 {
            return RgbImage::from_raw(self.width, self.height, self.pixels.clone());
        }

        let mut rgb = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for px in self.pixels.chunks_exact(channels) {
            if channels > 3 {
                rgb.extend_from_slice(&px[..3]);
            } else {
                rgb.extend_from_slice(&[px[0], px[0], px[0]]);
            }
        }
        RgbImage::from_raw(self.width, self.height, rgb)
    }
}

/// Convert a raw frame into packed RGB.
///
/// Empty input yields `Ok(None)`. BGR input is swapped to RGB, grayscale is
/// replicated across three channels and any other layout is copied unchanged.
pub fn normalize(raw: &RawFrame) -> Result<Option<NormalizedFrame>, CaptureError> {
    if raw.is_empty() {
        return Ok(None);
    }
    if raw.data.len() != raw.expected_len() {
        return Err(CaptureError::InvalidFrame(format!(
            "{}x{}x{} frame carries {} bytes, expected {}",
            raw.width,
            raw.height,
            raw.channels,
            raw.data.len(),
            raw.expected_len()
        )));
    }

    let (channels, pixels) = match raw.channels {
        3 => (3, bgr_to_rgb(&raw.data)),
        1 => (3, gray_to_rgb(&raw.data)),
        other => (other, raw.data.clone()),
    };

    Ok(Some(NormalizedFrame {
        width: raw.width,
        height: raw.height,
        channels,
        pixels,
        sequence: 0,
        captured_at: Utc::now(),
    }))
}

fn bgr_to_rgb(bgr: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(bgr.len());
    for px in bgr.chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    rgb
}

fn gray_to_rgb(gray: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(gray.len() * 3);
    for &value in gray {
        rgb.extend_from_slice(&[value, value, value]);
    }
    rgb
}
