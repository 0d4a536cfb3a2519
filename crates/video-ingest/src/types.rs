use anyhow::Error;
use thiserror::Error;

use crate::device::CaptureProperty;

/// Decoded frame as handed back by a capture device.
///
/// `data` is tightly packed (`width * height * channels` bytes). Three-channel
/// frames are BGR ordered, matching what OpenCV-style backends produce.
#[derive(Clone, Debug, Default)]
pub struct RawFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Self {
        Self {
            data,
            width,
            height,
            channels,
        }
    }

    /// A read that produced no picture.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.channels == 0 || self.data.is_empty()
    }

    /// Number of bytes the frame should carry given its geometry.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {endpoint:?}")]
    Open { endpoint: String },
    #[error("frame read failed: {0}")]
    Read(String),
    #[error("property {property:?} rejected: {reason}")]
    Property {
        property: CaptureProperty,
        reason: String,
    },
    #[error("invalid capture source: {0}")]
    InvalidSource(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("capture device has been released")]
    Released,
    #[error(transparent)]
    Other(#[from] Error),
}
