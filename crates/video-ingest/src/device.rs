//! Backend-neutral capture device seam.
//!
//! A [`CaptureBackend`] opens devices; a [`CaptureDevice`] is a shared handle
//! that can be read from one thread while another releases it. Release must
//! never block on an outstanding read: implementations flag the handle and let
//! the in-flight read observe the flag.

use std::{ops::Deref, sync::Arc};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    source::{CaptureSourceDescriptor, SourceKind},
    types::{CaptureError, RawFrame},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum CaptureProperty {
    FrameWidth,
    FrameHeight,
    Fps,
    BufferSize,
    AutoExposure,
    FourCc,
}

/// Which platform capture API to open a local device through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureApi {
    /// Platform API with the best device compatibility (V4L2, DirectShow,
    /// AVFoundation).
    Preferred,
    /// Whatever the backend picks by default.
    Any,
}

pub trait CaptureDevice: Send + Sync {
    /// Read one frame. A read that succeeds without a picture returns
    /// [`RawFrame::empty`].
    fn read(&self) -> Result<RawFrame, CaptureError>;

    /// Request a property value. `Ok(false)` means the device ignored it.
    fn set(&self, property: CaptureProperty, value: f64) -> Result<bool, CaptureError>;

    fn get(&self, property: CaptureProperty) -> Result<f64, CaptureError>;

    /// Close the device. Idempotent and safe while a read is in flight.
    fn release(&self);

    fn is_open(&self) -> bool;
}

pub type DeviceHandle = Arc<dyn CaptureDevice>;

pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn open_local(&self, index: u32, api: CaptureApi) -> Result<DeviceHandle, CaptureError>;

    fn open_stream(&self, uri: &str) -> Result<DeviceHandle, CaptureError>;
}

/// Pack a four character code the way OpenCV's `VideoWriter::fourcc` does.
pub fn fourcc(code: [u8; 4]) -> f64 {
    let packed = u32::from(code[0])
        | (u32::from(code[1]) << 8)
        | (u32::from(code[2]) << 16)
        | (u32::from(code[3]) << 24);
    f64::from(packed)
}

/// Releases the wrapped device when dropped unless ownership was taken back
/// with [`DeviceGuard::into_inner`].
pub struct DeviceGuard {
    device: Option<DeviceHandle>,
}

impl DeviceGuard {
    pub fn new(device: DeviceHandle) -> Self {
        Self {
            device: Some(device),
        }
    }

    pub fn into_inner(mut self) -> DeviceHandle {
        match self.device.take() {
            Some(device) => device,
            None => unreachable!("device guard emptied before into_inner"),
        }
    }
}

impl Deref for DeviceGuard {
    type Target = dyn CaptureDevice;

    fn deref(&self) -> &Self::Target {
        match self.device.as_deref() {
            Some(device) => device,
            None => unreachable!("device guard emptied before drop"),
        }
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            device.release();
        }
    }
}

/// Device opened for a descriptor, plus the error from the preferred API when
/// a local device had to fall back to the generic one.
pub struct OpenedSource {
    pub device: DeviceHandle,
    pub preferred_api_error: Option<CaptureError>,
}

/// Open `source` through `backend`. Local devices try the preferred platform
/// API first and fall back to the generic API.
pub fn open_source(
    backend: &dyn CaptureBackend,
    source: &CaptureSourceDescriptor,
) -> Result<OpenedSource, CaptureError> {
    match source.kind() {
        SourceKind::LocalDevice => {
            let index = source.device_index();
            match backend.open_local(index, CaptureApi::Preferred) {
                Ok(device) => Ok(OpenedSource {
                    device,
                    preferred_api_error: None,
                }),
                Err(err) => {
                    warn!(
                        backend = backend.name(),
                        "failed to open device #{index} with preferred API: {err}"
                    );
                    let device = backend.open_local(index, CaptureApi::Any)?;
                    Ok(OpenedSource {
                        device,
                        preferred_api_error: Some(err),
                    })
                }
            }
        }
        SourceKind::NetworkStream => {
            debug!(backend = backend.name(), uri = source.endpoint(), "opening stream");
            let device = backend.open_stream(source.endpoint())?;
            Ok(OpenedSource {
                device,
                preferred_api_error: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticBackend, SyntheticProfile};

    #[test]
    fn fourcc_matches_opencv_packing() {
        // cv::VideoWriter::fourcc('H','2','6','4') == 875967048
        assert_eq!(fourcc(*b"H264"), 875_967_048.0);
    }

    #[test]
    fn guard_releases_unless_taken() {
        let backend = SyntheticBackend::new().with_device(0, SyntheticProfile::default());
        let counters = backend.counters();

        let guard = DeviceGuard::new(backend.open_local(0, CaptureApi::Any).unwrap());
        assert_eq!(counters.live(), 1);
        drop(guard);
        assert_eq!(counters.live(), 0);

        let guard = DeviceGuard::new(backend.open_local(0, CaptureApi::Any).unwrap());
        let device = guard.into_inner();
        assert_eq!(counters.live(), 1);
        device.release();
        assert_eq!(counters.live(), 0);
    }

    #[test]
    fn local_open_falls_back_to_generic_api() {
        let backend = SyntheticBackend::new().with_device(
            1,
            SyntheticProfile {
                preferred_api_fails: true,
                ..SyntheticProfile::default()
            },
        );
        let source = CaptureSourceDescriptor::local("cam", 1);
        let opened = open_source(&backend, &source).unwrap();
        assert!(opened.preferred_api_error.is_some());
        assert!(opened.device.is_open());
        opened.device.release();
    }
}
