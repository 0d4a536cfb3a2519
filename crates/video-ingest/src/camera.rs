//! OpenCV-backed capture devices.

use opencv::{
    core::{self, Mat},
    prelude::*,
    videoio::{self, VideoCapture},
};
use tracing::{debug, warn};

use crate::{
    device::{CaptureApi, CaptureBackend, CaptureDevice, CaptureProperty, DeviceHandle},
    handle::SharedHandle,
    types::{CaptureError, RawFrame},
};

#[derive(Clone, Copy, Debug, Default)]
pub struct OpenCvBackend;

impl OpenCvBackend {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "windows")]
const PREFERRED_API: i32 = videoio::CAP_DSHOW;
#[cfg(target_os = "macos")]
const PREFERRED_API: i32 = videoio::CAP_AVFOUNDATION;
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const PREFERRED_API: i32 = videoio::CAP_V4L2;

fn api_flag(api: CaptureApi) -> i32 {
    match api {
        CaptureApi::Preferred => PREFERRED_API,
        CaptureApi::Any => videoio::CAP_ANY,
    }
}

impl CaptureBackend for OpenCvBackend {
    fn name(&self) -> &'static str {
        "opencv"
    }

    fn open_local(&self, index: u32, api: CaptureApi) -> Result<DeviceHandle, CaptureError> {
        let endpoint = index.to_string();
        let backend = api_flag(api);
        let capture = VideoCapture::new(index as i32, backend).map_err(|err| {
            debug!("failed to open device #{index} with backend {backend}: {err}");
            CaptureError::Open {
                endpoint: endpoint.clone(),
            }
        })?;
        OpenCvDevice::wrap(capture, endpoint)
    }

    fn open_stream(&self, uri: &str) -> Result<DeviceHandle, CaptureError> {
        let capture = VideoCapture::from_file(uri, videoio::CAP_ANY).map_err(|err| {
            debug!("failed to open {uri}: {err}");
            CaptureError::Open {
                endpoint: uri.to_string(),
            }
        })?;
        OpenCvDevice::wrap(capture, uri.to_string())
    }
}

/// `VideoCapture` shared between the read loop, stills and `release`.
pub struct OpenCvDevice {
    capture: SharedHandle<VideoCapture>,
}

impl OpenCvDevice {
    fn wrap(capture: VideoCapture, endpoint: String) -> Result<DeviceHandle, CaptureError> {
        let opened = capture
            .is_opened()
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !opened {
            return Err(CaptureError::Open { endpoint });
        }
        debug!(%endpoint, "opencv capture opened");
        Ok(std::sync::Arc::new(Self {
            capture: SharedHandle::new(capture, close_capture),
        }))
    }
}

fn close_capture(mut capture: VideoCapture) {
    if let Err(err) = capture.release() {
        warn!("releasing capture failed: {err}");
    }
}

fn property_id(property: CaptureProperty) -> i32 {
    match property {
        CaptureProperty::FrameWidth => videoio::CAP_PROP_FRAME_WIDTH,
        CaptureProperty::FrameHeight => videoio::CAP_PROP_FRAME_HEIGHT,
        CaptureProperty::Fps => videoio::CAP_PROP_FPS,
        CaptureProperty::BufferSize => videoio::CAP_PROP_BUFFERSIZE,
        CaptureProperty::AutoExposure => videoio::CAP_PROP_AUTO_EXPOSURE,
        CaptureProperty::FourCc => videoio::CAP_PROP_FOURCC,
    }
}

impl CaptureDevice for OpenCvDevice {
    fn read(&self) -> Result<RawFrame, CaptureError> {
        self.capture.with(|capture| {
            let mut mat = Mat::default();
            let grabbed = capture
                .read(&mut mat)
                .map_err(|e| CaptureError::Read(e.to_string()))?;
            if grabbed {
                mat_to_raw(&mat)
            } else {
                Ok(RawFrame::empty())
            }
        })
    }

    fn set(&self, property: CaptureProperty, value: f64) -> Result<bool, CaptureError> {
        self.capture.with(|capture| {
            capture
                .set(property_id(property), value)
                .map_err(|err| CaptureError::Property {
                    property,
                    reason: err.to_string(),
                })
        })
    }

    fn get(&self, property: CaptureProperty) -> Result<f64, CaptureError> {
        self.capture.with(|capture| {
            capture
                .get(property_id(property))
                .map_err(|err| CaptureError::Property {
                    property,
                    reason: err.to_string(),
                })
        })
    }

    fn release(&self) {
        self.capture.release();
    }

    fn is_open(&self) -> bool {
        if self.capture.is_released() {
            return false;
        }
        self.capture
            .peek(|capture| capture.is_some_and(|capture| capture.is_opened().unwrap_or(false)))
            // Busy with a read, so still open.
            .unwrap_or(true)
    }
}

/// Copy an 8-bit `Mat` into an owned, tightly packed buffer.
fn mat_to_raw(mat: &Mat) -> Result<RawFrame, CaptureError> {
    if mat.empty() {
        return Ok(RawFrame::empty());
    }
    if mat.depth() != core::CV_8U {
        return Err(CaptureError::InvalidFrame(format!(
            "unsupported sample depth {}",
            mat.depth()
        )));
    }
    let width = mat.cols() as u32;
    let height = mat.rows() as u32;
    let channels = mat.channels() as u8;

    let data = if mat.is_continuous() {
        mat.data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec()
    } else {
        let packed = mat.try_clone().map_err(|e| CaptureError::Other(e.into()))?;
        packed
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec()
    };

    Ok(RawFrame::new(width, height, channels, data))
}
