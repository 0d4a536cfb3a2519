//! Video source access for the capture pipeline.
//!
//! - `source`: capture source descriptors.
//! - `device`: the backend/device traits every capture implementation fulfils.
//! - `handle`: native handle shared between readers and release.
//! - `frame`: conversion of raw device frames into packed RGB.
//! - `resolver`: discovery of local devices.
//! - `synthetic`: test-pattern backend.
//! - `camera`: OpenCV backend (feature `opencv`).

#[cfg(feature = "opencv")]
mod camera;
mod device;
mod frame;
#[cfg_attr(not(feature = "opencv"), allow(dead_code))]
mod handle;
mod resolver;
mod source;
pub mod synthetic;
mod types;

#[cfg(feature = "opencv")]
pub use camera::{OpenCvBackend, OpenCvDevice};
pub use device::{
    fourcc, open_source, CaptureApi, CaptureBackend, CaptureDevice, CaptureProperty,
    DeviceGuard, DeviceHandle, OpenedSource,
};
pub use frame::{normalize, NormalizedFrame};
pub use resolver::{DeviceResolver, DEFAULT_PROBE_LIMIT, EXAMPLE_STREAM_URI};
pub use source::{parse_device_index, CaptureSourceDescriptor, SourceKind};
pub use synthetic::{DeviceCounters, SyntheticBackend, SyntheticProfile};
pub use types::{CaptureError, RawFrame};
