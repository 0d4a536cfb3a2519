//! Virtual capture backend emitting test-pattern frames.
//!
//! Used by the CLI when no hardware backend is compiled in and by tests, which
//! rely on the [`DeviceCounters`] to check that devices are never leaked.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use tracing::debug;

use crate::{
    device::{CaptureApi, CaptureBackend, CaptureDevice, CaptureProperty, DeviceHandle},
    types::{CaptureError, RawFrame},
};

/// Behaviour of one synthetic device.
#[derive(Clone, Debug)]
pub struct SyntheticProfile {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub open_fails: bool,
    pub preferred_api_fails: bool,
    /// Number of leading reads that return an empty frame.
    pub empty_reads: u64,
    /// Every read fails with an error.
    pub reads_fail: bool,
    /// After this many reads the device behaves as if unplugged.
    pub lose_after_reads: Option<u64>,
    /// After this many reads every frame comes back empty while the device
    /// stays open, like a stream that has stalled.
    pub stall_after_reads: Option<u64>,
    pub read_latency: Duration,
    /// Resolutions the device accepts. Empty accepts anything.
    pub supported_resolutions: Vec<(u32, u32)>,
    pub rejected_properties: Vec<CaptureProperty>,
    /// Panic inside `open_*`, for exercising callers that must contain faults.
    pub panic_on_open: bool,
}

impl Default for SyntheticProfile {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            channels: 3,
            open_fails: false,
            preferred_api_fails: false,
            empty_reads: 0,
            reads_fail: false,
            lose_after_reads: None,
            stall_after_reads: None,
            read_latency: Duration::ZERO,
            supported_resolutions: Vec::new(),
            rejected_properties: Vec::new(),
            panic_on_open: false,
        }
    }
}

/// Open/release bookkeeping shared by all devices of one backend.
#[derive(Debug, Default)]
pub struct DeviceCounters {
    opened: AtomicUsize,
    released: AtomicUsize,
    live: AtomicUsize,
    peak_live: AtomicUsize,
}

impl DeviceCounters {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Devices currently open.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open devices observed.
    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    fn on_open(&self) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_live.fetch_max(live, Ordering::SeqCst);
    }

    fn on_release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct SyntheticBackend {
    devices: HashMap<u32, SyntheticProfile>,
    streams: HashMap<String, SyntheticProfile>,
    counters: Arc<DeviceCounters>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// One 640x480 webcam at index 0 and a stream at `uri`.
    pub fn demo(uri: &str) -> Self {
        Self::new()
            .with_device(0, SyntheticProfile::default())
            .with_stream(
                uri,
                SyntheticProfile {
                    width: 1280,
                    height: 720,
                    ..SyntheticProfile::default()
                },
            )
    }

    pub fn with_device(mut self, index: u32, profile: SyntheticProfile) -> Self {
        self.devices.insert(index, profile);
        self
    }

    pub fn with_stream(mut self, uri: &str, profile: SyntheticProfile) -> Self {
        self.streams.insert(uri.to_string(), profile);
        self
    }

    pub fn counters(&self) -> Arc<DeviceCounters> {
        self.counters.clone()
    }

    fn open_profile(
        &self,
        endpoint: String,
        profile: Option<&SyntheticProfile>,
    ) -> Result<DeviceHandle, CaptureError> {
        let profile = match profile {
            Some(profile) if !profile.open_fails => profile.clone(),
            _ => return Err(CaptureError::Open { endpoint }),
        };
        if profile.panic_on_open {
            panic!("synthetic device {endpoint} panicked while opening");
        }
        debug!(endpoint, "synthetic device opened");
        self.counters.on_open();
        Ok(Arc::new(SyntheticDevice::new(profile, self.counters.clone())))
    }
}

impl CaptureBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open_local(&self, index: u32, api: CaptureApi) -> Result<DeviceHandle, CaptureError> {
        let profile = self.devices.get(&index);
        if api == CaptureApi::Preferred && profile.is_some_and(|p| p.preferred_api_fails) {
            return Err(CaptureError::Open {
                endpoint: index.to_string(),
            });
        }
        self.open_profile(index.to_string(), profile)
    }

    fn open_stream(&self, uri: &str) -> Result<DeviceHandle, CaptureError> {
        self.open_profile(uri.to_string(), self.streams.get(uri))
    }
}

struct Geometry {
    width: u32,
    height: u32,
    requested_width: Option<u32>,
    properties: HashMap<CaptureProperty, f64>,
}

pub struct SyntheticDevice {
    profile: SyntheticProfile,
    geometry: Mutex<Geometry>,
    released: AtomicBool,
    reads: AtomicU64,
    counters: Arc<DeviceCounters>,
}

impl SyntheticDevice {
    fn new(profile: SyntheticProfile, counters: Arc<DeviceCounters>) -> Self {
        let geometry = Geometry {
            width: profile.width,
            height: profile.height,
            requested_width: None,
            properties: HashMap::new(),
        };
        Self {
            profile,
            geometry: Mutex::new(geometry),
            released: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            counters,
        }
    }

    fn unplugged(&self) -> bool {
        self.profile
            .lose_after_reads
            .is_some_and(|limit| self.reads.load(Ordering::SeqCst) >= limit)
    }

    fn accepts(&self, width: u32, height: u32) -> bool {
        self.profile.supported_resolutions.is_empty()
            || self.profile.supported_resolutions.contains(&(width, height))
    }
}

impl CaptureDevice for SyntheticDevice {
    fn read(&self) -> Result<RawFrame, CaptureError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(CaptureError::Released);
        }
        if self.unplugged() {
            return Err(CaptureError::Read("device disconnected".to_string()));
        }
        if !self.profile.read_latency.is_zero() {
            thread::sleep(self.profile.read_latency);
        }
        if self.released.load(Ordering::SeqCst) {
            return Err(CaptureError::Released);
        }

        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        if self.profile.reads_fail {
            return Err(CaptureError::Read("synthetic read failure".to_string()));
        }
        if n < self.profile.empty_reads
            || self.profile.stall_after_reads.is_some_and(|limit| n >= limit)
        {
            return Ok(RawFrame::empty());
        }

        let (width, height) = {
            let geometry = self.geometry.lock().unwrap_or_else(PoisonError::into_inner);
            (geometry.width, geometry.height)
        };
        Ok(test_pattern(width, height, self.profile.channels, n))
    }

    fn set(&self, property: CaptureProperty, value: f64) -> Result<bool, CaptureError> {
        if self.profile.rejected_properties.contains(&property) {
            return Err(CaptureError::Property {
                property,
                reason: "not supported by synthetic device".to_string(),
            });
        }
        let mut geometry = self.geometry.lock().unwrap_or_else(PoisonError::into_inner);
        match property {
            CaptureProperty::FrameWidth => {
                geometry.requested_width = Some(value as u32);
            }
            CaptureProperty::FrameHeight => {
                let width = geometry.requested_width.take().unwrap_or(geometry.width);
                let height = value as u32;
                if self.accepts(width, height) {
                    geometry.width = width;
                    geometry.height = height;
                }
            }
            other => {
                geometry.properties.insert(other, value);
            }
        }
        Ok(true)
    }

    fn get(&self, property: CaptureProperty) -> Result<f64, CaptureError> {
        let geometry = self.geometry.lock().unwrap_or_else(PoisonError::into_inner);
        match property {
            CaptureProperty::FrameWidth => Ok(f64::from(geometry.width)),
            CaptureProperty::FrameHeight => Ok(f64::from(geometry.height)),
            other => Ok(geometry.properties.get(&other).copied().unwrap_or(0.0)),
        }
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.counters.on_release();
        }
    }

    fn is_open(&self) -> bool {
        !self.released.load(Ordering::SeqCst) && !self.unplugged()
    }
}

/// Diagonal gradient that shifts with `tick`; BGR order for three channels.
fn test_pattern(width: u32, height: u32, channels: u8, tick: u64) -> RawFrame {
    let mut data = Vec::with_capacity(width as usize * height as usize * channels as usize);
    for y in 0..height {
        for x in 0..width {
            let value = ((u64::from(x) + u64::from(y) + tick) % 256) as u8;
            match channels {
                3 => data.extend_from_slice(&[value, 0x80, 255 - value]),
                n => data.extend(std::iter::repeat(value).take(n as usize)),
            }
        }
    }
    RawFrame::new(width, height, channels, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_applies_only_when_supported() {
        let backend = SyntheticBackend::new().with_device(
            0,
            SyntheticProfile {
                supported_resolutions: vec![(1280, 720)],
                ..SyntheticProfile::default()
            },
        );
        let device = backend.open_local(0, CaptureApi::Any).unwrap();

        device.set(CaptureProperty::FrameWidth, 1920.0).unwrap();
        device.set(CaptureProperty::FrameHeight, 1080.0).unwrap();
        assert_eq!(device.get(CaptureProperty::FrameWidth).unwrap(), 640.0);

        device.set(CaptureProperty::FrameWidth, 1280.0).unwrap();
        device.set(CaptureProperty::FrameHeight, 720.0).unwrap();
        assert_eq!(device.get(CaptureProperty::FrameWidth).unwrap(), 1280.0);
        assert_eq!(device.get(CaptureProperty::FrameHeight).unwrap(), 720.0);

        let frame = device.read().unwrap();
        assert_eq!((frame.width, frame.height), (1280, 720));
        assert_eq!(frame.data.len(), frame.expected_len());
        device.release();
    }

    #[test]
    fn release_is_idempotent_and_fails_later_reads() {
        let backend = SyntheticBackend::new().with_device(0, SyntheticProfile::default());
        let counters = backend.counters();
        let device = backend.open_local(0, CaptureApi::Preferred).unwrap();

        device.release();
        device.release();
        assert_eq!(counters.released(), 1);
        assert_eq!(counters.live(), 0);
        assert!(!device.is_open());
        assert!(matches!(device.read(), Err(CaptureError::Released)));
    }

    #[test]
    fn unplugged_device_reports_closed() {
        let backend = SyntheticBackend::new().with_device(
            0,
            SyntheticProfile {
                lose_after_reads: Some(2),
                ..SyntheticProfile::default()
            },
        );
        let device = backend.open_local(0, CaptureApi::Any).unwrap();
        assert!(device.read().is_ok());
        assert!(device.read().is_ok());
        assert!(!device.is_open());
        assert!(device.read().is_err());
        device.release();
    }
}
