//! Capture source descriptors handed from the controller to a session.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::CaptureError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Transport used to reach a capture source.
pub enum SourceKind {
    /// Camera attached to this machine, addressed by index.
    LocalDevice,
    /// Stream reachable by URI (RTSP, HTTP, file).
    NetworkStream,
}

impl SourceKind {
    pub fn label(self) -> &'static str {
        match self {
            SourceKind::LocalDevice => "Webcam",
            SourceKind::NetworkStream => "RTSP",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Immutable description of one capture source.
///
/// For local devices `endpoint` is the decimal form of `device_index`; for
/// network streams it is a non-empty URI and `device_index` is unused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSourceDescriptor {
    name: String,
    kind: SourceKind,
    endpoint: String,
    #[serde(default)]
    device_index: u32,
}

impl CaptureSourceDescriptor {
    pub fn local(name: impl Into<String>, device_index: u32) -> Self {
        Self {
            name: name.into(),
            kind: SourceKind::LocalDevice,
            endpoint: device_index.to_string(),
            device_index,
        }
    }

    pub fn network(name: impl Into<String>, uri: impl Into<String>) -> Result<Self, CaptureError> {
        let uri = uri.into();
        if uri.trim().is_empty() {
            return Err(CaptureError::InvalidSource(
                "network stream requires a non-empty URI".to_string(),
            ));
        }
        Ok(Self {
            name: name.into(),
            kind: SourceKind::NetworkStream,
            endpoint: uri,
            device_index: 0,
        })
    }

    /// Build a descriptor from free-form user input: a bare index or
    /// `/dev/videoN` selects a local device, anything else is a stream URI.
    pub fn from_endpoint(name: impl Into<String>, endpoint: &str) -> Result<Self, CaptureError> {
        match parse_device_index(endpoint) {
            Some(index) => Ok(Self::local(name, index)),
            None => Self::network(name, endpoint),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    pub fn is_local(&self) -> bool {
        self.kind == SourceKind::LocalDevice
    }

    pub fn display_info(&self) -> String {
        format!("{} ({})", self.name, self.kind)
    }

    /// Check the endpoint/index invariant. Descriptors built through the
    /// constructors always pass; deserialized ones may not.
    pub fn validate(&self) -> Result<(), CaptureError> {
        match self.kind {
            SourceKind::LocalDevice => match self.endpoint.trim().parse::<u32>() {
                Ok(index) if index == self.device_index => Ok(()),
                Ok(index) => Err(CaptureError::InvalidSource(format!(
                    "endpoint {index} does not match device index {}",
                    self.device_index
                ))),
                Err(_) => Err(CaptureError::InvalidSource(format!(
                    "local device endpoint {:?} is not a device index",
                    self.endpoint
                ))),
            },
            SourceKind::NetworkStream if self.endpoint.trim().is_empty() => Err(
                CaptureError::InvalidSource("network stream requires a non-empty URI".to_string()),
            ),
            SourceKind::NetworkStream => Ok(()),
        }
    }
}

impl fmt::Display for CaptureSourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Parse a bare index or a `/dev/videoX` path into a zero-based device index.
pub fn parse_device_index(uri: &str) -> Option<u32> {
    if let Ok(index) = uri.parse::<u32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<u32>().ok();
        }
    }
    None
}
