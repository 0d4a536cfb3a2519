//! Best-effort device configuration and the initial read probe.
//!
//! Each property is set independently; a device rejecting one property never
//! aborts configuration.

use tracing::debug;
use video_ingest::{fourcc, CaptureDevice, CaptureProperty, CaptureSourceDescriptor, SourceKind};

use crate::{
    config::SessionConfig,
    session::cancel::Cancellation,
    status::{StatusKind, StatusReporter},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NegotiatedResolution {
    /// A preferred resolution was applied.
    Exact { width: u32, height: u32 },
    /// No preference matched; last measured resolution.
    Measured { width: u32, height: u32 },
    /// The device never reported its resolution.
    Unknown,
    /// A stop arrived while waiting for the device to settle.
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ProbeOutcome {
    Frame { width: u32, height: u32 },
    NoFrames,
    Cancelled,
}

fn try_set(device: &dyn CaptureDevice, property: CaptureProperty, value: f64) -> bool {
    match device.set(property, value) {
        Ok(applied) => applied,
        Err(err) => {
            debug!("ignoring unsupported setting: {err}");
            false
        }
    }
}

fn measure(device: &dyn CaptureDevice) -> Option<(f64, f64)> {
    let width = device.get(CaptureProperty::FrameWidth).ok()?;
    let height = device.get(CaptureProperty::FrameHeight).ok()?;
    Some((width, height))
}

/// Try each preferred resolution in order and keep the first one the device
/// actually applies.
pub(crate) fn negotiate_resolution(
    device: &dyn CaptureDevice,
    config: &SessionConfig,
    cancel: &Cancellation,
) -> NegotiatedResolution {
    let mut last_measured = measure(device);

    for &(width, height) in &config.resolutions {
        try_set(device, CaptureProperty::FrameWidth, f64::from(width));
        try_set(device, CaptureProperty::FrameHeight, f64::from(height));
        if !config.resolution_settle.is_zero() && !cancel.sleep(config.resolution_settle) {
            return NegotiatedResolution::Cancelled;
        }

        let Some((actual_w, actual_h)) = measure(device) else {
            continue;
        };
        last_measured = Some((actual_w, actual_h));
        debug!("requested {width}x{height}, device reports {actual_w}x{actual_h}");
        if (actual_w - f64::from(width)).abs() <= config.resolution_tolerance
            && (actual_h - f64::from(height)).abs() <= config.resolution_tolerance
        {
            return NegotiatedResolution::Exact {
                width: actual_w as u32,
                height: actual_h as u32,
            };
        }
    }

    match last_measured {
        Some((width, height)) => NegotiatedResolution::Measured {
            width: width as u32,
            height: height as u32,
        },
        None => NegotiatedResolution::Unknown,
    }
}

/// Apply source-specific settings and report what was chosen.
pub(crate) fn apply_settings(
    device: &dyn CaptureDevice,
    source: &CaptureSourceDescriptor,
    config: &SessionConfig,
    status: &StatusReporter,
    cancel: &Cancellation,
) {
    match source.kind() {
        SourceKind::LocalDevice => {
            status.report(StatusKind::Configuring, "Configuring webcam settings...");
            match negotiate_resolution(device, config, cancel) {
                NegotiatedResolution::Exact { width, height } => status.report(
                    StatusKind::ResolutionSelected {
                        width,
                        height,
                        exact: true,
                    },
                    format!("Resolution set to {width}x{height}"),
                ),
                NegotiatedResolution::Measured { width, height } => status.report(
                    StatusKind::ResolutionSelected {
                        width,
                        height,
                        exact: false,
                    },
                    format!("Using resolution: {width}x{height}"),
                ),
                NegotiatedResolution::Unknown => {
                    debug!("device did not report a resolution");
                }
                NegotiatedResolution::Cancelled => return,
            }
            try_set(device, CaptureProperty::Fps, config.target_fps);
            try_set(device, CaptureProperty::BufferSize, config.local_buffer_frames);
            try_set(device, CaptureProperty::AutoExposure, config.auto_exposure);
        }
        SourceKind::NetworkStream => {
            status.report(StatusKind::Configuring, "Configuring RTSP stream...");
            try_set(device, CaptureProperty::BufferSize, config.stream_buffer_frames);
            try_set(device, CaptureProperty::FourCc, fourcc(config.stream_fourcc));
        }
    }

    cancel.sleep(config.stabilize_delay);
    status.report(StatusKind::Configured, "Camera configured successfully");
}

/// Read until a non-empty frame arrives or the attempts run out.
pub(crate) fn probe_frames(
    device: &dyn CaptureDevice,
    source: &CaptureSourceDescriptor,
    config: &SessionConfig,
    status: &StatusReporter,
    cancel: &Cancellation,
) -> ProbeOutcome {
    let attempts = config.probe_attempts.max(1);
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return ProbeOutcome::Cancelled;
        }
        match device.read() {
            Ok(frame) if !frame.is_empty() => {
                return ProbeOutcome::Frame {
                    width: frame.width,
                    height: frame.height,
                };
            }
            Ok(_) => debug!(attempt, "probe read returned an empty frame"),
            Err(err) => debug!(attempt, "probe read failed: {err}"),
        }

        if !source.is_local() && attempt < attempts {
            status.report(
                StatusKind::WaitingForStream { attempt, attempts },
                format!("Waiting for RTSP connection... ({attempt}/{attempts})"),
            );
            if !cancel.sleep(config.stream_probe_delay) {
                return ProbeOutcome::Cancelled;
            }
        }
    }
    ProbeOutcome::NoFrames
}
