//! Timing and negotiation settings for a capture session.

use std::{path::PathBuf, time::Duration};

/// Resolutions tried on local devices, best first.
pub const DEFAULT_RESOLUTIONS: [(u32, u32); 8] = [
    (3840, 2160),
    (2560, 1440),
    (1920, 1080),
    (1600, 1200),
    (1280, 720),
    (1024, 768),
    (800, 600),
    (640, 480),
];

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Pause between stopping a running session and reopening in `start`.
    pub restart_grace: Duration,
    pub resolutions: Vec<(u32, u32)>,
    /// Time given to a device to apply a requested resolution before it is
    /// measured.
    pub resolution_settle: Duration,
    /// Largest per-axis difference, in pixels, accepted as a match.
    pub resolution_tolerance: f64,
    pub target_fps: f64,
    pub local_buffer_frames: f64,
    pub stream_buffer_frames: f64,
    pub auto_exposure: f64,
    pub stream_fourcc: [u8; 4],
    /// Pause after configuration so the device can settle.
    pub stabilize_delay: Duration,
    pub probe_attempts: u32,
    /// Delay between probe reads on network streams.
    pub stream_probe_delay: Duration,
    /// Read loop period; 33 ms targets roughly 30 fps.
    pub frame_period: Duration,
    pub read_retry_delay: Duration,
    pub throughput_interval: Duration,
    /// How long `stop` waits for the worker before tearing down anyway.
    pub stop_timeout: Duration,
    /// Consecutive failed reads after which the device counts as lost.
    /// `None` retries forever.
    pub max_consecutive_read_failures: Option<u32>,
    /// Frames allowed to wait on the executor before new ones are dropped.
    pub max_pending_frames: usize,
    pub still_quality: u8,
    pub output_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            restart_grace: Duration::from_millis(500),
            resolutions: DEFAULT_RESOLUTIONS.to_vec(),
            resolution_settle: Duration::from_millis(50),
            resolution_tolerance: 1.0,
            target_fps: 30.0,
            local_buffer_frames: 1.0,
            stream_buffer_frames: 3.0,
            auto_exposure: 0.25,
            stream_fourcc: *b"H264",
            stabilize_delay: Duration::from_millis(100),
            probe_attempts: 5,
            stream_probe_delay: Duration::from_secs(1),
            frame_period: Duration::from_millis(33),
            read_retry_delay: Duration::from_millis(100),
            throughput_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(3),
            max_consecutive_read_failures: None,
            max_pending_frames: 2,
            still_quality: 95,
            output_dir: default_output_dir(),
        }
    }
}

/// Pictures directory, else Desktop, else the working directory.
pub fn default_output_dir() -> PathBuf {
    dirs::picture_dir()
        .or_else(dirs::desktop_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}
