//! Command-line arguments and their translation into session settings.
//!
//! Parsing is left to clap; the `TryFrom` conversion owns validation so the
//! rest of the binary only ever sees a checked [`AppConfig`].

use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Result};
use capture::SessionConfig;
use clap::{Args, Parser, Subcommand, ValueEnum};
use video_ingest::{DEFAULT_PROBE_LIMIT, EXAMPLE_STREAM_URI};

#[derive(Debug, Parser)]
#[command(name = "camctl", version, about = "Inspect and stream capture sources")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
/// Capture implementation used to open sources.
pub enum BackendKind {
    /// Built-in test-pattern devices.
    Synthetic,
    /// OpenCV `VideoCapture` (requires the `opencv` feature).
    Opencv,
}

/// Flags shared by every subcommand.
#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Capture backend.
    #[arg(long, value_enum, default_value_t = BackendKind::Synthetic, global = true)]
    pub backend: BackendKind,
    /// Directory for stills (defaults to Pictures, then Desktop).
    #[arg(long = "output-dir", value_name = "DIR", global = true)]
    pub output_dir: Option<PathBuf>,
    /// Print the Prometheus metrics snapshot before exiting.
    #[arg(long = "print-metrics", action = clap::ArgAction::SetTrue, global = true)]
    pub print_metrics: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH", global = true)]
    pub chrome_trace: Option<PathBuf>,
    /// Network stream listed next to detected devices.
    #[arg(long = "stream-uri", value_name = "URI", default_value = EXAMPLE_STREAM_URI, global = true)]
    pub stream_uri: String,
    /// JPEG quality for stills (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", global = true)]
    pub jpeg_quality: Option<u8>,
    /// Seconds to wait for the read loop when stopping.
    #[arg(long = "stop-timeout", value_name = "SECS", global = true)]
    pub stop_timeout: Option<f64>,
    /// Treat this many consecutive failed reads as a lost device.
    #[arg(long = "max-read-failures", value_name = "N", global = true)]
    pub max_read_failures: Option<u32>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Probe local devices and list known sources.
    List(ListArgs),
    /// Stream a source, logging status until the duration elapses or Ctrl+C.
    Stream(StreamArgs),
    /// Start a source, save one still and stop.
    Snapshot(SnapshotArgs),
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Number of local device indices to probe.
    #[arg(long = "max-index", value_name = "N", default_value_t = DEFAULT_PROBE_LIMIT)]
    pub max_index: u32,
    /// Print descriptors as JSON.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct StreamArgs {
    /// Device index, `/dev/videoN` or stream URI (defaults to device 0).
    #[arg(long, value_name = "SOURCE")]
    pub source: Option<String>,
    /// Stop after this many seconds instead of waiting for Ctrl+C.
    #[arg(long, value_name = "SECS")]
    pub seconds: Option<u64>,
    /// Save a still once streaming has started.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub snapshot: bool,
}

#[derive(Debug, Args)]
pub struct SnapshotArgs {
    /// Device index, `/dev/videoN` or stream URI (defaults to device 0).
    #[arg(long, value_name = "SOURCE")]
    pub source: Option<String>,
}

/// Validated settings shared by all subcommands.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub backend: BackendKind,
    pub stream_uri: String,
    pub print_metrics: bool,
    pub chrome_trace_path: Option<PathBuf>,
    pub session: SessionConfig,
}

impl TryFrom<GlobalArgs> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(args: GlobalArgs) -> Result<Self> {
        if args.stream_uri.trim().is_empty() {
            bail!("--stream-uri must not be empty");
        }

        let mut session = SessionConfig::default();
        if let Some(dir) = args.output_dir {
            if dir.as_os_str().is_empty() {
                bail!("--output-dir must not be empty");
            }
            session.output_dir = dir;
        }
        if let Some(quality) = args.jpeg_quality {
            if !(1..=100).contains(&quality) {
                bail!("--jpeg-quality must be an integer between 1 and 100");
            }
            session.still_quality = quality;
        }
        if let Some(secs) = args.stop_timeout {
            if !secs.is_finite() || secs <= 0.0 {
                bail!("--stop-timeout must be a positive number of seconds");
            }
            session.stop_timeout = Duration::from_secs_f64(secs);
        }
        if let Some(limit) = args.max_read_failures {
            if limit == 0 {
                bail!("--max-read-failures must be at least 1");
            }
            session.max_consecutive_read_failures = Some(limit);
        }

        Ok(Self {
            backend: args.backend,
            stream_uri: args.stream_uri,
            print_metrics: args.print_metrics,
            chrome_trace_path: args.chrome_trace,
            session,
        })
    }
}
