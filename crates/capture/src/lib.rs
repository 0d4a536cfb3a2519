//! Live capture sessions built on `video-ingest` backends.
//!
//! - `session`: the start/stop state machine, read worker and stills.
//! - `status`: structured status events and the controller-side tracker.
//! - `delivery`: executors and subscriber registries for frames and events.
//! - `config`: timing and negotiation settings.
//! - `telemetry`: thread helpers that keep the tracing context.

pub mod config;
pub mod delivery;
mod session;
pub mod status;
pub mod telemetry;

pub use config::{default_output_dir, SessionConfig, DEFAULT_RESOLUTIONS};
pub use delivery::{Executor, InlineExecutor, Job, Subscribers, SubscriptionId, ThreadExecutor};
pub use session::{still_file_name, CaptureSession, SessionPhase, SessionSnapshot};
pub use status::{Severity, StatusEvent, StatusKind, StatusSnapshot, StatusTracker};
