//! Structured status events emitted by a capture session.

use std::{path::PathBuf, sync::Arc};

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::delivery::{Executor, Subscribers};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum StatusKind {
    Connecting,
    Opening,
    /// The preferred platform API failed and the generic one is being used.
    ApiFallback,
    Configuring,
    ResolutionSelected {
        width: u32,
        height: u32,
        /// `false` when no preferred resolution was accepted and this is
        /// simply what the device reports.
        exact: bool,
    },
    Configured,
    WaitingForStream {
        attempt: u32,
        attempts: u32,
    },
    Active {
        width: u32,
        height: u32,
    },
    Connected,
    StreamingStarted,
    ReadFailed,
    FrameConversionFailed,
    Throughput {
        fps: f64,
    },
    /// A start or stop is already in flight.
    Busy,
    Cancelled,
    DeviceLost,
    LoopFault,
    Stopping,
    StopTimeout,
    TeardownFault,
    Stopped,
    AlreadyStopped,
    NotRunning,
    StillSaved {
        path: PathBuf,
    },
    StillFailed,
    StartFailed,
}

impl StatusKind {
    pub fn severity(&self) -> Severity {
        match self {
            StatusKind::Active { .. }
            | StatusKind::Connected
            | StatusKind::StreamingStarted
            | StatusKind::Throughput { .. }
            | StatusKind::StillSaved { .. } => Severity::Success,
            StatusKind::ApiFallback
            | StatusKind::ReadFailed
            | StatusKind::FrameConversionFailed
            | StatusKind::Busy
            | StatusKind::StopTimeout
            | StatusKind::AlreadyStopped
            | StatusKind::NotRunning => Severity::Warning,
            StatusKind::DeviceLost
            | StatusKind::LoopFault
            | StatusKind::TeardownFault
            | StatusKind::StillFailed
            | StatusKind::StartFailed => Severity::Error,
            _ => Severity::Info,
        }
    }

    /// Whether this event implies frames are (or are no longer) being
    /// delivered. `None` leaves the controller's current belief unchanged.
    pub fn running_hint(&self) -> Option<bool> {
        match self {
            StatusKind::Connected
            | StatusKind::Active { .. }
            | StatusKind::StreamingStarted
            | StatusKind::Throughput { .. } => Some(true),
            StatusKind::Stopped
            | StatusKind::Cancelled
            | StatusKind::DeviceLost
            | StatusKind::LoopFault
            | StatusKind::StartFailed => Some(false),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusEvent {
    #[serde(flatten)]
    pub kind: StatusKind,
    pub message: String,
    pub timestamp_ms: i64,
}

impl StatusEvent {
    pub fn new(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn running_hint(&self) -> Option<bool> {
        self.kind.running_hint()
    }
}

/// Controller-side view of the latest status: what to show and whether the
/// session is believed to be delivering frames.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusSnapshot {
    pub message: String,
    pub severity: Severity,
    pub is_running: bool,
}

#[derive(Debug)]
pub struct StatusTracker {
    current: StatusSnapshot,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self {
            current: StatusSnapshot {
                message: String::new(),
                severity: Severity::Info,
                is_running: false,
            },
        }
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &StatusEvent) -> &StatusSnapshot {
        if let Some(running) = event.running_hint() {
            self.current.is_running = running;
        }
        self.current.message.clone_from(&event.message);
        self.current.severity = event.severity();
        &self.current
    }

    pub fn snapshot(&self) -> &StatusSnapshot {
        &self.current
    }

    pub fn is_running(&self) -> bool {
        self.current.is_running
    }
}

/// Logs status events and hands them to subscribers through the executor.
#[derive(Clone)]
pub(crate) struct StatusReporter {
    subscribers: Arc<Subscribers<StatusEvent>>,
    executor: Arc<dyn Executor>,
}

impl StatusReporter {
    pub(crate) fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            subscribers: Arc::new(Subscribers::new()),
            executor,
        }
    }

    pub(crate) fn subscribers(&self) -> &Subscribers<StatusEvent> {
        &self.subscribers
    }

    pub(crate) fn report(&self, kind: StatusKind, message: impl Into<String>) {
        let event = StatusEvent::new(kind, message);
        let severity = event.severity();
        match severity {
            Severity::Error => error!(kind = ?event.kind, "{}", event.message),
            Severity::Warning => warn!(kind = ?event.kind, "{}", event.message),
            Severity::Info | Severity::Success => info!(kind = ?event.kind, "{}", event.message),
        }
        metrics::counter!("capture_status_events_total", "severity" => severity.label())
            .increment(1);

        let subscribers = self.subscribers.clone();
        self.executor
            .execute(Box::new(move || subscribers.publish(&event)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::InlineExecutor;

    #[test]
    fn severity_follows_kind_not_text() {
        // The message mentions "Failed" but the kind is informational.
        let event = StatusEvent::new(StatusKind::Configuring, "Failed-over profile selected");
        assert_eq!(event.severity(), Severity::Info);
        assert_eq!(event.running_hint(), None);

        let event = StatusEvent::new(StatusKind::Stopped, "Camera stopped");
        assert_eq!(event.running_hint(), Some(false));
        assert_eq!(
            StatusKind::Throughput { fps: 30.0 }.running_hint(),
            Some(true)
        );
        assert_eq!(StatusKind::StartFailed.severity(), Severity::Error);
        assert_eq!(StatusKind::ReadFailed.severity(), Severity::Warning);
    }

    #[test]
    fn tracker_keeps_running_state_across_neutral_events() {
        let mut tracker = StatusTracker::new();
        tracker.apply(&StatusEvent::new(StatusKind::Connected, "Connected to cam"));
        assert!(tracker.is_running());

        let snapshot = tracker.apply(&StatusEvent::new(StatusKind::ReadFailed, "retrying"));
        assert!(snapshot.is_running);
        assert_eq!(snapshot.severity, Severity::Warning);
        assert_eq!(snapshot.message, "retrying");

        tracker.apply(&StatusEvent::new(StatusKind::DeviceLost, "gone"));
        assert!(!tracker.is_running());
        assert_eq!(tracker.snapshot().severity, Severity::Error);
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let event = StatusEvent::new(StatusKind::Throughput { fps: 29.5 }, "Streaming at 29.5 FPS");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "Throughput");
        assert_eq!(json["fps"], 29.5);
        assert_eq!(json["message"], "Streaming at 29.5 FPS");
    }

    #[test]
    fn reporter_delivers_through_executor() {
        let reporter = StatusReporter::new(Arc::new(InlineExecutor));
        let (_, rx) = reporter.subscribers().subscribe_channel(4);
        reporter.report(StatusKind::NotRunning, "Camera is not running");

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, StatusKind::NotRunning);
        assert_eq!(event.message, "Camera is not running");
    }
}
