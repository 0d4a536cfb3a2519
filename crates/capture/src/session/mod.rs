//! Capture session lifecycle.
//!
//! A session moves through `Idle → Opening → Configuring → Running →
//! Stopping → Idle`. Phase changes happen under one mutex; opening,
//! configuring and teardown run outside it. Every start stamps a new epoch so
//! a start that lost a race with `stop` can tell and unwind.
//!
//! The device handle and the worker live in the slot only while the phase is
//! `Running`, which keeps `is_running()` and device ownership in step.

mod cancel;
mod configure;
mod still;
mod worker;

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{atomic::AtomicUsize, Arc, Mutex, MutexGuard, PoisonError},
    thread,
};

use serde::Serialize;
use tracing::{debug, info, info_span};
use video_ingest::{
    open_source, CaptureBackend, CaptureSourceDescriptor, DeviceGuard, DeviceHandle,
    NormalizedFrame,
};

use crate::{
    config::SessionConfig,
    delivery::{Executor, Subscribers},
    status::{StatusEvent, StatusKind, StatusReporter},
    telemetry::panic_message,
};
use cancel::Cancellation;
use configure::ProbeOutcome;
use worker::{LoopExit, WorkerHandle};

pub use still::still_file_name;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SessionPhase {
    Idle,
    Opening,
    Configuring,
    Running,
    Stopping,
}

/// Point-in-time view of the session internals, taken under the phase lock.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub has_device: bool,
    pub has_worker: bool,
    pub source: Option<CaptureSourceDescriptor>,
}

impl SessionSnapshot {
    /// A device and a worker are held exactly when the phase is `Running`.
    pub fn is_consistent(&self) -> bool {
        let running = self.phase == SessionPhase::Running;
        self.has_device == running && self.has_worker == running
    }
}

struct Slot {
    phase: SessionPhase,
    epoch: u64,
    source: Option<CaptureSourceDescriptor>,
    device: Option<DeviceHandle>,
    worker: Option<WorkerHandle>,
    cancel: Option<Cancellation>,
}

enum Claim {
    Acquired { epoch: u64, cancel: Cancellation },
    Running,
    Busy(SessionPhase),
}

pub(crate) struct Shared {
    backend: Arc<dyn CaptureBackend>,
    config: SessionConfig,
    status: StatusReporter,
    frames: Arc<Subscribers<Arc<NormalizedFrame>>>,
    executor: Arc<dyn Executor>,
    pending_frames: Arc<AtomicUsize>,
    slot: Mutex<Slot>,
}

/// Settles an unfinished start back to `Idle` when dropped.
struct StartAttempt<'a> {
    shared: &'a Shared,
    epoch: u64,
    committed: bool,
}

impl Drop for StartAttempt<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut slot = self.shared.lock_slot();
        if slot.epoch == self.epoch
            && matches!(
                slot.phase,
                SessionPhase::Opening | SessionPhase::Configuring | SessionPhase::Stopping
            )
        {
            slot.phase = SessionPhase::Idle;
            slot.source = None;
            slot.cancel = None;
        }
    }
}

impl Shared {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, source: &CaptureSourceDescriptor) -> Claim {
        let mut slot = self.lock_slot();
        let phase = slot.phase;
        match phase {
            SessionPhase::Idle => {
                let cancel = Cancellation::new();
                slot.epoch += 1;
                slot.phase = SessionPhase::Opening;
                slot.source = Some(source.clone());
                slot.cancel = Some(cancel.clone());
                Claim::Acquired {
                    epoch: slot.epoch,
                    cancel,
                }
            }
            SessionPhase::Running => Claim::Running,
            phase => Claim::Busy(phase),
        }
    }

    /// Move an in-flight start to `next`. Fails once a stop has intervened.
    fn advance(&self, epoch: u64, next: SessionPhase) -> bool {
        let mut slot = self.lock_slot();
        if slot.epoch != epoch || slot.phase == SessionPhase::Stopping {
            return false;
        }
        slot.phase = next;
        true
    }

    fn start_cancelled(&self) -> bool {
        self.status
            .report(StatusKind::Cancelled, "Camera start cancelled");
        false
    }

    fn launch(
        self: &Arc<Self>,
        source: &CaptureSourceDescriptor,
        epoch: u64,
        cancel: &Cancellation,
        mut attempt: StartAttempt<'_>,
    ) -> bool {
        let status = &self.status;
        status.report(
            StatusKind::Connecting,
            format!("Connecting to {}...", source.display_info()),
        );
        status.report(
            StatusKind::Opening,
            format!("Opening {} camera...", source.kind().label()),
        );

        let opened = match open_source(self.backend.as_ref(), source) {
            Ok(opened) => opened,
            Err(err) => {
                status.report(
                    StatusKind::StartFailed,
                    format!("Failed to open camera: {err}"),
                );
                return false;
            }
        };
        let device = DeviceGuard::new(opened.device);
        if let Some(err) = opened.preferred_api_error {
            status.report(
                StatusKind::ApiFallback,
                format!("Preferred capture API unavailable ({err}), using default API"),
            );
        }
        if !device.is_open() {
            status.report(
                StatusKind::StartFailed,
                "Failed to open camera: device closed immediately",
            );
            return false;
        }

        if !self.advance(epoch, SessionPhase::Configuring) {
            return self.start_cancelled();
        }
        configure::apply_settings(&*device, source, &self.config, status, cancel);

        match configure::probe_frames(&*device, source, &self.config, status, cancel) {
            ProbeOutcome::Frame { width, height } => status.report(
                StatusKind::Active { width, height },
                format!("Camera active: {width}x{height}"),
            ),
            ProbeOutcome::NoFrames => {
                status.report(
                    StatusKind::StartFailed,
                    "Camera opened but is not providing frames",
                );
                return false;
            }
            ProbeOutcome::Cancelled => return self.start_cancelled(),
        }
        if cancel.is_cancelled() {
            return self.start_cancelled();
        }
        status.report(
            StatusKind::Connected,
            format!("Connected to {}", source.name()),
        );

        let device = device.into_inner();
        let mut slot = self.lock_slot();
        if slot.epoch != epoch || slot.phase != SessionPhase::Configuring {
            drop(slot);
            device.release();
            return self.start_cancelled();
        }
        match worker::spawn(self.clone(), device.clone(), epoch, cancel.clone()) {
            Ok(handle) => {
                slot.phase = SessionPhase::Running;
                slot.device = Some(device);
                slot.worker = Some(handle);
                attempt.committed = true;
            }
            Err(err) => {
                drop(slot);
                device.release();
                status.report(
                    StatusKind::StartFailed,
                    format!("Failed to start capture worker: {err}"),
                );
                return false;
            }
        }
        drop(slot);

        metrics::counter!("capture_sessions_started_total").increment(1);
        info!(source = %source, "capture session running");
        true
    }

    fn stop(&self) {
        let (epoch, worker, device, cancel) = {
            let mut slot = self.lock_slot();
            let phase = slot.phase;
            match phase {
                SessionPhase::Idle => {
                    drop(slot);
                    self.status
                        .report(StatusKind::AlreadyStopped, "Camera already stopped");
                    return;
                }
                SessionPhase::Stopping => {
                    drop(slot);
                    self.status
                        .report(StatusKind::Busy, "Camera is already stopping");
                    return;
                }
                SessionPhase::Opening | SessionPhase::Configuring => {
                    slot.phase = SessionPhase::Stopping;
                    let cancel = slot.cancel.clone();
                    drop(slot);
                    if let Some(cancel) = cancel {
                        cancel.cancel();
                    }
                    self.status
                        .report(StatusKind::Stopping, "Cancelling camera start...");
                    return;
                }
                SessionPhase::Running => {
                    slot.phase = SessionPhase::Stopping;
                    (
                        slot.epoch,
                        slot.worker.take(),
                        slot.device.take(),
                        slot.cancel.take(),
                    )
                }
            }
        };

        self.status.report(StatusKind::Stopping, "Stopping camera...");
        if let Some(worker) = &worker {
            worker.signal_stop();
        }
        if let Some(cancel) = &cancel {
            cancel.cancel();
        }

        if let Some(worker) = worker {
            if worker.is_current_thread() {
                debug!("stop requested from the capture worker; not waiting for it");
            } else if !worker.wait(self.config.stop_timeout) {
                self.status.report(
                    StatusKind::StopTimeout,
                    format!(
                        "Capture loop did not exit within {:?}, forcing teardown",
                        self.config.stop_timeout
                    ),
                );
            }
        }

        if let Some(device) = device {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| device.release())) {
                self.status.report(
                    StatusKind::TeardownFault,
                    format!(
                        "Error releasing camera: {}",
                        panic_message(payload.as_ref())
                    ),
                );
            }
        }

        {
            let mut slot = self.lock_slot();
            if slot.epoch == epoch && slot.phase == SessionPhase::Stopping {
                slot.phase = SessionPhase::Idle;
                slot.source = None;
            }
        }
        self.status.report(StatusKind::Stopped, "Camera stopped");
    }

    /// Last-resort reset after a fault inside `stop`.
    fn force_idle(&self) {
        let (worker, device, cancel) = {
            let mut slot = self.lock_slot();
            slot.phase = SessionPhase::Idle;
            slot.source = None;
            (slot.worker.take(), slot.device.take(), slot.cancel.take())
        };
        if let Some(worker) = worker {
            worker.signal_stop();
        }
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(device) = device {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| device.release()));
        }
    }

    /// Called by the worker as it exits. Exits not requested by `stop` settle
    /// the session to `Idle` and release the device. A worker that outlived a
    /// forced teardown and a later restart only logs, so its exit cannot
    /// contradict the newer run.
    fn finish_worker(&self, epoch: u64, exit: LoopExit) {
        let superseded = {
            let mut slot = self.lock_slot();
            if exit != LoopExit::Cancelled {
                Self::settle_lost_worker(&mut slot, epoch);
            }
            slot.epoch != epoch
        };
        if superseded {
            debug!(epoch, ?exit, "capture worker of a replaced run exited");
            return;
        }

        match exit {
            LoopExit::Cancelled => {
                self.status
                    .report(StatusKind::Cancelled, "Capture loop stopped");
            }
            LoopExit::DeviceLost(reason) => {
                self.status.report(
                    StatusKind::DeviceLost,
                    format!("Camera disconnected: {reason}"),
                );
            }
            LoopExit::Fault(message) => {
                self.status.report(
                    StatusKind::LoopFault,
                    format!("Capture loop error: {message}"),
                );
            }
        }
    }

    fn settle_lost_worker(slot: &mut Slot, epoch: u64) {
        if slot.epoch != epoch || slot.phase != SessionPhase::Running {
            return;
        }
        slot.phase = SessionPhase::Idle;
        slot.source = None;
        slot.worker = None;
        if let Some(cancel) = slot.cancel.take() {
            cancel.cancel();
        }
        // Released before the slot unlocks so a new start cannot open a
        // second device first.
        if let Some(device) = slot.device.take() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| device.release())) {
                debug!(
                    "releasing lost device panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

/// A single capture source driven through its lifecycle.
///
/// All methods take `&self` and may be called from any thread. `start` blocks
/// while the device is opened and probed; everything else returns promptly,
/// except `stop`, which waits up to [`SessionConfig::stop_timeout`] for the
/// worker.
pub struct CaptureSession {
    shared: Arc<Shared>,
}

impl CaptureSession {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        config: SessionConfig,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let shared = Shared {
            backend,
            config,
            status: StatusReporter::new(executor.clone()),
            frames: Arc::new(Subscribers::new()),
            executor,
            pending_frames: Arc::new(AtomicUsize::new(0)),
            slot: Mutex::new(Slot {
                phase: SessionPhase::Idle,
                epoch: 0,
                source: None,
                device: None,
                worker: None,
                cancel: None,
            }),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Normalized frames, delivered through the session's executor. Every
    /// subscriber receives the same shared buffer.
    pub fn frames(&self) -> &Subscribers<Arc<NormalizedFrame>> {
        &self.shared.frames
    }

    pub fn status(&self) -> &Subscribers<StatusEvent> {
        self.shared.status.subscribers()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Open, configure and probe `source`, then start streaming it.
    ///
    /// A running session is stopped first. Returns `false` when the source is
    /// invalid or cannot produce frames, when another start or stop is in
    /// progress, or when a concurrent `stop` cancelled this start.
    pub fn start(&self, source: CaptureSourceDescriptor) -> bool {
        let span = info_span!("capture.start", source = %source);
        let _guard = span.enter();

        if let Err(err) = source.validate() {
            self.shared
                .status
                .report(StatusKind::StartFailed, format!("Invalid camera source: {err}"));
            return false;
        }

        let claim = match self.shared.claim(&source) {
            Claim::Running => {
                self.stop();
                thread::sleep(self.shared.config.restart_grace);
                self.shared.claim(&source)
            }
            claim => claim,
        };
        let (epoch, cancel) = match claim {
            Claim::Acquired { epoch, cancel } => (epoch, cancel),
            Claim::Running => {
                self.report_busy(SessionPhase::Running);
                return false;
            }
            Claim::Busy(phase) => {
                self.report_busy(phase);
                return false;
            }
        };

        let attempt = StartAttempt {
            shared: &self.shared,
            epoch,
            committed: false,
        };
        let launched = panic::catch_unwind(AssertUnwindSafe(|| {
            self.shared.launch(&source, epoch, &cancel, attempt)
        }));
        match launched {
            Ok(started) => started,
            Err(payload) => {
                self.shared.status.report(
                    StatusKind::StartFailed,
                    format!("Failed to start camera: {}", panic_message(payload.as_ref())),
                );
                false
            }
        }
    }

    fn report_busy(&self, phase: SessionPhase) {
        self.shared.status.report(
            StatusKind::Busy,
            format!("Camera is busy ({phase:?}), try again shortly"),
        );
    }

    /// Stop streaming and release the device. Safe to call at any time and
    /// from any thread; failures are reported, never raised.
    pub fn stop(&self) {
        let span = info_span!("capture.stop");
        let _guard = span.enter();

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.shared.stop())) {
            self.shared.force_idle();
            self.shared.status.report(
                StatusKind::TeardownFault,
                format!("Error stopping camera: {}", panic_message(payload.as_ref())),
            );
        }
    }

    /// Save one still from the running device on a background thread.
    pub fn capture_frame(&self) {
        let device = {
            let slot = self.shared.lock_slot();
            match slot.phase {
                SessionPhase::Running => slot.device.clone(),
                _ => None,
            }
        };
        match device {
            Some(device) => {
                still::spawn_still(device, &self.shared.config, self.shared.status.clone())
            }
            None => self
                .shared
                .status
                .report(StatusKind::NotRunning, "Camera is not running"),
        }
    }

    pub fn is_running(&self) -> bool {
        let slot = self.shared.lock_slot();
        slot.phase == SessionPhase::Running && slot.device.is_some() && slot.worker.is_some()
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.lock_slot().phase
    }

    pub fn active_source(&self) -> Option<CaptureSourceDescriptor> {
        self.shared.lock_slot().source.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let slot = self.shared.lock_slot();
        SessionSnapshot {
            phase: slot.phase,
            has_device: slot.device.is_some(),
            has_worker: slot.worker.is_some(),
            source: slot.source.clone(),
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.phase() != SessionPhase::Idle {
            self.stop();
        }
    }
}
