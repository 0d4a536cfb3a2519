//! Background read loop for a running session.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, warn};
use video_ingest::{normalize, CaptureError, DeviceHandle, NormalizedFrame};

use crate::{
    delivery::{Executor, Subscribers},
    session::{cancel::Cancellation, Shared},
    status::StatusKind,
    telemetry::{self, panic_message},
};

/// Why the read loop returned.
#[derive(Debug, PartialEq)]
pub(crate) enum LoopExit {
    /// Running flag cleared or cancellation signalled.
    Cancelled,
    DeviceLost(String),
    Fault(String),
}

/// Frames delivered per second over fixed wall-clock windows.
pub(crate) struct ThroughputMeter {
    interval: Duration,
    window_start: Instant,
    frames: u64,
}

impl ThroughputMeter {
    pub(crate) fn new(now: Instant, interval: Duration) -> Self {
        Self {
            interval,
            window_start: now,
            frames: 0,
        }
    }

    /// Count one delivered frame. Once the window has elapsed, returns the
    /// rate for it and starts a new window.
    pub(crate) fn frame_delivered(&mut self, now: Instant) -> Option<f64> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval || elapsed.is_zero() {
            return None;
        }
        let fps = self.frames as f64 / elapsed.as_secs_f64();
        self.frames = 0;
        self.window_start = now;
        Some(fps)
    }
}

/// Decrements the pending count when the delivery job runs or is discarded.
struct PendingSlot(Arc<AtomicUsize>);

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Hands frames to the executor, dropping new ones while the consumer is
/// behind.
pub(crate) struct FrameDispatch {
    subscribers: Arc<Subscribers<Arc<NormalizedFrame>>>,
    executor: Arc<dyn Executor>,
    pending: Arc<AtomicUsize>,
    limit: usize,
}

impl FrameDispatch {
    pub(crate) fn new(
        subscribers: Arc<Subscribers<Arc<NormalizedFrame>>>,
        executor: Arc<dyn Executor>,
        pending: Arc<AtomicUsize>,
        limit: usize,
    ) -> Self {
        Self {
            subscribers,
            executor,
            pending,
            limit: limit.max(1),
        }
    }

    /// Returns `false` when the frame was dropped. Subscribers share one
    /// buffer per frame.
    pub(crate) fn deliver(&self, frame: NormalizedFrame) -> bool {
        if self.pending.load(Ordering::SeqCst) >= self.limit {
            metrics::counter!("capture_frames_dropped_total").increment(1);
            return false;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        let slot = PendingSlot(self.pending.clone());
        let subscribers = self.subscribers.clone();
        let frame = Arc::new(frame);
        self.executor.execute(Box::new(move || {
            let _slot = slot;
            subscribers.publish(&frame);
        }));
        metrics::counter!("capture_frames_delivered_total").increment(1);
        true
    }
}

/// Control side of a spawned worker.
pub(crate) struct WorkerHandle {
    running: Arc<AtomicBool>,
    done: Receiver<()>,
    thread: thread::JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn signal_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_current_thread(&self) -> bool {
        self.thread.thread().id() == thread::current().id()
    }

    /// Wait up to `timeout` for the worker to finish. Returns `false` on
    /// timeout; the thread is then left detached.
    pub(crate) fn wait(self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.thread.join().is_err() {
                    warn!("capture worker exited with a panic");
                }
                true
            }
        }
    }
}

/// Spawn the single read worker for session `epoch`.
pub(crate) fn spawn(
    shared: Arc<Shared>,
    device: DeviceHandle,
    epoch: u64,
    cancel: Cancellation,
) -> io::Result<WorkerHandle> {
    let running = Arc::new(AtomicBool::new(true));
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
    let flag = running.clone();

    let thread = telemetry::spawn_thread(format!("capture-worker-{epoch}"), move || {
        // Disconnects `done` once everything below, including settling, is finished.
        let _done = done_tx;
        let span = tracing::info_span!("capture.worker", epoch);
        let _guard = span.enter();

        shared
            .status
            .report(StatusKind::StreamingStarted, "Video streaming started");
        let exit = match panic::catch_unwind(AssertUnwindSafe(|| {
            run_loop(&shared, &device, &flag, &cancel)
        })) {
            Ok(exit) => exit,
            Err(payload) => LoopExit::Fault(panic_message(payload.as_ref())),
        };
        debug!(?exit, "capture loop finished");
        shared.finish_worker(epoch, exit);
    })?;

    Ok(WorkerHandle {
        running,
        done: done_rx,
        thread,
    })
}

fn run_loop(
    shared: &Shared,
    device: &DeviceHandle,
    running: &AtomicBool,
    cancel: &Cancellation,
) -> LoopExit {
    let config = &shared.config;
    let dispatch = FrameDispatch::new(
        shared.frames.clone(),
        shared.executor.clone(),
        shared.pending_frames.clone(),
        config.max_pending_frames,
    );
    let mut meter = ThroughputMeter::new(Instant::now(), config.throughput_interval);
    let mut sequence = 0u64;
    let mut consecutive_failures = 0u32;

    loop {
        if !running.load(Ordering::SeqCst) || cancel.is_cancelled() {
            return LoopExit::Cancelled;
        }

        let iteration_start = Instant::now();
        let read = device.read();
        if !running.load(Ordering::SeqCst) || cancel.is_cancelled() {
            return LoopExit::Cancelled;
        }

        match read {
            Ok(raw) if !raw.is_empty() => {
                consecutive_failures = 0;
                let convert_start = Instant::now();
                match normalize(&raw) {
                    Ok(Some(mut frame)) => {
                        metrics::histogram!("capture_frame_normalize_seconds")
                            .record(convert_start.elapsed().as_secs_f64());
                        sequence += 1;
                        frame.sequence = sequence;
                        if dispatch.deliver(frame) {
                            if let Some(fps) = meter.frame_delivered(Instant::now()) {
                                metrics::gauge!("capture_stream_fps").set(fps);
                                shared.status.report(
                                    StatusKind::Throughput { fps },
                                    format!("Streaming at {fps:.1} FPS"),
                                );
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(err) => shared.status.report(
                        StatusKind::FrameConversionFailed,
                        format!("Frame conversion error: {err}"),
                    ),
                }

                let remaining = config.frame_period.saturating_sub(iteration_start.elapsed());
                if !cancel.sleep(remaining) {
                    return LoopExit::Cancelled;
                }
            }
            failed => {
                if matches!(failed, Err(CaptureError::Released)) {
                    return LoopExit::DeviceLost("device was released".to_string());
                }
                if !device.is_open() {
                    return LoopExit::DeviceLost("device is no longer open".to_string());
                }
                consecutive_failures = consecutive_failures.saturating_add(1);
                metrics::counter!("capture_read_failures_total").increment(1);
                let detail = match &failed {
                    Err(err) => err.to_string(),
                    Ok(_) => "empty frame".to_string(),
                };
                shared.status.report(
                    StatusKind::ReadFailed,
                    format!("Failed to read frame ({detail}), retrying..."),
                );

                if config
                    .max_consecutive_read_failures
                    .is_some_and(|limit| consecutive_failures >= limit)
                {
                    return LoopExit::DeviceLost(format!(
                        "{consecutive_failures} consecutive read failures"
                    ));
                }
                if !cancel.sleep(config.read_retry_delay) {
                    return LoopExit::Cancelled;
                }
            }
        }
    }
}
