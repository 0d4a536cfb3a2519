use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

/// Cooperative cancellation signal. Cancelling wakes any thread blocked in
/// [`Cancellation::sleep`].
#[derive(Clone)]
pub(crate) struct Cancellation {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    // Dropping the sender disconnects `wake_rx`, which ends every pending sleep.
    wake_tx: Mutex<Option<Sender<()>>>,
    wake_rx: Receiver<()>,
}

impl Cancellation {
    pub(crate) fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                wake_tx: Mutex::new(Some(tx)),
                wake_rx: rx,
            }),
        }
    }

    pub(crate) fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        drop(
            self.inner
                .wake_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`. Returns `false` if cancelled before or during
    /// the sleep.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }
        match self.inner.wake_rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => !self.is_cancelled(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}
