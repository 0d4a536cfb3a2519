//! Hand-off of frames and status events to consumers.
//!
//! Sessions never call consumers directly. Every delivery is packaged as a job
//! and given to an [`Executor`], which decides the thread it runs on. Consumers
//! register with a [`Subscribers`] registry and are called in registration
//! order.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{error, warn};

use crate::telemetry::{self, panic_message};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Capability to run a delivery job on a designated thread.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Runs jobs immediately on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}

/// Runs jobs in submission order on one dedicated thread.
pub struct ThreadExecutor {
    tx: Option<Sender<Job>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ThreadExecutor {
    pub fn new(name: impl Into<String>) -> io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let handle = telemetry::spawn_thread(name, move || {
            for job in rx {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    error!(
                        "delivery job panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
        })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, job: Job) {
        if let Some(tx) = &self.tx {
            if tx.send(job).is_err() {
                warn!("delivery thread has exited; dropping job");
            }
        }
    }
}

impl Drop for ThreadExecutor {
    /// Drains queued jobs, then joins the delivery thread.
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered observer registry. Each subscriber sees every published item once.
pub struct Subscribers<T> {
    entries: Mutex<Vec<(SubscriptionId, Callback<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns `false` when `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every subscriber with `item`. Callbacks run outside the registry
    /// lock, so they may subscribe or unsubscribe. A panicking callback is
    /// logged and does not stop delivery to the rest.
    pub fn publish(&self, item: &T) {
        let snapshot: Vec<(SubscriptionId, Callback<T>)> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (id, callback) in snapshot {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(item))) {
                error!(
                    subscription = id.0,
                    "subscriber panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

impl<T: Clone + Send + 'static> Subscribers<T> {
    /// Bridge to a bounded channel. Items published while the channel is full
    /// are dropped so publishers never block.
    pub fn subscribe_channel(&self, capacity: usize) -> (SubscriptionId, Receiver<T>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let id = self.subscribe(move |item: &T| match tx.try_send(item.clone()) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                metrics::counter!("capture_subscriber_dropped_total").increment(1);
            }
        });
        (id, rx)
    }
}
