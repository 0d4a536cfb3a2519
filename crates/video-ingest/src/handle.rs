//! Native capture handle shared between readers and `release`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, MutexGuard, PoisonError,
};

use crate::types::CaptureError;

/// Wraps a native handle behind a mutex. `release` never waits for the mutex;
/// when a reader holds it, the reader closes the handle on its way out, and
/// any later access closes it before reporting [`CaptureError::Released`].
pub(crate) struct SharedHandle<T> {
    handle: Mutex<Option<T>>,
    released: AtomicBool,
    close: fn(T),
}

impl<T> SharedHandle<T> {
    pub(crate) fn new(handle: T, close: fn(T)) -> Self {
        Self {
            handle: Mutex::new(Some(handle)),
            released: AtomicBool::new(false),
            close,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Run `f` against the open handle.
    pub(crate) fn with<R>(
        &self,
        f: impl FnOnce(&mut T) -> Result<R, CaptureError>,
    ) -> Result<R, CaptureError> {
        if self.is_released() {
            self.close_now();
            return Err(CaptureError::Released);
        }
        let result = {
            let mut guard = self.lock();
            match guard.as_mut() {
                Some(handle) => f(handle),
                None => Err(CaptureError::Released),
            }
        };
        // Checked after unlocking: a release that found the lock taken
        // relies on this reader to close.
        if self.is_released() {
            self.close_now();
        }
        result
    }

    /// Inspect the handle without waiting. `None` when a reader holds it.
    pub(crate) fn peek<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> Option<R> {
        match self.handle.try_lock() {
            Ok(guard) => Some(f(guard.as_ref())),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                Some(f(poisoned.into_inner().as_ref()))
            }
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }

    pub(crate) fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let taken = match self.handle.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner().take(),
            Err(std::sync::TryLockError::WouldBlock) => None,
        };
        if let Some(handle) = taken {
            (self.close)(handle);
        }
    }

    fn close_now(&self) {
        let taken = self.lock().take();
        if let Some(handle) = taken {
            (self.close)(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    use crossbeam_channel::bounded;

    use super::*;

    static CLOSED: AtomicUsize = AtomicUsize::new(0);

    struct Native(Arc<AtomicUsize>);

    fn close_native(native: Native) {
        native.0.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn release_closes_an_idle_handle_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let shared = SharedHandle::new(Native(closes.clone()), close_native);

        shared.release();
        shared.release();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(matches!(shared.with(|_| Ok(())), Err(CaptureError::Released)));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reader_closes_when_release_found_the_lock_taken() {
        let closes = Arc::new(AtomicUsize::new(0));
        let shared = Arc::new(SharedHandle::new(Native(closes.clone()), close_native));
        let (entered_tx, entered_rx) = bounded::<()>(0);
        let (resume_tx, resume_rx) = bounded::<()>(0);

        let reader = {
            let shared = shared.clone();
            thread::spawn(move || {
                shared.with(|_| {
                    entered_tx.send(()).unwrap();
                    resume_rx.recv().unwrap();
                    Ok(7)
                })
            })
        };

        entered_rx.recv().unwrap();
        shared.release();
        // The reader still holds the handle, so release could not close it.
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert_eq!(shared.peek(|_| ()), None);

        resume_tx.send(()).unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), 7);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(shared.peek(|handle| handle.is_some()), Some(false));
    }

    #[test]
    fn access_after_release_closes_a_leftover_handle() {
        fn count_close(_: u8) {
            CLOSED.fetch_add(1, Ordering::SeqCst);
        }
        let shared = SharedHandle::new(1u8, count_close);
        // Flag set without the close going through, as when a reader held the
        // lock at release time and had already passed its own check.
        shared.released.store(true, Ordering::SeqCst);

        assert!(matches!(shared.with(|_| Ok(())), Err(CaptureError::Released)));
        assert_eq!(CLOSED.load(Ordering::SeqCst), 1);
        assert!(shared.is_released());
    }
}
