//! Mutual exclusion with bounded-wait acquisition.
//!
//! `TimedMutex` wraps a `parking_lot::Mutex` and adds the stack's timeout
//! convention to `lock`. Releasing is dropping the guard, so a non-holder
//! can never unlock.

use crate::error::{LspError, Result};
use crate::timeout::Deadline;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::time::Duration;

/// Guard returned by [`TimedMutex::lock`].
pub type TimedGuard<'a, T> = MutexGuard<'a, T>;

/// A mutex whose acquisition can be bounded by a timeout.
#[derive(Default)]
pub struct TimedMutex<T> {
    inner: Mutex<T>,
}

impl<T> TimedMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock.
    ///
    /// - `None`: block until the lock is free
    /// - `Some(Duration::ZERO)`: try-lock
    /// - `Some(d)`: give up with [`LspError::Timeout`] after `d`
    pub fn lock(&self, timeout: Option<Duration>) -> Result<TimedGuard<'_, T>> {
        self.lock_until(Deadline::after(timeout))
    }

    /// Block until the lock is free.
    pub fn lock_blocking(&self) -> TimedGuard<'_, T> {
        self.inner.lock()
    }

    /// Acquire the lock before an already computed deadline.
    pub fn lock_until(&self, deadline: Deadline) -> Result<TimedGuard<'_, T>> {
        match deadline {
            Deadline::Never => Ok(self.lock_blocking()),
            Deadline::Immediate => self.inner.try_lock().ok_or(LspError::Timeout),
            Deadline::At(at) => self.inner.try_lock_until(at).ok_or(LspError::Timeout),
        }
    }

    /// Whether some thread currently holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> fmt::Debug for TimedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedMutex")
            .field("locked", &self.inner.is_locked())
            .finish_non_exhaustive()
    }
}

/// Block on `cond` until notified or `deadline` passes.
///
/// The mutex is released while blocked and re-acquired before returning.
/// Returns `false` once the deadline has passed; callers re-check their
/// predicate either way, since wake-ups may be spurious.
pub(crate) fn wait_on<T>(cond: &Condvar, guard: &mut TimedGuard<'_, T>, deadline: Deadline) -> bool {
    match deadline {
        Deadline::Never => {
            cond.wait(guard);
            true
        }
        Deadline::Immediate => false,
        Deadline::At(at) => !cond.wait_until(guard, at).timed_out(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_try_lock_when_held() {
        let mutex = TimedMutex::new(0u32);
        let _guard = mutex.lock(None).unwrap();
        assert_eq!(mutex.lock(Some(Duration::ZERO)).unwrap_err(), LspError::Timeout);
    }

    #[test]
    fn test_timed_lock_gives_up() {
        let mutex = Arc::new(TimedMutex::new(()));
        let holder = Arc::clone(&mutex);
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let _guard = holder.lock(None).unwrap();
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        rx.recv().unwrap();
        let start = Instant::now();
        let err = mutex.lock(Some(Duration::from_millis(30))).unwrap_err();
        assert_eq!(err, LspError::Timeout);
        assert!(start.elapsed() < Duration::from_millis(190));
        handle.join().unwrap();
    }

    #[test]
    fn test_lock_after_release() {
        let mutex = TimedMutex::new(5u32);
        {
            let mut guard = mutex.lock(Some(Duration::from_millis(10))).unwrap();
            *guard += 1;
        }
        assert!(!mutex.is_locked());
        assert_eq!(*mutex.lock(Some(Duration::ZERO)).unwrap(), 6);
    }
}
