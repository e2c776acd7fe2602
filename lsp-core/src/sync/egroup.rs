//! Event groups: multi-bit condition signalling.
//!
//! An event group holds up to 32 independent condition bits. Threads wait
//! for *any* or *all* bits of a mask; setters OR bits in and wake every
//! waiter, since one update may satisfy several distinct predicates.
//!
//! # Timeout contract
//!
//! [`EventGroup::wait`] always returns the bits observed when the wait
//! ended, taken *before* the exit clear is applied. On timeout this may be
//! zero or a partial match; callers compare the snapshot against their mask
//! to tell success from expiry (see [`WaitOptions::satisfied_by`]).

use crate::error::{LspError, Result};
use crate::sync::mutex::{wait_on, TimedMutex};
use crate::timeout::Deadline;
use parking_lot::Condvar;
use std::time::Duration;
use tracing::{error, trace};

/// Bitmask type of an event group.
pub type EventBits = u32;

/// How a wait is satisfied and what is cleared on exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitOptions {
    /// Require every bit of the mask instead of any one of them.
    pub wait_all: bool,
    /// Zero the whole bit field on exit instead of only the waited bits.
    pub clear_on_exit: bool,
    /// Leave every bit set on exit. Takes precedence over `clear_on_exit`.
    ///
    /// Several threads waiting on the same level-triggered bit all observe
    /// it, instead of the first one consuming it.
    pub keep_bits: bool,
}

impl WaitOptions {
    /// Wait for any bit, clear only the waited bits.
    #[must_use]
    pub const fn any() -> Self {
        Self {
            wait_all: false,
            clear_on_exit: false,
            keep_bits: false,
        }
    }

    /// Wait for all bits, clear only the waited bits.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            wait_all: true,
            clear_on_exit: false,
            keep_bits: false,
        }
    }

    #[must_use]
    pub const fn with_clear_on_exit(mut self, clear: bool) -> Self {
        self.clear_on_exit = clear;
        self
    }

    #[must_use]
    pub const fn with_keep_bits(mut self, keep: bool) -> Self {
        self.keep_bits = keep;
        self
    }

    /// Whether `bits` satisfies a wait on `mask`.
    #[inline]
    #[must_use]
    pub const fn satisfied_by(&self, bits: EventBits, mask: EventBits) -> bool {
        if self.wait_all {
            bits & mask == mask
        } else {
            bits & mask != 0
        }
    }
}

#[derive(Debug, Default)]
struct EventState {
    bits: EventBits,
    waiters: usize,
}

/// A condition-variable backed set of event bits.
#[derive(Debug)]
pub struct EventGroup {
    state: TimedMutex<EventState>,
    cond: Condvar,
    lock_timeout: Duration,
}

impl Default for EventGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl EventGroup {
    /// Lock budget used by [`EventGroup::set`] when none is configured.
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

    #[must_use]
    pub fn new() -> Self {
        Self::with_lock_timeout(Self::DEFAULT_LOCK_TIMEOUT)
    }

    /// Create an event group whose setters wait at most `lock_timeout`
    /// for the internal lock.
    #[must_use]
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            state: TimedMutex::new(EventState::default()),
            cond: Condvar::new(),
            lock_timeout,
        }
    }

    /// OR `mask` into the bit field and wake every waiter.
    ///
    /// Returns the bits after the update.
    pub fn set(&self, mask: EventBits) -> Result<EventBits> {
        let mut state = self.state.lock(Some(self.lock_timeout)).map_err(|e| {
            // Critical sections are short; contention this long is a bug.
            error!("[EGROUP] Failed to lock event group for set: {}", e);
            e
        })?;
        state.bits |= mask;
        let bits = state.bits;
        self.cond.notify_all();
        trace!("[EGROUP] set {:#x} -> {:#x}", mask, bits);
        Ok(bits)
    }

    /// Clear `mask` without waking anyone. Returns the bits after the update.
    pub fn clear(&self, mask: EventBits) -> Result<EventBits> {
        let mut state = self.state.lock(Some(self.lock_timeout))?;
        state.bits &= !mask;
        Ok(state.bits)
    }

    /// Current bits (advisory).
    pub fn bits(&self) -> EventBits {
        self.state.lock(None).map_or(0, |state| state.bits)
    }

    /// Wait until `mask` is satisfied according to `options` or the timeout
    /// elapses.
    ///
    /// The returned snapshot is taken before the exit clear. Only a failure
    /// to acquire the internal lock within `timeout` is an error.
    pub fn wait(
        &self,
        mask: EventBits,
        options: WaitOptions,
        timeout: Option<Duration>,
    ) -> Result<EventBits> {
        let deadline = Deadline::after(timeout);
        let mut state = self.state.lock_until(deadline)?;

        state.waiters += 1;
        while !options.satisfied_by(state.bits, mask) {
            if !wait_on(&self.cond, &mut state, deadline) {
                break;
            }
        }
        state.waiters -= 1;

        let snapshot = state.bits;
        if !options.keep_bits {
            if options.clear_on_exit {
                state.bits = 0;
            } else {
                state.bits &= !mask;
            }
        }
        trace!(
            "[EGROUP] wait {:#x} (all: {}) returned {:#x}",
            mask,
            options.wait_all,
            snapshot
        );
        Ok(snapshot)
    }

    /// Number of threads currently blocked in [`EventGroup::wait`].
    pub fn waiters(&self) -> usize {
        self.state.lock(None).map_or(0, |state| state.waiters)
    }

    /// Refuse teardown while waiters are registered.
    ///
    /// Owners call this before releasing the group; a waiter that is still
    /// parked must first be woken (e.g. by setting an interrupt bit).
    pub fn ensure_idle(&self) -> Result<()> {
        if self.waiters() > 0 {
            return Err(LspError::ResourceInUse);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_set_returns_accumulated_bits() {
        let group = EventGroup::new();
        assert_eq!(group.set(0x1).unwrap(), 0x1);
        assert_eq!(group.set(0x4).unwrap(), 0x5);
        assert_eq!(group.bits(), 0x5);
    }

    #[test]
    fn test_wait_any_clears_only_mask() {
        let group = EventGroup::new();
        group.set(0x3 | 0x10).unwrap();
        let bits = group.wait(0x1, WaitOptions::any(), Some(Duration::ZERO)).unwrap();
        assert_eq!(bits, 0x13);
        assert_eq!(group.bits(), 0x12);
    }

    #[test]
    fn test_clear_on_exit_zeroes_everything() {
        let group = EventGroup::new();
        group.set(0xF0 | 0x1).unwrap();
        let opts = WaitOptions::any().with_clear_on_exit(true);
        let bits = group.wait(0x1, opts, Some(Duration::ZERO)).unwrap();
        assert_eq!(bits, 0xF1);
        assert_eq!(group.bits(), 0);
    }

    #[test]
    fn test_keep_bits_leaves_field_untouched() {
        let group = EventGroup::new();
        group.set(0x41).unwrap();
        let opts = WaitOptions::any().with_keep_bits(true).with_clear_on_exit(true);
        assert_eq!(group.wait(0x40, opts, Some(Duration::ZERO)).unwrap(), 0x41);
        assert_eq!(group.bits(), 0x41);
    }

    #[test]
    fn test_kept_bit_releases_every_waiter() {
        let group = Arc::new(EventGroup::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let group = Arc::clone(&group);
                thread::spawn(move || {
                    let opts = WaitOptions::any().with_keep_bits(true);
                    group.wait(0x40, opts, None).unwrap()
                })
            })
            .collect();

        while group.waiters() < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        group.set(0x40).unwrap();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap() & 0x40, 0x40);
        }
    }

    #[test]
    fn test_wait_all_times_out_with_partial_bits() {
        let group = EventGroup::new();
        group.set(0x1).unwrap();
        let start = Instant::now();
        let bits = group
            .wait(0x3, WaitOptions::all(), Some(Duration::from_millis(40)))
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(bits, 0x1);
        assert!(!WaitOptions::all().satisfied_by(bits, 0x3));
    }

    #[test]
    fn test_zero_timeout_returns_immediately() {
        let group = EventGroup::new();
        let start = Instant::now();
        let bits = group.wait(0x8, WaitOptions::any(), Some(Duration::ZERO)).unwrap();
        assert_eq!(bits, 0);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_wait_all_across_threads() {
        let group = Arc::new(EventGroup::new());
        let setter = Arc::clone(&group);
        let handle = thread::spawn(move || {
            setter.set(0x1).unwrap();
            thread::sleep(Duration::from_millis(20));
            setter.set(0x2).unwrap();
        });

        let bits = group
            .wait(0x3, WaitOptions::all(), Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(bits & 0x3, 0x3);
        handle.join().unwrap();
    }

    #[test]
    fn test_waiter_count_blocks_teardown() {
        let group = Arc::new(EventGroup::new());
        let waiter = Arc::clone(&group);
        let handle = thread::spawn(move || waiter.wait(0x80, WaitOptions::any(), None).unwrap());

        while group.waiters() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(group.ensure_idle().unwrap_err(), LspError::ResourceInUse);

        group.set(0x80).unwrap();
        assert_eq!(handle.join().unwrap() & 0x80, 0x80);
        assert!(group.ensure_idle().is_ok());
    }
}
