//! Timeout utilities for blocking operations
//!
//! Every blocking call in the stack takes an `Option<Duration>`:
//! - `None`: Block indefinitely (no timeout)
//! - `Some(Duration::ZERO)`: Non-blocking (return immediately if not ready)
//! - `Some(duration)`: Wait up to duration
//!
//! A [`Deadline`] turns that into an absolute point on the monotonic clock
//! once, so that waits interrupted by spurious wake-ups resume with the
//! *remaining* budget instead of restarting the full timeout.

use std::time::{Duration, Instant};

/// Absolute deadline for a blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Block forever
    Never,
    /// Do not block at all
    Immediate,
    /// Block until this instant
    At(Instant),
}

impl Deadline {
    /// Compute the deadline for a timeout starting now.
    #[must_use]
    pub fn after(timeout: Option<Duration>) -> Self {
        match timeout {
            None => Self::Never,
            Some(d) if d.is_zero() => Self::Immediate,
            // An unrepresentable instant is as good as forever
            Some(d) => Instant::now().checked_add(d).map_or(Self::Never, Self::At),
        }
    }

    /// Whether the caller asked for a non-blocking attempt.
    #[inline]
    #[must_use]
    pub const fn is_immediate(&self) -> bool {
        matches!(self, Self::Immediate)
    }

    /// Remaining budget.
    ///
    /// Returns `None` for an infinite deadline and `Some(Duration::ZERO)`
    /// once the deadline has passed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Self::Never => None,
            Self::Immediate => Some(Duration::ZERO),
            Self::At(at) => Some(at.saturating_duration_since(Instant::now())),
        }
    }

    /// Whether the deadline has been reached.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.remaining().is_some_and(|d| d.is_zero())
    }
}
