/// LSP Error Types
///
/// Error handling shared by every primitive of the stack. Lower-level
/// primitives never retry internally; the caller decides whether its
/// deadline budget allows another attempt.

use std::fmt;
use thiserror::Error;

/// Main error type for LSP operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LspError {
    /// A bounded wait expired before its predicate was satisfied
    #[error("Operation timed out")]
    Timeout,

    /// Non-blocking push on a full queue
    #[error("Queue full")]
    QueueFull,

    /// Non-blocking pop on an empty queue
    #[error("Queue empty")]
    QueueEmpty,

    /// Destroy/clear attempted while threads are blocked on the resource
    #[error("Resource in use")]
    ResourceInUse,

    /// Allocation failure
    #[error("Out of memory")]
    OutOfMemory,

    /// Bad size, capacity or argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Underlying lock primitive failed outside of a timeout
    #[error("Lock failure")]
    LockFailure,

    /// Address does not fit the header field or is reserved
    #[error("Invalid address: {0:#06x}")]
    AddressInvalid(u32),

    /// Port outside of the valid range
    #[error("Invalid port: {0}")]
    PortInvalid(u8),

    /// Port is already bound
    #[error("Port {0} already in use")]
    PortInUse(u8),

    /// Handle refers to a slot that was freed (and possibly reused)
    #[error("Stale connection handle")]
    StaleHandle,

    /// Operation on a queue after it was destroyed
    #[error("Resource destroyed")]
    Destroyed,

    /// Operation not valid for the connection's type or state
    #[error("Operation not valid in state {0}")]
    WrongState(String),

    /// No route towards the destination
    #[error("No route to {0:#06x}")]
    NoRoute(u16),

    /// Spawning or joining a stack thread failed
    #[error("Thread error: {0}")]
    Thread(String),
}

/// Result type alias for LSP operations
pub type Result<T> = std::result::Result<T, LspError>;

impl LspError {
    /// Create an invalid argument error with a message
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a wrong state error from anything printable
    pub fn wrong_state(state: impl fmt::Debug) -> Self {
        Self::WrongState(format!("{state:?}"))
    }

    /// Check if this error is a deadline expiry
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Check if the same call may succeed later without caller changes
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::QueueFull | Self::QueueEmpty | Self::ResourceInUse
        )
    }
}

/// A push that failed, handing the item back to the caller.
///
/// Queues take ownership on success only; on failure the item is returned
/// untouched so nothing is silently dropped.
pub struct Rejected<T> {
    pub error: LspError,
    pub item: T,
}

impl<T> Rejected<T> {
    pub const fn new(error: LspError, item: T) -> Self {
        Self { error, item }
    }

    /// Drop the item and keep the error.
    pub fn into_error(self) -> LspError {
        self.error
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected").field("error", &self.error).finish_non_exhaustive()
    }
}

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "push rejected: {}", self.error)
    }
}

impl<T> std::error::Error for Rejected<T> {}

impl<T> From<Rejected<T>> for LspError {
    fn from(rejected: Rejected<T>) -> Self {
        rejected.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds() {
        assert!(LspError::Timeout.is_recoverable());
        assert!(LspError::QueueFull.is_recoverable());
        assert!(!LspError::StaleHandle.is_recoverable());
        assert!(!LspError::PortInUse(3).is_recoverable());
    }

    #[test]
    fn test_rejected_converts_to_error() {
        let rejected = Rejected::new(LspError::QueueFull, vec![1u8, 2, 3]);
        assert_eq!(rejected.item, vec![1, 2, 3]);
        let err: LspError = rejected.into();
        assert_eq!(err, LspError::QueueFull);
    }

    #[test]
    fn test_display() {
        assert_eq!(LspError::AddressInvalid(0x1_0000).to_string(), "Invalid address: 0x10000");
        assert_eq!(LspError::PortInUse(4).to_string(), "Port 4 already in use");
    }
}
