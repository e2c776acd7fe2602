//! Connection attributes
//!
//! Per-connection addressing, priority and timeouts, reset to the defaults
//! below every time a slot is handed out by the pool.

use crate::packet::{Address, ADDR_ANY, PORT_ANY};
use std::time::Duration;

/// Priority given to freshly allocated connections.
pub const DEFAULT_PRIORITY: u8 = 0x7F;

/// Connection attributes.
///
/// # Examples
///
/// ```
/// use lsp_core::options::ConnOptions;
/// use std::time::Duration;
///
/// let opts = ConnOptions::default()
///     .with_priority(200)
///     .with_recv_timeout(Some(Duration::from_millis(50)));
/// assert_eq!(opts.priority, 200);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnOptions {
    /// Dispatch priority within a port.
    ///
    /// Higher values are offered inbound packets first.
    pub priority: u8,

    /// Local port, [`PORT_ANY`] until bound
    pub lport: u8,

    /// Local address, [`ADDR_ANY`] until bound
    pub laddr: Address,

    /// Remote port, [`PORT_ANY`] until connected
    pub rport: u8,

    /// Remote address, [`ADDR_ANY`] until connected
    pub raddr: Address,

    pub flags: u32,

    /// Receive timeout
    ///
    /// - `None`: Block indefinitely (default)
    /// - `Some(Duration::ZERO)`: Non-blocking
    /// - `Some(duration)`: Wait up to duration
    pub recv_timeout: Option<Duration>,

    /// Send timeout, same convention as `recv_timeout`
    pub send_timeout: Option<Duration>,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            lport: PORT_ANY,
            laddr: ADDR_ANY,
            rport: PORT_ANY,
            raddr: ADDR_ANY,
            flags: 0,
            recv_timeout: None,
            send_timeout: None,
        }
    }
}

impl ConnOptions {
    #[must_use]
    pub const fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_recv_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.recv_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Whether a packet from `addr:port` belongs to this connection's peer.
    ///
    /// Unset remote fields match anything.
    #[must_use]
    pub fn accepts_peer(&self, addr: Address, port: u8) -> bool {
        (self.raddr == ADDR_ANY || self.raddr == addr)
            && (self.rport == PORT_ANY || self.rport == port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_wildcards() {
        let opts = ConnOptions::default();
        assert_eq!(opts.priority, DEFAULT_PRIORITY);
        assert_eq!(opts.lport, PORT_ANY);
        assert_eq!(opts.raddr, ADDR_ANY);
        assert_eq!(opts.recv_timeout, None);
        assert_eq!(opts.flags, 0);
    }

    #[test]
    fn test_accepts_peer() {
        let mut opts = ConnOptions::default();
        assert!(opts.accepts_peer(0x10, 3));
        opts.raddr = 0x10;
        opts.rport = 3;
        assert!(opts.accepts_peer(0x10, 3));
        assert!(!opts.accepts_peer(0x11, 3));
        assert!(!opts.accepts_peer(0x10, 4));
    }
}
