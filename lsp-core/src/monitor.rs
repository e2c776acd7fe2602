//! Connection event monitoring.
//!
//! Provides event streams for tracking connection lifecycle events like
//! binding, listening, accepting and closing.

use crate::conn::ConnHandle;
use crate::packet::Address;
use std::fmt;

/// Connection lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    /// A slot was handed out by the pool.
    Allocated(ConnHandle),

    /// Connection bound to a local port slot.
    Bound { conn: ConnHandle, port: u8 },

    /// Connection is listening on a local port slot.
    Listening { conn: ConnHandle, port: u8 },

    /// Connection attached to a remote peer.
    Connected {
        conn: ConnHandle,
        addr: Address,
        port: u8,
    },

    /// A listening connection created a child for a new peer.
    Accepted { parent: ConnHandle, child: ConnHandle },

    /// Connection closed; queued packets were discarded.
    Closed(ConnHandle),

    /// Slot returned to the pool.
    Freed(ConnHandle),

    /// An inbound packet could not be queued.
    Dropped(ConnHandle),
}

impl fmt::Display for ConnEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocated(conn) => write!(f, "Allocated {conn}"),
            Self::Bound { conn, port } => write!(f, "{conn} bound to port {port}"),
            Self::Listening { conn, port } => write!(f, "{conn} listening on port {port}"),
            Self::Connected { conn, addr, port } => {
                write!(f, "{conn} connected to {addr:04X}:{port}")
            }
            Self::Accepted { parent, child } => write!(f, "{parent} accepted {child}"),
            Self::Closed(conn) => write!(f, "Closed {conn}"),
            Self::Freed(conn) => write!(f, "Freed {conn}"),
            Self::Dropped(conn) => write!(f, "Dropped packet for {conn}"),
        }
    }
}

/// Handle for receiving connection events.
pub type ConnMonitor = flume::Receiver<ConnEvent>;

/// Sender half held by the pool.
pub type ConnEventSender = flume::Sender<ConnEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (ConnEventSender, ConnMonitor) {
    flume::unbounded()
}
