//! # LSP
//!
//! An embeddable, socket-style network stack for small systems.
//!
//! ## Architecture
//!
//! - **`lsp-core`**: timed mutex, event groups, bounded queues, packet
//!   buffers, the connection pool with its port table, interfaces and routes
//! - **`lsp`**: the [`Stack`] context, its core thread and the socket API
//!   (this crate)
//!
//! Link drivers implement [`LinkDriver`] and hand received frames to
//! [`Stack::input`]. The core thread demultiplexes them by destination
//! port to listening or connected sockets.
//!
//! ## Quick Start
//!
//! ```rust
//! use lsp::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), LspError> {
//! let stack = Arc::new(Stack::new(LspConfig::default())?);
//! stack.start()?;
//!
//! let server = stack.socket()?;
//! stack.bind(server, 7)?;
//! stack.listen(server, 4)?;
//!
//! let client = stack.socket()?;
//! stack.connect(client, stack.address(), 7)?;
//! stack.send(client, b"ping")?;
//!
//! let child = stack.accept(server, Some(Duration::from_secs(1)))?;
//! stack.setsockopt(child, SockOpt::RecvTimeout(Some(Duration::from_secs(1))))?;
//! let mut buf = [0u8; 16];
//! let n = stack.recv(child, &mut buf)?;
//! assert_eq!(&buf[..n], b"ping");
//!
//! stack.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Timeouts
//!
//! Every blocking call takes `Option<Duration>`: `None` waits forever,
//! `Some(Duration::ZERO)` never blocks and anything else bounds the wait.

#![deny(unsafe_code)]
#![warn(clippy::all)]

mod core_task;
pub mod dev_tracing;
mod global;
mod socket;
mod stack;

pub use bytes::Bytes;
pub use core_task::CoreEvent;
pub use global::{init, init_with, instance, shutdown};
pub use lsp_core::buffer::PacketBuffer;
pub use lsp_core::config::LspConfig;
pub use lsp_core::conn::{
    ConnHandle, ConnInfo, ConnState, ConnType, CONN_EV_ACCEPT, CONN_EV_ALL, CONN_EV_BOUND,
    CONN_EV_CLOSED, CONN_EV_CONNECT, CONN_EV_INTR, CONN_EV_LISTEN, CONN_EV_RECEIVE, CONN_EV_SEND,
};
pub use lsp_core::error::{LspError, Result};
pub use lsp_core::interface::{Interface, InterfaceStats, LinkDriver};
pub use lsp_core::monitor::{ConnEvent, ConnMonitor};
pub use lsp_core::packet::{Address, PacketHeader, ADDR_ANY, PORT_ANY, PORT_MAX};
pub use socket::{SockOpt, SockOptName, SocketHandle};
pub use stack::Stack;

/// Lower-level building blocks, for drivers and tests.
pub use lsp_core;

/// Convenient imports.
///
/// ```rust
/// use lsp::prelude::*;
///
/// // Now you have:
/// // - Stack, LspConfig and the socket option types
/// // - Interface and LinkDriver for link drivers
/// // - LspError and Bytes
/// ```
pub mod prelude {
    pub use crate::{
        Address, Bytes, ConnState, Interface, LinkDriver, LspConfig, LspError, SockOpt,
        SockOptName, SocketHandle, Stack,
    };
}
