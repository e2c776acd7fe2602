//! LSP Core
//!
//! This crate contains the building blocks of the LSP network stack:
//! - Timed mutex, event groups and bounded blocking queues (`sync`)
//! - Headroom/tailroom-aware packet buffers (`buffer`)
//! - Packet header codec (`packet`)
//! - Connection pool with listening/child connections (`conn`)
//! - Port table and routing table (`port`, `routing`)
//! - Link-layer interface abstraction (`interface`)
//! - Configuration and error types (`config`, `error`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod interface;
pub mod monitor;
pub mod options;
pub mod packet;
pub mod port;
pub mod routing;
pub mod timeout;

pub mod sync {
    pub mod egroup;
    pub mod mutex;
    pub mod queue;
}

pub mod prelude {
    pub use crate::buffer::PacketBuffer;
    pub use crate::config::LspConfig;
    pub use crate::conn::{ConnHandle, ConnInfo, ConnState, ConnType, ConnectionPool};
    pub use crate::error::{LspError, Rejected, Result};
    pub use crate::interface::{Interface, InterfaceList, InterfaceStats, LinkDriver};
    pub use crate::monitor::{ConnEvent, ConnMonitor};
    pub use crate::options::ConnOptions;
    pub use crate::packet::{Address, PacketHeader, ADDR_ANY, PORT_ANY};
    pub use crate::routing::RouteTable;
    pub use crate::sync::egroup::{EventBits, EventGroup, WaitOptions};
    pub use crate::sync::mutex::TimedMutex;
    pub use crate::sync::queue::{BoundedQueue, CopyQueue, SlotQueue};
}
