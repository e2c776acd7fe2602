//! Stack configuration
//!
//! Configuration consumed at stack initialization. Unset values fall back
//! to the defaults below; [`LspConfig::validate`] rejects values the stack
//! cannot honour.

use crate::error::{LspError, Result};
use crate::packet::{Address, ADDR_ANY, ADDR_MAX, HEADER_LEN};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_ADDR: u32 = 0xAE55;
pub const DEFAULT_HOSTNAME: &str = "LSP Hostname";
pub const DEFAULT_MACHINENAME: &str = "LSP Machinename";
pub const DEFAULT_REVISION: &str = "LSP Revision";

/// Stack configuration.
///
/// # Examples
///
/// ```
/// use lsp_core::config::LspConfig;
/// use std::time::Duration;
///
/// let conf = LspConfig::default()
///     .with_addr(0x0042)
///     .with_max_connections(8)
///     .with_queue_timeout(Duration::from_millis(20));
/// assert!(conf.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct LspConfig {
    /// Address of this system.
    ///
    /// Kept wider than the wire field so out-of-range values can be
    /// reported instead of silently truncated.
    pub addr: u32,

    pub hostname: String,
    pub machine_name: String,
    pub revision: String,

    /// Number of connection slots pre-allocated by the pool
    pub max_connections: usize,

    /// Receive queue length of each connection
    pub conn_queue_len: usize,

    /// Budget for pushes onto a connection's receive queue.
    /// A producer that cannot push within this time drops the packet.
    pub queue_timeout: Duration,

    /// Budget for short internal critical sections
    pub mutex_timeout: Duration,

    /// Headroom reserved in front of outbound payloads; at least one
    /// packet header
    pub buffer_header_len: usize,

    /// Capacity of the core event queue
    pub core_event_queue_len: usize,

    /// How long the core thread blocks waiting for an event
    pub core_poll_interval: Duration,

    /// Release a connection's receive queue and event group on close
    /// instead of keeping them pooled with the slot.
    /// - `false` (default): amortize allocation across reuse
    pub release_on_close: bool,
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR,
            hostname: DEFAULT_HOSTNAME.to_string(),
            machine_name: DEFAULT_MACHINENAME.to_string(),
            revision: DEFAULT_REVISION.to_string(),
            max_connections: 32,
            conn_queue_len: 4,
            queue_timeout: Duration::from_millis(100),
            mutex_timeout: Duration::from_millis(100),
            buffer_header_len: HEADER_LEN,
            core_event_queue_len: 16,
            core_poll_interval: Duration::from_millis(500),
            release_on_close: false,
        }
    }
}

impl LspConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_addr(mut self, addr: u32) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_machine_name(mut self, name: impl Into<String>) -> Self {
        self.machine_name = name.into();
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_conn_queue_len(mut self, len: usize) -> Self {
        self.conn_queue_len = len;
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn with_mutex_timeout(mut self, timeout: Duration) -> Self {
        self.mutex_timeout = timeout;
        self
    }

    pub fn with_buffer_header_len(mut self, len: usize) -> Self {
        self.buffer_header_len = len;
        self
    }

    pub fn with_core_event_queue_len(mut self, len: usize) -> Self {
        self.core_event_queue_len = len;
        self
    }

    pub fn with_core_poll_interval(mut self, interval: Duration) -> Self {
        self.core_poll_interval = interval;
        self
    }

    pub fn with_release_on_close(mut self, release: bool) -> Self {
        self.release_on_close = release;
        self
    }

    /// The system address as a wire address.
    pub fn address(&self) -> Result<Address> {
        if self.addr > ADDR_MAX || self.addr == u32::from(ADDR_ANY) {
            return Err(LspError::AddressInvalid(self.addr));
        }
        Ok(self.addr as Address)
    }

    /// Check the configuration for values the stack cannot honour.
    pub fn validate(&self) -> Result<()> {
        self.address()?;
        if self.max_connections == 0 {
            return Err(LspError::invalid("max_connections must be non-zero"));
        }
        if self.conn_queue_len == 0 {
            return Err(LspError::invalid("conn_queue_len must be non-zero"));
        }
        if self.buffer_header_len < HEADER_LEN {
            return Err(LspError::invalid(format!(
                "buffer_header_len must be at least {}",
                HEADER_LEN
            )));
        }
        if self.core_event_queue_len == 0 {
            return Err(LspError::invalid("core_event_queue_len must be non-zero"));
        }
        Ok(())
    }

    /// Validate and replace empty names with their defaults.
    pub fn normalized(mut self) -> Result<Self> {
        self.validate()?;
        for (field, value, default) in [
            ("hostname", &mut self.hostname, DEFAULT_HOSTNAME),
            ("machine_name", &mut self.machine_name, DEFAULT_MACHINENAME),
            ("revision", &mut self.revision, DEFAULT_REVISION),
        ] {
            if value.is_empty() {
                debug!("[CONF] empty {}, loading default", field);
                *value = default.to_string();
            }
        }
        Ok(self)
    }
}
