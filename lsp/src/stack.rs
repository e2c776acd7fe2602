//! Stack context.
//!
//! A [`Stack`] owns every table of one stack instance: the connection pool
//! (with its port table), the interface list and the routing table, plus
//! the core event queue and thread. Nothing is global; see
//! [`crate::init`] for the optional process-wide instance.

use crate::core_task::{self, CoreEvent};
use lsp_core::buffer::PacketBuffer;
use lsp_core::config::LspConfig;
use lsp_core::conn::ConnectionPool;
use lsp_core::error::{LspError, Result};
use lsp_core::interface::{Interface, InterfaceId, InterfaceList};
use lsp_core::monitor::ConnMonitor;
use lsp_core::packet::{Address, ADDR_ANY, HEADER_LEN};
use lsp_core::routing::{RouteTable, LINK_SPEED_UNKNOWN};
use lsp_core::sync::queue::BoundedQueue;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// One instance of the network stack.
///
/// # Examples
///
/// ```
/// use lsp::{LspConfig, Stack};
/// use std::sync::Arc;
///
/// let stack = Arc::new(Stack::new(LspConfig::default()).unwrap());
/// stack.start().unwrap();
///
/// let server = stack.socket().unwrap();
/// stack.bind(server, 4).unwrap();
/// stack.listen(server, 2).unwrap();
///
/// let client = stack.socket().unwrap();
/// stack.connect(client, stack.address(), 4).unwrap();
/// stack.send(client, b"hello").unwrap();
///
/// stack.shutdown().unwrap();
/// ```
pub struct Stack {
    conf: LspConfig,
    addr: Address,
    pub(crate) pool: ConnectionPool,
    interfaces: InterfaceList,
    routes: RouteTable,
    pub(crate) core_events: BoundedQueue<CoreEvent>,
    pub(crate) running: AtomicBool,
    core: Mutex<Option<JoinHandle<()>>>,
}

impl Stack {
    /// Validate `conf` and allocate every table.
    pub fn new(conf: LspConfig) -> Result<Self> {
        let conf = conf.normalized()?;
        let addr = conf.address()?;
        let pool = ConnectionPool::new(&conf)?;
        let routes = RouteTable::new(conf.mutex_timeout);
        let core_events = BoundedQueue::new(conf.core_event_queue_len)?;
        debug!(
            "[CORE] stack {:04X} host: {} machine: {} rev: {}",
            addr, conf.hostname, conf.machine_name, conf.revision
        );

        Ok(Self {
            conf,
            addr,
            pool,
            interfaces: InterfaceList::new(),
            routes,
            core_events,
            running: AtomicBool::new(false),
            core: Mutex::new(None),
        })
    }

    /// Enable connection event monitoring.
    pub fn monitor(&mut self) -> ConnMonitor {
        self.pool.monitor()
    }

    #[must_use]
    pub const fn config(&self) -> &LspConfig {
        &self.conf
    }

    /// Address of this system.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.addr
    }

    #[must_use]
    pub const fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    #[must_use]
    pub const fn interfaces(&self) -> &InterfaceList {
        &self.interfaces
    }

    #[must_use]
    pub const fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Allocate a buffer for an outbound packet.
    ///
    /// Headroom is the configured `buffer_header_len`, raised to what `iface`
    /// needs when one is given.
    pub fn alloc_buffer(&self, iface: Option<&Interface>, payload_len: usize) -> Result<PacketBuffer> {
        let headroom = iface.map_or(self.conf.buffer_header_len, |iface| {
            iface.min_header_len().max(self.conf.buffer_header_len)
        });
        let mut buffer = PacketBuffer::new(headroom, payload_len)?;
        buffer.set_interface(iface.map(Interface::index));
        Ok(buffer)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register a link-layer interface. Only allowed before [`start`](Self::start).
    pub fn register_interface(&self, iface: Interface) -> Result<Arc<Interface>> {
        if self.is_running() {
            return Err(LspError::WrongState("running".to_string()));
        }
        self.interfaces.register(iface)
    }

    /// Add a route to `addr` through `iface`.
    pub fn add_route(&self, iface: &Arc<Interface>, addr: Address, link_speed: u32) -> Result<bool> {
        self.routes.add(iface, addr, link_speed)
    }

    /// Open every interface and spawn the core thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut core = self.core.lock();
        if core.is_some() {
            return Err(LspError::WrongState("running".to_string()));
        }
        for iface in self.interfaces.all() {
            iface.open()?;
        }

        self.running.store(true, Ordering::Release);
        let stack = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("lsp-core".to_string())
            .spawn(move || core_task::run(stack))
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                LspError::Thread(e.to_string())
            })?;
        *core = Some(handle);
        debug!("[CORE] {} interfaces up", self.interfaces.len());
        Ok(())
    }

    /// Stop the core thread and close every interface.
    ///
    /// Returns immediately if the stack is not running.
    pub fn shutdown(&self) -> Result<()> {
        let Some(handle) = self.core.lock().take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::Release);
        if let Err(rejected) = self.core_events.offer(CoreEvent::Shutdown) {
            // The core also checks `running` on every poll tick.
            debug!("[CORE] shutdown event not queued: {}", rejected.error);
        }
        handle
            .join()
            .map_err(|_| LspError::Thread("core thread panicked".to_string()))?;

        for iface in self.interfaces.all() {
            if let Err(e) = iface.close() {
                warn!("[CORE] could not close {}: {}", iface.name(), e);
            }
        }
        debug!("[CORE] shutdown complete");
        Ok(())
    }

    /// Post an event for the core thread without waiting for room.
    ///
    /// Fails with [`LspError::QueueFull`] when the core is behind.
    pub fn post(&self, event: CoreEvent) -> Result<()> {
        self.core_events
            .offer(event)
            .map_err(|rejected| {
                debug!("[CORE] could not post {:?}: {}", event, rejected.error);
                rejected.into_error()
            })
    }

    /// Hand a frame received on `iface` to the stack. Called by link drivers.
    ///
    /// Waits at most the configured queue timeout for room in the
    /// interface's receive queue; a frame that still does not fit is counted
    /// as dropped.
    pub fn input(&self, iface: &Interface, frame: &[u8]) -> Result<()> {
        let mut buffer = PacketBuffer::from_slice(0, frame)?;
        buffer.set_interface(Some(iface.index()));
        iface.enqueue_rx(buffer, Some(self.conf.queue_timeout))?;
        trace!("[CORE] frame queued on {}", iface.name());
        self.post(CoreEvent::NetRx(iface.index()))
    }

    pub(crate) fn process_rx(&self, id: InterfaceId) {
        let Some(iface) = self.interfaces.by_index(id) else {
            warn!("[CORE] rx event for unknown interface {}", id);
            return;
        };
        while let Ok(Some(buffer)) = iface.take_rx() {
            self.dispatch(Some(&iface), buffer);
        }
    }

    pub(crate) fn process_tx(&self, id: InterfaceId) {
        match self.interfaces.by_index(id) {
            Some(iface) => {
                iface.flush_tx();
            }
            None => warn!("[CORE] tx event for unknown interface {}", id),
        }
    }

    /// Drain every receive queue and flush every transmit queue.
    pub(crate) fn service_all(&self) {
        for iface in self.interfaces.all() {
            self.process_rx(iface.index());
            iface.flush_tx();
        }
    }

    /// Deliver one inbound packet to the socket it belongs to.
    ///
    /// `iface` is `None` for loopback traffic.
    pub(crate) fn dispatch(&self, iface: Option<&Arc<Interface>>, buffer: PacketBuffer) {
        buffer.hexdump();
        let Some(header) = buffer.parse_header() else {
            trace!("[CORE] runt frame of {} bytes", buffer.len());
            if let Some(iface) = iface {
                iface.record_rx_error();
            }
            return;
        };
        if buffer.len() - HEADER_LEN < usize::from(header.plen) {
            trace!("[CORE] truncated packet, plen {} len {}", header.plen, buffer.len());
            if let Some(iface) = iface {
                iface.record_rx_error();
            }
            return;
        }
        if header.dst_addr != self.addr && header.dst_addr != ADDR_ANY {
            trace!("[CORE] packet for {:04X} is not ours", header.dst_addr);
            count_drop(iface);
            return;
        }

        if let Some(iface) = iface {
            if header.src_addr != ADDR_ANY {
                if let Err(e) = self.routes.add(iface, header.src_addr, LINK_SPEED_UNKNOWN) {
                    debug!("[CORE] could not learn route to {:04X}: {}", header.src_addr, e);
                }
            }
        }

        match self
            .pool
            .resolve_inbound(header.dst_port, header.src_addr, header.src_port)
        {
            Ok(Some(conn)) => match self.pool.rxq_push(conn, buffer) {
                Ok(()) => trace!(
                    "[CORE] {:04X}:{} -> {} ({} bytes)",
                    header.src_addr,
                    header.src_port,
                    conn,
                    header.plen
                ),
                Err(rejected) => {
                    debug!("[CORE] {} dropped packet: {}", conn, rejected.error);
                    count_drop(iface);
                }
            },
            Ok(None) => {
                trace!("[CORE] no socket for port {}", header.dst_port);
                count_drop(iface);
            }
            Err(e) => {
                debug!("[CORE] could not resolve port {}: {}", header.dst_port, e);
                count_drop(iface);
            }
        }
    }
}

fn count_drop(iface: Option<&Arc<Interface>>) {
    if let Some(iface) = iface {
        iface.record_drop();
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("addr", &format_args!("{:04X}", self.addr))
            .field("running", &self.is_running())
            .field("interfaces", &self.interfaces.len())
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}
