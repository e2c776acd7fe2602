//! Connection pool.
//!
//! A fixed array of connection slots allocated once at start-up. Each slot
//! lazily gets a receive queue of [`PacketBuffer`]s and an [`EventGroup`]
//! on first use; both stay with the slot across reuse unless the pool is
//! configured to release them on close.
//!
//! Slots are addressed through [`ConnHandle`]s carrying the slot's
//! generation. Freeing a slot bumps its generation, so a handle kept past
//! `free` is rejected with [`LspError::StaleHandle`] instead of silently
//! aliasing whichever connection reuses the slot.
//!
//! # Locking
//!
//! The slot array has one coarse lock. The port table is only ever locked
//! while the slot lock is held or with no lock held, never the other way
//! round. Blocking waits (receive, accept) happen with no pool lock held:
//! they sleep on the connection's event group and re-check the queue on
//! every wake.

use crate::buffer::PacketBuffer;
use crate::config::LspConfig;
use crate::error::{LspError, Rejected, Result};
use crate::monitor::{create_monitor, ConnEvent, ConnEventSender, ConnMonitor};
use crate::options::ConnOptions;
use crate::packet::{Address, PORT_MAX};
use crate::port::{PortTable, PORT_ANY_SLOT};
use crate::sync::egroup::{EventBits, EventGroup, WaitOptions};
use crate::sync::mutex::{TimedGuard, TimedMutex};
use crate::sync::queue::BoundedQueue;
use crate::timeout::Deadline;
use hashbrown::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub const CONN_EV_RECEIVE: EventBits = 0x01;
pub const CONN_EV_SEND: EventBits = 0x02;
pub const CONN_EV_BOUND: EventBits = 0x04;
pub const CONN_EV_LISTEN: EventBits = 0x08;
pub const CONN_EV_ACCEPT: EventBits = 0x10;
pub const CONN_EV_CONNECT: EventBits = 0x20;
pub const CONN_EV_CLOSED: EventBits = 0x40;
pub const CONN_EV_INTR: EventBits = 0x80;
pub const CONN_EV_ALL: EventBits = 0xFF;

/// Generation-tagged reference to a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle {
    index: usize,
    generation: u32,
}

impl ConnHandle {
    #[must_use]
    pub const fn new(index: usize, generation: u32) -> Self {
        Self { index, generation }
    }

    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[inline]
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}.{}", self.index, self.generation)
    }
}

/// Connection states, ordered by how far a connection got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ConnState {
    #[default]
    Free = 0,
    Closed,
    /// Bound to a local port
    Open,
    Listen,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Client,
    Server,
    Child,
}

/// Role-specific data. A connection is exactly one of these at a time.
enum ConnKind {
    Client,
    Server {
        backlog: Arc<BoundedQueue<ConnHandle>>,
        /// Children by remote `(address, port)`
        children: HashMap<(Address, u8), ConnHandle>,
    },
    Child {
        parent: ConnHandle,
    },
}

impl ConnKind {
    const fn conn_type(&self) -> ConnType {
        match self {
            Self::Client => ConnType::Client,
            Self::Server { .. } => ConnType::Server,
            Self::Child { .. } => ConnType::Child,
        }
    }
}

/// Snapshot of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnInfo {
    pub state: ConnState,
    pub conn_type: ConnType,
    pub options: ConnOptions,
    pub parent: Option<ConnHandle>,
    pub opened_at: Option<Instant>,
    /// Buffers waiting in the receive queue (advisory)
    pub pending: usize,
}

struct Slot {
    generation: u32,
    state: ConnState,
    kind: ConnKind,
    opts: ConnOptions,
    /// Whether the connection sits in the socket list of `opts.lport`
    registered: bool,
    opened_at: Option<Instant>,
    rx_queue: Option<Arc<BoundedQueue<PacketBuffer>>>,
    events: Option<Arc<EventGroup>>,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            generation: 0,
            state: ConnState::Free,
            kind: ConnKind::Client,
            opts: ConnOptions::default(),
            registered: false,
            opened_at: None,
            rx_queue: None,
            events: None,
        }
    }

    fn events(&self) -> Result<Arc<EventGroup>> {
        self.events.clone().ok_or(LspError::Destroyed)
    }

    fn rx_queue(&self) -> Result<Arc<BoundedQueue<PacketBuffer>>> {
        self.rx_queue.clone().ok_or(LspError::Destroyed)
    }
}

fn slot_ref(slots: &[Slot], handle: ConnHandle) -> Result<&Slot> {
    match slots.get(handle.index) {
        Some(slot) if slot.generation == handle.generation && slot.state != ConnState::Free => {
            Ok(slot)
        }
        _ => Err(LspError::StaleHandle),
    }
}

fn slot_mut(slots: &mut [Slot], handle: ConnHandle) -> Result<&mut Slot> {
    match slots.get_mut(handle.index) {
        Some(slot) if slot.generation == handle.generation && slot.state != ConnState::Free => {
            Ok(slot)
        }
        _ => Err(LspError::StaleHandle),
    }
}

#[derive(Debug, Clone, Copy)]
struct PoolLimits {
    conn_queue_len: usize,
    queue_timeout: Duration,
    mutex_timeout: Duration,
    release_on_close: bool,
}

/// Fixed-size pool of connections plus the port table they bind into.
pub struct ConnectionPool {
    slots: TimedMutex<Vec<Slot>>,
    ports: PortTable,
    limits: PoolLimits,
    monitor: Option<ConnEventSender>,
}

impl ConnectionPool {
    /// Allocate `conf.max_connections` free slots.
    pub fn new(conf: &LspConfig) -> Result<Self> {
        if conf.max_connections == 0 || conf.conn_queue_len == 0 {
            return Err(LspError::invalid(
                "connection pool needs non-zero max_connections and conn_queue_len",
            ));
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(conf.max_connections)
            .map_err(|_| {
                debug!("[POOL] could not allocate {} slots", conf.max_connections);
                LspError::OutOfMemory
            })?;
        slots.resize_with(conf.max_connections, Slot::vacant);
        debug!(
            "[POOL] allocated pool, poolsize: {} queuelen: {}",
            conf.max_connections, conf.conn_queue_len
        );

        Ok(Self {
            slots: TimedMutex::new(slots),
            ports: PortTable::new(conf.mutex_timeout)?,
            limits: PoolLimits {
                conn_queue_len: conf.conn_queue_len,
                queue_timeout: conf.queue_timeout,
                mutex_timeout: conf.mutex_timeout,
                release_on_close: conf.release_on_close,
            },
            monitor: None,
        })
    }

    /// Enable monitoring for this pool.
    ///
    /// Call before sharing the pool; a later call replaces the previous
    /// monitor.
    pub fn monitor(&mut self) -> ConnMonitor {
        let (sender, receiver) = create_monitor();
        self.monitor = Some(sender);
        receiver
    }

    fn emit(&self, event: ConnEvent) {
        if let Some(monitor) = &self.monitor {
            let _ = monitor.send(event); // Ignore errors if receiver dropped
        }
    }

    fn lock(&self) -> TimedGuard<'_, Vec<Slot>> {
        self.slots.lock_blocking()
    }

    /// The port table connections bind into.
    #[must_use]
    pub const fn ports(&self) -> &PortTable {
        &self.ports
    }

    /// Reserve a free slot.
    ///
    /// Fails with [`LspError::OutOfMemory`] when every slot is in use or its
    /// receive queue cannot be allocated.
    pub fn alloc(&self) -> Result<ConnHandle> {
        let (handle, rx_queue, events) = {
            let mut slots = self.lock();
            let Some(index) = slots.iter().position(|slot| slot.state == ConnState::Free) else {
                debug!("[POOL] max connections reached");
                return Err(LspError::OutOfMemory);
            };
            let slot = &mut slots[index];
            slot.state = ConnState::Closed;
            (
                ConnHandle::new(index, slot.generation),
                slot.rx_queue.clone(),
                slot.events.clone(),
            )
        };

        // Allocation happens without the pool lock; the slot is already
        // reserved so nobody else can claim it.
        let prepared = self.prepare(rx_queue, events);

        let mut slots = self.lock();
        let slot = &mut slots[handle.index];
        match prepared {
            Ok((rx_queue, events)) => {
                slot.kind = ConnKind::Client;
                slot.opts = ConnOptions::default();
                slot.registered = false;
                slot.opened_at = None;
                slot.rx_queue = Some(rx_queue);
                slot.events = Some(events);
            }
            Err(e) => {
                warn!("[POOL] could not create resources for {}: {}", handle, e);
                slot.state = ConnState::Free;
                return Err(e);
            }
        }
        drop(slots);

        trace!("[POOL] allocated {}", handle);
        self.emit(ConnEvent::Allocated(handle));
        Ok(handle)
    }

    fn prepare(
        &self,
        rx_queue: Option<Arc<BoundedQueue<PacketBuffer>>>,
        events: Option<Arc<EventGroup>>,
    ) -> Result<(Arc<BoundedQueue<PacketBuffer>>, Arc<EventGroup>)> {
        let rx_queue = match rx_queue {
            Some(queue) => queue,
            None => Arc::new(BoundedQueue::new(self.limits.conn_queue_len)?),
        };
        let events = match events {
            Some(events) => events,
            None => Arc::new(EventGroup::with_lock_timeout(self.limits.mutex_timeout)),
        };
        events.clear(CONN_EV_ALL)?;
        Ok((rx_queue, events))
    }

    /// Close a connection.
    ///
    /// Idempotent: closing a connection that is not open succeeds without
    /// doing anything. Removes the connection from its port, discards every
    /// queued buffer and wakes its waiters with `CLOSED | INTR`.
    pub fn close(&self, handle: ConnHandle) -> Result<()> {
        let (rx_queue, events) = {
            let mut slots = self.lock();
            let slot = slot_mut(&mut slots, handle)?;
            if slot.state <= ConnState::Closed {
                trace!("[POOL] {} already closed", handle);
                return Ok(());
            }
            slot.state = ConnState::Closed;
            let registered = std::mem::take(&mut slot.registered);
            let lport = slot.opts.lport;
            let peer = (slot.opts.raddr, slot.opts.rport);
            let parent = match slot.kind {
                ConnKind::Child { parent } => Some(parent),
                _ => None,
            };
            let resources = (slot.rx_queue.clone(), slot.events.clone());

            if let Some(parent) = parent {
                if let Ok(ConnKind::Server { children, .. }) =
                    slot_mut(&mut slots, parent).map(|parent| &mut parent.kind)
                {
                    children.remove(&peer);
                }
            }
            if registered {
                if let Err(e) = self.ports.remove(lport, handle) {
                    warn!("[POOL] could not remove {} from port {}: {}", handle, lport, e);
                }
            }
            resources
        };

        if let Some(rx_queue) = &rx_queue {
            let flushed = rx_queue.drain().len();
            if flushed > 0 {
                debug!("[POOL] {} discarded {} queued buffers", handle, flushed);
            }
        }
        if let Some(events) = &events {
            if let Err(e) = events.set(CONN_EV_CLOSED | CONN_EV_INTR) {
                warn!("[POOL] could not signal close of {}: {}", handle, e);
            }
        }
        if self.limits.release_on_close {
            self.release(handle, rx_queue, events);
        }

        debug!("[POOL] closed {}", handle);
        self.emit(ConnEvent::Closed(handle));
        Ok(())
    }

    /// Drop a closed connection's queue and event group if nobody waits on them.
    fn release(
        &self,
        handle: ConnHandle,
        rx_queue: Option<Arc<BoundedQueue<PacketBuffer>>>,
        events: Option<Arc<EventGroup>>,
    ) {
        let queue_released = match rx_queue.map(|queue| queue.destroy()) {
            Some(Err(e)) => {
                warn!("[POOL] could not destroy rx queue of {}: {}", handle, e);
                false
            }
            _ => true,
        };
        let events_released = match events.map(|events| events.ensure_idle()) {
            Some(Err(e)) => {
                warn!("[POOL] could not release event group of {}: {}", handle, e);
                false
            }
            _ => true,
        };

        let mut slots = self.lock();
        if let Ok(slot) = slot_mut(&mut slots, handle) {
            if queue_released {
                slot.rx_queue = None;
            }
            if events_released {
                slot.events = None;
            }
        }
    }

    /// Return a connection to the pool, closing it first if needed.
    ///
    /// A listening connection also frees every child still waiting in its
    /// backlog.
    pub fn free(&self, handle: ConnHandle) -> Result<()> {
        self.close(handle)?;

        let backlog = {
            let mut slots = self.lock();
            let slot = slot_mut(&mut slots, handle)?;
            let kind = std::mem::replace(&mut slot.kind, ConnKind::Client);
            slot.state = ConnState::Free;
            slot.generation = slot.generation.wrapping_add(1);
            slot.opts = ConnOptions::default();
            slot.opened_at = None;
            match kind {
                ConnKind::Server { backlog, .. } => Some(backlog),
                _ => None,
            }
        };

        if let Some(backlog) = backlog {
            for child in backlog.drain() {
                if let Err(e) = self.free(child) {
                    debug!("[POOL] pending child {} already gone: {}", child, e);
                }
            }
            if let Err(e) = backlog.destroy() {
                warn!("[POOL] could not destroy backlog of {}: {}", handle, e);
            }
        }

        trace!("[POOL] freed {}", handle);
        self.emit(ConnEvent::Freed(handle));
        Ok(())
    }

    /// Queue an inbound buffer for a connection.
    ///
    /// Waits at most the configured queue timeout for space; on failure the
    /// buffer is handed back so the caller can count the drop.
    pub fn rxq_push(
        &self,
        handle: ConnHandle,
        buffer: PacketBuffer,
    ) -> std::result::Result<(), Rejected<PacketBuffer>> {
        let resources = {
            let slots = self.lock();
            slot_ref(&slots, handle).and_then(|slot| {
                if slot.state <= ConnState::Closed {
                    return Err(LspError::wrong_state(slot.state));
                }
                Ok((slot.rx_queue()?, slot.events()?))
            })
        };
        let (rx_queue, events) = match resources {
            Ok(resources) => resources,
            Err(e) => return Err(Rejected::new(e, buffer)),
        };

        match rx_queue.push(buffer, Some(self.limits.queue_timeout)) {
            Ok(()) => {
                if let Err(e) = events.set(CONN_EV_RECEIVE) {
                    warn!("[POOL] could not signal receive on {}: {}", handle, e);
                }
                Ok(())
            }
            Err(rejected) => {
                debug!("[POOL] {} rx queue rejected buffer: {}", handle, rejected.error);
                self.emit(ConnEvent::Dropped(handle));
                Err(rejected)
            }
        }
    }

    /// Take the oldest queued buffer of a connection.
    ///
    /// Blocks until a buffer arrives, the connection closes or the timeout
    /// elapses. A closed connection fails with [`LspError::WrongState`] once
    /// its queue is empty.
    pub fn rxq_pop(&self, handle: ConnHandle, timeout: Option<Duration>) -> Result<PacketBuffer> {
        let deadline = Deadline::after(timeout);
        loop {
            let (rx_queue, events, state) = {
                let slots = self.lock();
                let slot = slot_ref(&slots, handle)?;
                (slot.rx_queue()?, slot.events()?, slot.state)
            };
            if let Some(buffer) = take_ready(&rx_queue, &events, CONN_EV_RECEIVE)? {
                return Ok(buffer);
            }
            if state <= ConnState::Closed {
                return Err(LspError::wrong_state(state));
            }
            wait_for(&events, CONN_EV_RECEIVE | CONN_EV_CLOSED, deadline)?;
        }
    }

    /// Discard every queued buffer. Returns how many were dropped.
    pub fn rxq_flush(&self, handle: ConnHandle) -> Result<usize> {
        let rx_queue = {
            let slots = self.lock();
            slot_ref(&slots, handle)?.rx_queue()?
        };
        Ok(rx_queue.drain().len())
    }

    /// Bind a closed connection to `port` (or [`PORT_ANY`](crate::packet::PORT_ANY)).
    ///
    /// The connection is not yet reachable; see [`listen`](Self::listen) and
    /// [`connect`](Self::connect).
    pub fn bind(&self, handle: ConnHandle, port: u8) -> Result<()> {
        let (slot_no, events) = {
            let mut slots = self.lock();
            let slot = slot_mut(&mut slots, handle)?;
            if slot.state != ConnState::Closed {
                return Err(LspError::wrong_state(slot.state));
            }
            let slot_no = self.ports.check_bind(port)?;
            slot.opts.lport = slot_no;
            slot.state = ConnState::Open;
            (slot_no, slot.events()?)
        };

        events.clear(CONN_EV_CLOSED | CONN_EV_INTR)?;
        events.set(CONN_EV_BOUND)?;
        debug!("[POOL] bound {} to port {}", handle, slot_no);
        self.emit(ConnEvent::Bound {
            conn: handle,
            port: slot_no,
        });
        Ok(())
    }

    /// Turn a bound connection into a listening server with room for
    /// `backlog` pending children.
    pub fn listen(&self, handle: ConnHandle, backlog: usize) -> Result<()> {
        let queue = Arc::new(BoundedQueue::new(backlog)?);
        let (slot_no, events) = {
            let mut slots = self.lock();
            let slot = slot_mut(&mut slots, handle)?;
            if slot.state != ConnState::Open {
                debug!("[POOL] {} must be bound before listen", handle);
                return Err(LspError::wrong_state(slot.state));
            }
            let slot_no = slot.opts.lport;
            self.ports.listen(slot_no, handle, slot.opts.priority)?;
            slot.kind = ConnKind::Server {
                backlog: queue,
                children: HashMap::new(),
            };
            slot.state = ConnState::Listen;
            slot.registered = true;
            slot.opened_at = Some(Instant::now());
            (slot_no, slot.events()?)
        };

        events.set(CONN_EV_LISTEN)?;
        debug!("[POOL] {} listening to port {}", handle, slot_no);
        self.emit(ConnEvent::Listening {
            conn: handle,
            port: slot_no,
        });
        Ok(())
    }

    /// Attach a connection to a remote peer.
    ///
    /// An unbound connection joins the shared "any" port. Either way it is
    /// registered in its port's socket list so inbound packets reach it.
    pub fn connect(&self, handle: ConnHandle, addr: Address, port: u8) -> Result<()> {
        if port > PORT_MAX {
            return Err(LspError::PortInvalid(port));
        }
        let events = {
            let mut slots = self.lock();
            let slot = slot_mut(&mut slots, handle)?;
            match slot.state {
                ConnState::Closed => slot.opts.lport = PORT_ANY_SLOT,
                ConnState::Open => {}
                state => return Err(LspError::wrong_state(state)),
            }
            self.ports.insert(slot.opts.lport, handle, slot.opts.priority)?;
            slot.opts.raddr = addr;
            slot.opts.rport = port;
            slot.state = ConnState::Connected;
            slot.registered = true;
            slot.opened_at = Some(Instant::now());
            slot.events()?
        };

        events.clear(CONN_EV_CLOSED | CONN_EV_INTR)?;
        events.set(CONN_EV_CONNECT)?;
        debug!("[POOL] {} connected to {:04X}:{}", handle, addr, port);
        self.emit(ConnEvent::Connected {
            conn: handle,
            addr,
            port,
        });
        Ok(())
    }

    /// Child of a listening connection for the peer `addr:port`.
    ///
    /// Returns the existing child if the peer already has one; otherwise a
    /// new child is allocated, queued on the backlog and `ACCEPT` is
    /// signalled on the listener. Fails with [`LspError::QueueFull`] when
    /// the backlog has no room.
    pub fn offer_child(&self, parent: ConnHandle, addr: Address, port: u8) -> Result<ConnHandle> {
        let (opts, backlog, events) = {
            let slots = self.lock();
            let slot = slot_ref(&slots, parent)?;
            match (&slot.kind, slot.state) {
                (ConnKind::Server { backlog, children }, ConnState::Listen) => {
                    if let Some(&child) = children.get(&(addr, port)) {
                        return Ok(child);
                    }
                    (slot.opts, Arc::clone(backlog), slot.events()?)
                }
                (_, state) => return Err(LspError::wrong_state(state)),
            }
        };

        let child = self.alloc()?;
        let adopted = {
            let mut slots = self.lock();
            let slot = slot_mut(&mut slots, child)?;
            slot.kind = ConnKind::Child { parent };
            slot.state = ConnState::Connected;
            slot.opened_at = Some(Instant::now());
            slot.opts = ConnOptions {
                priority: opts.priority,
                lport: opts.lport,
                laddr: opts.laddr,
                raddr: addr,
                rport: port,
                ..ConnOptions::default()
            };
            match slot_mut(&mut slots, parent) {
                Ok(Slot {
                    state: ConnState::Listen,
                    kind: ConnKind::Server { children, .. },
                    ..
                }) => {
                    children.insert((addr, port), child);
                    Ok(())
                }
                Ok(slot) => Err(LspError::wrong_state(slot.state)),
                Err(e) => Err(e),
            }
        };

        let queued = adopted.and_then(|()| {
            backlog.offer(child).map_err(Rejected::into_error)
        });
        if let Err(e) = queued {
            debug!("[POOL] {} could not queue child for {:04X}:{}: {}", parent, addr, port, e);
            self.free(child)?;
            return Err(e);
        }

        events.set(CONN_EV_ACCEPT)?;
        debug!("[POOL] {} new child {} for {:04X}:{}", parent, child, addr, port);
        self.emit(ConnEvent::Accepted { parent, child });
        Ok(child)
    }

    /// Take the next pending child of a listening connection.
    ///
    /// Children closed while still in the backlog are skipped.
    pub fn accept(&self, handle: ConnHandle, timeout: Option<Duration>) -> Result<ConnHandle> {
        let deadline = Deadline::after(timeout);
        loop {
            let (backlog, events) = {
                let slots = self.lock();
                let slot = slot_ref(&slots, handle)?;
                match (&slot.kind, slot.state) {
                    (ConnKind::Server { backlog, .. }, ConnState::Listen) => {
                        (Arc::clone(backlog), slot.events()?)
                    }
                    (_, state) => return Err(LspError::wrong_state(state)),
                }
            };
            match take_ready(&backlog, &events, CONN_EV_ACCEPT)? {
                Some(child) if self.is_pending_child(handle, child) => return Ok(child),
                Some(child) => {
                    debug!("[POOL] {} skipping closed child {}", handle, child);
                    continue;
                }
                None => {}
            }
            wait_for(&events, CONN_EV_ACCEPT | CONN_EV_CLOSED, deadline)?;
        }
    }

    fn is_pending_child(&self, parent: ConnHandle, child: ConnHandle) -> bool {
        let slots = self.lock();
        match slot_ref(&slots, child) {
            Ok(slot) => {
                slot.state == ConnState::Connected
                    && matches!(slot.kind, ConnKind::Child { parent: owner } if owner == parent)
            }
            Err(_) => false,
        }
    }

    /// Find the connection an inbound packet belongs to.
    ///
    /// Looks at `dst_port` first and falls back to the shared "any" port.
    /// Within a port, sockets are tried highest priority first: a connected
    /// socket takes the packet if its peer matches, a listening socket takes
    /// it through a child for the sender.
    pub fn resolve_inbound(
        &self,
        dst_port: u8,
        src_addr: Address,
        src_port: u8,
    ) -> Result<Option<ConnHandle>> {
        let candidates = [dst_port, PORT_ANY_SLOT];
        let slots_to_try = if dst_port <= PORT_MAX {
            &candidates[..]
        } else {
            &candidates[1..]
        };

        for &slot_no in slots_to_try {
            for member in self.ports.sockets(slot_no)? {
                let listening = {
                    let slots = self.lock();
                    match slot_ref(&slots, member.conn) {
                        Ok(slot) if slot.state == ConnState::Connected => {
                            if slot.opts.accepts_peer(src_addr, src_port) {
                                return Ok(Some(member.conn));
                            }
                            false
                        }
                        Ok(slot) => slot.state == ConnState::Listen,
                        Err(_) => false,
                    }
                };
                if listening {
                    return self.offer_child(member.conn, src_addr, src_port).map(Some);
                }
            }
        }
        Ok(None)
    }

    /// Set the dispatch priority, reordering the port's socket list.
    pub fn set_priority(&self, handle: ConnHandle, priority: u8) -> Result<()> {
        let mut slots = self.lock();
        let slot = slot_mut(&mut slots, handle)?;
        slot.opts.priority = priority;
        if slot.registered {
            self.ports.reprioritize(slot.opts.lport, handle, priority)?;
        }
        Ok(())
    }

    pub fn set_recv_timeout(&self, handle: ConnHandle, timeout: Option<Duration>) -> Result<()> {
        let mut slots = self.lock();
        slot_mut(&mut slots, handle)?.opts.recv_timeout = timeout;
        Ok(())
    }

    pub fn set_send_timeout(&self, handle: ConnHandle, timeout: Option<Duration>) -> Result<()> {
        let mut slots = self.lock();
        slot_mut(&mut slots, handle)?.opts.send_timeout = timeout;
        Ok(())
    }

    pub fn options(&self, handle: ConnHandle) -> Result<ConnOptions> {
        let slots = self.lock();
        Ok(slot_ref(&slots, handle)?.opts)
    }

    pub fn state(&self, handle: ConnHandle) -> Result<ConnState> {
        let slots = self.lock();
        Ok(slot_ref(&slots, handle)?.state)
    }

    pub fn info(&self, handle: ConnHandle) -> Result<ConnInfo> {
        let slots = self.lock();
        let slot = slot_ref(&slots, handle)?;
        Ok(ConnInfo {
            state: slot.state,
            conn_type: slot.kind.conn_type(),
            options: slot.opts,
            parent: match slot.kind {
                ConnKind::Child { parent } => Some(parent),
                _ => None,
            },
            opened_at: slot.opened_at,
            pending: slot.rx_queue.as_ref().map_or(0, |queue| queue.len()),
        })
    }

    /// The connection's event group.
    pub fn events(&self, handle: ConnHandle) -> Result<Arc<EventGroup>> {
        let slots = self.lock();
        slot_ref(&slots, handle)?.events()
    }

    /// The connection's receive queue.
    pub fn rx_queue(&self, handle: ConnHandle) -> Result<Arc<BoundedQueue<PacketBuffer>>> {
        let slots = self.lock();
        slot_ref(&slots, handle)?.rx_queue()
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    /// Number of slots not free.
    pub fn in_use(&self) -> usize {
        self.lock()
            .iter()
            .filter(|slot| slot.state != ConnState::Free)
            .count()
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("limits", &self.limits)
            .field("monitored", &self.monitor.is_some())
            .finish_non_exhaustive()
    }
}

/// Take an item, clearing `ready` when the queue turns out empty.
///
/// Producers push before they set `ready`, so the second look after the
/// clear either finds the item or a later push sets the bit again.
fn take_ready<T>(queue: &BoundedQueue<T>, events: &EventGroup, ready: EventBits) -> Result<Option<T>> {
    if let Some(item) = queue.take()? {
        return Ok(Some(item));
    }
    events.clear(ready)?;
    queue.take()
}

/// Sleep on `events` until one of `mask` is set or `deadline` passes.
///
/// Bits are left set so every thread waiting on the connection sees them;
/// readiness bits are cleared by [`take_ready`], `CLOSED` by a new bind
/// or connect.
fn wait_for(events: &EventGroup, mask: EventBits, deadline: Deadline) -> Result<()> {
    if deadline.is_immediate() {
        return Err(LspError::QueueEmpty);
    }
    if deadline.expired() {
        return Err(LspError::Timeout);
    }
    events.wait(mask, WaitOptions::any().with_keep_bits(true), deadline.remaining())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortState;
    use std::thread;

    const NOWAIT: Option<Duration> = Some(Duration::ZERO);

    fn pool(max: usize) -> ConnectionPool {
        ConnectionPool::new(&LspConfig::default().with_max_connections(max)).unwrap()
    }

    fn packet(bytes: &[u8]) -> PacketBuffer {
        PacketBuffer::from_slice(0, bytes).unwrap()
    }

    #[test]
    fn test_alloc_until_exhausted_then_reuse() {
        let pool = pool(3);
        let handles: Vec<_> = (0..3).map(|_| pool.alloc().unwrap()).collect();
        assert_eq!(pool.alloc().unwrap_err(), LspError::OutOfMemory);
        assert_eq!(pool.in_use(), 3);

        pool.free(handles[1]).unwrap();
        let reused = pool.alloc().unwrap();
        assert_eq!(reused.index(), handles[1].index());
        assert_ne!(reused, handles[1]);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let pool = pool(1);
        let first = pool.alloc().unwrap();
        pool.free(first).unwrap();
        let second = pool.alloc().unwrap();

        assert_eq!(pool.state(first).unwrap_err(), LspError::StaleHandle);
        assert_eq!(pool.close(first).unwrap_err(), LspError::StaleHandle);
        assert_eq!(pool.state(second).unwrap(), ConnState::Closed);
    }

    #[test]
    fn test_fresh_connection_defaults() {
        let pool = pool(2);
        let conn = pool.alloc().unwrap();
        let info = pool.info(conn).unwrap();
        assert_eq!(info.state, ConnState::Closed);
        assert_eq!(info.conn_type, ConnType::Client);
        assert_eq!(info.options, ConnOptions::default());
        assert_eq!(pool.events(conn).unwrap().bits(), 0);
    }

    #[test]
    fn test_close_is_idempotent_and_flushes() {
        let pool = pool(2);
        let conn = pool.alloc().unwrap();
        pool.connect(conn, 0x0042, 3).unwrap();
        pool.rxq_push(conn, packet(b"one")).unwrap();
        pool.rxq_push(conn, packet(b"two")).unwrap();

        pool.close(conn).unwrap();
        assert!(pool.rx_queue(conn).unwrap().is_empty());
        assert_eq!(pool.state(conn).unwrap(), ConnState::Closed);
        assert_eq!(
            pool.events(conn).unwrap().bits() & (CONN_EV_CLOSED | CONN_EV_INTR),
            CONN_EV_CLOSED | CONN_EV_INTR
        );
        assert!(pool.close(conn).is_ok());
        assert!(pool.ports().sockets(PORT_ANY_SLOT).unwrap().is_empty());
    }

    #[test]
    fn test_rx_queue_backpressure_returns_buffer() {
        let conf = LspConfig::default()
            .with_max_connections(1)
            .with_conn_queue_len(1)
            .with_queue_timeout(Duration::from_millis(10));
        let pool = ConnectionPool::new(&conf).unwrap();
        let conn = pool.alloc().unwrap();
        pool.connect(conn, 0x0042, 3).unwrap();

        pool.rxq_push(conn, packet(b"a")).unwrap();
        let rejected = pool.rxq_push(conn, packet(b"b")).unwrap_err();
        assert_eq!(rejected.error, LspError::Timeout);
        assert_eq!(rejected.item.data(), b"b");

        assert_eq!(pool.rxq_pop(conn, NOWAIT).unwrap().data(), b"a");
        assert_eq!(pool.rxq_pop(conn, NOWAIT).unwrap_err(), LspError::QueueEmpty);
    }

    #[test]
    fn test_bind_and_listen_claim_port() {
        let pool = pool(4);
        let server = pool.alloc().unwrap();
        assert_eq!(pool.listen(server, 2).unwrap_err(), LspError::wrong_state(ConnState::Closed));

        pool.bind(server, 5).unwrap();
        assert_eq!(pool.options(server).unwrap().lport, 5);
        pool.listen(server, 2).unwrap();
        assert_eq!(pool.ports().state(5).unwrap(), PortState::Open);
        assert_eq!(pool.info(server).unwrap().conn_type, ConnType::Server);

        let other = pool.alloc().unwrap();
        assert_eq!(pool.bind(other, 5).unwrap_err(), LspError::PortInUse(5));
        assert_eq!(pool.bind(other, 40).unwrap_err(), LspError::PortInvalid(40));

        pool.free(server).unwrap();
        assert_eq!(pool.ports().state(5).unwrap(), PortState::Closed);
        pool.bind(other, 5).unwrap();
    }

    #[test]
    fn test_offer_and_accept_child() {
        let pool = pool(4);
        let server = pool.alloc().unwrap();
        pool.bind(server, 7).unwrap();
        pool.listen(server, 1).unwrap();

        let child = pool.offer_child(server, 0x0010, 2).unwrap();
        assert_eq!(pool.offer_child(server, 0x0010, 2).unwrap(), child);
        assert_eq!(
            pool.offer_child(server, 0x0011, 2).unwrap_err(),
            LspError::QueueFull
        );
        assert_eq!(pool.in_use(), 2);

        assert_eq!(pool.accept(server, NOWAIT).unwrap(), child);
        let info = pool.info(child).unwrap();
        assert_eq!(info.conn_type, ConnType::Child);
        assert_eq!(info.parent, Some(server));
        assert_eq!(info.options.raddr, 0x0010);
        assert_eq!(info.options.lport, 7);
        assert_eq!(pool.accept(server, NOWAIT).unwrap_err(), LspError::QueueEmpty);
    }

    #[test]
    fn test_free_listener_frees_pending_children() {
        let pool = pool(4);
        let server = pool.alloc().unwrap();
        pool.bind(server, 1).unwrap();
        pool.listen(server, 4).unwrap();
        let first = pool.offer_child(server, 0x0001, 1).unwrap();
        let second = pool.offer_child(server, 0x0002, 1).unwrap();
        assert_eq!(pool.in_use(), 3);

        pool.free(server).unwrap();
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.state(first).unwrap_err(), LspError::StaleHandle);
        assert_eq!(pool.state(second).unwrap_err(), LspError::StaleHandle);
    }

    #[test]
    fn test_accept_wakes_on_offer() {
        let pool = Arc::new(pool(4));
        let server = pool.alloc().unwrap();
        pool.bind(server, 2).unwrap();
        pool.listen(server, 2).unwrap();

        let acceptor = Arc::clone(&pool);
        let handle = thread::spawn(move || acceptor.accept(server, Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(20));
        let child = pool.offer_child(server, 0x0042, 9).unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), child);
    }

    #[test]
    fn test_blocked_receive_wakes_on_close() {
        let pool = Arc::new(pool(2));
        let conn = pool.alloc().unwrap();
        pool.connect(conn, 0x0042, 1).unwrap();

        let receiver = Arc::clone(&pool);
        let handle = thread::spawn(move || receiver.rxq_pop(conn, None));
        thread::sleep(Duration::from_millis(20));
        pool.close(conn).unwrap();

        assert_eq!(
            handle.join().unwrap().unwrap_err(),
            LspError::wrong_state(ConnState::Closed)
        );
    }

    fn wait_for_waiters(events: &EventGroup, count: usize) {
        while events.waiters() < count {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_close_wakes_every_blocked_receiver() {
        let pool = Arc::new(pool(2));
        let conn = pool.alloc().unwrap();
        pool.connect(conn, 0x0042, 1).unwrap();

        let receivers: Vec<_> = (0..2)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.rxq_pop(conn, None))
            })
            .collect();
        wait_for_waiters(&pool.events(conn).unwrap(), 2);
        pool.close(conn).unwrap();

        for receiver in receivers {
            assert_eq!(
                receiver.join().unwrap().unwrap_err(),
                LspError::wrong_state(ConnState::Closed)
            );
        }
    }

    #[test]
    fn test_close_wakes_every_blocked_acceptor() {
        let pool = Arc::new(pool(2));
        let server = pool.alloc().unwrap();
        pool.bind(server, 3).unwrap();
        pool.listen(server, 2).unwrap();

        let acceptors: Vec<_> = (0..2)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.accept(server, None))
            })
            .collect();
        wait_for_waiters(&pool.events(server).unwrap(), 2);
        pool.close(server).unwrap();

        for acceptor in acceptors {
            assert_eq!(
                acceptor.join().unwrap().unwrap_err(),
                LspError::wrong_state(ConnState::Closed)
            );
        }
    }

    #[test]
    fn test_each_blocked_receiver_gets_a_buffer() {
        let pool = Arc::new(pool(2));
        let conn = pool.alloc().unwrap();
        pool.connect(conn, 0x0042, 1).unwrap();

        let receivers: Vec<_> = (0..2)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.rxq_pop(conn, Some(Duration::from_secs(5))))
            })
            .collect();
        wait_for_waiters(&pool.events(conn).unwrap(), 2);
        pool.rxq_push(conn, packet(b"a")).unwrap();
        pool.rxq_push(conn, packet(b"b")).unwrap();

        let mut received: Vec<_> = receivers
            .into_iter()
            .map(|receiver| receiver.join().unwrap().unwrap().data().to_vec())
            .collect();
        received.sort();
        assert_eq!(received, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(pool.events(conn).unwrap().bits() & CONN_EV_CLOSED, 0);
    }

    #[test]
    fn test_accept_skips_child_closed_in_backlog() {
        let pool = pool(4);
        let server = pool.alloc().unwrap();
        pool.bind(server, 5).unwrap();
        pool.listen(server, 4).unwrap();
        let gone = pool.offer_child(server, 0x0001, 1).unwrap();
        let live = pool.offer_child(server, 0x0002, 1).unwrap();

        pool.free(gone).unwrap();
        assert_eq!(pool.accept(server, NOWAIT).unwrap(), live);
        assert_eq!(pool.accept(server, NOWAIT).unwrap_err(), LspError::QueueEmpty);
    }

    #[test]
    fn test_rebound_connection_blocks_again_after_close() {
        let pool = pool(1);
        let conn = pool.alloc().unwrap();
        pool.connect(conn, 0x0042, 1).unwrap();
        pool.close(conn).unwrap();

        pool.bind(conn, 4).unwrap();
        assert_eq!(pool.events(conn).unwrap().bits() & CONN_EV_CLOSED, 0);
        assert_eq!(
            pool.rxq_pop(conn, Some(Duration::from_millis(20))).unwrap_err(),
            LspError::Timeout
        );
    }

    #[test]
    fn test_receive_times_out() {
        let pool = pool(1);
        let conn = pool.alloc().unwrap();
        pool.connect(conn, 0x0042, 1).unwrap();
        assert_eq!(
            pool.rxq_pop(conn, Some(Duration::from_millis(20))).unwrap_err(),
            LspError::Timeout
        );
    }

    #[test]
    fn test_resolve_prefers_priority_and_peer() {
        let pool = pool(8);
        let low = pool.alloc().unwrap();
        pool.bind(low, 4).unwrap();
        pool.set_priority(low, 10).unwrap();
        pool.connect(low, 0x0001, 9).unwrap();

        let high = pool.alloc().unwrap();
        pool.bind(high, 4).unwrap();
        pool.set_priority(high, 200).unwrap();
        pool.connect(high, 0x0002, 9).unwrap();

        assert_eq!(pool.resolve_inbound(4, 0x0001, 9).unwrap(), Some(low));
        assert_eq!(pool.resolve_inbound(4, 0x0002, 9).unwrap(), Some(high));
        assert_eq!(pool.resolve_inbound(4, 0x0003, 9).unwrap(), None);

        pool.set_priority(low, 255).unwrap();
        assert_eq!(pool.ports().first(4).unwrap().unwrap().conn, low);
    }

    #[test]
    fn test_resolve_falls_back_to_any_listener() {
        let pool = pool(4);
        let server = pool.alloc().unwrap();
        pool.bind(server, crate::packet::PORT_ANY).unwrap();
        pool.listen(server, 2).unwrap();

        let child = pool.resolve_inbound(12, 0x0077, 3).unwrap().unwrap();
        assert_eq!(pool.info(child).unwrap().parent, Some(server));
        assert_eq!(pool.resolve_inbound(12, 0x0077, 3).unwrap(), Some(child));

        pool.close(child).unwrap();
        let again = pool.resolve_inbound(12, 0x0077, 3).unwrap().unwrap();
        assert_ne!(again, child);
    }

    #[test]
    fn test_release_on_close_drops_resources() {
        let conf = LspConfig::default()
            .with_max_connections(1)
            .with_release_on_close(true);
        let pool = ConnectionPool::new(&conf).unwrap();
        let conn = pool.alloc().unwrap();
        pool.connect(conn, 0x0042, 1).unwrap();
        pool.close(conn).unwrap();
        assert_eq!(pool.rx_queue(conn).unwrap_err(), LspError::Destroyed);

        pool.free(conn).unwrap();
        let conn = pool.alloc().unwrap();
        assert!(pool.rx_queue(conn).is_ok());
    }

    #[test]
    fn test_monitor_reports_lifecycle() {
        let mut pool = pool(2);
        let monitor = pool.monitor();
        let conn = pool.alloc().unwrap();
        pool.bind(conn, 3).unwrap();
        pool.free(conn).unwrap();

        let events: Vec<_> = monitor.try_iter().collect();
        assert_eq!(
            events,
            vec![
                ConnEvent::Allocated(conn),
                ConnEvent::Bound { conn, port: 3 },
                ConnEvent::Closed(conn),
                ConnEvent::Freed(conn),
            ]
        );
    }
}
