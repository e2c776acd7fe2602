//! Port table.
//!
//! `PORT_MAX + 2` entries: one per wire port plus a shared overflow slot for
//! sockets bound to [`PORT_ANY`]. Each entry keeps its sockets ordered by
//! descending priority; sockets of equal priority keep insertion order.

use crate::conn::ConnHandle;
use crate::error::{LspError, Result};
use crate::packet::{PORT_ANY, PORT_MAX};
use crate::sync::mutex::TimedMutex;
use smallvec::SmallVec;
use std::time::Duration;
use tracing::{debug, trace};

/// Slot index of the shared "any" port.
pub const PORT_ANY_SLOT: u8 = PORT_MAX + 1;

/// Number of entries in the table.
pub const PORT_SLOTS: usize = PORT_MAX as usize + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortState {
    #[default]
    Closed,
    Open,
}

/// A socket registered on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMember {
    pub conn: ConnHandle,
    pub priority: u8,
    pub listening: bool,
}

/// Sockets of one port, highest priority first.
pub type PortSockets = SmallVec<[PortMember; 4]>;

#[derive(Debug, Default)]
struct Port {
    state: PortState,
    sockets: PortSockets,
}

impl Port {
    fn insert(&mut self, member: PortMember) {
        let at = self
            .sockets
            .iter()
            .position(|existing| existing.priority < member.priority)
            .unwrap_or(self.sockets.len());
        self.sockets.insert(at, member);
    }
}

/// Map a user-facing port number to its table slot.
pub fn slot_for(port: u8) -> Result<u8> {
    match port {
        PORT_ANY => Ok(PORT_ANY_SLOT),
        port if port <= PORT_MAX => Ok(port),
        port => Err(LspError::PortInvalid(port)),
    }
}

/// Port number carried on the wire for a slot.
///
/// The shared slot has no wire number of its own and sends as port 0.
#[inline]
#[must_use]
pub const fn wire_port(slot: u8) -> u8 {
    if slot <= PORT_MAX {
        slot
    } else {
        0
    }
}

/// The process-wide port table.
#[derive(Debug)]
pub struct PortTable {
    ports: TimedMutex<Vec<Port>>,
    lock_timeout: Duration,
}

impl PortTable {
    pub fn new(lock_timeout: Duration) -> Result<Self> {
        let mut ports = Vec::new();
        ports
            .try_reserve_exact(PORT_SLOTS)
            .map_err(|_| LspError::OutOfMemory)?;
        ports.resize_with(PORT_SLOTS, Port::default);
        debug!("[PORT] allocated {} port slots", PORT_SLOTS);
        Ok(Self {
            ports: TimedMutex::new(ports),
            lock_timeout,
        })
    }

    /// Check that `port` may be bound. Returns its slot.
    ///
    /// Named ports are exclusive once a listener opened them; the shared
    /// slot never is.
    pub fn check_bind(&self, port: u8) -> Result<u8> {
        let slot = slot_for(port)?;
        let ports = self.ports.lock(Some(self.lock_timeout))?;
        if slot != PORT_ANY_SLOT && ports[usize::from(slot)].state == PortState::Open {
            debug!("[PORT] port {} is already in use", slot);
            return Err(LspError::PortInUse(slot));
        }
        Ok(slot)
    }

    /// Register a listener on `slot` and open the port.
    ///
    /// Fails with [`LspError::PortInUse`] if another listener opened the
    /// named port since [`check_bind`](Self::check_bind).
    pub fn listen(&self, slot: u8, conn: ConnHandle, priority: u8) -> Result<()> {
        let index = slot_index(slot)?;
        let mut ports = self.ports.lock(Some(self.lock_timeout))?;
        let port = &mut ports[index];
        if slot != PORT_ANY_SLOT && port.state == PortState::Open {
            return Err(LspError::PortInUse(slot));
        }
        port.insert(PortMember {
            conn,
            priority,
            listening: true,
        });
        port.state = PortState::Open;
        debug!("[PORT] {} listening on port {}", conn, slot);
        Ok(())
    }

    /// Register a non-listening socket on `slot`.
    pub fn insert(&self, slot: u8, conn: ConnHandle, priority: u8) -> Result<()> {
        let index = slot_index(slot)?;
        let mut ports = self.ports.lock(Some(self.lock_timeout))?;
        ports[index].insert(PortMember {
            conn,
            priority,
            listening: false,
        });
        trace!("[PORT] {} registered on port {}", conn, slot);
        Ok(())
    }

    /// Remove `conn` from `slot`. Returns whether it was registered.
    ///
    /// The port closes once no listener remains on it.
    pub fn remove(&self, slot: u8, conn: ConnHandle) -> Result<bool> {
        let index = slot_index(slot)?;
        let mut ports = self.ports.lock(Some(self.lock_timeout))?;
        let port = &mut ports[index];
        let Some(at) = port.sockets.iter().position(|member| member.conn == conn) else {
            return Ok(false);
        };
        port.sockets.remove(at);
        if !port.sockets.iter().any(|member| member.listening) {
            port.state = PortState::Closed;
        }
        trace!("[PORT] {} removed from port {}", conn, slot);
        Ok(true)
    }

    /// Change the priority of a registered socket, keeping the order.
    pub fn reprioritize(&self, slot: u8, conn: ConnHandle, priority: u8) -> Result<bool> {
        let index = slot_index(slot)?;
        let mut ports = self.ports.lock(Some(self.lock_timeout))?;
        let port = &mut ports[index];
        let Some(at) = port.sockets.iter().position(|member| member.conn == conn) else {
            return Ok(false);
        };
        let mut member = port.sockets.remove(at);
        member.priority = priority;
        port.insert(member);
        Ok(true)
    }

    /// Highest-priority socket on `slot`.
    pub fn first(&self, slot: u8) -> Result<Option<PortMember>> {
        let index = slot_index(slot)?;
        let ports = self.ports.lock(Some(self.lock_timeout))?;
        Ok(ports[index].sockets.first().copied())
    }

    /// Snapshot of the sockets on `slot`, highest priority first.
    pub fn sockets(&self, slot: u8) -> Result<PortSockets> {
        let index = slot_index(slot)?;
        let ports = self.ports.lock(Some(self.lock_timeout))?;
        Ok(ports[index].sockets.clone())
    }

    pub fn state(&self, slot: u8) -> Result<PortState> {
        let index = slot_index(slot)?;
        let ports = self.ports.lock(Some(self.lock_timeout))?;
        Ok(ports[index].state)
    }
}

fn slot_index(slot: u8) -> Result<usize> {
    if slot > PORT_ANY_SLOT {
        return Err(LspError::PortInvalid(slot));
    }
    Ok(usize::from(slot))
}
