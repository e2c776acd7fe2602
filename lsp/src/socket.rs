//! Socket-style API.
//!
//! Thin layer over the connection pool that adds addressing, header
//! encoding and the transmit path. Every call takes the [`SocketHandle`]
//! returned by [`Stack::socket`].

use crate::core_task::CoreEvent;
use crate::stack::Stack;
use bytes::Bytes;
use lsp_core::conn::{ConnHandle, ConnState, CONN_EV_SEND};
use lsp_core::error::{LspError, Rejected, Result};
use lsp_core::packet::{Address, PacketHeader, HEADER_LEN, PLEN_MAX, PORT_MAX};
use lsp_core::port::wire_port;
use lsp_core::sync::egroup::{EventBits, WaitOptions};
use std::time::Duration;
use tracing::{debug, trace};

/// Handle returned by [`Stack::socket`].
pub type SocketHandle = ConnHandle;

/// Per-socket options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOpt {
    /// Receive/accept timeout. `None` blocks forever.
    RecvTimeout(Option<Duration>),
    /// Transmit queue timeout. `None` blocks forever.
    SendTimeout(Option<Duration>),
    /// Delivery priority among sockets sharing a port (higher first).
    Priority(u8),
}

/// Names for [`Stack::getsockopt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOptName {
    RecvTimeout,
    SendTimeout,
    Priority,
}

impl Stack {
    /// Allocate a socket.
    pub fn socket(&self) -> Result<SocketHandle> {
        self.pool.alloc()
    }

    /// Bind `sock` to a local port.
    pub fn bind(&self, sock: SocketHandle, port: u8) -> Result<()> {
        self.pool.bind(sock, port)
    }

    /// Accept inbound peers on a bound socket.
    pub fn listen(&self, sock: SocketHandle, backlog: usize) -> Result<()> {
        self.pool.listen(sock, backlog)
    }

    /// Take the next accepted child.
    pub fn accept(&self, sock: SocketHandle, timeout: Option<Duration>) -> Result<SocketHandle> {
        self.pool.accept(sock, timeout)
    }

    /// Fix the remote peer of `sock`.
    ///
    /// The peer must be this system or reachable through the routing table.
    pub fn connect(&self, sock: SocketHandle, addr: Address, port: u8) -> Result<()> {
        if addr != self.address() && self.routes().find(addr)?.is_none() {
            return Err(LspError::NoRoute(addr));
        }
        self.pool.connect(sock, addr, port)
    }

    /// Send to the connected peer.
    pub fn send(&self, sock: SocketHandle, data: &[u8]) -> Result<usize> {
        let info = self.pool.info(sock)?;
        if info.state != ConnState::Connected {
            return Err(LspError::wrong_state(info.state));
        }
        self.sendto(sock, data, info.options.raddr, info.options.rport)
    }

    /// Send one packet to `addr:port`.
    ///
    /// Packets for this system's own address are delivered without touching
    /// any interface. Returns the number of payload bytes queued.
    pub fn sendto(&self, sock: SocketHandle, data: &[u8], addr: Address, port: u8) -> Result<usize> {
        if data.len() > usize::from(PLEN_MAX) {
            return Err(LspError::invalid(format!(
                "payload of {} bytes exceeds {}",
                data.len(),
                PLEN_MAX
            )));
        }
        if port > PORT_MAX {
            return Err(LspError::PortInvalid(port));
        }
        let opts = self.pool.options(sock)?;
        let header = PacketHeader {
            dst_addr: addr,
            src_addr: self.address(),
            plen: data.len() as u16,
            src_port: wire_port(opts.lport),
            dst_port: port,
            ..Default::default()
        };

        if addr == self.address() {
            let mut buffer = self.alloc_buffer(None, data.len())?;
            if let Some(payload) = buffer.put(data.len()) {
                payload.copy_from_slice(data);
            }
            buffer.push_header(&header)?;
            trace!("[SOCKET] {} loopback to port {}", sock, port);
            self.dispatch(None, buffer);
        } else {
            let iface = self.routes().find(addr)?.ok_or(LspError::NoRoute(addr))?;
            let frame_len = HEADER_LEN + data.len();
            if frame_len > iface.mtu() as usize {
                return Err(LspError::invalid(format!(
                    "frame of {} bytes exceeds mtu {} of {}",
                    frame_len,
                    iface.mtu(),
                    iface.name()
                )));
            }
            let mut buffer = self.alloc_buffer(Some(&iface), data.len())?;
            if let Some(payload) = buffer.put(data.len()) {
                payload.copy_from_slice(data);
            }
            buffer.push_header(&header)?;
            iface
                .enqueue_tx(buffer, opts.send_timeout)
                .map_err(Rejected::into_error)?;
            if let Err(e) = self.post(CoreEvent::NetTx(iface.index())) {
                debug!("[SOCKET] tx flush of {} deferred: {}", iface.name(), e);
            }
        }

        self.pool.events(sock)?.set(CONN_EV_SEND)?;
        Ok(data.len())
    }

    /// Receive from the connected peer. See [`recvfrom`](Self::recvfrom).
    pub fn recv(&self, sock: SocketHandle, buf: &mut [u8]) -> Result<usize> {
        self.recvfrom(sock, buf).map(|(n, _, _)| n)
    }

    /// Receive one packet into `buf`, waiting up to the receive timeout.
    ///
    /// A payload longer than `buf` is truncated. Returns the number of bytes
    /// copied with the sender's address and port.
    pub fn recvfrom(&self, sock: SocketHandle, buf: &mut [u8]) -> Result<(usize, Address, u8)> {
        let (payload, addr, port) = self.recv_packet(sock)?;
        let len = payload.len().min(buf.len());
        buf[..len].copy_from_slice(&payload[..len]);
        Ok((len, addr, port))
    }

    /// Receive one packet without copying its payload.
    pub fn recv_packet(&self, sock: SocketHandle) -> Result<(Bytes, Address, u8)> {
        let timeout = self.pool.options(sock)?.recv_timeout;
        let mut buffer = self.pool.rxq_pop(sock, timeout)?;
        let header = buffer
            .pull_header()
            .ok_or_else(|| LspError::invalid("queued packet without header"))?;
        let mut payload = buffer.freeze();
        payload.truncate(usize::from(header.plen));
        Ok((payload, header.src_addr, header.src_port))
    }

    /// Close and release a socket.
    pub fn close(&self, sock: SocketHandle) -> Result<()> {
        self.pool.free(sock)
    }

    pub fn setsockopt(&self, sock: SocketHandle, opt: SockOpt) -> Result<()> {
        match opt {
            SockOpt::RecvTimeout(timeout) => self.pool.set_recv_timeout(sock, timeout),
            SockOpt::SendTimeout(timeout) => self.pool.set_send_timeout(sock, timeout),
            SockOpt::Priority(priority) => self.pool.set_priority(sock, priority),
        }
    }

    pub fn getsockopt(&self, sock: SocketHandle, name: SockOptName) -> Result<SockOpt> {
        let opts = self.pool.options(sock)?;
        Ok(match name {
            SockOptName::RecvTimeout => SockOpt::RecvTimeout(opts.recv_timeout),
            SockOptName::SendTimeout => SockOpt::SendTimeout(opts.send_timeout),
            SockOptName::Priority => SockOpt::Priority(opts.priority),
        })
    }

    /// Wait for connection events on `sock`.
    ///
    /// Returns the event bits observed; check them with
    /// [`WaitOptions::satisfied_by`] since a timeout also returns the
    /// current bits. Polling leaves the bits set, so it never takes a wakeup
    /// away from a thread blocked in [`recv`](Self::recv) or
    /// [`accept`](Self::accept).
    pub fn poll(
        &self,
        sock: SocketHandle,
        mask: EventBits,
        wait_all: bool,
        timeout: Option<Duration>,
    ) -> Result<EventBits> {
        let opts = WaitOptions {
            wait_all,
            clear_on_exit: false,
            keep_bits: true,
        };
        self.pool.events(sock)?.wait(mask, opts, timeout)
    }
}
