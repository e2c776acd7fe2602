use crate::error::{LspError, Result};
use crate::interface::{Interface, InterfaceId};
use crate::packet::{PacketHeader, HEADER_LEN};
use bytes::Bytes;
use std::fmt;
use tracing::{debug, trace};

/// Headroom used when a buffer is not tied to an interface.
pub const DEFAULT_HEADROOM: usize = HEADER_LEN;

/// A packet buffer with reserved space in front of and behind the payload.
///
/// One allocation holds `[headroom][payload capacity]`. The used span is
/// `data..tail`:
///
/// ```text
/// 0          data            tail              end
/// |-headroom-|=====used======|----tailroom-----|
/// ```
///
/// - [`push`](Self::push) prepends (protocol encapsulation) out of headroom
/// - [`put`](Self::put) appends out of tailroom
/// - [`pull`](Self::pull) consumes from the front, returning space to headroom
///
/// The total size is fixed at allocation; growing past the initial budget
/// fails instead of reallocating, which keeps the memory footprint
/// predictable.
///
/// Ownership is exclusive. Queues move buffers, they never share them.
pub struct PacketBuffer {
    iface: Option<InterfaceId>,
    storage: Box<[u8]>,
    data: usize,
    tail: usize,
}

impl PacketBuffer {
    /// Allocate a buffer with `headroom` bytes reserved in front of room for
    /// `payload_len` bytes.
    pub fn new(headroom: usize, payload_len: usize) -> Result<Self> {
        let total = headroom
            .checked_add(payload_len)
            .ok_or_else(|| LspError::invalid("packet buffer size overflows"))?;
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(total)
            .map_err(|_| {
                debug!("[BUFFER] could not allocate {} bytes", total);
                LspError::OutOfMemory
            })?;
        storage.resize(total, 0);

        Ok(Self {
            iface: None,
            storage: storage.into_boxed_slice(),
            data: headroom,
            tail: headroom,
        })
    }

    /// Allocate a buffer for `iface`, reserving its minimum header length as
    /// headroom, or [`DEFAULT_HEADROOM`] when no interface is given.
    pub fn alloc(iface: Option<&Interface>, payload_len: usize) -> Result<Self> {
        let headroom = iface.map_or(DEFAULT_HEADROOM, Interface::min_header_len);
        let mut buffer = Self::new(headroom, payload_len)?;
        buffer.iface = iface.map(Interface::index);
        Ok(buffer)
    }

    /// Allocate a buffer holding a copy of `bytes` as its used span.
    pub fn from_slice(headroom: usize, bytes: &[u8]) -> Result<Self> {
        let mut buffer = Self::new(headroom, bytes.len())?;
        if let Some(dst) = buffer.put(bytes.len()) {
            dst.copy_from_slice(bytes);
        }
        Ok(buffer)
    }

    /// Append `len` bytes. Returns the newly reserved region, or `None` when
    /// `len` exceeds the tailroom.
    pub fn put(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.tailroom() {
            debug!("[BUFFER] put {} failed, tailroom {}", len, self.tailroom());
            return None;
        }
        let start = self.tail;
        self.tail += len;
        Some(&mut self.storage[start..self.tail])
    }

    /// Prepend `len` bytes. Returns the new front region, or `None` when
    /// `len` exceeds the headroom.
    pub fn push(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.headroom() {
            debug!("[BUFFER] push {} failed, headroom {}", len, self.headroom());
            return None;
        }
        self.data -= len;
        Some(&mut self.storage[self.data..self.data + len])
    }

    /// Consume up to `len` bytes from the front.
    ///
    /// `len` is clipped to the used span. Returns the number of bytes
    /// consumed; they become headroom again.
    pub fn pull(&mut self, len: usize) -> usize {
        let len = len.min(self.len());
        self.data += len;
        len
    }

    /// Prepend an encoded packet header.
    pub fn push_header(&mut self, header: &PacketHeader) -> Result<()> {
        let bytes = header.to_bytes()?;
        let front = self
            .push(HEADER_LEN)
            .ok_or_else(|| LspError::invalid("insufficient headroom for packet header"))?;
        front.copy_from_slice(&bytes);
        Ok(())
    }

    /// Decode the header at the front without consuming it.
    #[must_use]
    pub fn parse_header(&self) -> Option<PacketHeader> {
        PacketHeader::decode(&mut self.data())
    }

    /// Decode and consume the header at the front.
    pub fn pull_header(&mut self) -> Option<PacketHeader> {
        let header = self.parse_header()?;
        self.pull(HEADER_LEN);
        Some(header)
    }

    /// The used span.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.storage[self.data..self.tail]
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.data..self.tail]
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.tail - self.data
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes available for [`push`](Self::push).
    #[inline]
    #[must_use]
    pub const fn headroom(&self) -> usize {
        self.data
    }

    /// Bytes available for [`put`](Self::put).
    #[inline]
    #[must_use]
    pub fn tailroom(&self) -> usize {
        self.storage.len() - self.tail
    }

    /// Total size of the allocation.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Interface the buffer was allocated for or received on.
    #[inline]
    #[must_use]
    pub const fn interface(&self) -> Option<InterfaceId> {
        self.iface
    }

    pub fn set_interface(&mut self, iface: Option<InterfaceId>) {
        self.iface = iface;
    }

    /// Convert the used span into immutable `Bytes` without copying.
    #[must_use]
    pub fn freeze(self) -> Bytes {
        let (start, end) = (self.data, self.tail);
        Bytes::from(self.storage).slice(start..end)
    }

    /// Log the used span as hex at trace level.
    pub fn hexdump(&self) {
        trace!(
            "[BUFFER] {:?} {} bytes: {}",
            self.iface,
            self.len(),
            hex::encode(self.data())
        );
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("iface", &self.iface)
            .field("data", &self.data)
            .field("tail", &self.tail)
            .field("end", &self.storage.len())
            .field("headroom", &self.headroom())
            .field("tailroom", &self.tailroom())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headroom_and_tailroom_budget() {
        let mut buffer = PacketBuffer::new(8, 32).unwrap();
        assert!(buffer.push(4).is_some());
        assert_eq!(buffer.headroom(), 4);
        assert!(buffer.push(5).is_none());
        assert!(buffer.put(32).is_some());
        assert!(buffer.put(1).is_none());
        assert_eq!(buffer.tailroom(), 0);
        assert_eq!(buffer.len(), 36);
    }

    #[test]
    fn test_put_advances_tail_exactly() {
        let mut buffer = PacketBuffer::new(0, 10).unwrap();
        buffer.put(3).unwrap().copy_from_slice(b"abc");
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.tailroom(), 7);
        assert_eq!(buffer.data(), b"abc");
    }

    #[test]
    fn test_push_then_pull_restores_headroom() {
        let mut buffer = PacketBuffer::from_slice(8, b"payload").unwrap();
        let before = (buffer.headroom(), buffer.data().to_vec());
        for len in 0..=8 {
            buffer.push(len).unwrap();
            assert_eq!(buffer.pull(len), len);
            assert_eq!((buffer.headroom(), buffer.data().to_vec()), before);
        }
    }

    #[test]
    fn test_pull_is_clipped_to_used_span() {
        let mut buffer = PacketBuffer::from_slice(2, b"xyz").unwrap();
        assert_eq!(buffer.pull(10), 3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.headroom(), 5);
        assert_eq!(buffer.tailroom(), 0);
    }

    #[test]
    fn test_header_push_and_pull() {
        let header = PacketHeader {
            dst_addr: 0x0002,
            src_addr: 0x0001,
            plen: 2,
            src_port: 3,
            dst_port: 4,
            ..Default::default()
        };
        let mut buffer = PacketBuffer::from_slice(HEADER_LEN, b"hi").unwrap();
        buffer.push_header(&header).unwrap();
        assert_eq!(buffer.len(), HEADER_LEN + 2);
        assert_eq!(buffer.parse_header(), Some(header));
        assert_eq!(buffer.pull_header(), Some(header));
        assert_eq!(buffer.data(), b"hi");

        let mut tight = PacketBuffer::from_slice(2, b"hi").unwrap();
        assert!(tight.push_header(&header).is_err());
    }

    #[test]
    fn test_freeze_keeps_used_span() {
        let mut buffer = PacketBuffer::from_slice(4, b"frame").unwrap();
        buffer.pull(1);
        assert_eq!(buffer.freeze(), Bytes::from_static(b"rame"));
    }
}
