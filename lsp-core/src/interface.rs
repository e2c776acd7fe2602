//! Link-layer interfaces.
//!
//! An [`Interface`] pairs a [`LinkDriver`] (open/close/transmit callbacks
//! supplied by the embedding application) with a transmit and a receive
//! queue of [`PacketBuffer`]s and a set of counters. The [`InterfaceList`]
//! is the registry the stack looks interfaces up in.
//!
//! Interfaces are registered before the stack starts; hot-plugging is not
//! supported.

use crate::buffer::PacketBuffer;
use crate::error::{LspError, Rejected, Result};
use crate::packet::Address;
use crate::sync::queue::BoundedQueue;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Index assigned to an interface on registration.
pub type InterfaceId = usize;

/// Longest accepted interface name.
pub const IFNAME_MAX: usize = 31;

/// Interface is administratively up.
pub const IF_FLAG_UP: u32 = 1 << 0;

/// Driver callbacks for one kind of link.
pub trait LinkDriver: Send + Sync {
    /// Bring the link up.
    fn open(&self, _iface: &Interface) -> Result<()> {
        Ok(())
    }

    /// Take the link down.
    fn close(&self, _iface: &Interface) -> Result<()> {
        Ok(())
    }

    /// Put one encoded frame on the wire.
    fn transmit(&self, iface: &Interface, frame: &[u8]) -> Result<()>;
}

/// Snapshot of an interface's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceStats {
    pub tx_count: u32,
    pub rx_count: u32,
    pub tx_bytes: u32,
    pub rx_bytes: u32,
    pub dropped: u32,
    pub tx_error: u32,
    pub rx_error: u32,
}

#[derive(Debug, Default)]
struct Counters {
    tx_count: AtomicU32,
    rx_count: AtomicU32,
    tx_bytes: AtomicU32,
    rx_bytes: AtomicU32,
    dropped: AtomicU32,
    tx_error: AtomicU32,
    rx_error: AtomicU32,
}

#[inline]
fn bump(counter: &AtomicU32, by: usize) {
    // Counters wrap like their u32 C counterparts.
    counter.fetch_add(by as u32, Ordering::Relaxed);
}

/// Builder for [`Interface`].
pub struct InterfaceBuilder {
    name: String,
    driver: Box<dyn LinkDriver>,
    mtu: u32,
    min_header_len: usize,
    address: Address,
    tx_queue_len: usize,
    rx_queue_len: usize,
}

impl InterfaceBuilder {
    #[must_use]
    pub const fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Headroom reserved in buffers allocated for this interface.
    #[must_use]
    pub const fn with_min_header_len(mut self, len: usize) -> Self {
        self.min_header_len = len;
        self
    }

    /// Device address the interface answers to.
    #[must_use]
    pub const fn with_address(mut self, address: Address) -> Self {
        self.address = address;
        self
    }

    #[must_use]
    pub const fn with_queue_lens(mut self, tx: usize, rx: usize) -> Self {
        self.tx_queue_len = tx;
        self.rx_queue_len = rx;
        self
    }

    pub fn build(self) -> Result<Interface> {
        if self.name.is_empty() || self.name.len() > IFNAME_MAX {
            return Err(LspError::invalid(format!(
                "interface name must be 1-{} bytes, got {:?}",
                IFNAME_MAX, self.name
            )));
        }
        let tx_queue = BoundedQueue::new(self.tx_queue_len)?;
        let rx_queue = BoundedQueue::new(self.rx_queue_len)?;
        Ok(Interface {
            index: usize::MAX,
            name: self.name,
            flags: AtomicU32::new(0),
            mtu: self.mtu,
            min_header_len: self.min_header_len,
            address: self.address,
            driver: self.driver,
            tx_queue,
            rx_queue,
            counters: Counters::default(),
        })
    }
}

/// A link-layer interface.
pub struct Interface {
    index: InterfaceId,
    name: String,
    flags: AtomicU32,
    mtu: u32,
    min_header_len: usize,
    address: Address,
    driver: Box<dyn LinkDriver>,
    tx_queue: BoundedQueue<PacketBuffer>,
    rx_queue: BoundedQueue<PacketBuffer>,
    counters: Counters,
}

impl Interface {
    pub fn builder(name: impl Into<String>, driver: impl LinkDriver + 'static) -> InterfaceBuilder {
        InterfaceBuilder {
            name: name.into(),
            driver: Box::new(driver),
            mtu: 1024,
            min_header_len: crate::packet::HEADER_LEN,
            address: crate::packet::ADDR_ANY,
            tx_queue_len: 8,
            rx_queue_len: 8,
        }
    }

    #[inline]
    #[must_use]
    pub const fn index(&self) -> InterfaceId {
        self.index
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub const fn mtu(&self) -> u32 {
        self.mtu
    }

    #[inline]
    #[must_use]
    pub const fn min_header_len(&self) -> usize {
        self.min_header_len
    }

    #[inline]
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn is_up(&self) -> bool {
        self.flags() & IF_FLAG_UP != 0
    }

    /// Bring the interface up through its driver.
    pub fn open(&self) -> Result<()> {
        self.driver.open(self)?;
        self.flags.fetch_or(IF_FLAG_UP, Ordering::AcqRel);
        debug!("[IFACE] {} up", self.name);
        Ok(())
    }

    /// Take the interface down and drop everything still queued.
    pub fn close(&self) -> Result<()> {
        self.flags.fetch_and(!IF_FLAG_UP, Ordering::AcqRel);
        let pending = self.tx_queue.drain().len() + self.rx_queue.drain().len();
        if pending > 0 {
            debug!("[IFACE] {} dropped {} queued buffers on close", self.name, pending);
        }
        self.driver.close(self)
    }

    /// Queue a buffer for transmission.
    pub fn enqueue_tx(
        &self,
        buffer: PacketBuffer,
        timeout: Option<Duration>,
    ) -> std::result::Result<(), Rejected<PacketBuffer>> {
        self.tx_queue.push(buffer, timeout)
    }

    /// Hand every queued transmit buffer to the driver.
    ///
    /// Returns the number of frames transmitted successfully.
    pub fn flush_tx(&self) -> usize {
        let mut sent = 0;
        while let Ok(Some(buffer)) = self.tx_queue.take() {
            match self.driver.transmit(self, buffer.data()) {
                Ok(()) => {
                    bump(&self.counters.tx_count, 1);
                    bump(&self.counters.tx_bytes, buffer.len());
                    sent += 1;
                }
                Err(e) => {
                    warn!("[IFACE] {} transmit failed: {}", self.name, e);
                    bump(&self.counters.tx_error, 1);
                }
            }
        }
        trace!("[IFACE] {} flushed {} frames", self.name, sent);
        sent
    }

    /// Queue a received frame for the core.
    ///
    /// A frame that does not fit is counted as dropped.
    pub fn enqueue_rx(&self, buffer: PacketBuffer, timeout: Option<Duration>) -> Result<()> {
        let len = buffer.len();
        match self.rx_queue.push(buffer, timeout) {
            Ok(()) => {
                bump(&self.counters.rx_count, 1);
                bump(&self.counters.rx_bytes, len);
                Ok(())
            }
            Err(rejected) => {
                self.record_drop();
                Err(rejected.into_error())
            }
        }
    }

    /// Take the next received frame.
    pub fn pop_rx(&self, timeout: Option<Duration>) -> Result<PacketBuffer> {
        self.rx_queue.pop(timeout)
    }

    /// Take the next received frame if one is queued, waiting only for the
    /// queue lock.
    pub fn take_rx(&self) -> Result<Option<PacketBuffer>> {
        self.rx_queue.take()
    }

    pub fn record_drop(&self) {
        bump(&self.counters.dropped, 1);
    }

    pub fn record_rx_error(&self) {
        bump(&self.counters.rx_error, 1);
    }

    #[must_use]
    pub fn stats(&self) -> InterfaceStats {
        let c = &self.counters;
        InterfaceStats {
            tx_count: c.tx_count.load(Ordering::Relaxed),
            rx_count: c.rx_count.load(Ordering::Relaxed),
            tx_bytes: c.tx_bytes.load(Ordering::Relaxed),
            rx_bytes: c.rx_bytes.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            tx_error: c.tx_error.load(Ordering::Relaxed),
            rx_error: c.rx_error.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("address", &format_args!("{:#06x}", self.address))
            .field("up", &self.is_up())
            .finish_non_exhaustive()
    }
}

/// Registry of interfaces, keyed by case-insensitive name.
#[derive(Debug, Default)]
pub struct InterfaceList {
    by_name: DashMap<String, Arc<Interface>>,
    next_index: AtomicUsize,
}

impl InterfaceList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interface and assign its index.
    pub fn register(&self, mut iface: Interface) -> Result<Arc<Interface>> {
        let key = iface.name.to_ascii_lowercase();
        let Entry::Vacant(slot) = self.by_name.entry(key) else {
            return Err(LspError::invalid(format!(
                "interface '{}' is already registered",
                iface.name
            )));
        };
        iface.index = self.next_index.fetch_add(1, Ordering::AcqRel);
        let iface = Arc::new(iface);
        slot.insert(Arc::clone(&iface));
        debug!("[IFACE] registered {} as index {}", iface.name, iface.index);
        Ok(iface)
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Interface>> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn by_address(&self, address: Address) -> Option<Arc<Interface>> {
        self.by_name
            .iter()
            .find(|entry| entry.address == address)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn by_index(&self, index: InterfaceId) -> Option<Arc<Interface>> {
        self.by_name
            .iter()
            .find(|entry| entry.index == index)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every registered interface, ordered by index.
    pub fn all(&self) -> Vec<Arc<Interface>> {
        let mut all: Vec<_> = self.by_name.iter().map(|e| Arc::clone(e.value())).collect();
        all.sort_by_key(|iface| iface.index);
        all
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Capture {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl LinkDriver for Capture {
        fn transmit(&self, _iface: &Interface, frame: &[u8]) -> Result<()> {
            self.frames.lock().push(frame.to_vec());
            Ok(())
        }
    }

    struct Broken;

    impl LinkDriver for Broken {
        fn transmit(&self, _iface: &Interface, _frame: &[u8]) -> Result<()> {
            Err(LspError::invalid("link down"))
        }
    }

    #[test]
    fn test_builder_rejects_bad_names() {
        assert!(Interface::builder("", Broken).build().is_err());
        assert!(Interface::builder("x".repeat(IFNAME_MAX + 1), Broken).build().is_err());
    }

    #[test]
    fn test_flush_tx_counts_frames() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let driver = Capture {
            frames: Arc::clone(&frames),
        };
        let iface = Interface::builder("uart0", driver).build().unwrap();
        iface.open().unwrap();
        assert!(iface.is_up());

        let mut buffer = PacketBuffer::alloc(Some(&iface), 4).unwrap();
        buffer.put(4).unwrap().copy_from_slice(b"ping");
        iface.enqueue_tx(buffer, Some(Duration::ZERO)).unwrap();

        assert_eq!(iface.flush_tx(), 1);
        assert_eq!(frames.lock().as_slice(), &[b"ping".to_vec()]);
        let stats = iface.stats();
        assert_eq!(stats.tx_count, 1);
        assert_eq!(stats.tx_bytes, 4);
    }

    #[test]
    fn test_transmit_errors_are_counted() {
        let iface = Interface::builder("bad0", Broken).build().unwrap();
        let buffer = PacketBuffer::alloc(Some(&iface), 1).unwrap();
        iface.enqueue_tx(buffer, None).unwrap();
        assert_eq!(iface.flush_tx(), 0);
        assert_eq!(iface.stats().tx_error, 1);
    }

    #[test]
    fn test_rx_overflow_counts_drop() {
        let iface = Interface::builder("spi0", Broken)
            .with_queue_lens(1, 1)
            .build()
            .unwrap();
        iface.enqueue_rx(PacketBuffer::new(0, 1).unwrap(), None).unwrap();
        let err = iface
            .enqueue_rx(PacketBuffer::new(0, 1).unwrap(), Some(Duration::ZERO))
            .unwrap_err();
        assert_eq!(err, LspError::QueueFull);
        assert_eq!(iface.stats().dropped, 1);
        assert_eq!(iface.stats().rx_count, 1);
    }

    #[test]
    fn test_registry_lookups() {
        let list = InterfaceList::new();
        let first = list
            .register(Interface::builder("Radio0", Broken).with_address(0x10).build().unwrap())
            .unwrap();
        let second = list
            .register(Interface::builder("radio1", Broken).with_address(0x20).build().unwrap())
            .unwrap();
        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 1);

        assert_eq!(list.by_name("RADIO0").unwrap().index(), 0);
        assert_eq!(list.by_address(0x20).unwrap().name(), "radio1");
        assert_eq!(list.by_index(1).unwrap().address(), 0x20);
        assert!(list
            .register(Interface::builder("radio0", Broken).build().unwrap())
            .is_err());
        assert_eq!(list.all().len(), 2);
    }

    #[test]
    fn test_concurrent_same_name_registers_once() {
        let list = Arc::new(InterfaceList::new());
        let start = Arc::new(std::sync::Barrier::new(8));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let list = Arc::clone(&list);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    let name = if i % 2 == 0 { "Link0" } else { "link0" };
                    let iface = Interface::builder(name, Broken).build().unwrap();
                    start.wait();
                    list.register(iface).is_ok()
                })
            })
            .collect();

        let admitted = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(list.len(), 1);
        assert_eq!(list.by_name("LINK0").unwrap().index(), 0);

        let next = list
            .register(Interface::builder("link1", Broken).build().unwrap())
            .unwrap();
        assert_eq!(next.index(), 1);
    }

    #[test]
    fn test_take_rx_drains_without_waiting() {
        let iface = Interface::builder("can0", Broken).build().unwrap();
        assert!(iface.take_rx().unwrap().is_none());
        iface
            .enqueue_rx(PacketBuffer::from_slice(0, b"rx").unwrap(), None)
            .unwrap();
        assert_eq!(iface.take_rx().unwrap().unwrap().data(), b"rx");
        assert!(iface.take_rx().unwrap().is_none());
    }
}
