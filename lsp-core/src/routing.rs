//! Routing table.
//!
//! One route per destination address, each pointing at the interface the
//! destination was discovered on. A later discovery through a faster link
//! (lower `link_speed` metric) replaces the interface in place. Routing is
//! single-hop only.

use crate::error::Result;
use crate::interface::Interface;
use crate::packet::Address;
use crate::sync::mutex::TimedMutex;
use hashbrown::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Metric used when the link speed is not known.
pub const LINK_SPEED_UNKNOWN: u32 = u32::MAX;

/// A route towards one destination address.
#[derive(Debug, Clone)]
pub struct Route {
    pub iface: Arc<Interface>,
    pub addr: Address,
    /// Lower is better.
    pub link_speed: u32,
    /// When the route was last added or replaced.
    pub timestamp: Instant,
}

/// Destination address to interface table.
#[derive(Debug)]
pub struct RouteTable {
    routes: TimedMutex<HashMap<Address, Route>>,
    lock_timeout: Duration,
}

impl RouteTable {
    #[must_use]
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            routes: TimedMutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    /// Add a route to `addr` through `iface`.
    ///
    /// An existing route is replaced only when `link_speed` is strictly
    /// lower than its metric. Returns whether the table changed.
    pub fn add(&self, iface: &Arc<Interface>, addr: Address, link_speed: u32) -> Result<bool> {
        let mut routes = self.routes.lock(Some(self.lock_timeout))?;
        match routes.get_mut(&addr) {
            Some(route) if link_speed < route.link_speed => {
                debug!(
                    "[ROUTE] route for {:04X} replaced via {} ({} -> {})",
                    addr,
                    iface.name(),
                    route.link_speed,
                    link_speed
                );
                route.iface = Arc::clone(iface);
                route.link_speed = link_speed;
                route.timestamp = Instant::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                routes.insert(
                    addr,
                    Route {
                        iface: Arc::clone(iface),
                        addr,
                        link_speed,
                        timestamp: Instant::now(),
                    },
                );
                debug!("[ROUTE] route for {:04X} added via {}", addr, iface.name());
                Ok(true)
            }
        }
    }

    /// Interface to reach `addr` through.
    pub fn find(&self, addr: Address) -> Result<Option<Arc<Interface>>> {
        let routes = self.routes.lock(Some(self.lock_timeout))?;
        Ok(routes.get(&addr).map(|route| Arc::clone(&route.iface)))
    }

    /// Copy of the route to `addr`.
    pub fn get(&self, addr: Address) -> Result<Option<Route>> {
        let routes = self.routes.lock(Some(self.lock_timeout))?;
        Ok(routes.get(&addr).cloned())
    }

    /// Drop every route through `iface`. Returns how many were removed.
    pub fn remove_interface(&self, iface: &Interface) -> Result<usize> {
        let mut routes = self.routes.lock(Some(self.lock_timeout))?;
        let before = routes.len();
        routes.retain(|_, route| route.iface.index() != iface.index());
        let removed = before - routes.len();
        if removed > 0 {
            debug!("[ROUTE] removed {} routes via {}", removed, iface.name());
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.routes.lock(None).map_or(0, |routes| routes.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{InterfaceList, LinkDriver};

    struct Null;

    impl LinkDriver for Null {
        fn transmit(&self, _iface: &Interface, _frame: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn two_links() -> (Arc<Interface>, Arc<Interface>) {
        let list = InterfaceList::new();
        let slow = list.register(Interface::builder("slow0", Null).build().unwrap()).unwrap();
        let fast = list.register(Interface::builder("fast0", Null).build().unwrap()).unwrap();
        (slow, fast)
    }

    #[test]
    fn test_better_link_replaces_route() {
        let (slow, fast) = two_links();
        let table = RouteTable::new(Duration::from_millis(100));

        assert!(table.add(&slow, 0x0042, 9600).unwrap());
        assert!(table.add(&fast, 0x0042, 115_200 / 100).unwrap());
        assert_eq!(table.find(0x0042).unwrap().unwrap().name(), "fast0");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_worse_or_equal_link_keeps_route() {
        let (slow, fast) = two_links();
        let table = RouteTable::new(Duration::from_millis(100));

        table.add(&fast, 0x0042, 10).unwrap();
        assert!(!table.add(&slow, 0x0042, 10).unwrap());
        assert!(!table.add(&slow, 0x0042, LINK_SPEED_UNKNOWN).unwrap());
        assert_eq!(table.get(0x0042).unwrap().unwrap().link_speed, 10);
        assert_eq!(table.find(0x0042).unwrap().unwrap().name(), "fast0");
    }

    #[test]
    fn test_remove_interface() {
        let (slow, fast) = two_links();
        let table = RouteTable::new(Duration::from_millis(100));
        table.add(&slow, 0x0001, 5).unwrap();
        table.add(&slow, 0x0002, 5).unwrap();
        table.add(&fast, 0x0003, 5).unwrap();

        assert_eq!(table.remove_interface(&slow).unwrap(), 2);
        assert!(table.find(0x0001).unwrap().is_none());
        assert_eq!(table.len(), 1);
    }
}
