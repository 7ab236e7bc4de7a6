//! IPv4 routing table.
//!
//! A fixed-size table of (network, netmask, gateway, interface) entries
//! searched by longest-prefix match. Entries are scanned in insertion order,
//! and on equal prefix length the first one found wins.

use alloc::vec::Vec;
use spin::RwLock;

use crate::iface::{IfaceId, InterfaceTable};
use crate::ipv4::Ipv4Addr;

/// Maximum number of routes
pub const MAX_ROUTES: usize = 256;

/// Routing table errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    /// Interface name does not resolve
    NoSuchDevice,
    /// Table is full
    ResourceExhausted,
    /// No route matches the delete request
    NotFound,
}

/// A route entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Destination network, always masked by `netmask`.
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// `None` for a directly connected network.
    pub gateway: Option<Ipv4Addr>,
    pub iface: IfaceId,
}

impl Route {
    #[inline]
    fn matches(&self, dst: Ipv4Addr) -> bool {
        dst.mask(self.netmask) == self.network
    }

    #[inline]
    fn same_as(&self, other: &Route) -> bool {
        self.network == other.network
            && self.netmask == other.netmask
            && self.gateway == other.gateway
            && self.iface == other.iface
    }
}

/// Outcome of a route lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextHop {
    pub iface: IfaceId,
    /// Gateway for indirect routes, the destination itself otherwise.
    pub addr: Ipv4Addr,
}

/// The routing table.
pub struct RouteTable {
    routes: RwLock<Vec<Route>>,
}

impl RouteTable {
    pub const fn new() -> Self {
        RouteTable {
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Add a route, replacing an identical existing one.
    ///
    /// # Arguments
    ///
    /// * `ifaces` - Interface table used to resolve `iface_name`
    /// * `dst` - Destination network (masked by `netmask` before insertion)
    /// * `netmask` - Network mask
    /// * `gateway` - Next-hop router, or `None` for a direct route
    /// * `iface_name` - Outgoing interface
    pub fn add_route(
        &self,
        ifaces: &InterfaceTable,
        dst: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
        iface_name: &str,
    ) -> Result<(), RouteError> {
        let iface = ifaces.by_name(iface_name).ok_or(RouteError::NoSuchDevice)?;
        let route = Route {
            network: dst.mask(netmask),
            netmask,
            gateway,
            iface: iface.id(),
        };

        let mut routes = self.routes.write();
        routes.retain(|r| !r.same_as(&route));
        if routes.len() >= MAX_ROUTES {
            log::warn!(target: "net::route", "routing table full, rejecting {}", route.network);
            return Err(RouteError::ResourceExhausted);
        }
        routes.push(route);
        log::info!(
            target: "net::route",
            "route add {}/{} via {:?} dev {}",
            route.network,
            netmask.prefix_len(),
            gateway,
            iface_name
        );
        Ok(())
    }

    /// Delete the route with identical destination/mask/gateway/interface.
    pub fn delete_route(
        &self,
        ifaces: &InterfaceTable,
        dst: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
        iface_name: &str,
    ) -> Result<(), RouteError> {
        let iface = ifaces.by_name(iface_name).ok_or(RouteError::NoSuchDevice)?;
        let target = Route {
            network: dst.mask(netmask),
            netmask,
            gateway,
            iface: iface.id(),
        };
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|r| !r.same_as(&target));
        if routes.len() == before {
            return Err(RouteError::NotFound);
        }
        log::info!(target: "net::route", "route del {}/{}", target.network, netmask.prefix_len());
        Ok(())
    }

    /// Remove every route through `iface`. Returns how many were removed.
    pub fn purge(&self, iface: IfaceId) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|r| r.iface != iface);
        before - routes.len()
    }

    /// Longest-prefix-match lookup.
    ///
    /// # Arguments
    ///
    /// * `src_iface` - When set, only routes through this interface qualify
    /// * `dst` - Destination address
    pub fn lookup(&self, src_iface: Option<IfaceId>, dst: Ipv4Addr) -> Option<NextHop> {
        let routes = self.routes.read();
        let mut best: Option<&Route> = None;
        for route in routes.iter() {
            if !route.matches(dst) {
                continue;
            }
            if let Some(required) = src_iface {
                if route.iface != required {
                    continue;
                }
            }
            let better = match best {
                Some(b) => route.netmask.prefix_len() > b.netmask.prefix_len(),
                None => true,
            };
            if better {
                best = Some(route);
            }
        }
        best.map(|r| NextHop {
            iface: r.iface,
            addr: r.gateway.unwrap_or(dst),
        })
    }

    /// Snapshot of all routes in scan order.
    pub fn routes(&self) -> Vec<Route> {
        self.routes.read().clone()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LoopbackDevice;
    use crate::iface::IfaceFlags;
    use alloc::sync::Arc;

    fn ifaces() -> InterfaceTable {
        let table = InterfaceTable::new();
        table
            .add("eth0", Arc::new(LoopbackDevice::new()), IfaceFlags::UP)
            .unwrap();
        table
            .add("eth1", Arc::new(LoopbackDevice::new()), IfaceFlags::UP)
            .unwrap();
        table
    }

    const MASK8: Ipv4Addr = Ipv4Addr::new(255, 0, 0, 0);
    const MASK24: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

    #[test]
    fn test_longest_prefix_match() {
        let ifs = ifaces();
        let table = RouteTable::new();
        let gw = Ipv4Addr::new(10, 0, 0, 1);
        table
            .add_route(&ifs, Ipv4Addr::new(10, 0, 0, 0), MASK8, Some(gw), "eth0")
            .unwrap();
        table
            .add_route(&ifs, Ipv4Addr::new(10, 0, 2, 0), MASK24, None, "eth1")
            .unwrap();

        let hop = table.lookup(None, Ipv4Addr::new(10, 0, 2, 5)).unwrap();
        assert_eq!(hop.iface, IfaceId(1));
        assert_eq!(hop.addr, Ipv4Addr::new(10, 0, 2, 5));

        let hop = table.lookup(None, Ipv4Addr::new(10, 0, 9, 5)).unwrap();
        assert_eq!(hop.iface, IfaceId(0));
        assert_eq!(hop.addr, gw);

        assert!(table.lookup(None, Ipv4Addr::new(192, 168, 0, 1)).is_none());
    }

    #[test]
    fn test_source_interface_constraint() {
        let ifs = ifaces();
        let table = RouteTable::new();
        table
            .add_route(&ifs, Ipv4Addr::new(10, 0, 0, 0), MASK8, None, "eth0")
            .unwrap();
        table
            .add_route(&ifs, Ipv4Addr::new(10, 0, 2, 0), MASK24, None, "eth1")
            .unwrap();
        let hop = table
            .lookup(Some(IfaceId(0)), Ipv4Addr::new(10, 0, 2, 5))
            .unwrap();
        assert_eq!(hop.iface, IfaceId(0));
    }

    #[test]
    fn test_tie_goes_to_first_entry() {
        let ifs = ifaces();
        let table = RouteTable::new();
        table
            .add_route(&ifs, Ipv4Addr::new(10, 0, 2, 0), MASK24, None, "eth1")
            .unwrap();
        table
            .add_route(&ifs, Ipv4Addr::new(10, 0, 2, 0), MASK24, None, "eth0")
            .unwrap();
        let hop = table.lookup(None, Ipv4Addr::new(10, 0, 2, 9)).unwrap();
        assert_eq!(hop.iface, IfaceId(1));
    }

    #[test]
    fn test_add_is_idempotent_and_masks_destination() {
        let ifs = ifaces();
        let table = RouteTable::new();
        for _ in 0..2 {
            table
                .add_route(&ifs, Ipv4Addr::new(10, 0, 2, 77), MASK24, None, "eth0")
                .unwrap();
        }
        let routes = table.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].network, Ipv4Addr::new(10, 0, 2, 0));
    }

    #[test]
    fn test_errors_and_purge() {
        let ifs = ifaces();
        let table = RouteTable::new();
        assert_eq!(
            table.add_route(&ifs, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, None, "wlan0"),
            Err(RouteError::NoSuchDevice)
        );

        for i in 0..MAX_ROUTES {
            let dst = Ipv4Addr::from(0x0a00_0000u32 + ((i as u32) << 8));
            table.add_route(&ifs, dst, MASK24, None, "eth0").unwrap();
        }
        assert_eq!(
            table.add_route(&ifs, Ipv4Addr::new(192, 168, 0, 0), MASK24, None, "eth1"),
            Err(RouteError::ResourceExhausted)
        );

        assert_eq!(
            table.delete_route(&ifs, Ipv4Addr::new(10, 0, 0, 0), MASK24, None, "eth0"),
            Ok(())
        );
        assert_eq!(
            table.delete_route(&ifs, Ipv4Addr::new(10, 0, 0, 0), MASK24, None, "eth0"),
            Err(RouteError::NotFound)
        );
        assert_eq!(table.purge(IfaceId(0)), MAX_ROUTES - 1);
        assert!(table.routes().is_empty());
    }
}
