//! Network interfaces and their IPv4 configuration.
//!
//! An interface binds a `NetDevice` to a name, flags and one IPv4 address
//! with its netmask. The table is small and fixed (8 entries); interface ids
//! are stable indices used by routes and queued packets.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

use crate::device::NetDevice;
use crate::ipv4::Ipv4Addr;

/// Maximum number of interfaces
pub const MAX_INTERFACES: usize = 8;

bitflags::bitflags! {
    /// Interface flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IfaceFlags: u32 {
        /// Interface is administratively up
        const UP = 0x0001;
        /// Loopback interface (no address resolution)
        const LOOPBACK = 0x0002;
    }
}

/// Stable interface identifier (index into the table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IfaceId(pub u8);

/// Interface administration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfaceError {
    /// No interface with that name
    NoSuchDevice,
    /// Interface table is full
    ResourceExhausted,
    /// Name already registered
    AlreadyExists,
}

/// Address configuration of one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IfaceAddr {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

/// A configured network interface.
pub struct Interface {
    id: IfaceId,
    name: String,
    device: Arc<dyn NetDevice>,
    flags: IfaceFlags,
    addr: RwLock<IfaceAddr>,
}

impl Interface {
    #[inline]
    pub fn id(&self) -> IfaceId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn NetDevice> {
        &self.device
    }

    #[inline]
    pub fn flags(&self) -> IfaceFlags {
        self.flags
    }

    #[inline]
    pub fn is_loopback(&self) -> bool {
        self.flags.contains(IfaceFlags::LOOPBACK)
    }

    /// Largest IP datagram the device carries per frame.
    #[inline]
    pub fn mtu(&self) -> usize {
        self.device.mtu() as usize
    }

    /// Current address; unspecified until configured.
    #[inline]
    pub fn address(&self) -> Ipv4Addr {
        self.addr.read().address
    }

    #[inline]
    pub fn netmask(&self) -> Ipv4Addr {
        self.addr.read().netmask
    }

    /// Whether `addr` is assigned to this interface.
    #[inline]
    pub fn owns(&self, addr: Ipv4Addr) -> bool {
        let cfg = self.addr.read();
        !cfg.address.is_unspecified() && cfg.address == addr
    }
}

/// Snapshot returned by interface enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub id: IfaceId,
    pub name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mtu: usize,
    pub flags: IfaceFlags,
}

/// Table of all interfaces.
pub struct InterfaceTable {
    ifaces: RwLock<Vec<Arc<Interface>>>,
}

impl InterfaceTable {
    pub const fn new() -> Self {
        InterfaceTable {
            ifaces: RwLock::new(Vec::new()),
        }
    }

    /// Register a device under `name`.
    pub fn add(
        &self,
        name: &str,
        device: Arc<dyn NetDevice>,
        flags: IfaceFlags,
    ) -> Result<IfaceId, IfaceError> {
        let mut ifaces = self.ifaces.write();
        if ifaces.iter().any(|i| i.name == name) {
            return Err(IfaceError::AlreadyExists);
        }
        if ifaces.len() >= MAX_INTERFACES {
            return Err(IfaceError::ResourceExhausted);
        }
        let id = IfaceId(ifaces.len() as u8);
        ifaces.push(Arc::new(Interface {
            id,
            name: name.to_string(),
            device,
            flags,
            addr: RwLock::new(IfaceAddr::default()),
        }));
        log::info!(target: "net::link", "interface {} registered as #{}", name, id.0);
        Ok(id)
    }

    pub fn get(&self, id: IfaceId) -> Option<Arc<Interface>> {
        self.ifaces.read().get(id.0 as usize).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Interface>> {
        self.ifaces.read().iter().find(|i| i.name == name).cloned()
    }

    /// Interface that owns `addr`, if any.
    pub fn by_address(&self, addr: Ipv4Addr) -> Option<Arc<Interface>> {
        self.ifaces.read().iter().find(|i| i.owns(addr)).cloned()
    }

    /// Whether any interface owns `addr`.
    pub fn is_local(&self, addr: Ipv4Addr) -> bool {
        self.by_address(addr).is_some()
    }

    /// Assign address and netmask to the named interface.
    pub fn set_address(
        &self,
        name: &str,
        address: Ipv4Addr,
        netmask: Ipv4Addr,
    ) -> Result<(), IfaceError> {
        let iface = self.by_name(name).ok_or(IfaceError::NoSuchDevice)?;
        *iface.addr.write() = IfaceAddr { address, netmask };
        log::info!(target: "net::link", "{}: address {}/{}", name, address, netmask.prefix_len());
        Ok(())
    }

    /// Current address and netmask of the named interface.
    pub fn address(&self, name: &str) -> Result<IfaceAddr, IfaceError> {
        let iface = self.by_name(name).ok_or(IfaceError::NoSuchDevice)?;
        let cfg = *iface.addr.read();
        Ok(cfg)
    }

    /// Enumerate all interfaces.
    pub fn list(&self) -> Vec<InterfaceInfo> {
        self.ifaces
            .read()
            .iter()
            .map(|i| {
                let cfg = *i.addr.read();
                InterfaceInfo {
                    id: i.id,
                    name: i.name.clone(),
                    address: cfg.address,
                    netmask: cfg.netmask,
                    mtu: i.mtu(),
                    flags: i.flags,
                }
            })
            .collect()
    }
}

impl Default for InterfaceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LoopbackDevice;

    #[test]
    fn test_set_and_get_address() {
        let table = InterfaceTable::new();
        let id = table
            .add("lo", Arc::new(LoopbackDevice::new()), IfaceFlags::UP | IfaceFlags::LOOPBACK)
            .unwrap();
        assert_eq!(id, IfaceId(0));
        assert_eq!(
            table.add("lo", Arc::new(LoopbackDevice::new()), IfaceFlags::UP),
            Err(IfaceError::AlreadyExists)
        );

        table
            .set_address("lo", Ipv4Addr::LOCALHOST, Ipv4Addr::new(255, 0, 0, 0))
            .unwrap();
        let cfg = table.address("lo").unwrap();
        assert_eq!(cfg.address, Ipv4Addr::LOCALHOST);
        assert!(table.is_local(Ipv4Addr::LOCALHOST));
        assert_eq!(table.address("eth9"), Err(IfaceError::NoSuchDevice));

        let list = table.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].netmask, Ipv4Addr::new(255, 0, 0, 0));
        assert!(list[0].flags.contains(IfaceFlags::LOOPBACK));
    }

    #[test]
    fn test_table_capacity() {
        let table = InterfaceTable::new();
        let names = ["a", "b", "c", "d", "e", "f", "g", "h"];
        for name in names {
            table
                .add(name, Arc::new(LoopbackDevice::new()), IfaceFlags::UP)
                .unwrap();
        }
        assert_eq!(
            table.add("i", Arc::new(LoopbackDevice::new()), IfaceFlags::UP),
            Err(IfaceError::ResourceExhausted)
        );
    }
}
