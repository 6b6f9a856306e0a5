//! Network interface primitives
//!
//! [`InterfaceOps`] is the seam between network strategies and the kernel.
//! [`Netlink`] is the production implementation; tests substitute a recorder.

use std::net::IpAddr;

use tracing::debug;
use tether_core::{Error, ProcessId, Result};

use crate::netlink::NetlinkHandle;

/// Interface configuration primitives
///
/// Every operation acts in the caller's current network namespace.
pub trait InterfaceOps: Send + Sync {
    /// Bring an interface up
    fn interface_up(&self, name: &str) -> Result<()>;

    /// Take an interface down
    fn interface_down(&self, name: &str) -> Result<()>;

    /// Rename an interface; it must be down
    fn change_interface_name(&self, old: &str, new: &str) -> Result<()>;

    /// Create a veth pair `name` / `peer`
    fn create_veth_pair(&self, name: &str, peer: &str) -> Result<()>;

    /// Move an interface into the network namespace of `pid`
    fn set_interface_in_namespace_pid(&self, name: &str, pid: ProcessId) -> Result<()>;

    /// Attach an interface to a bridge
    fn set_interface_master(&self, name: &str, master: &str) -> Result<()>;

    /// Route everything not otherwise routed via `gateway` on `name`
    fn set_default_gateway(&self, gateway: &str, name: &str) -> Result<()>;

    /// Assign an address in CIDR notation (`10.0.0.2/24`)
    fn set_interface_ip(&self, name: &str, cidr: &str) -> Result<()>;

    /// Set an interface's MTU
    fn set_mtu(&self, name: &str, mtu: u32) -> Result<()>;
}

/// rtnetlink implementation of [`InterfaceOps`]
///
/// Opens a new socket per operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Netlink;

impl Netlink {
    fn with_link<T>(name: &str, op: impl FnOnce(&mut NetlinkHandle, u32) -> Result<T>) -> Result<T> {
        let mut handle = NetlinkHandle::new()?;
        let index = handle.ifindex(name)?;
        op(&mut handle, index)
    }
}

impl InterfaceOps for Netlink {
    fn interface_up(&self, name: &str) -> Result<()> {
        debug!(iface = name, "Bringing interface up");
        Self::with_link(name, |nl, index| nl.set_link_up(index, true))
    }

    fn interface_down(&self, name: &str) -> Result<()> {
        debug!(iface = name, "Taking interface down");
        Self::with_link(name, |nl, index| nl.set_link_up(index, false))
    }

    fn change_interface_name(&self, old: &str, new: &str) -> Result<()> {
        debug!(iface = old, new_name = new, "Renaming interface");
        Self::with_link(old, |nl, index| nl.set_link_name(index, new))
    }

    fn create_veth_pair(&self, name: &str, peer: &str) -> Result<()> {
        debug!(iface = name, peer, "Creating veth pair");
        NetlinkHandle::new()?.create_veth(name, peer)
    }

    fn set_interface_in_namespace_pid(&self, name: &str, pid: ProcessId) -> Result<()> {
        let target = u32::try_from(pid.as_raw()).map_err(|_| Error::Network {
            message: format!("invalid target pid {pid}"),
        })?;

        debug!(iface = name, pid = %pid, "Moving interface to namespace");
        Self::with_link(name, |nl, index| nl.set_link_netns_pid(index, target))
    }

    fn set_interface_master(&self, name: &str, master: &str) -> Result<()> {
        debug!(iface = name, master, "Attaching interface to bridge");
        let mut handle = NetlinkHandle::new()?;
        let master_index = handle.ifindex(master)?;
        let index = handle.ifindex(name)?;
        handle.set_link_master(index, master_index)
    }

    fn set_default_gateway(&self, gateway: &str, name: &str) -> Result<()> {
        let gateway: IpAddr = gateway.parse().map_err(|e| Error::Network {
            message: format!("invalid gateway {gateway}: {e}"),
        })?;

        debug!(iface = name, gateway = %gateway, "Setting default gateway");
        Self::with_link(name, |nl, index| nl.add_default_route(gateway, Some(index)))
    }

    fn set_interface_ip(&self, name: &str, cidr: &str) -> Result<()> {
        let (addr, prefix) = parse_cidr(cidr)?;

        debug!(iface = name, address = %addr, prefix, "Assigning address");
        Self::with_link(name, |nl, index| nl.add_address(index, addr, prefix))
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        debug!(iface = name, mtu, "Setting MTU");
        Self::with_link(name, |nl, index| nl.set_link_mtu(index, mtu))
    }
}

/// Split `addr/prefix`; a bare address is a host address
///
/// # Errors
/// Returns error if the address or prefix is malformed
pub fn parse_cidr(cidr: &str) -> Result<(IpAddr, u8)> {
    let invalid = |reason: &str| Error::Network {
        message: format!("invalid address {cidr}: {reason}"),
    };

    let (addr, prefix) = match cidr.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (cidr, None),
    };

    let addr: IpAddr = addr.parse().map_err(|_| invalid("not an IP address"))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };

    let prefix = match prefix {
        Some(p) => p.parse::<u8>().map_err(|_| invalid("bad prefix length"))?,
        None => max,
    };

    if prefix > max {
        return Err(invalid("prefix length out of range"));
    }

    Ok((addr, prefix))
}

/// Bring an interface up
pub fn interface_up(name: &str) -> Result<()> {
    Netlink.interface_up(name)
}

/// Take an interface down
pub fn interface_down(name: &str) -> Result<()> {
    Netlink.interface_down(name)
}

/// Rename an interface
pub fn change_interface_name(old: &str, new: &str) -> Result<()> {
    Netlink.change_interface_name(old, new)
}

/// Create a veth pair
pub fn create_veth_pair(name: &str, peer: &str) -> Result<()> {
    Netlink.create_veth_pair(name, peer)
}

/// Move an interface into the network namespace of `pid`
pub fn set_interface_in_namespace_pid(name: &str, pid: ProcessId) -> Result<()> {
    Netlink.set_interface_in_namespace_pid(name, pid)
}

/// Attach an interface to a bridge
pub fn set_interface_master(name: &str, master: &str) -> Result<()> {
    Netlink.set_interface_master(name, master)
}

/// Install a default route
pub fn set_default_gateway(gateway: &str, name: &str) -> Result<()> {
    Netlink.set_default_gateway(gateway, name)
}

/// Assign an address in CIDR notation
pub fn set_interface_ip(name: &str, cidr: &str) -> Result<()> {
    Netlink.set_interface_ip(name, cidr)
}

/// Set an interface's MTU
pub fn set_mtu(name: &str, mtu: u32) -> Result<()> {
    Netlink.set_mtu(name, mtu)
}
