//! Network strategies
//!
//! A strategy builds one configured network in two halves: `create` runs in
//! the supervisor before the child is released, `initialize` runs inside the
//! child's namespaces before it execs. Data flows between the halves only
//! through the [`Context`].

use std::fmt;

use tracing::debug;
use tether_core::{Context, Error, Network, ProcessId, Result};

use crate::iface::InterfaceOps;

/// Context key holding the host end of a veth pair
pub const VETH_HOST_KEY: &str = "veth-host";

/// Context key holding the end moved into the container
pub const VETH_CHILD_KEY: &str = "veth-child";

/// Name the container end is given inside the namespace
pub const CONTAINER_IFACE: &str = "eth0";

/// Linux limit on interface name length (IFNAMSIZ minus the nul)
pub const MAX_IFACE_NAME: usize = 15;

/// Builds one kind of network
pub trait NetworkStrategy: Send + Sync + fmt::Debug {
    /// Registered type name
    fn name(&self) -> &'static str;

    /// Supervisor side, run once per configured network with the child's pid
    ///
    /// # Errors
    /// Any error aborts the launch
    fn create(
        &self,
        ops: &dyn InterfaceOps,
        config: &Network,
        pid: ProcessId,
        context: &mut Context,
    ) -> Result<()>;

    /// Child side, run inside the new network namespace
    ///
    /// # Errors
    /// Any error aborts the container's init
    fn initialize(&self, ops: &dyn InterfaceOps, config: &Network, context: &Context) -> Result<()>;
}

/// Brings up `lo` inside the namespace
#[derive(Debug, Clone, Copy)]
pub struct Loopback;

impl NetworkStrategy for Loopback {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn create(&self, _: &dyn InterfaceOps, _: &Network, _: ProcessId, _: &mut Context) -> Result<()> {
        Ok(())
    }

    fn initialize(&self, ops: &dyn InterfaceOps, config: &Network, _: &Context) -> Result<()> {
        if let Some(mtu) = config.mtu {
            ops.set_mtu("lo", mtu)?;
        }
        ops.interface_up("lo")
    }
}

/// A veth pair with the host end on a bridge
#[derive(Debug, Clone, Copy)]
pub struct Veth;

impl NetworkStrategy for Veth {
    fn name(&self) -> &'static str {
        "veth"
    }

    fn create(
        &self,
        ops: &dyn InterfaceOps,
        config: &Network,
        pid: ProcessId,
        context: &mut Context,
    ) -> Result<()> {
        let bridge = config.context.get("bridge").ok_or_else(|| Error::Network {
            message: "veth network requires a bridge in its context".to_string(),
        })?;
        let prefix = config.context.get("prefix").map_or("veth", String::as_str);

        let host = random_iface_name(prefix);
        let mut child = random_iface_name(prefix);
        while child == host {
            child = random_iface_name(prefix);
        }

        debug!(host = %host, child = %child, bridge = %bridge, pid = %pid, "Creating veth network");

        ops.create_veth_pair(&host, &child)?;
        // Once one end lives in the container, killing it destroys the pair
        ops.set_interface_in_namespace_pid(&child, pid)?;
        ops.set_interface_master(&host, bridge)?;
        if let Some(mtu) = config.mtu {
            ops.set_mtu(&host, mtu)?;
        }
        ops.interface_up(&host)?;

        context.insert(VETH_HOST_KEY, host);
        context.insert(VETH_CHILD_KEY, child);
        Ok(())
    }

    fn initialize(&self, ops: &dyn InterfaceOps, config: &Network, context: &Context) -> Result<()> {
        let child = context.get(VETH_CHILD_KEY).ok_or_else(|| Error::Network {
            message: format!("context has no {VETH_CHILD_KEY} entry"),
        })?;

        ops.interface_down(child)?;
        ops.change_interface_name(child, CONTAINER_IFACE)?;
        if let Some(address) = &config.address {
            ops.set_interface_ip(CONTAINER_IFACE, address)?;
        }
        if let Some(mtu) = config.mtu {
            ops.set_mtu(CONTAINER_IFACE, mtu)?;
        }
        ops.interface_up(CONTAINER_IFACE)?;
        if let Some(gateway) = &config.gateway {
            ops.set_default_gateway(gateway, CONTAINER_IFACE)?;
        }

        Ok(())
    }
}

/// No networking beyond what the namespace starts with
#[derive(Debug, Clone, Copy)]
pub struct NoNetwork;

impl NetworkStrategy for NoNetwork {
    fn name(&self) -> &'static str {
        "none"
    }

    fn create(&self, _: &dyn InterfaceOps, _: &Network, _: ProcessId, _: &mut Context) -> Result<()> {
        Ok(())
    }

    fn initialize(&self, _: &dyn InterfaceOps, _: &Network, _: &Context) -> Result<()> {
        Ok(())
    }
}

static STRATEGIES: [&(dyn NetworkStrategy + 'static); 3] = [&Loopback, &Veth, &NoNetwork];

/// Look up the strategy registered for a network type
///
/// # Errors
/// Returns `UnknownStrategy` for unregistered types
pub fn get_strategy(kind: &str) -> Result<&'static dyn NetworkStrategy> {
    STRATEGIES
        .iter()
        .copied()
        .find(|strategy| strategy.name() == kind)
        .ok_or_else(|| Error::UnknownStrategy {
            kind: kind.to_string(),
        })
}

/// Names of every registered strategy
#[must_use]
pub fn strategy_names() -> Vec<&'static str> {
    STRATEGIES.iter().map(|strategy| strategy.name()).collect()
}

/// `prefix` followed by random hex, cut to the kernel's name limit
#[must_use]
pub fn random_iface_name(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let keep = prefix.len().min(MAX_IFACE_NAME - 7);
    let prefix = prefix.get(..keep).unwrap_or("veth");

    let mut name = format!("{prefix}{suffix}");
    name.truncate(MAX_IFACE_NAME);
    name
}
