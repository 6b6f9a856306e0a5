//! Container networking: interface primitives and network strategies
//!
//! - [`iface`]: the [`InterfaceOps`] trait and its rtnetlink implementation
//! - [`strategy`]: the `loopback`, `veth` and `none` strategies and their
//!   registry

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation
)]

pub mod iface;
pub mod netlink;
pub mod strategy;

pub use iface::{InterfaceOps, Netlink, parse_cidr};
pub use strategy::{
    CONTAINER_IFACE, Loopback, NetworkStrategy, NoNetwork, VETH_CHILD_KEY, VETH_HOST_KEY, Veth,
    get_strategy, strategy_names,
};
