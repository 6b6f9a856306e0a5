//! Tether Core - Foundation types shared by the launch pipeline
//!
//! This crate provides the container description, the context payload and the
//! error type used throughout Tether.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod container;
pub mod context;
pub mod error;
pub mod resources;
pub mod types;

pub use container::{Container, Network, NetworkInterface, CONTAINER_FILE};
pub use context::Context;
pub use error::{Error, Result};
pub use resources::{CgroupSpec, DeviceRule, MemorySize};
pub use types::ProcessId;
