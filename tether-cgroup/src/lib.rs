//! Cgroup placement with pluggable backends
//!
//! [`apply`] puts a freshly spawned container process into its cgroup, going
//! through systemd when systemd owns the hierarchy and writing cgroup v2
//! control files directly otherwise. The returned [`ActiveCgroup`] handle is
//! the only way to undo the placement.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod backend;
pub mod controller;
pub mod limits;
pub mod systemd;

pub use backend::{ActiveCgroup, CgroupBackend, apply, apply_with, cleanup, select_backend, use_systemd};
pub use controller::{CGroupController, FsBackend};
pub use systemd::{SystemdBackend, SystemdScope};

/// Mount point of the unified cgroup hierarchy
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
