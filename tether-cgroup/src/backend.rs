//! Backend traits and selection
//!
//! Two backends exist:
//! - [`SystemdBackend`](crate::SystemdBackend) - transient scope units, used
//!   when systemd manages the host's cgroups
//! - [`FsBackend`](crate::FsBackend) - direct writes to the cgroup v2 hierarchy

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use tether_core::{CgroupSpec, ProcessId, Result};

use crate::{FsBackend, SystemdBackend};

/// A cgroup that has been created and joined by a process
///
/// `cleanup` is idempotent: after the first successful call every further
/// call is a no-op returning `Ok(())`.
pub trait ActiveCgroup: Send + fmt::Debug {
    /// Remove the group
    ///
    /// # Errors
    /// Returns error if the group still exists and cannot be removed
    fn cleanup(&mut self) -> Result<()>;
}

/// Trait for cgroup backends
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; launches of distinct containers may
/// share one backend.
pub trait CgroupBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Create the group, apply every configured limit and attach `pid`
    ///
    /// On error nothing is left behind: a partially created group is removed
    /// before returning.
    ///
    /// # Errors
    /// Returns error if any controller rejects its limit or the pid cannot
    /// be attached
    fn apply(&self, spec: &CgroupSpec, pid: ProcessId) -> Result<Box<dyn ActiveCgroup>>;
}

/// Whether systemd is actively managing cgroups on this host
///
/// Evaluated once per process.
pub fn use_systemd() -> bool {
    static USE_SYSTEMD: OnceLock<bool> = OnceLock::new();

    *USE_SYSTEMD.get_or_init(|| {
        if !Path::new("/run/systemd/system").is_dir() {
            return false;
        }

        match zbus::blocking::Connection::system() {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "systemd present but system bus unreachable");
                false
            }
        }
    })
}

/// Pick the backend for this host
#[must_use]
pub fn select_backend() -> Box<dyn CgroupBackend> {
    if use_systemd() {
        Box::new(SystemdBackend::new())
    } else {
        Box::new(FsBackend::default())
    }
}

/// Apply cgroup limits to a process
///
/// An absent specification is not an error: cgroups are optional and the
/// returned handle is `None`.
///
/// # Errors
/// Returns the backend's error if applying any limit fails
pub fn apply(spec: Option<&CgroupSpec>, pid: ProcessId) -> Result<Option<Box<dyn ActiveCgroup>>> {
    apply_with(select_backend().as_ref(), spec, pid)
}

/// Apply cgroup limits through a specific backend
///
/// # Errors
/// Returns the backend's error if applying any limit fails
pub fn apply_with(
    backend: &dyn CgroupBackend,
    spec: Option<&CgroupSpec>,
    pid: ProcessId,
) -> Result<Option<Box<dyn ActiveCgroup>>> {
    let Some(spec) = spec else {
        tracing::debug!(pid = %pid, "No cgroup configuration");
        return Ok(None);
    };

    tracing::info!(
        backend = backend.name(),
        cgroup = %spec.name,
        parent = %spec.parent,
        pid = %pid,
        "Applying cgroup limits"
    );

    backend.apply(spec, pid).map(Some)
}

/// Clean up an optional handle; `None` is a no-op
///
/// # Errors
/// Returns the handle's cleanup error
pub fn cleanup(handle: &mut Option<Box<dyn ActiveCgroup>>) -> Result<()> {
    match handle {
        Some(active) => active.cleanup(),
        None => Ok(()),
    }
}
