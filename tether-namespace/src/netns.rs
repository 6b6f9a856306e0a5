//! Temporarily operating inside another process's network namespace

use std::fs::File;
use std::os::unix::fs::MetadataExt;

use nix::sched::{CloneFlags, setns};
use tracing::{debug, warn};
use tether_core::{Error, ProcessId, Result};

const CURRENT_NET_NS: &str = "/proc/thread-self/ns/net";

/// Open handle on a process's network namespace
///
/// The namespace outlives its last process for as long as the handle is held,
/// and the handle keeps naming it after the pid is reused.
#[derive(Debug)]
pub struct NetNs {
    file: File,
    owner: ProcessId,
}

impl NetNs {
    /// Open the network namespace of `pid`
    ///
    /// # Errors
    /// Returns `Namespace` if the namespace file cannot be opened, e.g. the
    /// process already exited
    pub fn open(pid: ProcessId) -> Result<Self> {
        let path = pid.proc_path("ns/net");
        let file = File::open(&path).map_err(|e| Error::Namespace {
            message: format!("Cannot open {path}: {e}"),
        })?;
        Ok(Self { file, owner: pid })
    }

    /// Process the namespace was opened through
    #[must_use]
    pub const fn owner(&self) -> ProcessId {
        self.owner
    }

    /// Namespace inode, as shown in `net:[<inode>]`
    ///
    /// # Errors
    /// Returns `Namespace` if the handle cannot be stat'ed
    pub fn inode(&self) -> Result<u64> {
        let meta = self.file.metadata().map_err(|e| Error::Namespace {
            message: format!("Cannot stat network namespace of {}: {e}", self.owner),
        })?;
        Ok(meta.ino())
    }
}

/// Calling thread's stay in a foreign network namespace
///
/// The thread returns to its original namespace when the guard is dropped.
#[derive(Debug)]
pub struct NetNsGuard {
    original: File,
    target: ProcessId,
}

impl NetNsGuard {
    /// Switch the calling thread into the network namespace of `pid`
    ///
    /// # Errors
    /// Returns `Namespace` if either namespace file cannot be opened, e.g. the
    /// process already exited, or the switch is refused
    pub fn enter(pid: ProcessId) -> Result<Self> {
        Self::enter_ns(&NetNs::open(pid)?)
    }

    /// Switch the calling thread into the namespace behind `ns`
    ///
    /// # Errors
    /// Returns `Namespace` if the current namespace cannot be saved or the
    /// switch is refused
    pub fn enter_ns(ns: &NetNs) -> Result<Self> {
        let original = File::open(CURRENT_NET_NS).map_err(|e| Error::Namespace {
            message: format!("Cannot open current network namespace: {e}"),
        })?;

        setns(&ns.file, CloneFlags::CLONE_NEWNET).map_err(|e| Error::Namespace {
            message: format!("Cannot enter network namespace of {}: {e}", ns.owner),
        })?;

        debug!(pid = %ns.owner, "Entered network namespace");
        Ok(Self {
            original,
            target: ns.owner,
        })
    }

    /// Process whose namespace the thread is in
    #[must_use]
    pub const fn target(&self) -> ProcessId {
        self.target
    }
}

impl Drop for NetNsGuard {
    fn drop(&mut self) {
        match setns(&self.original, CloneFlags::CLONE_NEWNET) {
            Ok(()) => debug!(pid = %self.target, "Left network namespace"),
            Err(e) => warn!(pid = %self.target, error = %e, "Failed to restore network namespace"),
        }
    }
}
