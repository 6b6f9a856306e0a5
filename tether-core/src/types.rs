//! Process identity types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ProcessId(i32);

impl ProcessId {
    /// The host's init process. Moving an interface to this pid's network
    /// namespace returns it to the root namespace.
    pub const INIT: Self = Self(1);

    /// Create from raw PID
    #[must_use]
    pub const fn from_raw(pid: i32) -> Self {
        Self(pid)
    }

    /// Get the current process ID
    #[must_use]
    pub fn current() -> Self {
        #[allow(clippy::cast_possible_wrap)]
        Self(std::process::id() as i32)
    }

    /// Convert to `nix::unistd::Pid`
    #[must_use]
    pub const fn as_nix_pid(self) -> nix::unistd::Pid {
        nix::unistd::Pid::from_raw(self.0)
    }

    /// Get raw PID value
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// Path of a per-process pseudo-file, e.g. `proc_path("ns/net")`
    #[must_use]
    pub fn proc_path(self, entry: &str) -> String {
        format!("/proc/{}/{entry}", self.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<nix::unistd::Pid> for ProcessId {
    fn from(pid: nix::unistd::Pid) -> Self {
        Self(pid.as_raw())
    }
}

impl From<ProcessId> for nix::unistd::Pid {
    fn from(pid: ProcessId) -> Self {
        nix::unistd::Pid::from_raw(pid.0)
    }
}
