//! Namespace registry
//!
//! Maps the namespace keys used in container configuration (`NEWPID`,
//! `NEWNET`, ...) to their clone flags and `/proc/<pid>/ns` entries.

use std::collections::HashMap;
use std::fmt;
use std::fs;

use nix::sched::CloneFlags;
use tether_core::{Error, ProcessId, Result};

/// A registered namespace kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Namespace {
    /// Configuration key
    pub key: &'static str,

    /// Flag passed to clone(2)
    pub value: CloneFlags,

    /// Entry name under `/proc/<pid>/ns`
    pub file: &'static str,
}

/// Every namespace kind a container can request
pub static NAMESPACES: [Namespace; 7] = [
    Namespace {
        key: "NEWNS",
        value: CloneFlags::CLONE_NEWNS,
        file: "mnt",
    },
    Namespace {
        key: "NEWUTS",
        value: CloneFlags::CLONE_NEWUTS,
        file: "uts",
    },
    Namespace {
        key: "NEWIPC",
        value: CloneFlags::CLONE_NEWIPC,
        file: "ipc",
    },
    Namespace {
        key: "NEWUSER",
        value: CloneFlags::CLONE_NEWUSER,
        file: "user",
    },
    Namespace {
        key: "NEWPID",
        value: CloneFlags::CLONE_NEWPID,
        file: "pid",
    },
    Namespace {
        key: "NEWNET",
        value: CloneFlags::CLONE_NEWNET,
        file: "net",
    },
    Namespace {
        key: "NEWCGROUP",
        value: CloneFlags::CLONE_NEWCGROUP,
        file: "cgroup",
    },
];

/// Look up a namespace by configuration key
#[must_use]
pub fn get_namespace(key: &str) -> Option<&'static Namespace> {
    NAMESPACES.iter().find(|ns| ns.key == key)
}

/// Clone flags for every enabled, registered namespace
///
/// Unknown keys and disabled entries contribute nothing.
#[must_use]
pub fn get_namespace_flags(namespaces: &HashMap<String, bool>) -> CloneFlags {
    namespaces
        .iter()
        .filter(|&(_, &enabled)| enabled)
        .filter_map(|(key, _)| get_namespace(key))
        .fold(CloneFlags::empty(), |flags, ns| flags | ns.value)
}

/// Sorted keys of every enabled, registered namespace
#[must_use]
pub fn enabled_namespaces(namespaces: &HashMap<String, bool>) -> Vec<&'static str> {
    let mut enabled: Vec<&'static str> = namespaces
        .iter()
        .filter(|&(_, &enabled)| enabled)
        .filter_map(|(key, _)| get_namespace(key).map(|ns| ns.key))
        .collect();
    enabled.sort_unstable();
    enabled
}

/// Namespace identities of one process
#[derive(Debug, Clone, Default)]
pub struct NamespaceInfo {
    /// PID namespace ID
    pub pid: Option<String>,
    /// Network namespace ID
    pub net: Option<String>,
    /// Mount namespace ID
    pub mnt: Option<String>,
    /// UTS namespace ID
    pub uts: Option<String>,
    /// IPC namespace ID
    pub ipc: Option<String>,
    /// User namespace ID
    pub user: Option<String>,
    /// CGroup namespace ID
    pub cgroup: Option<String>,
}

impl NamespaceInfo {
    /// Read the namespace links of `pid`
    ///
    /// # Errors
    /// Returns error if the process does not exist
    pub fn for_pid(pid: ProcessId) -> Result<Self> {
        let base = pid.proc_path("ns");
        if let Err(e) = fs::metadata(&base) {
            return Err(Error::Namespace {
                message: format!("Cannot read namespaces of {pid}: {e}"),
            });
        }

        let read_ns = |name: &str| {
            fs::read_link(format!("{base}/{name}"))
                .ok()
                .map(|p| p.to_string_lossy().into_owned())
        };

        Ok(Self {
            pid: read_ns("pid"),
            net: read_ns("net"),
            mnt: read_ns("mnt"),
            uts: read_ns("uts"),
            ipc: read_ns("ipc"),
            user: read_ns("user"),
            cgroup: read_ns("cgroup"),
        })
    }

    /// Namespaces of the calling process
    ///
    /// # Errors
    /// Returns error if `/proc` is unavailable
    pub fn current() -> Result<Self> {
        Self::for_pid(ProcessId::current())
    }

    /// Whether any of pid, net or mount differ from init's
    ///
    /// # Errors
    /// Returns error if init's namespaces cannot be read
    pub fn is_isolated(&self) -> Result<bool> {
        let init = Self::for_pid(ProcessId::INIT)?;

        Ok(self.pid != init.pid || self.net != init.net || self.mnt != init.mnt)
    }
}

impl fmt::Display for NamespaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Namespace Info:")?;
        let rows = [
            ("PID", &self.pid),
            ("NET", &self.net),
            ("MNT", &self.mnt),
            ("UTS", &self.uts),
            ("IPC", &self.ipc),
            ("USER", &self.user),
            ("CGROUP", &self.cgroup),
        ];
        for (label, value) in rows {
            if let Some(value) = value {
                writeln!(f, "  {:<7} {value}", format!("{label}:"))?;
            }
        }
        Ok(())
    }
}
