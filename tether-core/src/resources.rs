//! Cgroup limit specification with unit-safe values

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Memory size value object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[repr(transparent)]
#[serde(transparent)]
pub struct MemorySize(u64); // bytes

impl MemorySize {
    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from megabytes
    #[must_use]
    pub const fn from_mb(mb: u64) -> Self {
        Self(mb.saturating_mul(1024).saturating_mul(1024))
    }

    /// Create from gigabytes
    #[must_use]
    pub const fn from_gb(gb: u64) -> Self {
        Self(
            gb.saturating_mul(1024)
                .saturating_mul(1024)
                .saturating_mul(1024),
        )
    }

    /// Get value in bytes
    #[must_use]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Get value in megabytes
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_mb(self) -> f64 {
        self.0 as f64 / (1024.0 * 1024.0)
    }
}

impl fmt::Display for MemorySize {
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const GB: u64 = 1024 * 1024 * 1024;
        const MB: u64 = 1024 * 1024;

        if self.0 >= GB {
            write!(f, "{:.2} GB", self.0 as f64 / GB as f64)
        } else if self.0 >= MB {
            write!(f, "{:.2} MB", self.as_mb())
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}

/// A single device access rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRule {
    /// Device node path, e.g. `/dev/null`
    pub path: String,

    /// `c` (char), `b` (block) or `a` (all)
    #[serde(rename = "type", default = "DeviceRule::default_kind")]
    pub kind: char,

    /// Major number, `None` matches any
    #[serde(default)]
    pub major: Option<i64>,

    /// Minor number, `None` matches any
    #[serde(default)]
    pub minor: Option<i64>,

    /// Any combination of `r`, `w`, `m`
    #[serde(default = "DeviceRule::default_permissions")]
    pub permissions: String,
}

impl DeviceRule {
    fn default_kind() -> char {
        'c'
    }

    fn default_permissions() -> String {
        "rwm".to_string()
    }

    /// Allow full access to a character device node
    #[must_use]
    pub fn char_device(path: impl Into<String>, major: i64, minor: i64) -> Self {
        Self {
            path: path.into(),
            kind: 'c',
            major: Some(major),
            minor: Some(minor),
            permissions: Self::default_permissions(),
        }
    }
}

/// Resource limits for the container's cgroup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CgroupSpec {
    /// Group name, unique per container
    pub name: String,

    /// Parent group (or systemd slice)
    #[serde(default = "CgroupSpec::default_parent")]
    pub parent: String,

    /// Relative CPU weight in cgroup v1 "shares" units (2..=262144)
    #[serde(default)]
    pub cpu_shares: Option<u64>,

    /// CPU quota in microseconds per period
    #[serde(default)]
    pub cpu_quota: Option<i64>,

    /// CPU period in microseconds
    #[serde(default)]
    pub cpu_period: Option<u64>,

    /// Memory ceiling
    #[serde(default)]
    pub memory: Option<MemorySize>,

    /// Swap ceiling
    #[serde(default)]
    pub memory_swap: Option<MemorySize>,

    /// Maximum number of tasks
    #[serde(default)]
    pub pids_limit: Option<i64>,

    /// Skip device filtering entirely
    #[serde(default)]
    pub allow_all_devices: bool,

    /// Devices the container may access
    #[serde(default)]
    pub device_rules: Vec<DeviceRule>,
}

impl CgroupSpec {
    /// Maximum length for group names
    pub const MAX_NAME_LENGTH: usize = 64;

    /// Default CPU period (100ms)
    pub const DEFAULT_CPU_PERIOD: u64 = 100_000;

    fn default_parent() -> String {
        "tether".to_string()
    }

    /// Create a spec with no limits under the default parent
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: Self::default_parent(),
            cpu_shares: None,
            cpu_quota: None,
            cpu_period: None,
            memory: None,
            memory_swap: None,
            pids_limit: None,
            allow_all_devices: false,
            device_rules: Vec::new(),
        }
    }

    /// Validate the group name
    ///
    /// # Errors
    /// Returns error if the name is empty, too long, or would escape the
    /// parent directory
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig {
                message: "cgroup name cannot be empty".to_string(),
            });
        }

        if self.name.len() > Self::MAX_NAME_LENGTH {
            return Err(Error::InvalidConfig {
                message: format!("cgroup name too long (max {} chars)", Self::MAX_NAME_LENGTH),
            });
        }

        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidConfig {
                message: "cgroup name can only contain alphanumeric, dash, and underscore"
                    .to_string(),
            });
        }

        if self.parent.split('/').any(|part| part == "..") {
            return Err(Error::InvalidConfig {
                message: format!("cgroup parent escapes hierarchy: {}", self.parent),
            });
        }

        Ok(())
    }

    /// Convert v1 shares into a v2 `cpu.weight` value (1..=10000)
    #[must_use]
    pub fn cpu_weight(&self) -> Option<u64> {
        self.cpu_shares
            .filter(|&shares| shares > 0)
            .map(|shares| {
                let shares = shares.clamp(2, 262_144);
                1 + ((shares - 2) * 9999) / 262_142
            })
    }

    /// `cpu.max` content, `None` if no quota is set
    #[must_use]
    pub fn cpu_max(&self) -> Option<String> {
        let quota = self.cpu_quota?;
        let period = self.cpu_period.unwrap_or(Self::DEFAULT_CPU_PERIOD);

        if quota <= 0 {
            Some(format!("max {period}"))
        } else {
            Some(format!("{quota} {period}"))
        }
    }
}
