//! Systemd transient scope backend
//!
//! Talks to `org.freedesktop.systemd1.Manager` over the system bus. The
//! container pid is placed in `tether-<name>.scope` under the configured slice.

use std::fmt;

use tracing::debug;
use tether_core::{CgroupSpec, Error, ProcessId, Result};
use zbus::blocking::Connection;
use zbus::zvariant::Value;

use crate::backend::{ActiveCgroup, CgroupBackend};

const DESTINATION: &str = "org.freedesktop.systemd1";
const OBJECT_PATH: &str = "/org/freedesktop/systemd1";
const MANAGER: &str = "org.freedesktop.systemd1.Manager";
const NO_SUCH_UNIT: &str = "org.freedesktop.systemd1.NoSuchUnit";

/// Backend placing containers in transient systemd scopes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemdBackend;

impl SystemdBackend {
    /// Create the backend; the bus is connected per apply
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Scope unit name for a spec
#[must_use]
pub fn unit_name(spec: &CgroupSpec) -> String {
    format!("tether-{}.scope", spec.name)
}

/// Slice unit a spec's scope is placed in
#[must_use]
pub fn slice_name(spec: &CgroupSpec) -> String {
    let parent = spec.parent.trim_matches('/');
    if parent.is_empty() {
        "system.slice".to_string()
    } else if parent.ends_with(".slice") {
        parent.to_string()
    } else {
        format!("{}.slice", parent.replace('/', "-"))
    }
}

/// Unit properties for `StartTransientUnit`
///
/// # Errors
/// Returns error if the pid is not positive
pub fn scope_properties(spec: &CgroupSpec, pid: ProcessId) -> Result<Vec<(&'static str, Value<'static>)>> {
    let pid = u32::try_from(pid.as_raw()).map_err(|_| Error::CGroup {
        message: format!("PID {pid} cannot be placed in a scope"),
    })?;

    let mut properties: Vec<(&'static str, Value<'static>)> = vec![
        ("Description", Value::new(format!("tether container {}", spec.name))),
        ("Slice", Value::new(slice_name(spec))),
        ("PIDs", Value::new(vec![pid])),
        ("Delegate", Value::new(true)),
    ];

    if let Some(weight) = spec.cpu_weight() {
        properties.push(("CPUWeight", Value::new(weight)));
    }

    if let Some(quota) = spec.cpu_quota.filter(|&q| q > 0) {
        let period = spec
            .cpu_period
            .filter(|&p| p > 0)
            .unwrap_or(CgroupSpec::DEFAULT_CPU_PERIOD);
        let quota_per_sec = quota
            .unsigned_abs()
            .saturating_mul(1_000_000)
            .checked_div(period)
            .unwrap_or(0);
        properties.push(("CPUQuotaPerSecUSec", Value::new(quota_per_sec)));
    }

    if let Some(memory) = spec.memory {
        properties.push(("MemoryMax", Value::new(memory.as_bytes())));
    }

    if let Some(swap) = spec.memory_swap {
        properties.push(("MemorySwapMax", Value::new(swap.as_bytes())));
    }

    if let Some(limit) = spec.pids_limit {
        let tasks = u64::try_from(limit).ok().filter(|&l| l > 0).unwrap_or(u64::MAX);
        properties.push(("TasksMax", Value::new(tasks)));
    }

    if !spec.allow_all_devices {
        let allow: Vec<(String, String)> = spec
            .device_rules
            .iter()
            .map(|rule| (rule.path.clone(), rule.permissions.clone()))
            .collect();
        properties.push(("DevicePolicy", Value::new("strict")));
        properties.push(("DeviceAllow", Value::new(allow)));
    }

    Ok(properties)
}

impl CgroupBackend for SystemdBackend {
    fn name(&self) -> &'static str {
        "systemd"
    }

    fn apply(&self, spec: &CgroupSpec, pid: ProcessId) -> Result<Box<dyn ActiveCgroup>> {
        spec.validate()?;

        let connection = Connection::system().map_err(|e| Error::CGroup {
            message: format!("Failed to connect to system bus: {e}"),
        })?;

        let unit = unit_name(spec);
        let properties = scope_properties(spec, pid)?;

        debug!(unit = %unit, slice = %slice_name(spec), pid = %pid, "Starting transient scope");

        connection
            .call_method(
                Some(DESTINATION),
                OBJECT_PATH,
                Some(MANAGER),
                "StartTransientUnit",
                &(
                    unit.as_str(),
                    "replace",
                    properties,
                    Vec::<(&str, Vec<(&str, Value<'_>)>)>::new(),
                ),
            )
            .map_err(|e| Error::CGroup {
                message: format!("StartTransientUnit {unit} failed: {e}"),
            })?;

        Ok(Box::new(SystemdScope {
            connection,
            unit,
            active: true,
        }))
    }
}

/// A running transient scope
pub struct SystemdScope {
    connection: Connection,
    unit: String,
    active: bool,
}

impl SystemdScope {
    /// Scope unit name
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }
}

impl fmt::Debug for SystemdScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemdScope")
            .field("unit", &self.unit)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl ActiveCgroup for SystemdScope {
    fn cleanup(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }

        let stopped = self.connection.call_method(
            Some(DESTINATION),
            OBJECT_PATH,
            Some(MANAGER),
            "StopUnit",
            &(self.unit.as_str(), "replace"),
        );

        match stopped {
            Ok(_) => debug!(unit = %self.unit, "Stopped scope"),
            Err(zbus::Error::MethodError(ref name, _, _)) if name.as_str() == NO_SUCH_UNIT => {
                debug!(unit = %self.unit, "Scope already gone");
            }
            Err(e) => {
                return Err(Error::CGroup {
                    message: format!("StopUnit {} failed: {e}", self.unit),
                });
            }
        }

        self.active = false;
        Ok(())
    }
}
