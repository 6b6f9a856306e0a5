//! Resource limit implementations
//!
//! This module provides methods for setting CPU, memory, and pid limits
//! by writing to CGroup v2 control files

use crate::controller::CGroupController;
use tracing::{debug, warn};
use tether_core::{CgroupSpec, Result};

impl CGroupController {
    /// Write every limit the spec configures
    ///
    /// # Errors
    /// Returns the first control file write that fails
    pub fn apply_limits(&self, spec: &CgroupSpec) -> Result<()> {
        self.set_cpu_limit(spec)?;
        self.set_memory_limit(spec)?;
        self.set_pids_limit(spec)?;
        self.check_device_rules(spec);
        Ok(())
    }

    /// Set `cpu.weight` and `cpu.max`
    ///
    /// # Errors
    /// Returns error if a control file write fails
    pub fn set_cpu_limit(&self, spec: &CgroupSpec) -> Result<()> {
        if let Some(weight) = spec.cpu_weight() {
            debug!(shares = ?spec.cpu_shares, weight, "Setting CPU weight");
            self.write_control("cpu.weight", &weight.to_string())?;
        }

        // Format: "quota period" (both in microseconds)
        if let Some(max) = spec.cpu_max() {
            debug!(cpu_max = %max, "Setting CPU quota");
            self.write_control("cpu.max", &max)?;
        }

        Ok(())
    }

    /// Set `memory.max` and `memory.swap.max`
    ///
    /// If exceeded, the kernel's OOM killer terminates processes in the group.
    ///
    /// # Errors
    /// Returns error if a control file write fails
    pub fn set_memory_limit(&self, spec: &CgroupSpec) -> Result<()> {
        if let Some(memory) = spec.memory {
            debug!(limit = %memory, "Setting memory limit");
            self.write_control("memory.max", &memory.as_bytes().to_string())?;
        }

        if let Some(swap) = spec.memory_swap {
            debug!(limit = %swap, "Setting swap limit");
            self.write_control("memory.swap.max", &swap.as_bytes().to_string())?;
        }

        Ok(())
    }

    /// Set `pids.max`; zero or negative means unlimited
    ///
    /// # Errors
    /// Returns error if the control file write fails
    pub fn set_pids_limit(&self, spec: &CgroupSpec) -> Result<()> {
        let Some(limit) = spec.pids_limit else {
            return Ok(());
        };

        let content = if limit > 0 {
            limit.to_string()
        } else {
            "max".to_string()
        };

        debug!(limit = %content, "Setting pids limit");
        self.write_control("pids.max", &content)
    }

    /// Device access on cgroup v2 needs an eBPF program; rules are reported,
    /// not enforced
    fn check_device_rules(&self, spec: &CgroupSpec) {
        if spec.allow_all_devices || spec.device_rules.is_empty() {
            return;
        }

        warn!(
            path = %self.path.display(),
            rules = spec.device_rules.len(),
            "Device rules are not enforced by the filesystem backend"
        );
    }
}
