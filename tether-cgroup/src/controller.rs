//! Cgroup v2 filesystem backend

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use tether_core::{CgroupSpec, Error, ProcessId, Result};

use crate::backend::{ActiveCgroup, CgroupBackend};

/// Controllers enabled in every ancestor's `cgroup.subtree_control`
const NEEDED_CONTROLLERS: [&str; 3] = ["cpu", "memory", "pids"];

/// Backend writing directly to a cgroup v2 hierarchy
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl Default for FsBackend {
    fn default() -> Self {
        Self::with_root(crate::CGROUP_ROOT)
    }
}

impl FsBackend {
    /// Backend rooted somewhere other than `/sys/fs/cgroup`
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Hierarchy root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a spec's group lives in
    #[must_use]
    pub fn group_path(&self, spec: &CgroupSpec) -> PathBuf {
        self.root
            .join(spec.parent.trim_matches('/'))
            .join(&spec.name)
    }

    /// Make sure every level from the root down to `parent` exists and
    /// delegates the needed controllers
    fn prepare_parent(&self, parent: &Path) -> Result<()> {
        if !parent.exists() {
            debug!(path = %parent.display(), "Creating parent cgroup");
            fs::create_dir_all(parent).map_err(|e| Error::CGroup {
                message: format!("Create parent cgroup {}: {e}", parent.display()),
            })?;
        }

        let relative = parent.strip_prefix(&self.root).unwrap_or(parent);
        let mut level = self.root.clone();
        enable_controllers(&level)?;

        for component in relative.components() {
            level.push(component);
            enable_controllers(&level)?;
        }

        Ok(())
    }
}

impl CgroupBackend for FsBackend {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn apply(&self, spec: &CgroupSpec, pid: ProcessId) -> Result<Box<dyn ActiveCgroup>> {
        spec.validate()?;

        let path = self.group_path(spec);
        let parent = path.parent().ok_or_else(|| Error::InvalidConfig {
            message: format!("Invalid cgroup path: {}", path.display()),
        })?;

        self.prepare_parent(parent)?;

        let mut controller = CGroupController::create(path)?;

        let applied = controller
            .apply_limits(spec)
            .and_then(|()| controller.add_process(pid));

        if let Err(e) = applied {
            if let Err(cleanup_err) = controller.cleanup() {
                warn!(error = %cleanup_err, "Failed to remove partially applied cgroup");
            }
            return Err(e);
        }

        Ok(Box::new(controller))
    }
}

/// A created cgroup directory
///
/// Removing the directory is the only cleanup cgroupfs needs; the kernel
/// drops the control files with it.
#[derive(Debug)]
pub struct CGroupController {
    /// Full path to this group directory
    /// example: /sys/fs/cgroup/tether/my-container
    pub(crate) path: PathBuf,

    /// Whether the directory is still ours to remove
    pub(crate) active: bool,

    /// Whether this controller created the directory
    pub(crate) created: bool,
}

impl CGroupController {
    /// Create the group directory
    ///
    /// An existing directory is reused but left in place on cleanup.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created
    pub fn create(path: PathBuf) -> Result<Self> {
        let created = match fs::create_dir(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Created cgroup");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!(path = %path.display(), "Reusing existing cgroup; it will not be removed");
                false
            }
            Err(e) => {
                return Err(Error::CGroup {
                    message: format!("Failed to create cgroup directory {}: {e}", path.display()),
                });
            }
        };

        Ok(Self {
            path,
            active: true,
            created,
        })
    }

    /// Group directory
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether cleanup is still pending
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Whether the directory was created by this controller
    #[must_use]
    pub const fn is_created(&self) -> bool {
        self.created
    }

    /// Move a process into this group
    ///
    /// # Errors
    /// Returns error if the group was removed or the kernel rejects the pid
    pub fn add_process(&self, pid: ProcessId) -> Result<()> {
        debug!(pid = %pid, path = %self.path.display(), "Adding process to cgroup");
        self.write_control("cgroup.procs", &pid.as_raw().to_string())
    }

    pub(crate) fn write_control(&self, file: &str, content: &str) -> Result<()> {
        if !self.active {
            return Err(Error::CGroup {
                message: "CGroup not active".to_string(),
            });
        }

        fs::write(self.path.join(file), content).map_err(|e| Error::CGroup {
            message: format!("Write {file} in {}: {e}", self.path.display()),
        })
    }
}

impl ActiveCgroup for CGroupController {
    fn cleanup(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }

        if !self.created {
            debug!(path = %self.path.display(), "Leaving pre-existing cgroup in place");
            self.active = false;
            return Ok(());
        }

        match fs::remove_dir(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed cgroup"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Cgroup already gone");
            }
            Err(e) => {
                return Err(Error::CGroup {
                    message: format!("Remove cgroup {}: {e}", self.path.display()),
                });
            }
        }

        self.active = false;
        Ok(())
    }
}

impl Drop for CGroupController {
    /// Fallback cleanup (if explicit cleanup wasn't called)
    fn drop(&mut self) {
        if !self.active {
            return;
        }

        warn!(path = %self.path.display(), "CGroup not explicitly cleaned up, using Drop fallback");
        if let Err(e) = self.cleanup() {
            warn!(error = %e, "Drop fallback could not remove cgroup");
        }
    }
}

/// Enable missing controllers in one level's `cgroup.subtree_control`
fn enable_controllers(level: &Path) -> Result<()> {
    let control_file = level.join("cgroup.subtree_control");

    if !control_file.exists() {
        debug!(path = %control_file.display(), "Control file does not exist, skipping controller setup");
        return Ok(());
    }

    let current = fs::read_to_string(&control_file).unwrap_or_else(|e| {
        debug!(error = %e, "Could not read control file");
        String::new()
    });

    let to_enable = NEEDED_CONTROLLERS
        .iter()
        .filter(|&&controller| !current.split_whitespace().any(|c| c == controller))
        .map(|c| format!("+{c}"))
        .collect::<Vec<_>>()
        .join(" ");

    if to_enable.is_empty() {
        return Ok(());
    }

    debug!(path = %level.display(), controllers = %to_enable, "Enabling controllers");

    match fs::write(&control_file, &to_enable) {
        Ok(()) => Ok(()),
        // Controllers may be managed at a higher level
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            debug!(path = %level.display(), "Permission denied enabling controllers");
            Ok(())
        }
        Err(e) => Err(Error::CGroup {
            message: format!("Enable controllers in {}: {e}", level.display()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_path() {
        let backend = FsBackend::with_root("/sys/fs/cgroup");
        let mut spec = CgroupSpec::new("web-1");
        assert_eq!(
            backend.group_path(&spec),
            PathBuf::from("/sys/fs/cgroup/tether/web-1")
        );

        spec.parent = "/machine/tenants/".to_string();
        assert_eq!(
            backend.group_path(&spec),
            PathBuf::from("/sys/fs/cgroup/machine/tenants/web-1")
        );
    }

    #[test]
    fn test_enable_controllers_adds_missing() {
        let dir = tempfile::tempdir().unwrap();
        let control = dir.path().join("cgroup.subtree_control");
        fs::write(&control, "cpu io").unwrap();

        enable_controllers(dir.path()).unwrap();

        assert_eq!(fs::read_to_string(&control).unwrap(), "+memory +pids");
    }

    #[test]
    fn test_enable_controllers_without_control_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(enable_controllers(dir.path()).is_ok());
        assert!(!dir.path().join("cgroup.subtree_control").exists());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = CGroupController::create(dir.path().join("group")).unwrap();
        assert!(controller.is_active());

        controller.cleanup().unwrap();
        assert!(!controller.is_active());
        assert!(!dir.path().join("group").exists());

        controller.cleanup().unwrap();
    }

    #[test]
    fn test_cleanup_tolerates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group");
        let mut controller = CGroupController::create(path.clone()).unwrap();

        fs::remove_dir(&path).unwrap();

        assert!(controller.cleanup().is_ok());
    }

    #[test]
    fn test_cleanup_keeps_reused_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group");
        fs::create_dir(&path).unwrap();

        let mut controller = CGroupController::create(path.clone()).unwrap();
        assert!(!controller.is_created());

        controller.cleanup().unwrap();
        assert!(!controller.is_active());
        assert!(path.exists());

        drop(CGroupController::create(path.clone()).unwrap());
        assert!(path.exists());
    }

    #[test]
    fn test_inactive_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = CGroupController::create(dir.path().join("group")).unwrap();
        controller.cleanup().unwrap();

        assert!(controller.add_process(ProcessId::from_raw(1)).is_err());
    }

    #[test]
    fn test_drop_fallback_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group");

        drop(CGroupController::create(path.clone()).unwrap());

        assert!(!path.exists());
    }
}
