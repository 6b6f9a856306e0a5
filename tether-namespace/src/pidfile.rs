//! Bookkeeping record of a running container
//!
//! The record pairs the pid with the process start time so a reader can tell
//! the container's process apart from an unrelated process that later reused
//! the pid.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use tether_core::{Error, ProcessId, Result};

/// File name of the record inside the data directory
pub const PID_FILE: &str = "pid";

/// Stores and removes the record of a started container
pub trait PidStore: Send + Sync {
    /// Record `pid`, started at `started`, for the container in `data_path`
    ///
    /// # Errors
    /// Returns `PidRecord` if the record cannot be persisted
    fn write_pid(&self, data_path: &Path, pid: ProcessId, started: &str) -> Result<()>;

    /// Remove the record; a missing record is not an error
    ///
    /// # Errors
    /// Returns `PidRecord` if an existing record cannot be removed
    fn delete_pid(&self, data_path: &Path) -> Result<()>;
}

/// Contents of the pid file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidRecord {
    /// Container process in the supervisor's pid namespace
    pub pid: ProcessId,

    /// Start time in clock ticks since boot, as read from `/proc`
    pub started: String,
}

impl PidRecord {
    /// Read the record kept in `data_path`
    ///
    /// # Errors
    /// Returns error if the record is missing or malformed
    pub fn read(data_path: &Path) -> Result<Self> {
        let path = data_path.join(PID_FILE);
        let raw = fs::read(&path).map_err(|e| Error::PidRecord {
            message: format!("cannot read {}: {e}", path.display()),
        })?;

        Ok(serde_json::from_slice(&raw)?)
    }

    /// Whether the recorded process is still the one that was started
    #[must_use]
    pub fn is_running(&self) -> bool {
        process_start_time(self.pid).is_ok_and(|started| started == self.started)
    }
}

/// Record kept as `<data_path>/pid`
#[derive(Debug, Default, Clone, Copy)]
pub struct PidFile;

impl PidStore for PidFile {
    fn write_pid(&self, data_path: &Path, pid: ProcessId, started: &str) -> Result<()> {
        let record = PidRecord {
            pid,
            started: started.to_string(),
        };
        let path = data_path.join(PID_FILE);
        let staging = data_path.join(format!(".{PID_FILE}.tmp"));

        let write = || -> std::io::Result<()> {
            fs::write(&staging, serde_json::to_vec(&record)?)?;
            fs::rename(&staging, &path)
        };

        write().map_err(|e| {
            let _ = fs::remove_file(&staging);
            Error::PidRecord {
                message: format!("cannot write {}: {e}", path.display()),
            }
        })?;

        debug!(pid = %pid, path = %path.display(), "Pid recorded");
        Ok(())
    }

    fn delete_pid(&self, data_path: &Path) -> Result<()> {
        let path = data_path.join(PID_FILE);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Pid record removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::PidRecord {
                message: format!("cannot remove {}: {e}", path.display()),
            }),
        }
    }
}

/// Start time of `pid` in clock ticks since boot
///
/// Field 22 of `/proc/<pid>/stat`, counted after the closing parenthesis
/// of the command name since the name may itself contain spaces and `)`.
///
/// # Errors
/// Returns error if the process does not exist or the stat line is malformed
pub fn process_start_time(pid: ProcessId) -> Result<String> {
    let path = pid.proc_path("stat");
    let stat = fs::read_to_string(&path)?;

    let malformed = || Error::PidRecord {
        message: format!("malformed {path}"),
    };

    let (_, rest) = stat.rsplit_once(')').ok_or_else(malformed)?;
    // rest starts at field 3 (state)
    rest.split_whitespace()
        .nth(22 - 3)
        .map(str::to_string)
        .ok_or_else(malformed)
}
