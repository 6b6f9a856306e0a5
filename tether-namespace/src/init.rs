//! Child side of a launch
//!
//! Runs as the first program inside the new namespaces. It waits for the
//! supervisor to release it, finishes the network setup the supervisor began,
//! and then replaces itself with the container's program.

use std::convert::Infallible;
use std::env;
use std::ffi::CString;
use std::path::PathBuf;

use nix::unistd::{execvpe, sethostname};
use tracing::{debug, info};
use tether_core::{Container, Context, Error, Result};
use tether_network::{Netlink, get_strategy};

use crate::sync_pipe::{SYNC_PIPE_FD, SyncPipe};

/// Environment variable naming the inherited sync pipe descriptor
pub const PIPE_ENV: &str = "pipe";

/// Environment variable naming the container's data directory
pub const DATA_PATH_ENV: &str = "data_path";

/// Environment variable naming the console slave, empty without a tty
pub const CONSOLE_ENV: &str = "console";

/// Parameters the supervisor passes through the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitParams {
    /// Inherited sync pipe descriptor
    pub pipe: i32,
    /// Directory holding `container.json`
    pub data_path: PathBuf,
    /// Console slave, if any
    pub console: Option<PathBuf>,
}

impl InitParams {
    /// Read the parameters from the process environment
    ///
    /// # Errors
    /// Returns `InvalidConfig` if `data_path` is unset or `pipe` is not a number
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let pipe = match lookup(PIPE_ENV) {
            Some(raw) => raw.parse().map_err(|_| Error::InvalidConfig {
                message: format!("{PIPE_ENV}={raw} is not a descriptor"),
            })?,
            None => SYNC_PIPE_FD,
        };

        let data_path = lookup(DATA_PATH_ENV)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| Error::InvalidConfig {
                message: format!("{DATA_PATH_ENV} is not set"),
            })?;

        let console = lookup(CONSOLE_ENV)
            .filter(|console| !console.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            pipe,
            data_path,
            console,
        })
    }
}

/// Wait for release, finish setup, and exec `args`
///
/// Only returns on failure.
///
/// # Errors
/// Returns error if any step fails; the caller should exit non-zero
pub fn init(args: &[String]) -> Result<Infallible> {
    let program = args.first().ok_or_else(|| Error::InvalidConfig {
        message: "no program to run".to_string(),
    })?;

    let params = InitParams::from_env()?;
    debug!(pipe = params.pipe, data_path = %params.data_path.display(), console = ?params.console, "Container init starting");

    let context = SyncPipe::inherited(params.pipe)?
        .read_from_parent()?
        .unwrap_or_else(Context::new);

    let container = Container::load(&params.data_path)?;

    for network in &container.networks {
        let strategy = get_strategy(&network.kind)?;
        debug!(strategy = strategy.name(), "Initializing network");
        strategy.initialize(&Netlink, network, &context)?;
    }

    if container.namespace_enabled("NEWUTS")
        && let Some(hostname) = &container.hostname
    {
        sethostname(hostname).map_err(|e| Error::Namespace {
            message: format!("Failed to set hostname {hostname}: {e}"),
        })?;
    }

    if let Some(dir) = &container.working_dir {
        env::set_current_dir(dir).map_err(|e| Error::InvalidConfig {
            message: format!("Cannot enter working directory {dir}: {e}"),
        })?;
    }

    let to_c = |value: &String| {
        CString::new(value.as_str()).map_err(|_| Error::InvalidConfig {
            message: format!("{value:?} contains a NUL byte"),
        })
    };
    let argv = args.iter().map(to_c).collect::<Result<Vec<_>>>()?;
    let envp = container.env.iter().map(to_c).collect::<Result<Vec<_>>>()?;
    let program = to_c(program)?;

    info!(program = ?program, "Starting container program");
    execvpe(&program, &argv, &envp).map_err(|e| Error::Spawn {
        message: format!("Failed to exec {program:?}: {e}"),
    })
}
