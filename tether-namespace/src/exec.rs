//! Container launch
//!
//! [`Launcher::exec`] drives one container from an empty sync pipe to a reaped
//! child. Setup steps run in a fixed order; a failing step kills and reaps the
//! child, unwinds what the earlier steps acquired and returns the error. Once
//! the child has been released, every teardown step runs regardless of how the
//! others fared and only logs its own failure.

use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};
use tether_cgroup::{ActiveCgroup, CgroupBackend};
use tether_core::{Container, Context, Error, ProcessId, Result};
use tether_network::{InterfaceOps, Netlink, get_strategy};

use crate::command::{CommandBuilder, CommandParams, SELF_EXE};
use crate::netns::{NetNs, NetNsGuard};
use crate::pidfile::{PidFile, PidStore, process_start_time};
use crate::sync_pipe::SyncPipe;
use crate::terminal::{Terminal, create_master_and_console};

pub use crate::registry::get_namespace_flags;

type CgroupHandle = Option<Box<dyn ActiveCgroup>>;

/// Collaborators used to launch containers
pub struct Launcher {
    pid_store: Box<dyn PidStore>,
    cgroups: Box<dyn CgroupBackend>,
    ops: Box<dyn InterfaceOps>,
    init: PathBuf,
}

impl Default for Launcher {
    fn default() -> Self {
        Self {
            pid_store: Box::new(PidFile),
            cgroups: tether_cgroup::select_backend(),
            ops: Box::new(Netlink),
            init: PathBuf::from(SELF_EXE),
        }
    }
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("cgroups", &self.cgroups.name())
            .field("init", &self.init)
            .finish_non_exhaustive()
    }
}

fn log_teardown(step: &str, pid: ProcessId, result: Result<()>) {
    if let Err(e) = result {
        warn!(pid = %pid, step, error = %e, "Teardown step failed");
    }
}

fn log_best_effort(op: &str, iface: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!(iface, op, error = %e, "Interface operation failed");
    }
}

impl Launcher {
    /// Launcher with the production collaborators
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pid bookkeeping
    #[must_use]
    pub fn with_pid_store(mut self, pid_store: impl PidStore + 'static) -> Self {
        self.pid_store = Box::new(pid_store);
        self
    }

    /// Replace the cgroup backend
    #[must_use]
    pub fn with_cgroup_backend(mut self, backend: impl CgroupBackend + 'static) -> Self {
        self.cgroups = Box::new(backend);
        self
    }

    /// Replace the interface primitives
    #[must_use]
    pub fn with_interface_ops(mut self, ops: impl InterfaceOps + 'static) -> Self {
        self.ops = Box::new(ops);
        self
    }

    /// Program handed to the command builder as the container's init
    #[must_use]
    pub fn with_init(mut self, init: impl Into<PathBuf>) -> Self {
        self.init = init.into();
        self
    }

    /// Launch `args` in a new container and wait for it
    ///
    /// `on_released` runs right after the child has been released, while it
    /// is running.
    ///
    /// # Errors
    /// Returns the first setup failure, after the child (if any) has been
    /// killed and reaped; or `Wait` if the exit status cannot be observed.
    /// A non-zero exit code is not an error.
    #[allow(clippy::too_many_arguments)]
    pub fn exec(
        &self,
        container: &Container,
        terminal: &mut dyn Terminal,
        rootfs: &Path,
        data_path: &Path,
        args: &[String],
        builder: &dyn CommandBuilder,
        on_released: Option<&mut dyn FnMut(ProcessId)>,
    ) -> Result<i32> {
        let mut pipe = SyncPipe::new()?;

        let console = if container.tty {
            let (master, console) = create_master_and_console()?;
            terminal.set_master(master);
            Some(console)
        } else {
            None
        };

        let child_fd = pipe.child_fd().ok_or_else(|| Error::Pipe {
            message: "Sync pipe has no child end".to_string(),
        })?;
        let mut command = builder.build(&CommandParams {
            container,
            console: console.as_deref(),
            rootfs,
            data_path,
            init: &self.init,
            pipe: child_fd,
            args,
        })?;
        terminal.attach(&mut command)?;

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "Failed to start container");
                Self::release_terminal(terminal, None);
                return Err(e);
            }
        };
        pipe.close_child();
        let pid = child.pid();

        // Held until teardown so the namespace and its interfaces survive
        // the child and a reused pid cannot redirect the switch
        let netns = NetNs::open(pid)
            .inspect_err(|e| warn!(pid = %pid, error = %e, "Cannot hold container network namespace"))
            .ok();

        if let Err(e) = terminal.start() {
            error!(pid = %pid, error = %e, "Failed to start terminal relay");
            child.kill_and_reap();
            Self::release_terminal(terminal, Some(pid));
            return Err(e);
        }

        if let Err(e) = self.record(data_path, pid) {
            error!(pid = %pid, error = %e, "Failed to record container");
            child.kill_and_reap();
            self.unwind(pid, None, data_path, terminal);
            return Err(e);
        }

        let mut cgroup = match self.setup_cgroups(container, pid) {
            Ok(cgroup) => cgroup,
            Err(e) => {
                error!(pid = %pid, error = %e, "Failed to apply cgroups");
                child.kill_and_reap();
                self.unwind(pid, None, data_path, terminal);
                return Err(e);
            }
        };

        if let Err(e) = self.initialize_networking(container, pid, &mut pipe) {
            error!(pid = %pid, error = %e, "Failed to set up networking");
            child.kill_and_reap();
            self.unwind(pid, Some(&mut cgroup), data_path, terminal);
            return Err(e);
        }

        pipe.close();
        info!(pid = %pid, "Container released");

        if let Some(on_released) = on_released {
            on_released(pid);
        }

        let status = child.wait();

        self.teardown_networking(container, pid, netns.as_ref());
        drop(netns);
        self.unwind(pid, Some(&mut cgroup), data_path, terminal);

        status
    }

    fn record(&self, data_path: &Path, pid: ProcessId) -> Result<()> {
        let started = process_start_time(pid)?;
        self.pid_store.write_pid(data_path, pid, &started)
    }

    /// Release everything acquired after the child was recorded
    fn unwind(
        &self,
        pid: ProcessId,
        cgroup: Option<&mut CgroupHandle>,
        data_path: &Path,
        terminal: &mut dyn Terminal,
    ) {
        if let Some(cgroup) = cgroup {
            log_teardown("cgroup", pid, tether_cgroup::cleanup(cgroup));
        }
        log_teardown("pid record", pid, self.pid_store.delete_pid(data_path));
        Self::release_terminal(terminal, Some(pid));
    }

    fn release_terminal(terminal: &mut dyn Terminal, pid: Option<ProcessId>) {
        if let Err(e) = terminal.close() {
            warn!(pid = ?pid.map(ProcessId::as_raw), error = %e, "Failed to close terminal");
        }
    }

    /// Place `pid` in the container's cgroup, if it has limits
    ///
    /// # Errors
    /// Returns the backend's error; nothing is left behind on failure
    pub fn setup_cgroups(&self, container: &Container, pid: ProcessId) -> Result<CgroupHandle> {
        tether_cgroup::apply_with(self.cgroups.as_ref(), container.cgroups.as_ref(), pid)
    }

    /// Build every configured network for `pid` and send the result down `pipe`
    ///
    /// Strategies run in configuration order and any failure is returned.
    /// Relocating host interfaces afterwards is best-effort.
    ///
    /// # Errors
    /// Returns the first strategy failure, or a pipe error if the context
    /// cannot be delivered
    pub fn initialize_networking(
        &self,
        container: &Container,
        pid: ProcessId,
        pipe: &mut SyncPipe,
    ) -> Result<()> {
        let mut context = Context::new();

        for network in &container.networks {
            let strategy = get_strategy(&network.kind)?;
            debug!(pid = %pid, strategy = strategy.name(), "Creating network");
            strategy.create(self.ops.as_ref(), network, pid, &mut context)?;
        }

        for iface in &container.network_interfaces {
            self.relocate_interface(&iface.host_iface_name, pid);
        }

        pipe.send_to_child(&context)
    }

    fn relocate_interface(&self, name: &str, pid: ProcessId) {
        debug!(iface = name, pid = %pid, "Moving interface into container");

        log_best_effort("down", name, self.ops.interface_down(name));
        log_best_effort("move", name, self.ops.set_interface_in_namespace_pid(name, pid));

        let guard = NetNsGuard::enter(pid)
            .inspect_err(|e| warn!(pid = %pid, error = %e, "Cannot enter container network namespace"))
            .ok();
        log_best_effort("up", name, self.ops.interface_up(name));
        drop(guard);
    }

    /// Return relocated interfaces to the root network namespace
    ///
    /// `netns` is the container's namespace, opened while `pid` was still
    /// the container. Without it the down and move run in the caller's
    /// namespace. Every interface gets its down, move and up attempt even
    /// when earlier ones fail. Failures are logged only.
    pub fn teardown_networking(&self, container: &Container, pid: ProcessId, netns: Option<&NetNs>) {
        for iface in &container.network_interfaces {
            let name = iface.host_iface_name.as_str();
            debug!(iface = name, pid = %pid, "Returning interface to host");

            let guard = netns.and_then(|ns| {
                NetNsGuard::enter_ns(ns)
                    .inspect_err(|e| warn!(pid = %pid, error = %e, "Cannot enter container network namespace"))
                    .ok()
            });
            log_best_effort("down", name, self.ops.interface_down(name));
            log_best_effort(
                "move",
                name,
                self.ops.set_interface_in_namespace_pid(name, ProcessId::INIT),
            );
            drop(guard);

            log_best_effort("up", name, self.ops.interface_up(name));
        }
    }
}

/// Launch a container with the production collaborators
///
/// # Errors
/// See [`Launcher::exec`]
#[allow(clippy::too_many_arguments)]
pub fn exec(
    container: &Container,
    terminal: &mut dyn Terminal,
    rootfs: &Path,
    data_path: &Path,
    args: &[String],
    builder: &dyn CommandBuilder,
    on_released: Option<&mut dyn FnMut(ProcessId)>,
) -> Result<i32> {
    Launcher::default().exec(container, terminal, rootfs, data_path, args, builder, on_released)
}

/// Apply the container's cgroup limits to `pid` with the host's backend
///
/// # Errors
/// See [`Launcher::setup_cgroups`]
pub fn setup_cgroups(container: &Container, pid: ProcessId) -> Result<CgroupHandle> {
    tether_cgroup::apply(container.cgroups.as_ref(), pid)
}

/// Build the container's networks with netlink
///
/// # Errors
/// See [`Launcher::initialize_networking`]
pub fn initialize_networking(container: &Container, pid: ProcessId, pipe: &mut SyncPipe) -> Result<()> {
    Launcher::default().initialize_networking(container, pid, pipe)
}

/// Return relocated interfaces with netlink
pub fn teardown_networking(container: &Container, pid: ProcessId, netns: Option<&NetNs>) {
    Launcher::default().teardown_networking(container, pid, netns);
}

