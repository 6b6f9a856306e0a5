//! Spawning the container process
//!
//! [`ContainerCommand`] describes the child; [`ContainerCommand::spawn`] starts
//! it with clone(2) in its new namespaces. Everything the child needs is
//! prepared before the clone: between clone and execve the child only makes
//! raw libc calls, and reports a failure back over a close-on-exec pipe.

#![allow(unsafe_code)]

use std::ffi::{CString, c_char};
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sched::{CloneFlags, clone};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::pipe2;
use tracing::{debug, error, info, warn};
use tether_core::{Container, Error, ProcessId, Result};

use crate::registry::get_namespace_flags;
use crate::sync_pipe::SYNC_PIPE_FD;

const CHILD_STACK_SIZE: usize = 128 * 1024;

/// Description of the process to start inside the container's namespaces
#[derive(Debug, Clone)]
pub struct ContainerCommand {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<String>,
    dir: Option<PathBuf>,
    clone_flags: CloneFlags,
    pdeath_signal: Option<Signal>,
    sync_fd: Option<RawFd>,
    console: Option<PathBuf>,
}

impl ContainerCommand {
    /// Command running `program` with `program` as `argv[0]`
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        Self {
            args: vec![program.to_string_lossy().into_owned()],
            program,
            env: Vec::new(),
            dir: None,
            clone_flags: CloneFlags::empty(),
            pdeath_signal: None,
            sync_fd: None,
            console: None,
        }
    }

    /// Append one argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append `KEY=value` environment entries
    #[must_use]
    pub fn envs<I, S>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env.extend(env.into_iter().map(Into::into));
        self
    }

    /// Working directory of the child
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Namespaces the child is created in
    #[must_use]
    pub const fn clone_flags(mut self, flags: CloneFlags) -> Self {
        self.clone_flags = flags;
        self
    }

    /// Signal delivered to the child if the supervisor dies first
    #[must_use]
    pub const fn pdeath_signal(mut self, signal: Signal) -> Self {
        self.pdeath_signal = Some(signal);
        self
    }

    /// Descriptor installed in the child as [`SYNC_PIPE_FD`]
    #[must_use]
    pub fn sync_pipe(mut self, fd: BorrowedFd<'_>) -> Self {
        self.sync_fd = Some(fd.as_raw_fd());
        self
    }

    /// Make `console` the child's controlling terminal and stdio
    pub fn set_console(&mut self, console: impl Into<PathBuf>) {
        self.console = Some(console.into());
    }

    /// Program path
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Full argument vector including `argv[0]`
    #[must_use]
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Environment entries
    #[must_use]
    pub fn get_env(&self) -> &[String] {
        &self.env
    }

    /// Working directory, if set
    #[must_use]
    pub fn get_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Namespaces to create
    #[must_use]
    pub const fn get_clone_flags(&self) -> CloneFlags {
        self.clone_flags
    }

    /// Console the child will be attached to
    #[must_use]
    pub fn get_console(&self) -> Option<&Path> {
        self.console.as_deref()
    }

    /// Start the child
    ///
    /// Returns once the child has either exec'd its program or failed to.
    ///
    /// # Errors
    /// Returns `Spawn` if clone fails or the child cannot exec; in the latter
    /// case the child has already been reaped
    pub fn spawn(&self) -> Result<ChildProcess> {
        let image = ExecImage::prepare(self)?;

        let (err_read, err_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::Spawn {
            message: format!("Failed to create error pipe: {e}"),
        })?;
        let err_write = move_above_sync_fd(err_write)?;
        let err_fd = err_write.as_raw_fd();

        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let child_fn = Box::new(|| -> isize {
            // SAFETY: runs in the freshly cloned child; only async-signal-safe
            // libc calls on memory prepared before the clone
            unsafe { image.run(err_fd) }
        });

        debug!(
            program = %self.program.display(),
            flags = ?self.clone_flags,
            "Cloning container process"
        );

        let result = unsafe { clone(child_fn, &mut stack, self.clone_flags, Some(Signal::SIGCHLD as i32)) };
        drop(err_write);

        let pid = result.map_err(|e| {
            error!(error = %e, "clone failed");
            Error::Spawn {
                message: format!("clone failed: {e}"),
            }
        })?;

        let mut child = ChildProcess::new(ProcessId::from(pid));

        let mut report = Vec::new();
        if let Err(e) = File::from(err_read).read_to_end(&mut report) {
            child.kill_and_reap();
            return Err(Error::Spawn {
                message: format!("Failed to read child status: {e}"),
            });
        }

        if let Ok(bytes) = <[u8; 4]>::try_from(report.get(..4).unwrap_or_default()) {
            let errno = Errno::from_raw(i32::from_ne_bytes(bytes));
            child.kill_and_reap();
            return Err(Error::Spawn {
                message: format!("Failed to start {}: {errno}", self.program.display()),
            });
        }

        info!(pid = %child.pid(), program = %self.program.display(), "Container process started");
        Ok(child)
    }
}

/// Keep the error pipe's write end clear of the descriptor the sync pipe is
/// moved to in the child
fn move_above_sync_fd(fd: OwnedFd) -> Result<OwnedFd> {
    if fd.as_raw_fd() > SYNC_PIPE_FD {
        return Ok(fd);
    }

    let moved = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, SYNC_PIPE_FD + 1) };
    if moved < 0 {
        return Err(Error::Spawn {
            message: format!("Failed to move error pipe: {}", std::io::Error::last_os_error()),
        });
    }

    // SAFETY: moved is a new descriptor owned by nobody else
    Ok(unsafe { OwnedFd::from_raw_fd(moved) })
}

/// Everything the child touches between clone and execve
struct ExecImage {
    program: CString,
    _args: Vec<CString>,
    _env: Vec<CString>,
    argv: Vec<*const c_char>,
    envp: Vec<*const c_char>,
    dir: Option<CString>,
    console: Option<CString>,
    sync_fd: Option<RawFd>,
    pdeath_signal: Option<i32>,
}

fn c_string(what: &str, value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| Error::Spawn {
        message: format!("{what} contains a NUL byte: {value:?}"),
    })
}

fn c_path(what: &str, path: &Path) -> Result<CString> {
    c_string(what, &path.to_string_lossy())
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

impl ExecImage {
    fn prepare(command: &ContainerCommand) -> Result<Self> {
        let args = command
            .args
            .iter()
            .map(|arg| c_string("argument", arg))
            .collect::<Result<Vec<_>>>()?;
        let env = command
            .env
            .iter()
            .map(|var| c_string("environment entry", var))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            program: c_path("program", &command.program)?,
            argv: null_terminated(&args),
            envp: null_terminated(&env),
            _args: args,
            _env: env,
            dir: command.dir.as_deref().map(|d| c_path("directory", d)).transpose()?,
            console: command
                .console
                .as_deref()
                .map(|c| c_path("console", c))
                .transpose()?,
            sync_fd: command.sync_fd,
            pdeath_signal: command.pdeath_signal.map(|s| s as i32),
        })
    }

    /// Child side: set up and exec, or report errno and exit 127
    unsafe fn run(&self, err_fd: RawFd) -> isize {
        unsafe {
            if let Some(signal) = self.pdeath_signal
                && libc::prctl(libc::PR_SET_PDEATHSIG, signal) != 0
            {
                fail(err_fd);
            }

            if let Some(console) = &self.console {
                if libc::setsid() < 0 {
                    fail(err_fd);
                }
                let fd = libc::open(console.as_ptr(), libc::O_RDWR);
                if fd < 0 || libc::ioctl(fd, libc::TIOCSCTTY, 0) < 0 {
                    fail(err_fd);
                }
                for target in 0..3 {
                    if libc::dup2(fd, target) < 0 {
                        fail(err_fd);
                    }
                }
                if fd > 2 {
                    libc::close(fd);
                }
            }

            if let Some(fd) = self.sync_fd {
                // dup2 onto itself keeps close-on-exec, so clear it by hand
                let installed = if fd == SYNC_PIPE_FD {
                    libc::fcntl(fd, libc::F_SETFD, 0)
                } else {
                    libc::dup2(fd, SYNC_PIPE_FD)
                };
                if installed < 0 {
                    fail(err_fd);
                }
            }

            if let Some(dir) = &self.dir
                && libc::chdir(dir.as_ptr()) < 0
            {
                fail(err_fd);
            }

            libc::execve(self.program.as_ptr(), self.argv.as_ptr(), self.envp.as_ptr());
            fail(err_fd)
        }
    }
}

/// Report errno to the parent and exit without running destructors
unsafe fn fail(err_fd: RawFd) -> ! {
    unsafe {
        let errno = *libc::__errno_location();
        let bytes = errno.to_ne_bytes();
        libc::write(err_fd, bytes.as_ptr().cast::<libc::c_void>(), bytes.len());
        libc::_exit(127)
    }
}

/// A started child that has not necessarily been reaped
#[derive(Debug)]
pub struct ChildProcess {
    pid: ProcessId,
    reaped: bool,
}

impl ChildProcess {
    /// Track an already started process
    #[must_use]
    pub const fn new(pid: ProcessId) -> Self {
        Self { pid, reaped: false }
    }

    /// Process ID in the supervisor's pid namespace
    #[must_use]
    pub const fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Block until the child exits
    ///
    /// A signal death is reported as `128 + signal`, like a shell does.
    ///
    /// # Errors
    /// Returns `Wait` if the exit status cannot be observed
    pub fn wait(&mut self) -> Result<i32> {
        if self.reaped {
            return Err(Error::Wait {
                message: format!("Process {} was already reaped", self.pid),
            });
        }

        loop {
            match waitpid(self.pid.as_nix_pid(), None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.reaped = true;
                    info!(pid = %self.pid, code, "Container process exited");
                    return Ok(code);
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    self.reaped = true;
                    warn!(pid = %self.pid, signal = ?signal, "Container process killed by signal");
                    return Ok(128 + signal as i32);
                }
                Ok(status) => {
                    debug!(pid = %self.pid, status = ?status, "Child status changed");
                }
                Err(Errno::EINTR) => {}
                Err(e) => {
                    error!(pid = %self.pid, error = %e, "Wait failed");
                    return Err(Error::Wait {
                        message: format!("Wait for {} failed: {e}", self.pid),
                    });
                }
            }
        }
    }

    /// SIGKILL the child and reap it
    pub fn kill_and_reap(&mut self) {
        if self.reaped {
            return;
        }

        match kill(self.pid.as_nix_pid(), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid = %self.pid, error = %e, "Failed to kill container process"),
        }

        if let Err(e) = self.wait() {
            warn!(pid = %self.pid, error = %e, "Failed to reap container process");
        }
    }
}

/// Inputs for building the container's command
#[derive(Debug, Clone, Copy)]
pub struct CommandParams<'a> {
    /// Container being launched
    pub container: &'a Container,
    /// Console slave path when a tty was requested
    pub console: Option<&'a Path>,
    /// Root filesystem, the child's working directory
    pub rootfs: &'a Path,
    /// Directory holding `container.json`
    pub data_path: &'a Path,
    /// Program run as the container's init
    pub init: &'a Path,
    /// Child end of the sync pipe
    pub pipe: BorrowedFd<'a>,
    /// User program and its arguments
    pub args: &'a [String],
}

/// Builds the command that starts a container
pub trait CommandBuilder {
    /// Build the command
    ///
    /// # Errors
    /// Returns error if the parameters cannot be turned into a command
    fn build(&self, params: &CommandParams<'_>) -> Result<ContainerCommand>;
}

/// Re-executes the current binary as `init -- <args>` inside the namespaces
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCommandBuilder;

/// Path that re-executes the running binary
pub const SELF_EXE: &str = "/proc/self/exe";

impl CommandBuilder for DefaultCommandBuilder {
    fn build(&self, params: &CommandParams<'_>) -> Result<ContainerCommand> {
        let console = params
            .console
            .map(|c| c.display().to_string())
            .unwrap_or_default();

        let env = std::env::vars_os()
            .map(|(key, value)| format!("{}={}", key.to_string_lossy(), value.to_string_lossy()))
            .chain([
                format!("console={console}"),
                format!("pipe={SYNC_PIPE_FD}"),
                format!("data_path={}", params.data_path.display()),
            ]);

        Ok(ContainerCommand::new(params.init)
            .arg("init")
            .arg("--")
            .args(params.args.iter().cloned())
            .envs(env)
            .current_dir(params.rootfs)
            .clone_flags(get_namespace_flags(&params.container.namespaces))
            .pdeath_signal(Signal::SIGKILL)
            .sync_pipe(params.pipe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_pipe::SyncPipe;
    use std::collections::HashMap;

    #[test]
    fn test_spawn_and_wait() {
        let mut child = ContainerCommand::new("/bin/sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();

        assert_eq!(child.wait().unwrap(), 3);
        assert!(child.wait().is_err());
    }

    #[test]
    fn test_signal_exit_code() {
        let mut child = ContainerCommand::new("/bin/sh")
            .args(["-c", "kill -9 $$"])
            .spawn()
            .unwrap();

        assert_eq!(child.wait().unwrap(), 128 + 9);
    }

    #[test]
    fn test_missing_program() {
        let err = ContainerCommand::new("/nonexistent/tether-init")
            .spawn()
            .unwrap_err();

        assert!(matches!(err, Error::Spawn { message } if message.contains("ENOENT")));
    }

    #[test]
    fn test_bad_working_directory() {
        let err = ContainerCommand::new("/bin/true")
            .current_dir("/nonexistent/rootfs")
            .spawn()
            .unwrap_err();

        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[test]
    fn test_environment_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = ContainerCommand::new("/bin/sh")
            .args(["-c", r#"[ "$TETHER_TEST" = yes ] && [ "$(pwd -P)" = "$EXPECTED" ]"#])
            .envs([
                "TETHER_TEST=yes".to_string(),
                format!("EXPECTED={}", dir.path().canonicalize().unwrap().display()),
            ])
            .current_dir(dir.path())
            .spawn()
            .unwrap();

        assert_eq!(child.wait().unwrap(), 0);
    }

    #[test]
    fn test_sync_pipe_installed_as_fd3() {
        let mut pipe = SyncPipe::new().unwrap();
        let command = ContainerCommand::new("/bin/sh")
            .args(["-c", "[ \"$(cat <&3)\" = '{}' ]"])
            .sync_pipe(pipe.child_fd().unwrap());

        let mut child = command.spawn().unwrap();
        pipe.close_child();

        pipe.send_to_child(&tether_core::Context::new()).unwrap();
        pipe.close();

        assert_eq!(child.wait().unwrap(), 0);
    }

    #[test]
    fn test_kill_and_reap() {
        let mut child = ContainerCommand::new("/bin/sleep").arg("30").spawn().unwrap();
        let pid = child.pid();

        child.kill_and_reap();
        child.kill_and_reap();

        assert_eq!(kill(pid.as_nix_pid(), None), Err(Errno::ESRCH));
    }

    #[test]
    fn test_default_command_builder() {
        let pipe = SyncPipe::new().unwrap();
        let mut container = Container::default();
        container.namespaces = HashMap::from([("NEWNET".to_string(), true)]);
        let args = vec!["/bin/echo".to_string(), "hi".to_string()];

        let command = DefaultCommandBuilder
            .build(&CommandParams {
                container: &container,
                console: None,
                rootfs: Path::new("/srv/rootfs"),
                data_path: Path::new("/var/lib/tether/c1"),
                init: Path::new(SELF_EXE),
                pipe: pipe.child_fd().unwrap(),
                args: &args,
            })
            .unwrap();

        assert_eq!(command.program(), Path::new(SELF_EXE));
        assert_eq!(command.get_args(), [SELF_EXE, "init", "--", "/bin/echo", "hi"]);
        assert_eq!(command.get_dir(), Some(Path::new("/srv/rootfs")));
        assert_eq!(command.get_clone_flags(), CloneFlags::CLONE_NEWNET);

        let env = command.get_env();
        assert!(env.iter().any(|e| e == "console="));
        assert!(env.iter().any(|e| e == "pipe=3"));
        assert!(env.iter().any(|e| e == "data_path=/var/lib/tether/c1"));
    }
}
