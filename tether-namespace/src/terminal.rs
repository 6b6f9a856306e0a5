//! Container stdio
//!
//! [`StdTerminal`] lets the child inherit the supervisor's stdio.
//! [`TtyTerminal`] gives it a pseudo-terminal and, once the child is running,
//! relays between the pty master and the supervisor's own stdin/stdout.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use nix::fcntl::OFlag;
use nix::pty::{PtyMaster, grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::termios::{SetArg, Termios, cfmakeraw, tcgetattr, tcsetattr};
use nix::unistd::isatty;
use tracing::{debug, warn};
use tether_core::{Error, Result};

use crate::command::ContainerCommand;

/// Where the container's stdio goes
pub trait Terminal: Send {
    /// Take ownership of the pty master allocated for a `tty` container
    fn set_master(&mut self, master: PtyMaster);

    /// Wire the command's stdio before it is spawned
    ///
    /// # Errors
    /// Returns `Terminal` if the command cannot be attached
    fn attach(&mut self, command: &mut ContainerCommand) -> Result<()>;

    /// Begin relaying I/O once the child holds the console
    ///
    /// # Errors
    /// Returns `Terminal` if the relay cannot be set up
    fn start(&mut self) -> Result<()>;

    /// Release everything `attach` acquired
    ///
    /// # Errors
    /// Returns `Terminal` if the supervisor's terminal cannot be restored
    fn close(&mut self) -> Result<()>;
}

/// Allocate a pty pair, returning the master and the slave's path
///
/// # Errors
/// Returns `Terminal` if no pty can be allocated
pub fn create_master_and_console() -> Result<(PtyMaster, PathBuf)> {
    let terminal_err = |step: &str, e: nix::Error| Error::Terminal {
        message: format!("{step} failed: {e}"),
    };

    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)
        .map_err(|e| terminal_err("posix_openpt", e))?;
    grantpt(&master).map_err(|e| terminal_err("grantpt", e))?;
    unlockpt(&master).map_err(|e| terminal_err("unlockpt", e))?;
    let console = ptsname_r(&master).map_err(|e| terminal_err("ptsname", e))?;

    debug!(console = %console, "Allocated pty");
    Ok((master, PathBuf::from(console)))
}

/// Child inherits the supervisor's stdin, stdout and stderr
#[derive(Debug, Default)]
pub struct StdTerminal {
    master: Option<PtyMaster>,
}

impl StdTerminal {
    /// Create a terminal that passes stdio through
    #[must_use]
    pub const fn new() -> Self {
        Self { master: None }
    }
}

impl Terminal for StdTerminal {
    fn set_master(&mut self, master: PtyMaster) {
        self.master = Some(master);
    }

    fn attach(&mut self, _command: &mut ContainerCommand) -> Result<()> {
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.master = None;
        Ok(())
    }
}

/// Interactive pseudo-terminal session
#[derive(Debug, Default)]
pub struct TtyTerminal {
    master: Option<PtyMaster>,
    saved: Option<Termios>,
    output: Option<JoinHandle<()>>,
}

impl TtyTerminal {
    /// Create an unattached session
    #[must_use]
    pub const fn new() -> Self {
        Self {
            master: None,
            saved: None,
            output: None,
        }
    }

    fn master_file(master: &PtyMaster) -> Result<File> {
        let fd = master.as_fd().try_clone_to_owned().map_err(|e| Error::Terminal {
            message: format!("Failed to duplicate pty master: {e}"),
        })?;
        Ok(File::from(fd))
    }

    /// Put the supervisor's terminal in raw mode so keystrokes reach the child
    fn make_raw(&mut self) -> Result<()> {
        let stdin = io::stdin();
        if !isatty(stdin.as_fd()).unwrap_or(false) {
            return Ok(());
        }

        let original = tcgetattr(stdin.as_fd()).map_err(|e| Error::Terminal {
            message: format!("tcgetattr failed: {e}"),
        })?;
        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw).map_err(|e| Error::Terminal {
            message: format!("tcsetattr failed: {e}"),
        })?;

        self.saved = Some(original);
        Ok(())
    }
}

impl Terminal for TtyTerminal {
    fn set_master(&mut self, master: PtyMaster) {
        self.master = Some(master);
    }

    fn attach(&mut self, command: &mut ContainerCommand) -> Result<()> {
        let master = self.master.as_ref().ok_or_else(|| Error::Terminal {
            message: "No pty master to attach".to_string(),
        })?;

        let console = ptsname_r(master).map_err(|e| Error::Terminal {
            message: format!("ptsname failed: {e}"),
        })?;
        command.set_console(&console);

        debug!(console = %console, "Terminal attached");
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        // Reads on the master block until a slave has been opened, so the
        // relays only run once the child holds the console
        let master = self.master.as_ref().ok_or_else(|| Error::Terminal {
            message: "No pty master to relay".to_string(),
        })?;
        let mut input = Self::master_file(master)?;
        let mut output = Self::master_file(master)?;
        self.make_raw()?;

        // Blocks on stdin forever once the child is gone; never joined
        thread::spawn(move || {
            let _ = io::copy(&mut io::stdin().lock(), &mut input);
        });

        self.output = Some(thread::spawn(move || {
            let mut stdout = io::stdout();
            // EIO once the last slave descriptor closes
            let _ = io::copy(&mut output, &mut stdout);
            let _ = stdout.flush();
        }));

        debug!("Terminal relay started");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.master = None;

        if let Some(output) = self.output.take()
            && output.join().is_err()
        {
            warn!("Terminal output relay panicked");
        }

        if let Some(saved) = self.saved.take() {
            tcsetattr(io::stdin().as_fd(), SetArg::TCSANOW, &saved).map_err(|e| Error::Terminal {
                message: format!("Failed to restore terminal: {e}"),
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_create_master_and_console() {
        let (_master, console) = create_master_and_console().unwrap();
        assert!(console.starts_with("/dev/pts/"));
        assert!(console.exists());
    }

    #[test]
    fn test_std_terminal_leaves_command_alone() {
        let mut terminal = StdTerminal::new();
        let mut command = ContainerCommand::new("/bin/true");

        terminal.attach(&mut command).unwrap();
        assert!(command.get_console().is_none());
        terminal.close().unwrap();
    }

    #[test]
    fn test_tty_requires_master() {
        let mut terminal = TtyTerminal::new();
        let mut command = ContainerCommand::new("/bin/true");

        let err = terminal.attach(&mut command).unwrap_err();
        assert!(matches!(err, Error::Terminal { .. }));
    }

    #[test]
    fn test_tty_attach_sets_console() {
        let (master, console) = create_master_and_console().unwrap();
        let mut terminal = TtyTerminal::new();
        terminal.set_master(master);

        let mut command = ContainerCommand::new("/bin/true");
        terminal.attach(&mut command).unwrap();
        assert_eq!(command.get_console(), Some(Path::new(&console)));
    }

    #[test]
    fn test_tty_close_without_start_returns() {
        let (master, _console) = create_master_and_console().unwrap();
        let mut terminal = TtyTerminal::new();
        terminal.set_master(master);

        let mut command = ContainerCommand::new("/bin/true");
        terminal.attach(&mut command).unwrap();

        terminal.close().unwrap();
        assert!(terminal.output.is_none());
    }

    #[test]
    fn test_tty_start_requires_master() {
        let err = TtyTerminal::new().start().unwrap_err();
        assert!(matches!(err, Error::Terminal { .. }));
    }
}
