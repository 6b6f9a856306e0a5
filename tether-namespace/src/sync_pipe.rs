//! One-shot handshake between the supervisor and the container's init
//!
//! The supervisor writes at most one JSON-encoded [`Context`] and closes its
//! end. The child blocks reading until it sees end-of-file, so closing the
//! write end is the release signal whether or not a payload was sent.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use tracing::debug;
use tether_core::{Context, Error, Result};

/// Descriptor number the child finds its end of the pipe at
pub const SYNC_PIPE_FD: RawFd = 3;

/// Both ends of the handshake channel
#[derive(Debug)]
pub struct SyncPipe {
    parent: Option<File>,
    child: Option<File>,
}

impl SyncPipe {
    /// Create the pipe; both ends are close-on-exec in this process
    ///
    /// # Errors
    /// Returns error if the kernel refuses a new pipe
    pub fn new() -> Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::Pipe {
            message: format!("Failed to create sync pipe: {e}"),
        })?;

        Ok(Self {
            parent: Some(File::from(write)),
            child: Some(File::from(read)),
        })
    }

    /// Child side of a pipe inherited at `fd`
    ///
    /// # Errors
    /// Returns error if `fd` is not an open descriptor
    pub fn inherited(fd: RawFd) -> Result<Self> {
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
            return Err(Error::Pipe {
                message: format!("Sync pipe descriptor {fd} is not open"),
            });
        }

        // SAFETY: fd was handed to this process for its exclusive use
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self::from_child_fd(owned))
    }

    /// Child side of the pipe from an owned descriptor
    #[must_use]
    pub fn from_child_fd(fd: OwnedFd) -> Self {
        Self {
            parent: None,
            child: Some(File::from(fd)),
        }
    }

    /// Read end, for handing to the child at spawn time
    #[must_use]
    pub fn child_fd(&self) -> Option<BorrowedFd<'_>> {
        self.child.as_ref().map(AsFd::as_fd)
    }

    /// Serialize `context` and write it to the child
    ///
    /// # Errors
    /// Returns error if the pipe was closed or the child's end is gone
    pub fn send_to_child(&mut self, context: &Context) -> Result<()> {
        let parent = self.parent.as_mut().ok_or_else(|| Error::Pipe {
            message: "Sync pipe already closed".to_string(),
        })?;

        let payload = serde_json::to_vec(context)?;
        debug!(bytes = payload.len(), entries = context.len(), "Sending context to child");

        parent.write_all(&payload).map_err(|e| Error::Pipe {
            message: format!("Failed to send context to child: {e}"),
        })
    }

    /// Close the write end, releasing the child; later calls do nothing
    pub fn close(&mut self) {
        if self.parent.take().is_some() {
            debug!("Sync pipe closed");
        }
    }

    /// Drop this process's copy of the read end once the child holds it
    pub fn close_child(&mut self) {
        self.child = None;
    }

    /// Whether the write end has been closed
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.parent.is_none()
    }

    /// Block until the supervisor releases us
    ///
    /// Returns `None` if the supervisor closed without sending anything.
    ///
    /// # Errors
    /// Returns error if reading fails or the payload is not a context
    pub fn read_from_parent(&mut self) -> Result<Option<Context>> {
        let mut child = self.child.take().ok_or_else(|| Error::Pipe {
            message: "No read end to receive from".to_string(),
        })?;

        let mut payload = Vec::new();
        child.read_to_end(&mut payload).map_err(|e| Error::Pipe {
            message: format!("Failed to read from parent: {e}"),
        })?;

        if payload.is_empty() {
            return Ok(None);
        }

        Ok(Some(serde_json::from_slice(&payload)?))
    }
}
