//! Tether Namespace - Launching containers in isolated namespaces
//!
//! This crate owns the launch sequence:
//! - Namespace registry - configuration keys to clone flags
//! - Sync pipe - releases the child once the supervisor is done
//! - Command spawning - clone(2) into the requested namespaces
//! - Launcher - pid record, cgroups, networking, wait and teardown
//! - Init - the child-side half of the handshake

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod command;
pub mod exec;
pub mod init;
pub mod netns;
pub mod pidfile;
pub mod registry;
pub mod sync_pipe;
pub mod terminal;

pub use command::{
    ChildProcess, CommandBuilder, CommandParams, ContainerCommand, DefaultCommandBuilder, SELF_EXE,
};
pub use exec::{Launcher, exec, initialize_networking, setup_cgroups, teardown_networking};
pub use init::{InitParams, init};
pub use netns::{NetNs, NetNsGuard};
pub use pidfile::{PID_FILE, PidFile, PidRecord, PidStore, process_start_time};
pub use registry::{
    NAMESPACES, Namespace, NamespaceInfo, enabled_namespaces, get_namespace, get_namespace_flags,
};
pub use sync_pipe::{SYNC_PIPE_FD, SyncPipe};
pub use terminal::{StdTerminal, Terminal, TtyTerminal, create_master_and_console};
