//! Exec command implementation

use anyhow::{Context, Result};
use std::path::Path;
use tether_core::{Container, ProcessId};
use tether_namespace::{DefaultCommandBuilder, StdTerminal, Terminal, TtyTerminal};

pub fn execute(root: &Path, data: &Path, command: &[String]) -> Result<i32> {
    let container = Container::load(data)
        .with_context(|| format!("Failed to load container from {}", data.display()))?;

    // The child resolves data_path after moving into the rootfs
    let data = data
        .canonicalize()
        .with_context(|| format!("Invalid data directory {}", data.display()))?;
    let rootfs = root
        .canonicalize()
        .with_context(|| format!("Invalid root filesystem {}", root.display()))?;

    let mut terminal: Box<dyn Terminal> = if container.tty {
        Box::new(TtyTerminal::new())
    } else {
        Box::new(StdTerminal::new())
    };

    tracing::info!(rootfs = %rootfs.display(), command = ?command, "Launching container");
    let mut on_released = |pid: ProcessId| tracing::info!(pid = %pid, "Container running");

    let code = tether_namespace::exec(
        &container,
        terminal.as_mut(),
        &rootfs,
        &data,
        command,
        &DefaultCommandBuilder,
        Some(&mut on_released),
    )
    .context("Container launch failed")?;

    tracing::info!(code, "Container exited");
    Ok(code)
}
