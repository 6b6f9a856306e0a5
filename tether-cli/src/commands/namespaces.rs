//! Namespaces command implementation

use anyhow::{Context, Result};
use tether_core::ProcessId;
use tether_namespace::NamespaceInfo;

pub fn execute(pid: Option<i32>) -> Result<()> {
    let target = pid.map_or_else(ProcessId::current, ProcessId::from_raw);

    println!("Namespaces of PID {target}");
    println!("{:-<60}", "");

    let ns_info = NamespaceInfo::for_pid(target).context("Failed to get namespace information")?;

    print!("{ns_info}");

    match ns_info.is_isolated() {
        Ok(true) => println!("\nProcess is in isolated namespaces"),
        Ok(false) => println!("\nProcess is in host namespaces"),
        Err(e) => println!("\nFailed to check isolation: {e}"),
    }

    Ok(())
}
