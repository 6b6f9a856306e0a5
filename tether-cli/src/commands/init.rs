//! Init command implementation

use anyhow::{Context, Result};

pub fn execute(command: &[String]) -> Result<i32> {
    // Only returns if the program could not be started
    match tether_namespace::init(command).context("Container init failed")? {}
}
