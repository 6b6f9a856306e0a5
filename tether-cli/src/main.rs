//! Tether CLI
//!
//! Launches containers described by `container.json` and doubles as the
//! init program that runs inside them.

use clap::Parser;
use std::process;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::Cli;

fn main() {
    let cli = Cli::parse();

    // stdout belongs to the container's program
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match commands::dispatch(cli.command) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(1);
        }
    }
}
