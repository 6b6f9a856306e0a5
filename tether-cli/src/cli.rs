//! CLI argument definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Launch processes in isolated Linux containers", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a program in a new container and wait for it
    Exec {
        /// Root filesystem the program starts in
        #[arg(long)]
        root: PathBuf,

        /// Directory holding container.json
        #[arg(long)]
        data: PathBuf,

        /// Program and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Container-side entry point (started by exec)
    #[command(hide = true)]
    Init {
        /// Program and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Show namespace information
    Namespaces {
        /// Process ID (default: current process)
        #[arg(short, long)]
        pid: Option<i32>,
    },
}
