use crate::cli::Commands;
use anyhow::Result;

pub mod exec;
pub mod init;
pub mod namespaces;

/// Dispatch command to appropriate handler, returning the exit code
pub fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Exec {
            root,
            data,
            command,
        } => exec::execute(&root, &data, &command),

        Commands::Init { command } => init::execute(&command),

        Commands::Namespaces { pid } => namespaces::execute(pid).map(|()| 0),
    }
}
