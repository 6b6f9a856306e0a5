//! Error types for Tether

use thiserror::Error;

/// Tether error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System error from nix
    #[error("System error: {0}")]
    System(#[from] nix::Error),

    /// Payload or configuration could not be (de)serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Synchronization pipe failure
    #[error("Sync pipe error: {message}")]
    Pipe {
        /// Error message
        message: String,
    },

    /// Terminal allocation or attachment failed
    #[error("Terminal error: {message}")]
    Terminal {
        /// Error message
        message: String,
    },

    /// Child process could not be started
    #[error("Spawn error: {message}")]
    Spawn {
        /// Error message
        message: String,
    },

    /// Pid bookkeeping record could not be written or read
    #[error("Pid record error: {message}")]
    PidRecord {
        /// Error message
        message: String,
    },

    /// `CGroup` operation failed
    #[error("CGroup error: {message}")]
    CGroup {
        /// Error message
        message: String,
    },

    /// Network setup failed
    #[error("Network error: {message}")]
    Network {
        /// Error message
        message: String,
    },

    /// Netlink request rejected by the kernel
    #[error("Netlink error: {message}")]
    Netlink {
        /// Error message
        message: String,
    },

    /// Named network interface does not exist
    #[error("Interface not found: {name}")]
    InterfaceNotFound {
        /// Interface name
        name: String,
    },

    /// No network strategy registered for this type
    #[error("Unknown network strategy: {kind}")]
    UnknownStrategy {
        /// Requested strategy type
        kind: String,
    },

    /// Namespace operation failed
    #[error("Namespace error: {message}")]
    Namespace {
        /// Error message
        message: String,
    },

    /// Child exit status could not be observed
    #[error("Wait error: {message}")]
    Wait {
        /// Error message
        message: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },
}

/// Result type alias for Tether operations
pub type Result<T> = std::result::Result<T, Error>;
