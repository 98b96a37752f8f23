//! Error taxonomy for hotspot lifecycle operations

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HotspotError {
    #[error("Invalid hotspot configuration: {0}")]
    InvalidConfig(String),

    #[error("Required binary '{0}' is not installed")]
    DependencyMissing(String),

    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("Failed to execute '{program}': {source}")]
    ExecutionFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Failed to write config file {}: {source}", path.display())]
    ConfigWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Address {address} was not assigned to {interface}")]
    AddressAssignmentFailed { interface: String, address: String },

    #[error("Access point daemon failed to start: {0}")]
    ApDaemonFailed(String),

    #[error("Network restore incomplete; failed steps: {}", .0.join(", "))]
    RestoreIncomplete(Vec<String>),

    #[error("A hotspot session is already in progress")]
    AlreadyActive,
}

impl HotspotError {
    /// Whether this condition aborts a `start` sequence.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_)
                | Self::DependencyMissing(_)
                | Self::InterfaceNotFound(_)
                | Self::ExecutionFailed { .. }
                | Self::ApDaemonFailed(_)
                | Self::AlreadyActive
        )
    }
}

pub type HotspotResult<T> = Result<T, HotspotError>;
