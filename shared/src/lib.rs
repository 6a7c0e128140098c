//! Shared data structures and utilities for the fleet command system
//!
//! This crate contains the wire protocol types, HTTP API types, domain model,
//! configuration structures, and utilities used by both the agent and server
//! components.

pub mod api;
pub mod config;
pub mod defaults;
pub mod model;
pub mod protocol;
pub mod utils;

// Re-export commonly used types for convenience
pub use api::{ApiEnvelope, RegisterResponse};
pub use config::{AgentConfig, ServerConfig};
pub use model::{CommandHostStatus, CommandStatus, TaskPriority, TaskStatus};
pub use protocol::{CommandContent, CommandMessage, CommandResult, HostInfo, HostStatus};
pub use utils::{current_timestamp, validate_host_id};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Typed errors for control-plane operations.
///
/// Validation and conflict errors are returned to the caller without side
/// effects, transport and timeout errors become terminal state on the
/// affected command, and storage failures abort the triggering operation.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Whether the error indicates a caller mistake rather than a system fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ControlError::Validation(_) | ControlError::NotFound(_) | ControlError::Conflict(_)
        )
    }
}

#[cfg(test)]
mod tests;
