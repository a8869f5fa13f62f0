//! Supervisor-specific error types

use shared::SharedError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Process kill failed: PID {pid} still alive after {signal}")]
    ProcessKillFailed { pid: u32, signal: String },

    #[error("Platform tool failed: {tool}: {message}")]
    PlatformToolError { tool: String, message: String },

    #[error("Registry operation failed: {operation}: {message}")]
    RegistryError { operation: String, message: String },

    #[error("Recovery strategy {strategy} failed: {reason}")]
    RecoveryError { strategy: String, reason: String },

    #[error("Session cleanup hook failed: {message}")]
    SessionCleanupError { message: String },

    #[error("Health system is disabled after repeated internal failures")]
    Disabled,

    #[error("Configuration error: {field}")]
    ConfigurationError { field: String },

    #[error("Shared component error")]
    SharedError(#[from] SharedError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl SupervisorError {
    pub fn registry(operation: impl Into<String>, message: impl Into<String>) -> Self {
        SupervisorError::RegistryError {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn platform(tool: impl Into<String>, message: impl Into<String>) -> Self {
        SupervisorError::PlatformToolError {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn config(field: impl Into<String>) -> Self {
        SupervisorError::ConfigurationError { field: field.into() }
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
