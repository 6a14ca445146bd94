//! Error types for the engine.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by registry, lifecycle and persistence operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Brick '{0}' is not configured")]
    BadConfig(String),

    #[error("Brick '{0}' is not connected")]
    NotConnected(String),

    #[error("Network loop detected while starting '{0}'")]
    LinkLoop(String),

    #[error("Unmanaged type: {0}")]
    UnmanagedType(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Invalid value '{value}' for '{key}'")]
    InvalidValue { key: String, value: String },

    #[error("No such brick, event or socket: {0}")]
    NotFound(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Management console {} not responding after {attempts} attempts", path.display())]
    ConsoleUnavailable { path: PathBuf, attempts: u32 },

    #[error("Process error: {0}")]
    Process(String),

    #[error("Line {line}: {reason}")]
    Persistence { line: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System error: {0}")]
    Nix(#[from] nix::errno::Errno),
}

impl EngineError {
    pub(crate) fn invalid_name(name: &str, reason: &'static str) -> Self {
        EngineError::InvalidName {
            name: name.to_string(),
            reason,
        }
    }

    pub(crate) fn invalid_value(key: &str, value: &str) -> Self {
        EngineError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
