//! Error types for the creation kernel.

use thiserror::Error;

/// Cache persistence errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Cache entry is corrupt at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Kernel errors.
///
/// Errors are `Clone` so that one publish failure can be delivered to every
/// waiter and cascaded to every downstream commit.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelError {
    /// Malformed input to a protocol operation. Never retried.
    #[error("Argument error: {0}")]
    Argument(String),

    /// Operation attempted against a creation in an illegal state. Never retried.
    #[error("State error: {0}")]
    State(String),

    /// Replay produced a different canonical payload than declared.
    #[error("Payload mismatch: {0}")]
    PayloadMismatch(String),

    /// Funding, signing or broadcast failure.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// A method of a creation failed.
    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Untrusted code: {0}")]
    Trust(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl KernelError {
    pub fn needs_sync(what: impl std::fmt::Display) -> Self {
        KernelError::State(format!("{} needs sync", what))
    }

    /// True for errors that indicate an invalid or forged transaction.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KernelError::PayloadMismatch(_) | KernelError::Trust(_))
    }
}

impl From<StorageError> for KernelError {
    fn from(err: StorageError) -> Self {
        KernelError::Storage(err.to_string())
    }
}

impl From<config::ConfigError> for KernelError {
    fn from(err: config::ConfigError) -> Self {
        KernelError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        KernelError::Codec(err.to_string())
    }
}
