/// regscan error types and retry utilities
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScanError>;

/// Main error type for scanner operations
#[derive(Debug, Error)]
pub enum ScanError {
    /// Network or connection failure talking to a registry or the controller
    #[error("Transport error talking to {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    /// Registry answered, but the document is unusable
    #[error("Registry API error for {reference}: {reason}")]
    Protocol { reference: String, reason: String },

    /// Missing or malformed user input
    #[error("Invalid input: {0}")]
    Input(String),

    /// Host does not expose the expected container runtime introspection
    #[error("Unsupported environment: {0}")]
    Environment(String),

    /// Local vulnerability database could not be read
    #[error("Database error at {path}: {reason}")]
    Database { path: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ScanError {
    pub fn transport(endpoint: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub fn protocol(reference: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Protocol {
            reference: reference.into(),
            reason: reason.to_string(),
        }
    }

    /// Wire code reported in a scan result for this error
    pub fn code(&self) -> ScanErrorCode {
        match self {
            Self::Transport { .. } => ScanErrorCode::RegistryApi,
            Self::Protocol { .. } => ScanErrorCode::RegistryApi,
            Self::Input(_) => ScanErrorCode::Internal,
            Self::Environment(_) => ScanErrorCode::Unsupported,
            Self::Database { .. } => ScanErrorCode::DatabaseUnavailable,
            Self::Io(_) | Self::Json(_) => ScanErrorCode::Internal,
        }
    }
}

/// Error code carried inside a scan result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanErrorCode {
    #[default]
    None,
    RegistryApi,
    DatabaseUnavailable,
    Unsupported,
    Internal,
}

impl std::fmt::Display for ScanErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "succeeded",
            Self::RegistryApi => "registry API call failed",
            Self::DatabaseUnavailable => "vulnerability database unavailable",
            Self::Unsupported => "unsupported",
            Self::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// Helper to determine if an error is worth retrying by a long-running loop
pub fn is_retryable(err: &ScanError) -> bool {
    match err {
        ScanError::Transport { .. } => true,
        ScanError::Database { .. } => true,
        ScanError::Io(_) => true,
        ScanError::Protocol { .. } => false,
        ScanError::Input(_) => false,
        ScanError::Environment(_) => false,
        ScanError::Json(_) => false,
    }
}

/// Fixed-interval retry policy. `max_attempts == 0` means retry forever.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn unlimited(interval: Duration) -> Self {
        Self {
            max_attempts: 0,
            interval,
        }
    }

    pub fn bounded(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }
}
