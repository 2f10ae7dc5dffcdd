use std::time::Duration;
use thiserror::Error;

/// Capture core error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Recorder construction failed: {0}")]
    DeviceInitFailure(String),

    #[error("Recorder command '{command}' failed: {reason}")]
    DeviceCommandFailure { command: String, reason: String },

    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("Timed out after {waited:?} waiting for {what}")]
    TimeoutExceeded { what: String, waited: Duration },

    #[error("No recorder prepared")]
    NotPrepared,

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

impl CaptureError {
    pub fn command(command: &str, reason: impl ToString) -> Self {
        CaptureError::DeviceCommandFailure {
            command: command.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for the kinds that the session absorbs and continues past
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CaptureError::DeviceCommandFailure { .. } | CaptureError::TimeoutExceeded { .. }
        )
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::IoFailure(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::IoFailure(err.to_string())
    }
}

/// Result type for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;
