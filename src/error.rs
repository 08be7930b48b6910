use std::time::Duration;
use thiserror::Error;

// Add Result type alias
pub type Result<T> = std::result::Result<T, TelemetryError>;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Node '{node_id}' in workflow '{prompt_id}' was never started")]
    DanglingNode {
        prompt_id: String,
        node_id: String,
    },
    #[error("Unknown workflow '{prompt_id}'")]
    UnknownWorkflow {
        prompt_id: String,
    },
    #[error("Illegal state for node '{node_id}' in workflow '{prompt_id}': {message}")]
    IllegalState {
        prompt_id: String,
        node_id: String,
        message: String,
    },
    #[error("Workflow '{prompt_id}' is already in flight")]
    DuplicateWorkflow {
        prompt_id: String,
    },
    #[error("Invalid time range '{token}'")]
    InvalidRange {
        token: String,
    },
    #[error("Invalid sample for {field}: {message}")]
    InvalidSample {
        message: String,
        field: String,
    },
    #[error("Archive write failed: {message}")]
    ArchiveWrite {
        message: String,
    },
    #[error("Archive operation '{operation}' timed out after {duration:?}")]
    ArchiveTimeout {
        duration: Duration,
        operation: String,
    },
    #[error("Archive not found: {filename}")]
    ArchiveNotFound {
        filename: String,
    },
    #[error("Invalid archive name: {filename}")]
    InvalidArchiveName {
        filename: String,
    },
    #[error("Configuration error for {parameter}: {message}")]
    Configuration {
        message: String,
        parameter: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TelemetryError {
    pub(crate) fn illegal_state(
        prompt_id: impl Into<String>,
        node_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        TelemetryError::IllegalState {
            prompt_id: prompt_id.into(),
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid_sample(field: impl Into<String>, message: impl Into<String>) -> Self {
        TelemetryError::InvalidSample {
            message: message.into(),
            field: field.into(),
        }
    }
}

/// Extension trait for error handling utilities
pub trait ErrorExt {
    /// Whether the error concerns a single ingest event and leaves other state untouched
    fn is_event_level(&self) -> bool;
    fn is_recoverable(&self) -> bool;
}

impl ErrorExt for TelemetryError {
    fn is_event_level(&self) -> bool {
        matches!(
            self,
            TelemetryError::DanglingNode { .. }
                | TelemetryError::UnknownWorkflow { .. }
                | TelemetryError::IllegalState { .. }
                | TelemetryError::DuplicateWorkflow { .. }
                | TelemetryError::InvalidSample { .. }
        )
    }

    fn is_recoverable(&self) -> bool {
        match self {
            TelemetryError::Configuration { .. } => false,
            TelemetryError::Io(_) | TelemetryError::Serialization(_) => false,
            _ => true,
        }
    }
}
