//! Error types for linkrelay core

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in linkrelay core
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Limit reached: {active}/{limit} active transfers")]
    AdmissionRejected { active: usize, limit: usize },

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Storage session is not authenticated")]
    NotAuthenticated,

    #[error("Upload failed: {0}")]
    Upload(UploadError),

    #[error("Failed to delete {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Worker pool is shutting down")]
    ShuttingDown,

    #[error("Transfer worker panicked")]
    WorkerPanicked,
}

impl RelayError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Fetch(e) => e.is_retryable(),
            RelayError::Upload(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<UploadError> for RelayError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::NotAuthenticated => RelayError::NotAuthenticated,
            other => RelayError::Upload(other),
        }
    }
}

impl From<RejectionReason> for RelayError {
    fn from(reason: RejectionReason) -> Self {
        match reason {
            RejectionReason::LimitReached { active, limit } => {
                RelayError::AdmissionRejected { active, limit }
            }
            RejectionReason::InvalidUrl(msg) => RelayError::InvalidInput(msg),
            RejectionReason::NotAuthenticated => RelayError::NotAuthenticated,
            RejectionReason::ShuttingDown => RelayError::ShuttingDown,
        }
    }
}

/// Failures while fetching the remote resource
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Server responded with status {status}")]
    Status { status: u16 },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Body ended after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Truncated { .. } => true,
            FetchError::Status { status } => *status >= 500,
            _ => false,
        }
    }
}

/// Failures while relaying an artifact to the storage backend
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("No valid storage session")]
    NotAuthenticated,

    #[error("Could not open upload session (status {status})")]
    Session { status: u16 },

    #[error("Storage rejected upload: {status} - {message}")]
    Rejected { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage response carried no object id")]
    MissingObjectId,

    #[error("Could not share uploaded object (status {status})")]
    Permission { status: u16 },

    #[error("Upload session did not advance past byte {offset}")]
    Stalled { offset: u64 },

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl UploadError {
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Network(_) | UploadError::Stalled { .. } => true,
            UploadError::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Why a submission was turned away before any resource was used
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionReason {
    #[error("Limit reached: {active}/{limit} active transfers")]
    LimitReached { active: usize, limit: usize },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Storage session is not authenticated")]
    NotAuthenticated,

    #[error("Service is shutting down")]
    ShuttingDown,
}
