//! Shared types for linkrelay
//!
//! This crate contains the data structures shared between the core
//! pipeline and the CLI: identifiers, task snapshots, history records,
//! settings and the events broadcast by the core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque identifier of the principal submitting work
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<i64> for UserId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a single submission, `{user_id}_{seq}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(user_id: &UserId, seq: u64) -> Self {
        Self(format!("{}_{}", user_id, seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Task Types
// ============================================================================

/// Status of a transfer task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Downloading,
    Uploading,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether the task occupies one of its user's concurrency slots
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Downloading | TaskStatus::Uploading)
    }

    /// Terminal states admit no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "downloading" => Ok(TaskStatus::Downloading),
            "uploading" => Ok(TaskStatus::Uploading),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("Unknown task status: {}", other)),
        }
    }
}

/// Point-in-time view of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub artifact_name: String,
    pub source_url: String,
    pub status: TaskStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Bytes per second currently allocated (0 = unthrottled)
    pub allocated_rate: u64,
    pub created_at: DateTime<Utc>,
}

impl TaskSnapshot {
    /// Fraction complete in `[0, 1]`, `None` when the size is unknown
    pub fn progress_fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some((self.downloaded_bytes as f64 / total as f64).min(1.0))
            }
            Some(_) => Some(1.0),
            None => None,
        }
    }
}

/// Durable reference to an object held by the storage backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub file_id: String,
    pub share_link: String,
}

/// What a completed task resolves to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub task_id: TaskId,
    pub artifact_name: String,
    pub bytes: u64,
    pub object: StoredObject,
}

/// History row handed to the record store once a task is terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub task_id: TaskId,
    pub artifact_name: String,
    pub source_url: String,
    pub bytes: u64,
    pub status: TaskStatus,
    pub file_id: Option<String>,
    pub share_link: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Totals over one user's recorded transfers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    /// Every recorded transfer, failed ones included
    pub transfers: u64,
    pub completed: u64,
    /// Bytes relayed by completed transfers
    pub bytes: u64,
}

// ============================================================================
// Settings Types
// ============================================================================

/// Pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Per-user concurrency ceiling
    pub max_concurrent_per_user: usize,
    /// Per-user aggregate rate ceiling in bytes per second (0 = unthrottled)
    pub user_rate_limit: u64,
    /// Number of jobs that may run at once across all users
    pub worker_pool_size: usize,
    /// Largest slice written and rate-shaped at a time
    pub chunk_size: usize,
    /// Progress is reported each time this many percent are crossed
    pub progress_step_percent: u8,
    /// Overall bound on a single fetch
    pub fetch_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Where artifacts live between download and upload
    pub work_dir: PathBuf,
    /// Resumable upload chunk, rounded down to a multiple of 256 KiB
    pub upload_chunk_size: usize,
    pub upload_max_retries: u32,
    /// Bound on a single status delivery
    pub notify_timeout_ms: u64,
    /// Longest error text shown to the end user
    pub error_text_limit: usize,
    pub drive: DriveSettings,
}

/// Storage backend endpoints and session source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveSettings {
    pub upload_base: String,
    pub api_base: String,
    pub share_link_base: String,
    /// JSON file holding the current access token
    pub token_file: Option<PathBuf>,
}

impl Default for DriveSettings {
    fn default() -> Self {
        Self {
            upload_base: "https://www.googleapis.com".to_string(),
            api_base: "https://www.googleapis.com".to_string(),
            share_link_base: "https://drive.google.com".to_string(),
            token_file: None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_per_user: 2,
            user_rate_limit: 5 * 1024 * 1024,
            worker_pool_size: 10,
            chunk_size: 8192,
            progress_step_percent: 10,
            fetch_timeout_secs: 1800,
            connect_timeout_secs: 30,
            work_dir: dirs::cache_dir()
                .map(|p| p.join("linkrelay").join("artifacts"))
                .unwrap_or_else(|| PathBuf::from("downloads")),
            upload_chunk_size: 8 * 1024 * 1024,
            upload_max_retries: 5,
            notify_timeout_ms: 2000,
            error_text_limit: 100,
            drive: DriveSettings::default(),
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    TaskAdmitted {
        task: TaskSnapshot,
    },
    TaskRejected {
        user_id: UserId,
        url: String,
        reason: String,
    },
    TaskProgress {
        task_id: TaskId,
        downloaded: u64,
        total: Option<u64>,
        /// Observed bytes per second
        speed: u64,
    },
    TaskStatusChanged {
        task_id: TaskId,
        status: TaskStatus,
        error: Option<String>,
    },
    TaskReleased {
        task_id: TaskId,
        user_id: UserId,
    },
}
