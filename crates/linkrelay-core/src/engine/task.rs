//! Live transfer task state shared between the registry and its worker

use crate::engine::rate_governor::RateShare;
use chrono::{DateTime, Utc};
use linkrelay_types::{TaskId, TaskSnapshot, TaskStatus, UserId};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

/// Sentinel stored in `total_bytes` while the size is unknown
const UNKNOWN_TOTAL: u64 = u64::MAX;

/// Name of the artifact behind `url`: the last path segment, percent-decoded
/// and stripped of separators and control characters, or `download_{secs}`
pub fn artifact_name_from_url(url: &Url) -> String {
    let raw = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    let decoded = urlencoding::decode(raw)
        .map(|name| name.into_owned())
        .unwrap_or_else(|_| raw.to_string());

    let cleaned: String = decoded
        .chars()
        .filter(|c| !c.is_control() && *c != '/' && *c != '\\')
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        format!("download_{}", Utc::now().timestamp())
    } else {
        cleaned.to_string()
    }
}

/// One submission, from admission until it leaves the registry
#[derive(Debug)]
pub struct Task {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub source_url: String,
    pub artifact_name: String,
    pub created_at: DateTime<Utc>,
    rate: RateShare,
    downloaded: AtomicU64,
    total: AtomicU64,
    status: Mutex<TaskStatus>,
}

impl Task {
    pub fn new(
        task_id: TaskId,
        user_id: UserId,
        source_url: impl Into<String>,
        artifact_name: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            user_id,
            source_url: source_url.into(),
            artifact_name: artifact_name.into(),
            created_at: Utc::now(),
            rate: RateShare::unlimited(),
            downloaded: AtomicU64::new(0),
            total: AtomicU64::new(UNKNOWN_TOTAL),
            status: Mutex::new(TaskStatus::Queued),
        }
    }

    /// `work_dir/{task_id}_{artifact_name}`
    pub fn artifact_path(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(format!("{}_{}", self.task_id, self.artifact_name))
    }

    /// The cell the registry writes allocations into
    pub fn rate_share(&self) -> &RateShare {
        &self.rate
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock()
    }

    /// Move to `status` unless the task is already terminal.
    /// Returns whether the transition happened.
    pub fn set_status(&self, status: TaskStatus) -> bool {
        let mut current = self.status.lock();
        if current.is_terminal() {
            return false;
        }
        *current = status;
        true
    }

    pub fn record_progress(&self, downloaded: u64, total: Option<u64>) {
        self.downloaded.store(downloaded, Ordering::Relaxed);
        self.total
            .store(total.unwrap_or(UNKNOWN_TOTAL), Ordering::Relaxed);
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> Option<u64> {
        match self.total.load(Ordering::Relaxed) {
            UNKNOWN_TOTAL => None,
            total => Some(total),
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            user_id: self.user_id.clone(),
            artifact_name: self.artifact_name.clone(),
            source_url: self.source_url.clone(),
            status: self.status(),
            downloaded_bytes: self.downloaded_bytes(),
            total_bytes: self.total_bytes(),
            allocated_rate: self.rate.get(),
            created_at: self.created_at,
        }
    }
}
