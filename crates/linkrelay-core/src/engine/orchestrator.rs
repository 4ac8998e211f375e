//! Task orchestrator - drives one admitted task to a terminal state
//!
//! Key principles:
//! - The registry slot is released exactly once, by a drop guard, whatever
//!   way the job ends (success, failure, panic, cancellation)
//! - The local artifact never outlives the job
//! - Only this module turns failures into user-facing text
//! - Notifier and history failures are logged, never escalated

use crate::engine::persistence::RecordStore;
use crate::engine::rate_limiter::{Clock, RateLimiter};
use crate::engine::registry::TaskRegistry;
use crate::engine::task::Task;
use crate::engine::transfer::{Progress, TransferEngine};
use crate::error::{FetchError, RelayError};
use crate::notify::{StatusFeed, StatusNotifier};
use crate::relay::StorageRelay;
use crate::status;
use chrono::Utc;
use linkrelay_types::{
    CoreEvent, StoredObject, TaskId, TaskStatus, TransferReceipt, TransferRecord, UserId,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Releases the task's registry slot when dropped
struct ReleaseGuard {
    registry: Arc<TaskRegistry>,
    events: broadcast::Sender<CoreEvent>,
    user_id: UserId,
    task_id: TaskId,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if self.registry.release(&self.user_id, &self.task_id) {
            debug!("Released slot of {}", self.task_id);
            let _ = self.events.send(CoreEvent::TaskReleased {
                task_id: self.task_id.clone(),
                user_id: self.user_id.clone(),
            });
        }
    }
}

/// Local artifact; deleted synchronously on drop if [`discard`](Self::discard) never ran
struct Artifact {
    path: PathBuf,
    discarded: bool,
}

impl Artifact {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            discarded: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn discard(&mut self) {
        self.discarded = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!("Removed artifact {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                let err = RelayError::Cleanup {
                    path: self.path.clone(),
                    source,
                };
                warn!("{}", err);
            }
        }
    }
}

impl Drop for Artifact {
    fn drop(&mut self) {
        if !self.discarded {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Everything a job needs besides its task
pub struct Orchestrator {
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) engine: TransferEngine,
    pub(crate) relay: Arc<dyn StorageRelay>,
    pub(crate) notifier: Arc<dyn StatusNotifier>,
    pub(crate) records: Arc<dyn RecordStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: broadcast::Sender<CoreEvent>,
    pub(crate) work_dir: PathBuf,
    pub(crate) fetch_timeout: Duration,
    pub(crate) notify_timeout: Duration,
    pub(crate) error_text_limit: usize,
}

impl Orchestrator {
    /// Run an admitted task to completion
    pub async fn run(&self, task: Arc<Task>) -> Result<TransferReceipt, RelayError> {
        let release = ReleaseGuard {
            registry: self.registry.clone(),
            events: self.events.clone(),
            user_id: task.user_id.clone(),
            task_id: task.task_id.clone(),
        };
        let feed = StatusFeed::start(self.notifier.clone(), self.notify_timeout);
        let mut artifact = Artifact::new(task.artifact_path(&self.work_dir));

        let snapshot = task.snapshot();
        feed.milestone(snapshot.clone(), status::started(&snapshot)).await;

        let result = self.transfer(&task, artifact.path(), &feed).await;
        artifact.discard().await;

        let outcome = match result {
            Ok((bytes, object)) => {
                self.transition(&task, TaskStatus::Completed, None);
                drop(release);
                info!(
                    "Task {} completed: {} ({} bytes) -> {}",
                    task.task_id, task.artifact_name, bytes, object.share_link
                );
                self.record(&task, TaskStatus::Completed, bytes, Some(&object), None)
                    .await;
                feed.milestone(
                    task.snapshot(),
                    status::completed(&task.artifact_name, &object.share_link),
                )
                .await;
                Ok(TransferReceipt {
                    task_id: task.task_id.clone(),
                    artifact_name: task.artifact_name.clone(),
                    bytes,
                    object,
                })
            }
            Err(e) => {
                let cause = e.to_string();
                error!("Task {} failed: {}", task.task_id, cause);
                let shown = status::truncate_chars(&cause, self.error_text_limit).to_string();
                self.transition(&task, TaskStatus::Failed, Some(shown.clone()));
                drop(release);
                let fetched = task.downloaded_bytes();
                self.record(&task, TaskStatus::Failed, fetched, None, Some(cause.clone()))
                    .await;

                let text = match &e {
                    RelayError::NotAuthenticated => status::not_authenticated().to_string(),
                    _ => status::failed(&task.artifact_name, &cause, self.error_text_limit),
                };
                feed.milestone(task.snapshot(), text).await;
                Err(e)
            }
        };

        feed.close().await;
        outcome
    }

    async fn transfer(
        &self,
        task: &Task,
        artifact: &Path,
        feed: &StatusFeed,
    ) -> Result<(u64, StoredObject), RelayError> {
        // The session may have expired since submission
        if !self.relay.is_authenticated().await {
            return Err(RelayError::NotAuthenticated);
        }

        tokio::fs::create_dir_all(&self.work_dir).await?;

        let mut limiter = RateLimiter::new(task.rate_share().clone(), self.clock.clone());
        let events = &self.events;
        let on_progress = |p: Progress| {
            task.record_progress(p.downloaded, p.total);
            let _ = events.send(CoreEvent::TaskProgress {
                task_id: task.task_id.clone(),
                downloaded: p.downloaded,
                total: p.total,
                speed: p.rate,
            });
            let snapshot = task.snapshot();
            let text = status::downloading(&snapshot, p.rate);
            feed.progress(snapshot, text);
        };

        let download = self
            .engine
            .download(&task.source_url, artifact, &mut limiter, on_progress);
        let bytes = match tokio::time::timeout(self.fetch_timeout, download).await {
            Ok(result) => result?,
            Err(_) => return Err(FetchError::Timeout(self.fetch_timeout).into()),
        };
        task.record_progress(bytes, Some(bytes));

        self.transition(task, TaskStatus::Uploading, None);
        let snapshot = task.snapshot();
        feed.milestone(snapshot.clone(), status::uploading(&snapshot)).await;

        let object = self.relay.upload(artifact, &task.artifact_name).await?;
        Ok((bytes, object))
    }

    fn transition(&self, task: &Task, status: TaskStatus, error: Option<String>) {
        if task.set_status(status) {
            let _ = self.events.send(CoreEvent::TaskStatusChanged {
                task_id: task.task_id.clone(),
                status,
                error,
            });
        }
    }

    async fn record(
        &self,
        task: &Task,
        status: TaskStatus,
        bytes: u64,
        object: Option<&StoredObject>,
        error: Option<String>,
    ) {
        let record = TransferRecord {
            id: Uuid::new_v4(),
            user_id: task.user_id.clone(),
            task_id: task.task_id.clone(),
            artifact_name: task.artifact_name.clone(),
            source_url: task.source_url.clone(),
            bytes,
            status,
            file_id: object.map(|o| o.file_id.clone()),
            share_link: object.map(|o| o.share_link.clone()),
            error,
            created_at: task.created_at,
            finished_at: Utc::now(),
        };
        if let Err(e) = self.records.record(&record).await {
            warn!("Failed to record history for {}: {}", task.task_id, e);
        }
    }
}
