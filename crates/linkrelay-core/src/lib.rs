//! linkrelay Core - fetch-and-relay pipeline
//!
//! This crate accepts URLs from users, downloads each resource under a
//! per-user concurrency and bandwidth ceiling, relays it to cloud storage
//! and hands back a sharable link. The local copy never outlives its task.

mod engine;
mod error;
mod notify;
mod relay;
pub mod status;
mod storage;

pub use engine::*;
pub use error::*;
pub use notify::*;
pub use relay::*;
pub use storage::*;

use linkrelay_types::{CoreEvent, Settings, TaskId, TaskSnapshot, TransferReceipt, UserId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Process-wide submission counter behind task ids
static TASK_SEQ: AtomicU64 = AtomicU64::new(1);

/// The collaborators the pipeline talks to
#[derive(Clone)]
pub struct Services {
    pub fetcher: Arc<dyn Fetcher>,
    pub relay: Arc<dyn StorageRelay>,
    pub notifier: Arc<dyn StatusNotifier>,
    pub records: Arc<dyn RecordStore>,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    /// Production wiring: HTTP fetcher, Drive relay, log notifier, SQLite history
    /// (discarded with a warning when the database cannot be opened).
    ///
    /// An explicit `access_token` wins over the configured token file; without
    /// either, `token.json` in the data directory is used.
    pub async fn from_settings(
        settings: &Settings,
        storage: &Storage,
        access_token: Option<String>,
    ) -> Result<Self, RelayError> {
        let fetcher = HttpFetcher::new(Duration::from_secs(settings.connect_timeout_secs))?;

        let credentials: Arc<dyn CredentialProvider> = match access_token {
            Some(token) => Arc::new(StaticCredentials::new(token)),
            None => {
                let path = settings
                    .drive
                    .token_file
                    .clone()
                    .unwrap_or_else(|| storage.data_dir().join("token.json"));
                Arc::new(TokenFileCredentials::new(path))
            }
        };

        let relay = DriveRelay::new(
            credentials,
            settings.drive.clone(),
            settings.upload_chunk_size,
            settings.upload_max_retries,
        )?;

        // History is a side record; a broken database never blocks transfers
        let records: Arc<dyn RecordStore> = match HistoryDatabase::new(storage.history_path()).await {
            Ok(db) => Arc::new(db),
            Err(e) => {
                warn!("History disabled, cannot open {}: {}", storage.history_path().display(), e);
                Arc::new(NoopRecordStore)
            }
        };

        Ok(Self {
            fetcher: Arc::new(fetcher),
            relay: Arc::new(relay),
            notifier: Arc::new(LogNotifier),
            records,
            clock: Arc::new(SystemClock::new()),
        })
    }
}

/// A submitted task
#[derive(Debug)]
pub struct TaskHandle {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub artifact_name: String,
    join: JoinHandle<Result<TransferReceipt, RelayError>>,
}

impl TaskHandle {
    /// Wait for the task to reach a terminal state
    pub async fn wait(self) -> Result<TransferReceipt, RelayError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => {
                error!("Worker for {} ended abnormally: {}", self.task_id, e);
                Err(RelayError::WorkerPanicked)
            }
        }
    }
}

/// The main linkrelay core instance
#[derive(Clone)]
pub struct RelayCore {
    settings: Arc<Settings>,
    registry: Arc<TaskRegistry>,
    pool: WorkerPool,
    orchestrator: Arc<Orchestrator>,
    relay: Arc<dyn StorageRelay>,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl RelayCore {
    pub fn new(settings: Settings, services: Services) -> Self {
        let (event_tx, _) = broadcast::channel(1000);

        let registry = Arc::new(TaskRegistry::new(
            settings.max_concurrent_per_user,
            settings.user_rate_limit,
        ));
        let pool = WorkerPool::new(settings.worker_pool_size);

        let engine = TransferEngine::new(
            services.fetcher,
            settings.chunk_size,
            settings.progress_step_percent,
        );

        let orchestrator = Arc::new(Orchestrator {
            registry: registry.clone(),
            engine,
            relay: services.relay.clone(),
            notifier: services.notifier,
            records: services.records,
            clock: services.clock,
            events: event_tx.clone(),
            work_dir: settings.work_dir.clone(),
            fetch_timeout: Duration::from_secs(settings.fetch_timeout_secs),
            notify_timeout: Duration::from_millis(settings.notify_timeout_ms),
            error_text_limit: settings.error_text_limit,
        });

        Self {
            settings: Arc::new(settings),
            registry,
            pool,
            orchestrator,
            relay: services.relay,
            event_tx,
        }
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ========================================================================
    // Task Operations
    // ========================================================================

    /// Validate, admit and start a transfer. Returns as soon as the job is
    /// scheduled; a rejection leaves no trace in the registry.
    pub async fn submit(
        &self,
        user: impl Into<UserId>,
        url: &str,
    ) -> Result<TaskHandle, RejectionReason> {
        let user_id = user.into();
        let result = self.try_submit(user_id.clone(), url).await;

        if let Err(reason) = &result {
            warn!("Rejected {} for {}: {}", url, user_id, reason);
            self.emit(CoreEvent::TaskRejected {
                user_id,
                url: url.to_string(),
                reason: reason.to_string(),
            });
        }
        result
    }

    async fn try_submit(&self, user_id: UserId, url: &str) -> Result<TaskHandle, RejectionReason> {
        let url = url.trim();
        if url.is_empty() {
            return Err(RejectionReason::InvalidUrl("empty URL".to_string()));
        }
        let parsed =
            url::Url::parse(url).map_err(|e| RejectionReason::InvalidUrl(format!("{}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RejectionReason::InvalidUrl(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }

        if self.pool.is_closed() {
            return Err(RejectionReason::ShuttingDown);
        }
        if !self.relay.is_authenticated().await {
            return Err(RejectionReason::NotAuthenticated);
        }

        let seq = TASK_SEQ.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(Task::new(
            TaskId::new(&user_id, seq),
            user_id.clone(),
            parsed.as_str(),
            artifact_name_from_url(&parsed),
        ));

        if !self.registry.admit(task.clone()) {
            return Err(RejectionReason::LimitReached {
                active: self.registry.active_count(&user_id),
                limit: self.registry.max_per_user(),
            });
        }
        info!(
            "Admitted {} for {}: {} ({} B/s)",
            task.task_id,
            user_id,
            task.artifact_name,
            task.rate_share().get()
        );
        self.emit(CoreEvent::TaskAdmitted {
            task: task.snapshot(),
        });

        let orchestrator = self.orchestrator.clone();
        let job_task = task.clone();
        let join = match self.pool.spawn(async move { orchestrator.run(job_task).await }) {
            Ok(join) => join,
            Err(_) => {
                self.registry.release(&user_id, &task.task_id);
                return Err(RejectionReason::ShuttingDown);
            }
        };

        Ok(TaskHandle {
            task_id: task.task_id.clone(),
            user_id,
            artifact_name: task.artifact_name.clone(),
            join,
        })
    }

    /// Snapshots of the user's running tasks
    pub fn query_active(&self, user: &UserId) -> Vec<TaskSnapshot> {
        self.registry.active(user)
    }

    /// Running tasks across all users
    pub fn total_active(&self) -> usize {
        self.registry.total_active()
    }

    /// Stop accepting work and wait for every running task
    pub async fn shutdown(&self) {
        info!("Shutting down, {} tasks active", self.registry.total_active());
        self.pool.shutdown().await;
    }
}
