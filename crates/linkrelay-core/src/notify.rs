//! Status notifications to the submitting user
//!
//! A transfer never waits on the messaging side. [`StatusFeed`] puts a
//! small queue and a pump task in front of the [`StatusNotifier`]: progress
//! notices are dropped when the queue is full, lifecycle notices are queued
//! in order, and every delivery is bounded by a timeout.

use async_trait::async_trait;
use linkrelay_types::TaskSnapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the per-task notice queue
const FEED_CAPACITY: usize = 8;

#[async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn notify(&self, task: &TaskSnapshot, text: &str) -> anyhow::Result<()>;
}

/// Writes notices to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl StatusNotifier for LogNotifier {
    async fn notify(&self, task: &TaskSnapshot, text: &str) -> anyhow::Result<()> {
        info!(user = %task.user_id, task = %task.task_id, "{}", text);
        Ok(())
    }
}

/// Discards notices
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

#[async_trait]
impl StatusNotifier for NullNotifier {
    async fn notify(&self, _task: &TaskSnapshot, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

type Notice = (TaskSnapshot, String);

/// Per-task notice queue drained by a background pump
pub struct StatusFeed {
    tx: mpsc::Sender<Notice>,
    pump: JoinHandle<()>,
}

impl StatusFeed {
    pub fn start(notifier: Arc<dyn StatusNotifier>, timeout: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<Notice>(FEED_CAPACITY);

        let pump = tokio::spawn(async move {
            while let Some((task, text)) = rx.recv().await {
                match tokio::time::timeout(timeout, notifier.notify(&task, &text)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Status delivery for {} failed: {:#}", task.task_id, e),
                    Err(_) => warn!(
                        "Status delivery for {} timed out after {:?}",
                        task.task_id, timeout
                    ),
                }
            }
        });

        Self { tx, pump }
    }

    /// Lossy: dropped when deliveries are falling behind
    pub fn progress(&self, task: TaskSnapshot, text: String) {
        if self.tx.try_send((task, text)).is_err() {
            debug!("Progress notice dropped");
        }
    }

    /// Queued behind earlier notices, never dropped while the pump runs
    pub async fn milestone(&self, task: TaskSnapshot, text: String) {
        if self.tx.send((task, text)).await.is_err() {
            warn!("Status pump is gone, notice lost");
        }
    }

    /// Deliver everything queued, then stop the pump
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.pump.await {
            warn!("Status pump ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use linkrelay_types::{TaskId, TaskStatus, UserId};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        texts: Mutex<Vec<String>>,
        delay: Option<Duration>,
        fail: bool,
    }

    #[async_trait]
    impl StatusNotifier for Recorder {
        async fn notify(&self, _task: &TaskSnapshot, text: &str) -> anyhow::Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                anyhow::bail!("chat unavailable");
            }
            self.texts.lock().push(text.to_string());
            Ok(())
        }
    }

    fn snapshot() -> TaskSnapshot {
        let user = UserId::from("u");
        TaskSnapshot {
            task_id: TaskId::new(&user, 1),
            user_id: user,
            artifact_name: "a.bin".to_string(),
            source_url: "https://host/a.bin".to_string(),
            status: TaskStatus::Downloading,
            downloaded_bytes: 0,
            total_bytes: None,
            allocated_rate: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_milestones_arrive_in_order() {
        let recorder = Arc::new(Recorder::default());
        let feed = StatusFeed::start(recorder.clone(), Duration::from_secs(1));

        feed.milestone(snapshot(), "one".into()).await;
        feed.progress(snapshot(), "two".into());
        feed.milestone(snapshot(), "three".into()).await;
        feed.close().await;

        assert_eq!(*recorder.texts.lock(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_progress_is_dropped_when_full() {
        let recorder = Arc::new(Recorder {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let feed = StatusFeed::start(recorder.clone(), Duration::from_secs(1));

        for i in 0..100 {
            feed.progress(snapshot(), format!("p{}", i));
        }
        feed.milestone(snapshot(), "done".into()).await;
        feed.close().await;

        let texts = recorder.texts.lock();
        assert!(texts.len() < 100);
        assert_eq!(texts.last().map(String::as_str), Some("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_or_failing_notifier_does_not_block() {
        let slow = Arc::new(Recorder {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let feed = StatusFeed::start(slow.clone(), Duration::from_millis(100));
        feed.milestone(snapshot(), "late".into()).await;
        feed.close().await;
        assert!(slow.texts.lock().is_empty());

        let failing = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let feed = StatusFeed::start(failing, Duration::from_millis(100));
        feed.milestone(snapshot(), "lost".into()).await;
        feed.close().await;
    }
}
