//! Progress bars driven by core events

use crate::output::ellipsize;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use linkrelay_types::{CoreEvent, TaskId, TaskStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

type Bars = Arc<RwLock<HashMap<TaskId, ProgressBar>>>;

/// One bar per admitted task, fed from the core's event stream
pub struct TransferProgress {
    bars: Bars,
    listener: JoinHandle<()>,
}

impl TransferProgress {
    pub fn start(mut events: broadcast::Receiver<CoreEvent>) -> Self {
        let multi = MultiProgress::new();
        let bars: Bars = Arc::new(RwLock::new(HashMap::new()));

        let listener = {
            let bars = bars.clone();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => handle_event(&multi, &bars, &event).await,
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        };

        Self { bars, listener }
    }

    /// Stop following events and clear unfinished bars
    pub async fn finish(self) {
        self.listener.abort();
        for (_, pb) in self.bars.write().await.drain() {
            if !pb.is_finished() {
                pb.finish_and_clear();
            }
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg:30} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}

async fn handle_event(multi: &MultiProgress, bars: &Bars, event: &CoreEvent) {
    match event {
        CoreEvent::TaskAdmitted { task } => {
            let pb = multi.add(ProgressBar::new(task.total_bytes.unwrap_or(0)));
            pb.set_style(bar_style());
            pb.set_message(ellipsize(&task.artifact_name, 30));
            bars.write().await.insert(task.task_id.clone(), pb);
        }

        CoreEvent::TaskProgress {
            task_id,
            downloaded,
            total,
            ..
        } => {
            let bars = bars.read().await;
            if let Some(pb) = bars.get(task_id) {
                if let Some(total) = total {
                    pb.set_length(*total);
                }
                pb.set_position(*downloaded);
            }
        }

        CoreEvent::TaskStatusChanged {
            task_id,
            status,
            error,
        } => {
            let bars = bars.read().await;
            if let Some(pb) = bars.get(task_id) {
                match status {
                    TaskStatus::Uploading => {
                        pb.set_message(format!("{} uploading", style("↑").cyan()));
                    }
                    TaskStatus::Completed => {
                        pb.finish_with_message(format!("{} Relayed", style("✓").green().bold()));
                    }
                    TaskStatus::Failed => {
                        pb.abandon_with_message(format!(
                            "{} Failed: {}",
                            style("✗").red().bold(),
                            error.as_deref().unwrap_or("Unknown error")
                        ));
                    }
                    _ => {}
                }
            }
        }

        _ => {}
    }
}
