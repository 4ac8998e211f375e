//! Transfer engine - streams one remote resource to a local artifact
//!
//! Key principles:
//! - The destination is only created once the server answered successfully
//! - Writes happen in slices of at most `chunk_size` bytes
//! - Every slice goes through the task's [`RateLimiter`]
//! - Progress is reported on percentage boundaries, never per chunk
//! - Partial files are left for the caller to clean up

use crate::engine::fetcher::Fetcher;
use crate::engine::rate_limiter::RateLimiter;
use crate::error::FetchError;
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Progress reported to the caller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Fraction complete in `[0, 1]`, `None` when the size is unknown
    pub fraction: Option<f64>,
    pub downloaded: u64,
    pub total: Option<u64>,
    /// Observed bytes per second
    pub rate: u64,
}

/// How often progress is reported when the total size is unknown
const UNKNOWN_SIZE_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Streaming downloader with rate shaping
#[derive(Clone)]
pub struct TransferEngine {
    fetcher: Arc<dyn Fetcher>,
    chunk_size: usize,
    progress_step_percent: u8,
}

impl TransferEngine {
    pub fn new(fetcher: Arc<dyn Fetcher>, chunk_size: usize, progress_step_percent: u8) -> Self {
        Self {
            fetcher,
            chunk_size: chunk_size.max(1),
            progress_step_percent: progress_step_percent.clamp(1, 100),
        }
    }

    /// Download `url` into `destination`, returning the number of bytes written.
    pub async fn download<F>(
        &self,
        url: &str,
        destination: &Path,
        limiter: &mut RateLimiter,
        on_progress: F,
    ) -> Result<u64, FetchError>
    where
        F: Fn(Progress) + Send + Sync,
    {
        let response = self.fetcher.open(url).await?;
        let total = response.total_bytes;
        let mut stream = response.body;

        let mut file = File::create(destination).await?;
        info!(
            "Downloading {} -> {} ({:?} bytes, limit {} B/s)",
            url,
            destination.display(),
            total,
            limiter.current_limit()
        );

        let step = u64::from(self.progress_step_percent);
        let mut downloaded: u64 = 0;
        let mut next_percent = step;
        let mut last_report = limiter.clock().now();

        while let Some(chunk_result) = stream.next().await {
            let mut chunk = chunk_result?;

            while !chunk.is_empty() {
                let slice = chunk.split_to(self.chunk_size.min(chunk.len()));
                let slice_len = slice.len() as u64;

                file.write_all(&slice).await?;
                downloaded += slice_len;

                limiter.consume(slice_len).await;

                let report = match total {
                    Some(total) if total > 0 => {
                        let percent = downloaded.saturating_mul(100) / total;
                        if percent >= next_percent {
                            next_percent = (percent / step + 1) * step;
                            true
                        } else {
                            false
                        }
                    }
                    _ => {
                        let now = limiter.clock().now();
                        if now.saturating_sub(last_report) >= UNKNOWN_SIZE_REPORT_INTERVAL {
                            last_report = now;
                            true
                        } else {
                            false
                        }
                    }
                };

                if report {
                    on_progress(progress(downloaded, total, limiter.observed_rate()));
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = total {
            if downloaded < expected {
                return Err(FetchError::Truncated {
                    expected,
                    received: downloaded,
                });
            }
        }

        // Final report, unless the last boundary already said 100%
        if next_percent <= 100 || total.map_or(true, |t| t == 0) {
            on_progress(progress(downloaded, total, limiter.observed_rate()));
        }

        debug!("Finished {} ({} bytes)", url, downloaded);
        Ok(downloaded)
    }
}

fn progress(downloaded: u64, total: Option<u64>, rate: u64) -> Progress {
    let fraction = match total {
        Some(total) if total > 0 => Some((downloaded as f64 / total as f64).min(1.0)),
        Some(_) => Some(1.0),
        None => None,
    };
    Progress {
        fraction,
        downloaded,
        total,
        rate,
    }
}
