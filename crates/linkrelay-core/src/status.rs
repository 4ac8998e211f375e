//! Human-readable status texts sent to the submitting user

use linkrelay_types::TaskSnapshot;

const MB: f64 = 1024.0 * 1024.0;

/// Cut `text` to at most `limit` characters, never inside a character
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn started(task: &TaskSnapshot) -> String {
    format!("Starting download of {}", task.artifact_name)
}

pub fn downloading(task: &TaskSnapshot, speed: u64) -> String {
    let downloaded = task.downloaded_bytes as f64 / MB;
    let speed = speed as f64 / MB;
    match (task.progress_fraction(), task.total_bytes) {
        (Some(fraction), Some(total)) => format!(
            "Downloading {}: {:.0}% ({:.1}/{:.1} MB) at {:.2} MB/s",
            task.artifact_name,
            fraction * 100.0,
            downloaded,
            total as f64 / MB,
            speed
        ),
        _ => format!(
            "Downloading {}: {:.1} MB at {:.2} MB/s",
            task.artifact_name, downloaded, speed
        ),
    }
}

pub fn uploading(task: &TaskSnapshot) -> String {
    format!("Uploading {} to storage", task.artifact_name)
}

pub fn completed(artifact_name: &str, share_link: &str) -> String {
    format!("Done: {}\n{}", artifact_name, share_link)
}

pub fn failed(artifact_name: &str, error: &str, limit: usize) -> String {
    format!("Failed: {}\n{}", artifact_name, truncate_chars(error, limit))
}

pub fn limit_reached(active: usize, limit: usize) -> String {
    format!(
        "Limit reached: {} of {} transfers running. Try again when one finishes.",
        active, limit
    )
}

pub fn not_authenticated() -> &'static str {
    "Storage is not connected. Authorize the storage account first."
}
