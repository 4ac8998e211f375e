//! Output formatting utilities

use serde::Serialize;

/// Print a value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format speed as human-readable, `Unlimited` for 0
pub fn format_speed(bytes_per_sec: u64) -> String {
    if bytes_per_sec == 0 {
        return "Unlimited".to_string();
    }
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec as f64))
}

/// Shorten `text` to `max` characters with a trailing ellipsis
pub fn ellipsize(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(0), "Unlimited");
        assert!(format_speed(2048).ends_with("/s"));
    }

    #[test]
    fn test_ellipsize() {
        assert_eq!(ellipsize("short.txt", 30), "short.txt");
        assert_eq!(ellipsize("abcdefghij", 8), "abcde...");
        assert_eq!(ellipsize("ééééé", 4), "é...");
    }
}
