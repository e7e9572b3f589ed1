use crate::media_fetcher::MediaKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from the chat transport
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Bot API error {code:?}: {description}")]
    Api {
        code: Option<i64>,
        description: String,
    },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Sends results back to a chat
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Send a local file as the attachment type matching `kind`
    async fn send_file(&self, chat_id: i64, path: &Path, kind: MediaKind) -> Result<(), DeliveryError>;

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError>;
}

/// Human-readable byte size, e.g. `80.0 MB`
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Message sent in place of a file that was staged remotely
pub fn staged_file_message(
    file_name: &str,
    size_bytes: u64,
    public_url: &str,
    expires_at: DateTime<Utc>,
) -> String {
    format!(
        "File \"{}\" ({}) is too large to send here.\n\
         Download it from:\n{}\n\n\
         The link stays valid until {} UTC.",
        file_name,
        format_size(size_bytes),
        public_url,
        expires_at.format("%Y-%m-%d %H:%M"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(80 * 1024 * 1024), "80.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_staged_file_message_mentions_link_and_expiry() {
        let expires = Utc.with_ymd_and_hms(2024, 1, 15, 22, 30, 0).unwrap();
        let text = staged_file_message("clip.mp4", 80 * 1024 * 1024, "https://x.example/clip", expires);

        assert!(text.contains("clip.mp4"));
        assert!(text.contains("80.0 MB"));
        assert!(text.contains("https://x.example/clip"));
        assert!(text.contains("2024-01-15 22:30 UTC"));
    }
}
