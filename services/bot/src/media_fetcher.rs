use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::FetcherConfig;

/// Substrings that make a message look like a media link
const LINK_MARKERS: &[&str] = &[
    "http", "www", ".com", ".ru", "youtu", "tiktok", "instagram",
];

/// What the user wants extracted from a link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaMode {
    /// Video only (mp4 preferred)
    #[default]
    Video,
    /// Audio only, converted to mp3
    Audio,
    /// Video, audio and thumbnail
    #[serde(alias = "all")]
    Both,
}

impl MediaMode {
    pub const ALL: [MediaMode; 3] = [MediaMode::Video, MediaMode::Audio, MediaMode::Both];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaMode::Video => "video",
            MediaMode::Audio => "audio",
            MediaMode::Both => "both",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "video" => Some(MediaMode::Video),
            "audio" => Some(MediaMode::Audio),
            "both" | "all" => Some(MediaMode::Both),
            _ => None,
        }
    }
}

impl fmt::Display for MediaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse media type, decides how a file is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
    Image,
    Document,
}

impl MediaKind {
    /// Guess the kind from a file extension
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "mp4" | "mkv" | "webm" | "mov" => MediaKind::Video,
            "mp3" | "m4a" | "opus" | "ogg" | "aac" | "wav" | "flac" => MediaKind::Audio,
            "jpg" | "jpeg" | "png" | "webp" => MediaKind::Image,
            _ => MediaKind::Document,
        }
    }
}

/// A file produced by the fetcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub path: PathBuf,
    pub byte_len: u64,
    pub kind: MediaKind,
}

impl FetchedFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string())
    }
}

/// Files from one extraction run plus the folder that holds them
#[derive(Debug, Clone)]
pub struct FetchOutput {
    pub work_dir: PathBuf,
    pub files: Vec<FetchedFile>,
}

impl FetchOutput {
    /// Remove the request folder and everything in it
    pub async fn cleanup(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, dir = %self.work_dir.display(), "Failed to remove download folder");
            }
        }
    }
}

/// Errors that can occur while extracting media
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Extraction step '{step}' failed ({status}): {stderr}")]
    ToolFailed {
        step: &'static str,
        status: String,
        stderr: String,
    },

    #[error("Extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("Extraction produced no files")]
    NoFiles,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of downloadable media
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Download `url` in the requested mode into a fresh folder
    async fn fetch(&self, url: &str, mode: MediaMode) -> Result<FetchOutput, FetchError>;
}

/// One invocation of the extraction tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionStep {
    pub label: &'static str,
    pub args: Vec<String>,
    /// Failure of an optional step is logged and ignored
    pub required: bool,
}

/// Build the tool invocations for a mode
pub fn extraction_steps(url: &str, mode: MediaMode, dir: &Path) -> Vec<ExtractionStep> {
    let template = |name: &str| dir.join(format!("{}.%(ext)s", name)).to_string_lossy().into_owned();
    let titled = dir.join("%(title).80B.%(ext)s").to_string_lossy().into_owned();

    match mode {
        MediaMode::Video => vec![video_step(url, titled)],
        MediaMode::Audio => vec![audio_step(url, titled)],
        MediaMode::Both => vec![
            video_step(url, template("video")),
            audio_step(url, template("audio")),
            ExtractionStep {
                label: "thumbnail",
                args: ["--skip-download", "--write-thumbnail", "--convert-thumbnails", "jpg"]
                    .map(String::from)
                    .into_iter()
                    .chain(common_args(url, template("thumbnail")))
                    .collect(),
                required: false,
            },
        ],
    }
}

fn common_args(url: &str, output: String) -> Vec<String> {
    vec![
        "--quiet".to_string(),
        "--no-warnings".to_string(),
        "--no-playlist".to_string(),
        "--no-check-certificates".to_string(),
        "--no-mtime".to_string(),
        "-o".to_string(),
        output,
        "--".to_string(),
        url.to_string(),
    ]
}

fn video_step(url: &str, output: String) -> ExtractionStep {
    let mut args = vec!["-f".to_string(), "best[ext=mp4]/best".to_string()];
    args.extend(common_args(url, output));
    ExtractionStep {
        label: "video",
        args,
        required: true,
    }
}

fn audio_step(url: &str, output: String) -> ExtractionStep {
    let mut args: Vec<String> = [
        "-f",
        "bestaudio/best",
        "--extract-audio",
        "--audio-format",
        "mp3",
        "--audio-quality",
        "192K",
    ]
    .map(String::from)
    .to_vec();
    args.extend(common_args(url, output));
    ExtractionStep {
        label: "audio",
        args,
        required: true,
    }
}

/// Media fetcher backed by the yt-dlp command line tool
pub struct YtDlpFetcher {
    binary: String,
    work_dir: PathBuf,
    timeout: Duration,
}

impl YtDlpFetcher {
    pub fn new(config: &FetcherConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            work_dir: config.work_dir.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn run_step(&self, step: &ExtractionStep) -> Result<(), FetchError> {
        debug!(step = step.label, args = ?step.args, "Running extraction step");

        let output = Command::new(&self.binary)
            .args(&step.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| FetchError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        if output.status.success() {
            return Ok(());
        }

        Err(FetchError::ToolFailed {
            step: step.label,
            status: output.status.to_string(),
            stderr: stderr_tail(&output.stderr),
        })
    }

    async fn run_steps(&self, steps: &[ExtractionStep], dir: &Path) -> Result<Vec<FetchedFile>, FetchError> {
        let mut files = Vec::new();
        let mut seen = HashSet::new();

        for step in steps {
            match self.run_step(step).await {
                Ok(()) => {}
                Err(e) if !step.required => {
                    info!(step = step.label, error = %e, "Optional extraction step failed");
                }
                Err(e) => return Err(e),
            }

            // Keep production order: files from earlier steps come first
            for file in collect_files(dir).await? {
                if seen.insert(file.path.clone()) {
                    files.push(file);
                }
            }
        }

        Ok(files)
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    #[instrument(skip(self, mode), fields(mode = %mode))]
    async fn fetch(&self, url: &str, mode: MediaMode) -> Result<FetchOutput, FetchError> {
        let dir = self.work_dir.join(format!(
            "harti_{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            Uuid::new_v4().simple()
        ));
        tokio::fs::create_dir_all(&dir).await?;

        let output = FetchOutput {
            work_dir: dir.clone(),
            files: Vec::new(),
        };

        let steps = extraction_steps(url, mode, &dir);
        let result = tokio::time::timeout(self.timeout, self.run_steps(&steps, &dir))
            .await
            .unwrap_or(Err(FetchError::Timeout(self.timeout)));

        let files = match result {
            Ok(files) if !files.is_empty() => files,
            Ok(_) => {
                output.cleanup().await;
                return Err(FetchError::NoFiles);
            }
            Err(e) => {
                output.cleanup().await;
                return Err(e);
            }
        };

        for file in &files {
            info!(file = %file.file_name(), size_bytes = file.byte_len, kind = ?file.kind, "Fetched file");
        }

        Ok(FetchOutput { files, ..output })
    }
}

/// Regular files in `dir`, sorted by name, skipping partial downloads
pub async fn collect_files(dir: &Path) -> Result<Vec<FetchedFile>, FetchError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }

        let path = entry.path();
        let partial = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e, "part" | "ytdl" | "tmp"));
        if partial {
            continue;
        }

        files.push(FetchedFile {
            kind: MediaKind::from_path(&path),
            byte_len: metadata.len(),
            path,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Heuristic used to tell links from free text
pub fn looks_like_link(text: &str) -> bool {
    let lower = text.to_lowercase();
    LINK_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(499)
        .map(|(i, _)| i)
        .unwrap_or(0);
    trimmed[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_mode_parse_and_display() {
        assert_eq!(MediaMode::parse("Video"), Some(MediaMode::Video));
        assert_eq!(MediaMode::parse("all"), Some(MediaMode::Both));
        assert_eq!(MediaMode::parse("gif"), None);
        assert_eq!(MediaMode::Audio.to_string(), "audio");
        assert_eq!(MediaMode::default(), MediaMode::Video);
    }

    #[test]
    fn test_mode_serde_accepts_legacy_all() {
        let mode: MediaMode = serde_json::from_str("\"all\"").unwrap();
        assert_eq!(mode, MediaMode::Both);
        assert_eq!(serde_json::to_string(&MediaMode::Both).unwrap(), "\"both\"");
    }

    #[test]
    fn test_media_kind_from_extension() {
        assert_eq!(MediaKind::from_path(Path::new("a/clip.MP4")), MediaKind::Video);
        assert_eq!(MediaKind::from_path(Path::new("song.mp3")), MediaKind::Audio);
        assert_eq!(MediaKind::from_path(Path::new("thumbnail.webp")), MediaKind::Image);
        assert_eq!(MediaKind::from_path(Path::new("notes.txt")), MediaKind::Document);
        assert_eq!(MediaKind::from_path(Path::new("noext")), MediaKind::Document);
    }

    #[test]
    fn test_looks_like_link() {
        assert!(looks_like_link("https://vm.tiktok.com/abc"));
        assert!(looks_like_link("WWW.example.org/video"));
        assert!(looks_like_link("youtu.be/xyz"));
        assert!(!looks_like_link("hello there"));
    }

    #[test]
    fn test_steps_per_mode() {
        let dir = Path::new("/tmp/job");
        let url = "https://youtu.be/xyz";

        let video = extraction_steps(url, MediaMode::Video, dir);
        assert_eq!(video.len(), 1);
        assert!(video[0].args.contains(&"best[ext=mp4]/best".to_string()));
        assert_eq!(video[0].args.last().map(String::as_str), Some(url));

        let audio = extraction_steps(url, MediaMode::Audio, dir);
        assert_eq!(audio.len(), 1);
        assert!(audio[0].args.contains(&"--extract-audio".to_string()));
        assert!(audio[0].args.contains(&"mp3".to_string()));

        let both = extraction_steps(url, MediaMode::Both, dir);
        let labels: Vec<_> = both.iter().map(|s| s.label).collect();
        assert_eq!(labels, vec!["video", "audio", "thumbnail"]);
        assert!(both[0].required && both[1].required && !both[2].required);
        assert!(both[1].args.contains(&"/tmp/job/audio.%(ext)s".to_string()));
        assert_eq!(both[2].args.last().map(String::as_str), Some(url));
    }

    #[test]
    fn test_url_is_passed_after_separator() {
        let steps = extraction_steps("--exec=rm", MediaMode::Video, Path::new("/tmp/job"));
        let args = &steps[0].args;
        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args[sep + 1], "--exec=rm");
    }

    #[tokio::test]
    async fn test_collect_files_skips_partials_and_dirs() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.mp3"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("a.mp4"), vec![0u8; 20]).unwrap();
        std::fs::write(dir.path().join("c.mp4.part"), vec![0u8; 5]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let files = collect_files(dir.path()).await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.file_name()).collect();
        assert_eq!(names, vec!["a.mp4", "b.mp3"]);
        assert_eq!(files[0].byte_len, 20);
        assert_eq!(files[0].kind, MediaKind::Video);
        assert_eq!(files[1].kind, MediaKind::Audio);
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_fetch_error() {
        let dir = tempdir().unwrap();
        let fetcher = YtDlpFetcher::new(&FetcherConfig {
            binary: "definitely-not-a-real-binary-xyz".to_string(),
            work_dir: dir.path().to_path_buf(),
            timeout_secs: 5,
        });

        let err = fetcher
            .fetch("https://example.com/v", MediaMode::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Spawn { .. }));
        // The request folder is removed on failure
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_stderr_tail_keeps_end() {
        let long = "x".repeat(600) + "ERROR: Unsupported URL";
        let tail = stderr_tail(long.as_bytes());
        assert_eq!(tail.chars().count(), 500);
        assert!(tail.ends_with("Unsupported URL"));
    }
}
