//! Video resolution and audio download.
//!
//! Resolves a source URL to a canonical video id plus metadata, and fetches
//! the audio track as a local MP3. Both operations shell out to yt-dlp; the
//! [`MediaFetcher`] trait is the seam the pipeline depends on.

mod download;

pub use download::download_audio;

use crate::error::{Result, SvarError};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use url::Url;

/// Metadata about a video, resolved without downloading it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoMetadata {
    /// Canonical video id.
    pub id: String,
    /// Title.
    pub title: String,
    /// Thumbnail URL, if the extractor reported one.
    pub thumbnail_url: Option<String>,
    /// Duration in seconds, if known.
    pub duration_seconds: Option<u32>,
    /// Canonical watch URL.
    pub source_url: String,
}

impl VideoMetadata {
    /// Thumbnail URL, falling back to the id-derived YouTube image host.
    pub fn thumbnail_or_default(&self) -> String {
        self.thumbnail_url
            .clone()
            .unwrap_or_else(|| default_thumbnail_url(&self.id))
    }
}

/// Thumbnail URL derived from a video id alone.
pub fn default_thumbnail_url(video_id: &str) -> String {
    format!("https://img.youtube.com/vi/{}/0.jpg", video_id)
}

fn bare_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]{11}$").expect("Invalid regex"))
}

fn id_chars_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("Invalid regex"))
}

/// Extract a video id from a URL or bare 11-character id.
///
/// Handles `youtu.be/<id>`, `youtube.com/watch?v=<id>`, and the embed and
/// `/v/` path forms. Bare input must be exactly 11 id characters; an id
/// taken from a recognized URL only needs to be non-empty id characters,
/// the extractor decides whether it actually exists.
pub fn extract_video_id(input: &str) -> Option<String> {
    let input = input.trim();

    if bare_id_regex().is_match(input) {
        return Some(input.to_string());
    }

    let parsed = Url::parse(input).ok()?;

    let host = parsed.host_str()?;
    let candidate = match host {
        "youtu.be" => parsed.path_segments()?.next().map(|s| s.to_string()),
        "www.youtube.com" | "youtube.com" | "m.youtube.com" => {
            let mut segments = parsed.path_segments()?;
            match segments.next() {
                Some("watch") => parsed
                    .query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned()),
                Some("embed") | Some("v") => segments.next().map(|s| s.to_string()),
                _ => None,
            }
        }
        _ => None,
    }?;

    if id_chars_regex().is_match(&candidate) {
        Some(candidate)
    } else {
        None
    }
}

/// Trait for resolving video metadata and fetching audio.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Resolve metadata for a video URL without downloading it.
    async fn resolve(&self, url: &str) -> Result<VideoMetadata>;

    /// Download the audio track to `output_dir` and return the local path.
    async fn fetch_audio(&self, url: &str, video_id: &str, output_dir: &Path)
        -> Result<PathBuf>;
}

/// yt-dlp backed fetcher.
pub struct YtDlpFetcher;

impl YtDlpFetcher {
    pub fn new() -> Self {
        Self
    }
}

impl Default for YtDlpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn resolve(&self, url: &str) -> Result<VideoMetadata> {
        let video_id = extract_video_id(url).ok_or_else(|| {
            SvarError::InvalidInput(format!("Not a recognizable video URL: {}", url))
        })?;

        let canonical = format!("https://www.youtube.com/watch?v={}", video_id);

        let output = tokio::process::Command::new("yt-dlp")
            .args([
                "--dump-json",
                "--no-download",
                "--no-warnings",
                &canonical,
            ])
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SvarError::ToolNotFound("yt-dlp".to_string())
                } else {
                    SvarError::VideoSource(format!("Failed to run yt-dlp: {}", e))
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SvarError::VideoNotFound(format!(
                "Video {} not found or unavailable: {}",
                video_id, stderr
            )));
        }

        let json_str = String::from_utf8_lossy(&output.stdout);
        let json: serde_json::Value = serde_json::from_str(&json_str)
            .map_err(|e| SvarError::VideoSource(format!("Failed to parse yt-dlp output: {}", e)))?;

        let title = json["title"]
            .as_str()
            .unwrap_or("Untitled Video")
            .to_string();

        let thumbnail = json["thumbnail"].as_str().map(|s| s.to_string());

        let duration = json["duration"].as_f64().map(|d| d as u32);

        Ok(VideoMetadata {
            id: video_id,
            title,
            thumbnail_url: thumbnail,
            duration_seconds: duration,
            source_url: canonical,
        })
    }

    async fn fetch_audio(
        &self,
        url: &str,
        video_id: &str,
        output_dir: &Path,
    ) -> Result<PathBuf> {
        download::download_audio(url, video_id, output_dir).await
    }
}
