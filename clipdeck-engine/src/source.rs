//! Source identity
//!
//! A [`SourceKey`] is the stable identity of a logical audio source. The
//! same source always maps to the same key, which makes it usable both as
//! the cache key and for de-duplicating in-flight acquisitions.
//!
//! **Key forms:**
//! - `yt:<video id>` for YouTube URLs (watch, youtu.be, embed, shorts, live, v)
//! - `url:<16 hex>` for any other http(s) URL (SHA-256 of the URL)
//! - `file:<16 hex>` for local files (SHA-256 of name, size and mtime)

use crate::error::AcquisitionError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

const YOUTUBE_ID_LEN: usize = 11;

/// Stable identity of an audio source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceKey(String);

impl SourceKey {
    /// Key for a remote URL
    ///
    /// # Errors
    /// - Validation error if the URL is not http(s) or has no host
    pub fn from_url(url: &str) -> Result<Self, AcquisitionError> {
        let url = url.trim();
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .ok_or_else(|| AcquisitionError::malformed_url(url))?;

        let host = rest.split(['/', '?', '#']).next().unwrap_or("");
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(AcquisitionError::malformed_url(url));
        }

        if let Some(id) = youtube_video_id(url) {
            return Ok(Self(format!("yt:{}", id)));
        }
        Ok(Self(format!("url:{}", short_digest(url.as_bytes()))))
    }

    /// Key for a local file from its name, size and modification time
    pub fn from_file_metadata(file_name: &str, size: u64, modified_ms: i64) -> Self {
        let fingerprint = format!("{}|{}|{}", file_name, size, modified_ms);
        Self(format!("file:{}", short_digest(fingerprint.as_bytes())))
    }

    /// Key for a local file, reading its metadata
    ///
    /// # Errors
    /// - Not-found error if the file cannot be inspected
    pub fn from_local_file(path: &Path) -> Result<Self, AcquisitionError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            AcquisitionError::not_found(format!("cannot read {}: {}", path.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(AcquisitionError::validation(format!(
                "{} is not a file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Ok(Self::from_file_metadata(&name, metadata.len(), modified_ms))
    }

    /// Accept an existing key string (`yt:`, `url:` or `file:` prefix)
    pub fn parse(key: &str) -> Result<Self, AcquisitionError> {
        let valid = ["yt:", "url:", "file:"]
            .iter()
            .any(|p| key.strip_prefix(p).is_some_and(|rest| !rest.is_empty()));
        if valid {
            Ok(Self(key.to_string()))
        } else {
            Err(AcquisitionError::validation(format!(
                "not a source key: {}",
                key
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// YouTube video id for `yt:` keys
    pub fn video_id(&self) -> Option<&str> {
        self.0.strip_prefix("yt:")
    }
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the caller asked to acquire
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireSource {
    /// Already-derived key; only a cache hit (or an in-flight acquisition) can satisfy it
    Key(SourceKey),
    Url(String),
    LocalFile(PathBuf),
}

impl AcquireSource {
    /// Interpret a command-line style argument: URL, existing file, or key
    pub fn from_arg(arg: &str) -> Self {
        if arg.starts_with("http://") || arg.starts_with("https://") {
            return AcquireSource::Url(arg.to_string());
        }
        let path = Path::new(arg);
        if path.exists() {
            return AcquireSource::LocalFile(path.to_path_buf());
        }
        match SourceKey::parse(arg) {
            Ok(key) => AcquireSource::Key(key),
            Err(_) => AcquireSource::Url(arg.to_string()),
        }
    }
}

/// Where the encoded bytes for a source come from
#[derive(Debug, Clone, PartialEq)]
pub enum FetchTarget {
    Http { url: String },
    LocalFile(PathBuf),
    CacheOnly,
}

/// Resolved acquisition request
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    pub key: SourceKey,
    pub target: FetchTarget,
    /// Container hint for the decoder (file extension)
    pub extension: Option<String>,
}

impl AcquireSource {
    /// Derive the key and fetch target
    ///
    /// YouTube URLs are fetched through `audio_endpoint` with `{id}`
    /// replaced by the video id; other URLs are fetched directly.
    pub fn resolve(&self, audio_endpoint: &str) -> Result<ResolvedSource, AcquisitionError> {
        match self {
            AcquireSource::Key(key) => Ok(ResolvedSource {
                key: key.clone(),
                target: FetchTarget::CacheOnly,
                extension: None,
            }),
            AcquireSource::Url(url) => {
                let key = SourceKey::from_url(url)?;
                let (fetch_url, extension) = match key.video_id() {
                    Some(id) => {
                        let endpoint = audio_endpoint.replace("{id}", id);
                        let ext = extension_of(&endpoint);
                        (endpoint, ext)
                    }
                    None => (url.trim().to_string(), extension_of(url)),
                };
                Ok(ResolvedSource {
                    key,
                    target: FetchTarget::Http { url: fetch_url },
                    extension,
                })
            }
            AcquireSource::LocalFile(path) => Ok(ResolvedSource {
                key: SourceKey::from_local_file(path)?,
                target: FetchTarget::LocalFile(path.clone()),
                extension: path
                    .extension()
                    .map(|e| e.to_string_lossy().to_lowercase()),
            }),
        }
    }
}

/// Extract the 11-character video id from any YouTube URL form
pub fn youtube_video_id(url: &str) -> Option<String> {
    let rest = url
        .trim()
        .strip_prefix("https://")
        .or_else(|| url.trim().strip_prefix("http://"))?;
    let (host, path_and_query) = rest.split_once('/').unwrap_or((rest, ""));
    let host = host.trim_start_matches("www.").trim_start_matches("m.");

    let candidate = match host {
        "youtu.be" => path_and_query.split(['?', '#', '/']).next(),
        "youtube.com" | "music.youtube.com" | "youtube-nocookie.com" => {
            let (path, query) = path_and_query.split_once('?').unwrap_or((path_and_query, ""));
            if path == "watch" {
                query
                    .split('&')
                    .find_map(|pair| pair.strip_prefix("v="))
                    .map(|v| v.split('#').next().unwrap_or(v))
            } else {
                ["embed/", "shorts/", "live/", "v/"]
                    .iter()
                    .find_map(|prefix| path.strip_prefix(prefix))
                    .and_then(|tail| tail.split(['/', '#']).next())
            }
        }
        _ => None,
    }?;

    let valid = candidate.len() == YOUTUBE_ID_LEN
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then(|| candidate.to_string())
}

fn short_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

fn extension_of(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let last = path.rsplit('/').next()?;
    let (_, ext) = last.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    (!ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .then_some(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_youtube_forms_share_a_key() {
        let forms = [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtube.com/watch?feature=share&v=dQw4w9WgXcQ&t=42",
            "https://youtu.be/dQw4w9WgXcQ?t=10",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
            "https://m.youtube.com/live/dQw4w9WgXcQ",
            "http://www.youtube.com/v/dQw4w9WgXcQ",
        ];
        for form in forms {
            assert_eq!(
                SourceKey::from_url(form).unwrap().as_str(),
                "yt:dQw4w9WgXcQ",
                "{}",
                form
            );
        }
    }

    #[test]
    fn test_other_urls_hash_stably() {
        let a = SourceKey::from_url("https://example.com/audio/track.mp3").unwrap();
        let b = SourceKey::from_url("https://example.com/audio/track.mp3").unwrap();
        let c = SourceKey::from_url("https://example.com/audio/other.mp3").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("url:"));
        assert_eq!(a.as_str().len(), "url:".len() + 16);
    }

    #[test]
    fn test_malformed_urls_are_validation_errors() {
        for bad in ["ftp://example.com/a.mp3", "not a url", "https://", "https:///path"] {
            let err = SourceKey::from_url(bad).unwrap_err();
            assert_eq!(err.class, clipdeck_common::events::ErrorClass::Validation);
        }
    }

    #[test]
    fn test_file_key_depends_on_metadata() {
        let a = SourceKey::from_file_metadata("loop.wav", 1000, 1_700_000_000_000);
        let b = SourceKey::from_file_metadata("loop.wav", 1000, 1_700_000_000_000);
        let touched = SourceKey::from_file_metadata("loop.wav", 1000, 1_700_000_000_001);
        assert_eq!(a, b);
        assert_ne!(a, touched);
        assert!(a.as_str().starts_with("file:"));
    }

    #[test]
    fn test_parse_existing_keys() {
        assert!(SourceKey::parse("yt:dQw4w9WgXcQ").is_ok());
        assert!(SourceKey::parse("file:0011223344556677").is_ok());
        assert!(SourceKey::parse("yt:").is_err());
        assert!(SourceKey::parse("song.mp3").is_err());
    }

    #[test]
    fn test_resolve_uses_endpoint_for_video_ids() {
        let source = AcquireSource::Url("https://youtu.be/dQw4w9WgXcQ".to_string());
        let resolved = source
            .resolve("http://localhost:3001/api/audio/{id}")
            .unwrap();
        assert_eq!(
            resolved.target,
            FetchTarget::Http {
                url: "http://localhost:3001/api/audio/dQw4w9WgXcQ".to_string()
            }
        );
        assert_eq!(resolved.extension, None);
    }

    #[test]
    fn test_resolve_direct_url_keeps_extension_hint() {
        let source = AcquireSource::Url("https://cdn.example.com/a/B.MP3?sig=1".to_string());
        let resolved = source.resolve("http://unused/{id}").unwrap();
        assert_eq!(resolved.extension.as_deref(), Some("mp3"));
    }
}
