//! Canonical media shapes shared by every layer of the gallery feed.
//!
//! Whatever source a record came from, the renderer and the reaction store
//! only ever see a [`MediaItem`].

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Extensions accepted for local video files (lowercase, without the dot).
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "avi", "mkv"];

/// Extensions accepted for local image files (lowercase, without the dot).
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaKind {
    Video,
    Image,
    CloudLink,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Image => "image",
            Self::CloudLink => "cloud-link",
        }
    }

    /// Parses the loose `type` hints found in catalogs and admin payloads.
    pub fn parse_hint(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "video" | "videos" => Some(Self::Video),
            "image" | "images" | "photo" => Some(Self::Image),
            _ => None,
        }
    }

    /// Allow-list for local files of this kind. Cloud links have none.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Video => VIDEO_EXTENSIONS,
            Self::Image => IMAGE_EXTENSIONS,
            Self::CloudLink => &[],
        }
    }

    pub fn accepts_file(self, filename: &str) -> bool {
        extension_of(filename)
            .map(|ext| self.extensions().contains(&ext.as_str()))
            .unwrap_or(false)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier used to key reactions; stable for the lifetime of a session and,
/// for synthesized ids, across reloads as well.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaId(String);

impl MediaId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derives an id from the kind and locator. The same record always hashes
    /// to the same id, whichever source produced it.
    pub fn synthesize(kind: MediaKind, locator: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(locator.as_bytes());
        let hex = hasher.finalize().to_hex();
        let prefix = match kind {
            MediaKind::Video => "v",
            MediaKind::Image => "i",
            MediaKind::CloudLink => "cl",
        };
        Self(format!("{prefix}_{}", &hex.as_str()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MediaId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One displayable entry of the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    pub id: MediaId,
    pub kind: MediaKind,
    /// Local URL-style path (`media/videos/sd/a.mp4`) or a remote URL.
    pub locator: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Presentation hint carried by cloud links (`video` or `image`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_hint: Option<MediaKind>,
}

impl MediaItem {
    pub fn is_local(&self) -> bool {
        !matches!(self.kind, MediaKind::CloudLink)
    }
}

/// Lowercased extension of a file name or URL path, ignoring query strings.
pub fn extension_of(name: &str) -> Option<String> {
    let name = name.split(['?', '#']).next().unwrap_or(name);
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_ascii_lowercase())
}

/// File name with its final extension removed (`clip.final.mp4` -> `clip.final`).
pub fn file_stem(name: &str) -> String {
    let base = name.rsplit('/').next().unwrap_or(name);
    Path::new(base)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(base)
        .to_string()
}

/// Joins a URL-style base path and a file name with exactly one separator.
pub fn join_locator(base: &str, filename: &str) -> String {
    let base = base.trim_end_matches('/');
    let filename = filename.trim_start_matches('/');
    if base.is_empty() {
        filename.to_string()
    } else {
        format!("{base}/{filename}")
    }
}
