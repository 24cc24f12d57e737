//! Failure taxonomy of the feed subsystem.
//!
//! None of these are fatal to the host: each one maps to a degraded outcome
//! (fallthrough, skipped record, broken card, unchanged vote).

use std::path::PathBuf;

use thiserror::Error;

use crate::media::MediaKind;
use crate::sources::SourceKind;

/// Failure of one source probe. Both variants trigger fallthrough to the next
/// source in priority order.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("{source_kind} unavailable: {reason}")]
    Unavailable {
        source_kind: SourceKind,
        reason: String,
    },

    #[error("{source_kind} responded with unexpected shape: {reason}")]
    SchemaMismatch {
        source_kind: SourceKind,
        reason: String,
    },
}

impl SourceError {
    pub fn unavailable(source_kind: SourceKind, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            source_kind,
            reason: reason.into(),
        }
    }

    pub fn schema(source_kind: SourceKind, reason: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            source_kind,
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Unavailable { reason, .. } | Self::SchemaMismatch { reason, .. } => reason,
        }
    }

    pub fn source_kind(&self) -> SourceKind {
        match self {
            Self::Unavailable { source_kind, .. } | Self::SchemaMismatch { source_kind, .. } => {
                *source_kind
            }
        }
    }
}

/// A remote document could not be retrieved.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("fetching {url}: {reason}")]
    Transport { url: String, reason: String },
}

/// A catalog document that cannot be used as a whole.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("reading {location}: {reason}")]
    Read { location: String, reason: String },

    #[error("catalog is not valid JSON: {0}")]
    Json(String),

    #[error("catalog is not a JSON object")]
    NotAnObject,

    #[error("catalog has none of videos, images or cloud_links")]
    NoSections,

    #[error("{0} is not an array")]
    SectionNotArray(&'static str),
}

/// Reasons a single raw record is dropped from its batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("{file} is not an accepted {kind} file")]
    UnsupportedExtension { file: String, kind: MediaKind },

    #[error("record has neither a file nor a url")]
    MissingLocator,
}

/// A resolved item whose underlying file or URL cannot be displayed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaLoadFailure {
    #[error("media file missing: {}", .0.display())]
    Missing(PathBuf),

    #[error("media locator escapes the media root: {0}")]
    OutsideRoot(String),
}

/// Key-value persistence rejected a read or a write.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("stored value under {key} is not valid: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<libsql::Error> for StoreError {
    fn from(err: libsql::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ReactionError {
    #[error("invalid reaction kind {0:?}")]
    InvalidKind(String),

    #[error(transparent)]
    Persistence(#[from] StoreError),
}
