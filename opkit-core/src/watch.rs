//! Types for the watch stream.

use crate::metadata::TypeMeta;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// A raw event yielded by a watch stream.
#[derive(Deserialize, Serialize, Clone)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<K> {
    /// Resource was added
    Added(K),
    /// Resource was modified
    Modified(K),
    /// Resource was deleted
    Deleted(K),
    /// Progress marker carrying only a resource version
    Bookmark(Bookmark),
    /// Server-side error report on the stream
    Error(WatchError),
}

impl<K> Debug for WatchEvent<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchEvent::Added(_) => f.write_str("Added event"),
            WatchEvent::Modified(_) => f.write_str("Modified event"),
            WatchEvent::Deleted(_) => f.write_str("Deleted event"),
            WatchEvent::Bookmark(_) => f.write_str("Bookmark event"),
            WatchEvent::Error(e) => write!(f, "Error event: {e:?}"),
        }
    }
}

/// Slimmed-down object for [`WatchEvent::Bookmark`].
///
/// Bookmarks carry apiVersion + kind and essentially empty metadata; only the
/// resource version can be relied upon.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Bookmark {
    /// apiVersion + kind
    #[serde(flatten)]
    pub types: TypeMeta,

    /// Metadata reduced to the resource version
    pub metadata: BookmarkMeta,
}

/// Metadata for [`Bookmark`]
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkMeta {
    /// The resource version the stream has progressed to
    pub resource_version: String,
}

/// An error object delivered in-band on a watch stream.
#[derive(Deserialize, Serialize, Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("watch stream error {code}: {message}")]
pub struct WatchError {
    /// HTTP-style status code; `410` means the version window was lost and
    /// the consumer must relist
    pub code: u16,
    /// Human-readable cause
    #[serde(default)]
    pub message: String,
}

impl WatchError {
    /// Whether the consumer has fallen out of the server's version window
    #[must_use]
    pub fn is_gone(&self) -> bool {
        self.code == 410
    }
}
