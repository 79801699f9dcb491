//! Capability contracts supplied by callers.
//!
//! The runtime never talks to an API server directly; it consumes these
//! traits. Implementations own transport, authentication, decoding, and the
//! retry/backoff of the wire itself.

use crate::metadata::ObjectIdentifier;
use crate::params::{ListOptions, PatchOptions, WatchOptions};
use crate::resource::DynamicResource;
use crate::watch::WatchEvent;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed error used as the handler-facing error currency.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared (cloneable) form of [`BoxError`], used where an error outlives one
/// consumer, e.g. retry bookkeeping.
pub type SharedError = std::sync::Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by client capabilities.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server rejected the request
    #[error("api error {code}: {message}")]
    Api {
        /// HTTP-style status code
        code: u16,
        /// Server-provided cause
        message: String,
    },

    /// A write was rejected because the resource version has moved
    #[error("resource version conflict: {message}")]
    Conflict {
        /// Server-provided cause
        message: String,
    },

    /// Transport-level failure; may succeed on retry
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    /// Response payload could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether this error is a resource-version conflict (HTTP 409 family)
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ClientError::Conflict { .. } | ClientError::Api { code: 409, .. }
        )
    }
}

/// Metadata of a list response.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    /// Resource version the list was taken at
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    /// Continue token; present when the response is one page of many
    #[serde(rename = "continue", skip_serializing_if = "Option::is_none")]
    pub continue_token: Option<String>,
}

/// A page of objects returned by [`ListWatchClient::list`].
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct ResourceList {
    /// List metadata
    #[serde(default)]
    pub metadata: ListMeta,

    /// The objects
    #[serde(default)]
    pub items: Vec<DynamicResource>,
}

/// Stream of watch events, closed by the implementation on disconnect.
pub type WatchStream = BoxStream<'static, Result<WatchEvent<DynamicResource>, ClientError>>;

/// List + watch access to one resource kind.
#[async_trait]
pub trait ListWatchClient: Send + Sync {
    /// List objects in `namespace` (all namespaces when `None`)
    async fn list(
        &self,
        namespace: Option<&str>,
        options: &ListOptions,
    ) -> Result<ResourceList, ClientError>;

    /// Open a watch in `namespace` (all namespaces when `None`)
    async fn watch(
        &self,
        namespace: Option<&str>,
        options: &WatchOptions,
    ) -> Result<WatchStream, ClientError>;
}

/// JSON-patch write access to one resource kind.
#[async_trait]
pub trait PatchClient: Send + Sync {
    /// Apply `patch` to the object at `identifier`, returning the updated
    /// object
    async fn patch(
        &self,
        identifier: &ObjectIdentifier,
        patch: &json_patch::Patch,
        options: &PatchOptions,
    ) -> Result<DynamicResource, ClientError>;
}

/// Point-read access, used to refresh state on version conflicts.
#[async_trait]
pub trait GetClient: Send + Sync {
    /// Fetch the current state of the object at `identifier`
    async fn get(&self, identifier: &ObjectIdentifier) -> Result<DynamicResource, ClientError>;
}
