//! Metadata structs shared by every resource object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display};

/// Type information that is flattened into every resource object.
#[derive(Deserialize, Serialize, Clone, Default, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    /// The version of the API, e.g. `example.io/v1`
    pub api_version: String,

    /// The name of the kind
    pub kind: String,
}

impl TypeMeta {
    /// Construct from a [`GroupVersionKind`]
    #[must_use]
    pub fn from_gvk(gvk: &GroupVersionKind) -> Self {
        Self {
            api_version: gvk.api_version(),
            kind: gvk.kind.clone(),
        }
    }

    /// Split the `apiVersion` + `kind` back into a [`GroupVersionKind`]
    #[must_use]
    pub fn to_gvk(&self) -> GroupVersionKind {
        let (group, version) = match self.api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), self.api_version.clone()),
        };
        GroupVersionKind {
            group,
            version,
            kind: self.kind.clone(),
        }
    }
}

/// Core group/version/kind identity of a resource kind.
#[derive(Deserialize, Serialize, Clone, Default, Debug, Eq, PartialEq, Hash)]
pub struct GroupVersionKind {
    /// API group; empty for the core group
    pub group: String,
    /// API version
    pub version: String,
    /// Kind name
    pub kind: String,
}

impl GroupVersionKind {
    /// Construct from explicit parts
    #[must_use]
    pub fn gvk(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// The `apiVersion` string, `<group>/<version>` or bare `<version>` for the core group
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.kind, self.version, self.group)
    }
}

/// Full kind descriptor: a [`GroupVersionKind`] plus the plural name used in
/// API paths and store keys.
#[derive(Deserialize, Serialize, Clone, Default, Debug, Eq, PartialEq, Hash)]
pub struct ResourceKind {
    /// API group; empty for the core group
    pub group: String,
    /// API version
    pub version: String,
    /// Kind name
    pub kind: String,
    /// Lowercase plural, e.g. `deployments`
    pub plural: String,
}

impl ResourceKind {
    /// Construct a descriptor, inferring the plural by appending `s`.
    ///
    /// Kinds with irregular plurals should set [`ResourceKind::plural`]
    /// directly.
    #[must_use]
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: format!("{}s", kind.to_ascii_lowercase()),
        }
    }

    /// Override the inferred plural
    #[must_use]
    pub fn with_plural(mut self, plural: &str) -> Self {
        self.plural = plural.to_string();
        self
    }

    /// The group/version/kind part of this descriptor
    #[must_use]
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
        }
    }

    /// The `apiVersion` string for this kind
    #[must_use]
    pub fn api_version(&self) -> String {
        self.gvk().api_version()
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.kind, self.version, self.group)
    }
}

/// Standard object metadata.
///
/// The subset of apimachinery `ObjectMeta` the runtime relies on, with the
/// same wire names. Unknown metadata fields are dropped on decode.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    /// Object name, unique within a namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Namespace; `None` for cluster-scoped objects
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Opaque version identifier, monotonic per object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    /// Monotonic counter bumped only on spec-affecting changes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,

    /// Server-assigned unique identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Set when deletion has been requested and finalizers are pending
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    /// Creation time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// Keys blocking hard deletion until removed
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    /// String key/value labels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    /// String key/value annotations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Namespace + name address of one object, used by patch/get capabilities.
#[derive(Deserialize, Serialize, Clone, Default, Debug, Eq, PartialEq, Hash)]
pub struct ObjectIdentifier {
    /// Namespace; `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Cache key for an object: `<namespace>/<name>`, or bare `<name>` when
/// cluster-scoped.
#[must_use]
pub fn namespaced_name(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}
