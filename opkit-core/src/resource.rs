//! The erased resource object and the typed access contract.

use crate::metadata::{namespaced_name, GroupVersionKind, ObjectIdentifier, ObjectMeta, TypeMeta};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// A resource whose kind is known at compile time.
///
/// Implementors pair a serde-able body with a static [`crate::ResourceKind`]
/// descriptor; the runtime itself only ever sees [`DynamicResource`] and
/// converts at the edges via [`DynamicResource::try_into_typed`].
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// The kind descriptor for this type
    fn kind() -> crate::ResourceKind;

    /// Object metadata
    fn meta(&self) -> &ObjectMeta;

    /// Mutable object metadata
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

/// A resource of any kind, with type identity carried at runtime.
///
/// This is the currency of the runtime: informers, stores, watchers and
/// reconcilers all traffic in `DynamicResource`, and typed handlers decode on
/// entry. The payload past `metadata` is kept as raw JSON.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DynamicResource {
    /// apiVersion + kind
    #[serde(flatten)]
    pub types: TypeMeta,

    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// All other fields (spec, status, ...)
    ///
    /// Always a JSON object; `flatten` cannot serialize other value kinds.
    #[serde(flatten)]
    pub data: serde_json::Value,
}

impl Default for DynamicResource {
    fn default() -> Self {
        Self {
            types: TypeMeta::default(),
            metadata: ObjectMeta::default(),
            data: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

impl DynamicResource {
    /// Create a named object of the given kind with no payload
    #[must_use]
    pub fn new(name: &str, gvk: &GroupVersionKind) -> Self {
        Self {
            types: TypeMeta::from_gvk(gvk),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            data: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Attach a payload
    #[must_use]
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Attach a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.metadata.namespace = Some(namespace.to_string());
        self
    }

    /// Object name; empty string if unset (objects returned by an API server
    /// always carry one)
    #[must_use]
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Namespace, if namespaced
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    /// The object's resource version, if set
    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    /// The object's generation, `0` if unset
    #[must_use]
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }

    /// Deletion timestamp, set while the object awaits finalizer removal
    #[must_use]
    pub fn deletion_timestamp(&self) -> Option<&DateTime<Utc>> {
        self.metadata.deletion_timestamp.as_ref()
    }

    /// Finalizer list
    #[must_use]
    pub fn finalizers(&self) -> &[String] {
        &self.metadata.finalizers
    }

    /// Whether `finalizer` is present in the finalizer list
    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.iter().any(|f| f == finalizer)
    }

    /// The runtime kind identity of this object
    #[must_use]
    pub fn gvk(&self) -> GroupVersionKind {
        self.types.to_gvk()
    }

    /// `<namespace>/<name>` cache key
    #[must_use]
    pub fn cache_key(&self) -> String {
        namespaced_name(self.namespace(), self.name())
    }

    /// Namespace + name address for patch/get calls
    #[must_use]
    pub fn identifier(&self) -> ObjectIdentifier {
        ObjectIdentifier {
            namespace: self.metadata.namespace.clone(),
            name: self.name().to_string(),
        }
    }

    /// Decode into a typed resource.
    ///
    /// Fails with [`CannotCastError`] when the runtime kind identity does not
    /// match `T`, or when the payload does not deserialize into `T`.
    pub fn try_into_typed<T: Resource>(&self) -> Result<T, CannotCastError> {
        let expected = T::kind().gvk();
        let found = self.gvk();
        if expected != found {
            return Err(CannotCastError {
                namespace: self.namespace().map(String::from),
                name: self.name().to_string(),
                expected,
                found,
            });
        }
        serde_json::to_value(self)
            .and_then(serde_json::from_value)
            .map_err(|_| CannotCastError {
                namespace: self.namespace().map(String::from),
                name: self.name().to_string(),
                expected: T::kind().gvk(),
                found,
            })
    }

    /// Erase a typed resource into its dynamic representation
    pub fn from_typed<T: Resource>(obj: &T) -> Result<Self, serde_json::Error> {
        let mut value = serde_json::to_value(obj)?;
        if let serde_json::Value::Object(map) = &mut value {
            let gvk = T::kind().gvk();
            map.insert("apiVersion".to_string(), gvk.api_version().into());
            map.insert("kind".to_string(), gvk.kind.clone().into());
        }
        serde_json::from_value(value)
    }
}

/// An object could not be converted to the expected concrete type.
///
/// Never retried by the runtime; a kind mismatch will not fix itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cannot cast object {}/{} of kind {found} to {expected}", namespace.as_deref().unwrap_or(""), name)]
pub struct CannotCastError {
    /// Namespace of the offending object
    pub namespace: Option<String>,
    /// Name of the offending object
    pub name: String,
    /// The kind identity the caller asked for
    pub expected: GroupVersionKind,
    /// The kind identity the object actually carries
    pub found: GroupVersionKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceKind;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Widget {
        metadata: ObjectMeta,
        spec: WidgetSpec,
    }

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct WidgetSpec {
        size: i32,
    }

    impl Resource for Widget {
        fn kind() -> ResourceKind {
            ResourceKind::new("example.io", "v1", "Widget")
        }

        fn meta(&self) -> &ObjectMeta {
            &self.metadata
        }

        fn meta_mut(&mut self) -> &mut ObjectMeta {
            &mut self.metadata
        }
    }

    fn widget_json() -> DynamicResource {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "example.io/v1",
            "kind": "Widget",
            "metadata": {"name": "w1", "namespace": "ns", "generation": 3},
            "spec": {"size": 7},
        }))
        .unwrap()
    }

    #[test]
    fn dynamic_decodes_wire_shape() {
        let obj = widget_json();
        assert_eq!(obj.name(), "w1");
        assert_eq!(obj.namespace(), Some("ns"));
        assert_eq!(obj.generation(), 3);
        assert_eq!(obj.gvk(), GroupVersionKind::gvk("example.io", "v1", "Widget"));
        assert_eq!(obj.cache_key(), "ns/w1");
    }

    #[test]
    fn typed_round_trip() {
        let obj = widget_json();
        let typed: Widget = obj.try_into_typed().unwrap();
        assert_eq!(typed.spec.size, 7);

        let erased = DynamicResource::from_typed(&typed).unwrap();
        assert_eq!(erased.gvk(), obj.gvk());
        assert_eq!(erased.name(), "w1");
    }

    #[test]
    fn cast_rejects_wrong_kind() {
        let mut obj = widget_json();
        obj.types.kind = "Gadget".into();
        let err = obj.try_into_typed::<Widget>().unwrap_err();
        assert_eq!(err.found.kind, "Gadget");
        assert_eq!(err.expected.kind, "Widget");
        assert_eq!(err.name, "w1");
    }

    #[test]
    fn finalizer_lookup() {
        let mut obj = widget_json();
        obj.metadata.finalizers = vec!["a".into(), "b".into()];
        assert!(obj.has_finalizer("a"));
        assert!(!obj.has_finalizer("c"));
    }
}
