//! Shared resource types and capability contracts for opkit operators.
//!
//! This crate is client-less: it defines the object model
//! ([`DynamicResource`], [`ObjectMeta`], [`ResourceKind`]) and the capability
//! traits ([`ListWatchClient`], [`PatchClient`], [`GetClient`]) that the
//! runtime in `opkit-runtime` consumes. Concrete API-server clients live with
//! the caller.

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod client;
pub mod metadata;
pub mod params;
pub mod resource;
pub mod watch;

pub use client::{
    BoxError, ClientError, GetClient, ListMeta, ListWatchClient, PatchClient, ResourceList,
    SharedError, WatchStream,
};
pub use metadata::{
    namespaced_name, GroupVersionKind, ObjectIdentifier, ObjectMeta, ResourceKind, TypeMeta,
};
pub use params::{ListOptions, PatchOptions, ResourceVersionMatch, WatchOptions};
pub use resource::{CannotCastError, DynamicResource, Resource};
pub use watch::{Bookmark, BookmarkMeta, WatchError, WatchEvent};
