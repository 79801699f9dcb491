//! Operator runtime: informers, controllers, retries, and finalizer-aware
//! handlers.
//!
//! The pipeline: a [`CustomCacheInformer`] lists and watches one resource
//! kind through a [`ListWatchClient`](opkit_core::ListWatchClient), mirrors
//! it into a [`Store`], and fans typed events out through an
//! [`InformerProcessor`]. An [`InformerController`] multiplexes those events
//! to registered [`ResourceWatcher`]s and [`Reconciler`]s, scheduling failed
//! invocations into a [`RetryProcessor`] under configurable retry and
//! dequeue policies. [`OpinionatedWatcher`] and [`OpinionatedReconciler`]
//! wrap user handlers with finalizer management so deletes are delivered at
//! least once, and an [`Operator`] composes controllers into one runnable
//! unit.

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod buffered_queue;
pub mod concurrent;
pub mod controller;
pub mod finalizer;
pub mod informer;
pub mod list_map;
pub mod processor;
pub mod reconcile;
pub mod retry;
pub mod store;
pub mod watcher;

pub mod operator;

pub use buffered_queue::BufferedQueue;
pub use concurrent::{ConcurrentWatcher, ConcurrentWatcherConfig, ConcurrentWatcherError};
pub use controller::{
    opinionated_retry_dequeue_policy, ControllerError, InformerController,
    InformerControllerConfig, RetryDequeuePolicy,
};
pub use finalizer::{
    default_finalizer, FinalizerConfigError, FinalizerOperationError, OpinionatedConfig,
    OpinionatedReconciler, OpinionatedWatcher,
};
pub use informer::{CustomCacheInformer, Informer, InformerError, InformerOptions};
pub use list_map::ListMap;
pub use operator::{Controller, Operator};
pub use processor::{EventHandler, InformerEvent, InformerProcessor, ProcessorError};
pub use reconcile::{
    ReconcileAction, ReconcileError, ReconcileRequest, ReconcileResult, ReconcileState,
    Reconciler, ResourceAction, Typed, TypedReconcileRequest, TypedReconciler,
};
pub use retry::{
    default_retry_policy, exponential_backoff_retry_policy, RetryPolicy, RetryProcessor,
    RetryProcessorConfig, RetryRequest,
};
pub use store::{KeyValueClient, KeyValueStore, MemoryStore, Store, StoreError};
pub use watcher::{log_error_handler, ErrorHandler, ResourceWatcher, SimpleWatcher};
