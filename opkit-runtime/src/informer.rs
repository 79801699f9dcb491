//! List+watch engine feeding a local cache and an event fan-out.

use crate::processor::{EventHandler, InformerEvent, InformerProcessor, ProcessorError};
use crate::store::{Store, StoreError};
use async_trait::async_trait;
use futures::StreamExt;
use opkit_core::{
    ClientError, DynamicResource, ListOptions, ListWatchClient, ResourceKind, WatchEvent,
    WatchOptions,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

/// Errors terminating an informer run.
#[derive(Debug, Error)]
pub enum InformerError {
    /// The initial list failed; the informer cannot establish a baseline
    #[error("initial list failed: {0}")]
    ListFailed(#[source] ClientError),

    /// The cache store rejected an operation
    #[error("cache store failed: {0}")]
    Store(#[from] StoreError),

    /// `run` was called while a run is already active
    #[error("informer is already running")]
    AlreadyRunning,
}

/// Why a watch loop stopped watching.
enum WatchExit {
    /// Shutdown was requested
    Cancelled,
    /// The server's version window was lost; a re-list is required
    Desynced,
}

/// A source of resource events with a local cache.
#[async_trait]
pub trait Informer: Send + Sync {
    /// Register an event handler. Must be called before [`Informer::run`].
    fn add_event_handler(&self, handler: Arc<dyn EventHandler>) -> Result<(), ProcessorError>;

    /// Drive the informer until `ct` is cancelled or a fatal error occurs
    async fn run(&self, ct: CancellationToken) -> Result<(), InformerError>;

    /// Whether the initial list has been fully processed
    fn has_synced(&self) -> bool;
}

/// Configuration for [`CustomCacheInformer`].
#[derive(Clone, Debug)]
pub struct InformerOptions {
    /// Namespace to list and watch; `None` for all namespaces
    pub namespace: Option<String>,

    /// Label filter expressions applied to list and watch
    pub label_filters: Vec<String>,

    /// Field selector expressions applied to list and watch
    pub field_selectors: Vec<String>,

    /// Page size for the initial list; `None` lets the server decide
    pub list_page_size: Option<i64>,

    /// Consumer-side capacity of each listener queue
    pub event_buffer_size: usize,

    /// Period between synthetic re-emissions of the cached state; zero
    /// disables the ticker
    pub cache_resync_interval: Duration,
}

impl Default for InformerOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            label_filters: Vec::new(),
            field_selectors: Vec::new(),
            list_page_size: None,
            event_buffer_size: crate::buffered_queue::DEFAULT_QUEUE_CAPACITY,
            cache_resync_interval: Duration::ZERO,
        }
    }
}

/// Informer over a [`ListWatchClient`] and a pluggable cache [`Store`].
///
/// A run performs one full (paginated) list, replaces the store with the
/// result, emits an `Add` per object, then watches from the listed resource
/// version, merging every delta into the store before fanning it out. Watch
/// interruptions restart the watch from the last seen version; backoff
/// between attempts is the client's concern. List failures are fatal to the
/// run.
pub struct CustomCacheInformer {
    client: Arc<dyn ListWatchClient>,
    store: Arc<dyn Store>,
    processor: InformerProcessor,
    kind: ResourceKind,
    options: InformerOptions,
    synced: AtomicBool,
    running: AtomicBool,
}

impl CustomCacheInformer {
    /// Create an informer for `kind` backed by `store`
    #[must_use]
    pub fn new(
        client: Arc<dyn ListWatchClient>,
        store: Arc<dyn Store>,
        kind: ResourceKind,
        options: InformerOptions,
    ) -> Self {
        let processor = InformerProcessor::new(options.event_buffer_size);
        Self {
            client,
            store,
            processor,
            kind,
            options,
            synced: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// The kind this informer serves
    #[must_use]
    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// Read access to the backing store
    #[must_use]
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    fn list_options(&self, continue_token: Option<String>) -> ListOptions {
        ListOptions {
            label_filters: self.options.label_filters.clone(),
            field_selectors: self.options.field_selectors.clone(),
            continue_token,
            limit: self.options.list_page_size,
            resource_version: None,
        }
    }

    fn watch_options(&self, resource_version: &str) -> WatchOptions {
        WatchOptions {
            resource_version: Some(resource_version.to_string()),
            label_filters: self.options.label_filters.clone(),
            field_selectors: self.options.field_selectors.clone(),
            ..WatchOptions::default()
        }
    }

    /// Full paginated list, store replacement, and fan-out of the snapshot.
    /// Returns the resource version to start watching at.
    ///
    /// On the first call everything is announced as an initial-list add. A
    /// re-list (after a desync) instead diffs against the cache: survivors
    /// become synthetic updates, newcomers adds, and cached objects missing
    /// from the snapshot are announced as deletes, since their delete events
    /// were lost with the watch.
    async fn list_and_populate(&self) -> Result<String, InformerError> {
        let namespace = self.options.namespace.as_deref();
        let mut items: Vec<Arc<DynamicResource>> = Vec::new();
        let mut continue_token = None;
        let resource_version = loop {
            let page = self
                .client
                .list(namespace, &self.list_options(continue_token.take()))
                .await
                .map_err(InformerError::ListFailed)?;
            items.extend(page.items.into_iter().map(Arc::new));
            match page.metadata.continue_token {
                Some(token) if !token.is_empty() => continue_token = Some(token),
                _ => break page.metadata.resource_version.unwrap_or_default(),
            }
        };
        debug!(kind = %self.kind, objects = items.len(), rv = %resource_version, "list complete");

        let stale = match self.store.list().await {
            Ok(prior) => {
                let listed: std::collections::HashSet<String> =
                    items.iter().map(|obj| obj.cache_key()).collect();
                prior
                    .into_iter()
                    .filter(|obj| !listed.contains(&obj.cache_key()))
                    .collect()
            }
            // Stores that cannot enumerate cannot surface lost deletes.
            Err(StoreError::EnumerationUnsupported) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let mut events = Vec::with_capacity(items.len());
        for obj in &items {
            match self.store.get(obj).await? {
                Some(old) => events.push(InformerEvent::Update {
                    old,
                    new: Arc::clone(obj),
                }),
                None => events.push(InformerEvent::Add {
                    object: Arc::clone(obj),
                    is_in_initial_list: true,
                }),
            }
        }
        self.store.replace(items, &resource_version).await?;
        for obj in stale {
            self.processor.on_delete(obj).await;
        }
        for event in events {
            self.processor.distribute(event).await;
        }
        self.synced.store(true, Ordering::SeqCst);
        Ok(resource_version)
    }

    /// Merge one watch delta into the store and fan out the derived event.
    async fn apply_delta(
        &self,
        event: WatchEvent<DynamicResource>,
        resource_version: &mut String,
    ) -> Result<(), StoreError> {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let obj = Arc::new(obj);
                if let Some(rv) = obj.resource_version() {
                    *resource_version = rv.to_string();
                }
                // Derive Add vs Update from prior existence in the cache, not
                // from the wire event type, so a re-list cannot misreport.
                let prior = self.store.get(&obj).await?;
                match prior {
                    Some(old) => {
                        self.store.update(Arc::clone(&obj)).await?;
                        self.processor.on_update(old, obj).await;
                    }
                    None => {
                        self.store.add(Arc::clone(&obj)).await?;
                        self.processor.on_add(obj, false).await;
                    }
                }
            }
            WatchEvent::Deleted(obj) => {
                let obj = Arc::new(obj);
                if let Some(rv) = obj.resource_version() {
                    *resource_version = rv.to_string();
                }
                self.store.delete(&obj).await?;
                self.processor.on_delete(obj).await;
            }
            WatchEvent::Bookmark(bm) => {
                *resource_version = bm.metadata.resource_version;
            }
            // Error events are handled by the watch loop.
            WatchEvent::Error(_) => {}
        }
        Ok(())
    }

    async fn watch_loop(
        &self,
        mut resource_version: String,
        ct: &CancellationToken,
    ) -> Result<WatchExit, InformerError> {
        let namespace = self.options.namespace.as_deref();
        loop {
            if ct.is_cancelled() {
                return Ok(WatchExit::Cancelled);
            }
            let stream = self
                .client
                .watch(namespace, &self.watch_options(&resource_version))
                .instrument(info_span!("informer_watch", kind = %self.kind, rv = %resource_version))
                .await;
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    // Restart with the last seen version; backoff between
                    // attempts is the client's responsibility.
                    warn!(kind = %self.kind, error = %err, "watch failed to start, retrying");
                    continue;
                }
            };
            loop {
                let event = tokio::select! {
                    () = ct.cancelled() => return Ok(WatchExit::Cancelled),
                    event = stream.next() => event,
                };
                match event {
                    Some(Ok(WatchEvent::Error(err))) => {
                        warn!(kind = %self.kind, code = err.code, message = %err.message, "watch stream error event");
                        if err.is_gone() {
                            // Fell out of the server's version window; only a
                            // fresh list can resynchronize.
                            return Ok(WatchExit::Desynced);
                        }
                        break;
                    }
                    Some(Ok(event)) => self.apply_delta(event, &mut resource_version).await?,
                    Some(Err(err)) => {
                        warn!(kind = %self.kind, error = %err, "watch stream failed, restarting");
                        break;
                    }
                    None => {
                        debug!(kind = %self.kind, "watch stream ended, restarting");
                        break;
                    }
                }
            }
        }
    }

    async fn resync_loop(&self, ct: &CancellationToken) {
        let interval = self.options.cache_resync_interval;
        if interval.is_zero() {
            ct.cancelled().await;
            return;
        }
        loop {
            tokio::select! {
                () = ct.cancelled() => return,
                () = tokio::time::sleep(interval) => {}
            }
            match self.store.list().await {
                Ok(objects) => {
                    debug!(kind = %self.kind, objects = objects.len(), "cache resync");
                    for obj in objects {
                        self.processor.on_cache_sync(obj).await;
                    }
                }
                Err(err) => warn!(kind = %self.kind, error = %err, "cache resync list failed"),
            }
        }
    }
}

#[async_trait]
impl Informer for CustomCacheInformer {
    fn add_event_handler(&self, handler: Arc<dyn EventHandler>) -> Result<(), ProcessorError> {
        self.processor.add_listener(handler)
    }

    async fn run(&self, ct: CancellationToken) -> Result<(), InformerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(InformerError::AlreadyRunning);
        }
        let result = async {
            let child = ct.child_token();
            let processor = self.processor.run(child.clone());
            let work = async {
                loop {
                    let resource_version = self
                        .list_and_populate()
                        .instrument(info_span!("informer_list", kind = %self.kind))
                        .await?;
                    let exit = tokio::select! {
                        exit = self.watch_loop(resource_version, &child) => exit?,
                        () = self.resync_loop(&child) => WatchExit::Cancelled,
                    };
                    match exit {
                        WatchExit::Cancelled => return Ok(()),
                        WatchExit::Desynced => {}
                    }
                }
            };
            // Stop the processor (draining listener queues) however the work
            // future exits.
            let (result, ()) = tokio::join!(
                async {
                    let result = work.await;
                    child.cancel();
                    result
                },
                processor
            );
            result
        }
        .await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}
