//! Finalizer-mediated wrappers turning maybe-missed deletes into reliable
//! delete delivery.

use crate::reconcile::{
    ReconcileAction, ReconcileError, ReconcileRequest, ReconcileResult, Reconciler,
    ReconcileState,
};
use crate::watcher::ResourceWatcher;
use async_trait::async_trait;
use futures::future::BoxFuture;
use json_patch::{AddOperation, Patch, PatchOperation, ReplaceOperation, TestOperation};
use jsonptr::PointerBuf;
use opkit_core::{
    BoxError, ClientError, DynamicResource, GetClient, PatchClient, PatchOptions, ResourceKind,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

/// Finalizer strings must fit the server-side length cap.
pub const MAX_FINALIZER_LENGTH: usize = 63;

/// The default finalizer for a kind: `operator.<version>.<kind>.<group>`.
#[must_use]
pub fn default_finalizer(kind: &ResourceKind) -> String {
    format!("operator.{}.{}.{}", kind.version, kind.kind, kind.group)
}

/// Errors from wrapper construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FinalizerConfigError {
    /// The finalizer exceeds [`MAX_FINALIZER_LENGTH`]
    #[error("finalizer {0:?} exceeds {MAX_FINALIZER_LENGTH} characters")]
    FinalizerTooLong(String),

    /// The finalizer must be non-empty
    #[error("finalizer must not be empty")]
    EmptyFinalizer,
}

/// A finalizer patch was rejected by the API server.
///
/// Carries the attempted patch so the caller can decide whether to retry.
/// Conflicts surface here after the configured refresh attempts are
/// exhausted.
#[derive(Debug, Error)]
#[error("finalizer patch for {object} failed: {source}")]
pub struct FinalizerOperationError {
    /// `namespace/name` of the object the patch addressed
    pub object: String,

    /// The patch that was attempted
    pub patch: Patch,

    /// The client failure
    #[source]
    pub source: ClientError,
}

impl FinalizerOperationError {
    /// Whether the patch failed on a resource-version conflict
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.source.is_conflict()
    }
}

/// Shared configuration for the opinionated wrappers.
#[derive(Clone, Debug)]
pub struct OpinionatedConfig {
    /// Finalizer to manage; `None` derives [`default_finalizer`]
    pub finalizer: Option<String>,

    /// Re-read the object and re-derive the patch on version conflicts
    pub refresh_on_conflict: bool,

    /// Patch attempts per operation when refreshing on conflict
    pub max_conflict_retries: usize,
}

impl Default for OpinionatedConfig {
    fn default() -> Self {
        Self {
            finalizer: None,
            refresh_on_conflict: false,
            max_conflict_retries: 3,
        }
    }
}

/// Finalizer bookkeeping shared by both wrappers.
struct FinalizerClient {
    client: Arc<dyn PatchClient>,
    getter: Option<Arc<dyn GetClient>>,
    finalizer: String,
    refresh_on_conflict: bool,
    max_conflict_retries: usize,
}

impl FinalizerClient {
    fn new(
        kind: &ResourceKind,
        client: Arc<dyn PatchClient>,
        getter: Option<Arc<dyn GetClient>>,
        config: OpinionatedConfig,
    ) -> Result<Self, FinalizerConfigError> {
        let finalizer = config.finalizer.unwrap_or_else(|| default_finalizer(kind));
        if finalizer.is_empty() {
            return Err(FinalizerConfigError::EmptyFinalizer);
        }
        if finalizer.len() > MAX_FINALIZER_LENGTH {
            return Err(FinalizerConfigError::FinalizerTooLong(finalizer));
        }
        Ok(Self {
            client,
            getter,
            finalizer,
            refresh_on_conflict: config.refresh_on_conflict,
            max_conflict_retries: config.max_conflict_retries.max(1),
        })
    }

    fn has_finalizer(&self, obj: &DynamicResource) -> bool {
        obj.has_finalizer(&self.finalizer)
    }

    /// Ops guarding on the observed resource version, then attaching the
    /// finalizer.
    fn attach_ops(&self, obj: &DynamicResource) -> Patch {
        let mut ops = rv_guard(obj);
        if obj.finalizers().is_empty() {
            ops.push(PatchOperation::Add(AddOperation {
                path: finalizers_pointer(),
                value: serde_json::json!([self.finalizer]),
            }));
        } else {
            ops.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["metadata", "finalizers", "-"]),
                value: serde_json::json!(self.finalizer),
            }));
        }
        Patch(ops)
    }

    /// Ops guarding on the observed resource version, then replacing the
    /// finalizer list with one that omits ours.
    fn remove_ops(&self, obj: &DynamicResource) -> Patch {
        let remaining: Vec<&String> = obj
            .finalizers()
            .iter()
            .filter(|f| *f != &self.finalizer)
            .collect();
        let mut ops = rv_guard(obj);
        ops.push(PatchOperation::Replace(ReplaceOperation {
            path: finalizers_pointer(),
            value: serde_json::json!(remaining),
        }));
        Patch(ops)
    }

    async fn attach(&self, obj: &DynamicResource) -> Result<(), FinalizerOperationError> {
        // Membership is set-like: never append a duplicate.
        if self.has_finalizer(obj) {
            return Ok(());
        }
        self.patch_with_refresh(obj, |target| self.attach_ops(target))
            .await
    }

    async fn remove(&self, obj: &DynamicResource) -> Result<(), FinalizerOperationError> {
        if !self.has_finalizer(obj) {
            return Ok(());
        }
        self.patch_with_refresh(obj, |target| self.remove_ops(target))
            .await
    }

    /// Apply `ops(obj)`, optionally refreshing the object and re-deriving
    /// the patch on conflicts, bounded by `max_conflict_retries`.
    async fn patch_with_refresh(
        &self,
        obj: &DynamicResource,
        ops: impl Fn(&DynamicResource) -> Patch,
    ) -> Result<(), FinalizerOperationError> {
        let identifier = obj.identifier();
        let mut current = obj.clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let patch = ops(&current);
            let span = info_span!("finalizer_patch", object = %current.cache_key(), attempt);
            let result = self
                .client
                .patch(&identifier, &patch, &PatchOptions::default())
                .instrument(span)
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(err) if err.is_conflict() && attempt < self.max_conflict_retries => {
                    let refreshed = match (&self.getter, self.refresh_on_conflict) {
                        (Some(getter), true) => getter.get(&identifier).await.ok(),
                        _ => None,
                    };
                    match refreshed {
                        Some(fresh) => {
                            debug!(object = %current.cache_key(), "finalizer patch conflicted, refreshed object");
                            current = fresh;
                        }
                        None => {
                            return Err(FinalizerOperationError {
                                object: current.cache_key(),
                                patch,
                                source: err,
                            })
                        }
                    }
                }
                Err(err) => {
                    return Err(FinalizerOperationError {
                        object: current.cache_key(),
                        patch,
                        source: err,
                    })
                }
            }
        }
    }
}

fn finalizers_pointer() -> PointerBuf {
    PointerBuf::from_tokens(["metadata", "finalizers"])
}

fn rv_guard(obj: &DynamicResource) -> Vec<PatchOperation> {
    match obj.resource_version() {
        Some(rv) => vec![PatchOperation::Test(TestOperation {
            path: PointerBuf::from_tokens(["metadata", "resourceVersion"]),
            value: serde_json::json!(rv),
        })],
        None => Vec::new(),
    }
}

/// Whether the only difference between `old` and `new` is that `new` gained
/// `finalizer`.
fn only_added_finalizer(old: &DynamicResource, new: &DynamicResource, finalizer: &str) -> bool {
    if old.has_finalizer(finalizer) || !new.has_finalizer(finalizer) {
        return false;
    }
    let mut trimmed: Vec<&String> = new.finalizers().iter().collect();
    trimmed.retain(|f| f.as_str() != finalizer);
    old.generation() == new.generation()
        && old.finalizers().iter().collect::<Vec<_>>() == trimmed
}

type SyncFn =
    Arc<dyn Fn(Arc<DynamicResource>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Watcher wrapper that guarantees delete delivery via a finalizer.
///
/// New objects get the finalizer attached after a successful add; objects
/// already carrying it are treated as resyncs; tombstone updates deliver the
/// delete and then release the finalizer. Raw delete events are ignored: by
/// the time the server sends one, the delete has already been handled during
/// the tombstone update.
pub struct OpinionatedWatcher {
    watcher: Arc<dyn ResourceWatcher>,
    sync_fn: Option<SyncFn>,
    finalizers: FinalizerClient,
}

impl std::fmt::Debug for OpinionatedWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpinionatedWatcher")
            .field("sync_fn", &self.sync_fn.is_some())
            .finish_non_exhaustive()
    }
}

impl OpinionatedWatcher {
    /// Wrap `watcher` for objects of `kind`, patching through `client`
    pub fn new(
        kind: &ResourceKind,
        watcher: Arc<dyn ResourceWatcher>,
        client: Arc<dyn PatchClient>,
        config: OpinionatedConfig,
    ) -> Result<Self, FinalizerConfigError> {
        Ok(Self {
            watcher,
            sync_fn: None,
            finalizers: FinalizerClient::new(kind, client, None, config)?,
        })
    }

    /// Provide a getter used to refresh the object on patch conflicts
    #[must_use]
    pub fn with_getter(mut self, getter: Arc<dyn GetClient>) -> Self {
        self.finalizers.getter = Some(getter);
        self
    }

    /// Handle resyncs (add events for objects already under management);
    /// without one they are no-ops
    #[must_use]
    pub fn with_sync<F>(mut self, f: F) -> Self
    where
        F: Fn(Arc<DynamicResource>) -> BoxFuture<'static, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        self.sync_fn = Some(Arc::new(f));
        self
    }

    /// The finalizer this watcher manages
    #[must_use]
    pub fn finalizer(&self) -> &str {
        &self.finalizers.finalizer
    }

    async fn sync(&self, object: Arc<DynamicResource>) -> Result<(), BoxError> {
        match &self.sync_fn {
            Some(f) => f(object).await,
            None => Ok(()),
        }
    }

    async fn delete_and_release(&self, object: Arc<DynamicResource>) -> Result<(), BoxError> {
        self.watcher.delete(Arc::clone(&object)).await?;
        self.finalizers.remove(&object).await?;
        Ok(())
    }
}

#[async_trait]
impl ResourceWatcher for OpinionatedWatcher {
    async fn add(&self, object: Arc<DynamicResource>) -> Result<(), BoxError> {
        if object.deletion_timestamp().is_some() {
            // Deletion in progress; only act if our finalizer still holds it.
            if self.finalizers.has_finalizer(&object) {
                return self.delete_and_release(object).await;
            }
            return Ok(());
        }
        if self.finalizers.has_finalizer(&object) {
            // Already under management: a restart replayed this object.
            return self.sync(object).await;
        }
        self.watcher.add(Arc::clone(&object)).await?;
        self.finalizers.attach(&object).await?;
        Ok(())
    }

    async fn update(
        &self,
        old: Arc<DynamicResource>,
        new: Arc<DynamicResource>,
    ) -> Result<(), BoxError> {
        if new.deletion_timestamp().is_some() {
            // Tombstone updates keep the old generation, so this branch must
            // come before any generation comparison.
            if self.finalizers.has_finalizer(&new) {
                return self.delete_and_release(new).await;
            }
            return Ok(());
        }
        if !self.finalizers.has_finalizer(&new) {
            // A live object without our finalizer means the add was missed.
            self.finalizers.attach(&new).await?;
        } else if only_added_finalizer(&old, &new, &self.finalizers.finalizer) {
            // Echo of our own attach.
            return Ok(());
        }
        if new.generation() == old.generation() {
            // Status or metadata churn only.
            return Ok(());
        }
        self.watcher.update(old, new).await
    }

    async fn delete(&self, _object: Arc<DynamicResource>) -> Result<(), BoxError> {
        Ok(())
    }
}

/// State key marking that user logic succeeded but the finalizer attach is
/// still owed; the retry then re-attempts only the patch.
const ATTACH_PENDING_STATE_KEY: &str = "finalizer-attach-pending";

/// Reconciler wrapper applying the same finalizer state machine to
/// [`ReconcileRequest`]s.
pub struct OpinionatedReconciler {
    reconciler: Arc<dyn Reconciler>,
    finalizers: FinalizerClient,
}

impl OpinionatedReconciler {
    /// Wrap `reconciler` for objects of `kind`, patching through `client`
    pub fn new(
        kind: &ResourceKind,
        reconciler: Arc<dyn Reconciler>,
        client: Arc<dyn PatchClient>,
        config: OpinionatedConfig,
    ) -> Result<Self, FinalizerConfigError> {
        Ok(Self {
            reconciler,
            finalizers: FinalizerClient::new(kind, client, None, config)?,
        })
    }

    /// Provide a getter used to refresh the object on patch conflicts
    #[must_use]
    pub fn with_getter(mut self, getter: Arc<dyn GetClient>) -> Self {
        self.finalizers.getter = Some(getter);
        self
    }

    /// The finalizer this reconciler manages
    #[must_use]
    pub fn finalizer(&self) -> &str {
        &self.finalizers.finalizer
    }

    fn attach_pending(state: Option<&ReconcileState>) -> bool {
        state
            .and_then(|s| s.get(ATTACH_PENDING_STATE_KEY))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    async fn attach_after_create(
        &self,
        object: &Arc<DynamicResource>,
        mut result: ReconcileResult,
    ) -> Result<ReconcileResult, ReconcileError> {
        match self.finalizers.attach(object).await {
            Ok(()) => Ok(result),
            Err(err) => {
                // User logic already succeeded; checkpoint so the retry only
                // re-attempts the patch.
                let mut state = result.state.take().unwrap_or_default();
                state.insert(ATTACH_PENDING_STATE_KEY.to_string(), serde_json::json!(true));
                Err(ReconcileError::new(err).with_state(state))
            }
        }
    }

    async fn deleted(&self, request: ReconcileRequest) -> Result<ReconcileResult, ReconcileError> {
        let object = Arc::clone(&request.object);
        let result = self
            .reconciler
            .reconcile(ReconcileRequest {
                action: ReconcileAction::Deleted,
                ..request
            })
            .await?;
        self.finalizers
            .remove(&object)
            .await
            .map_err(ReconcileError::new)?;
        Ok(result)
    }
}

#[async_trait]
impl Reconciler for OpinionatedReconciler {
    async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileResult, ReconcileError> {
        let object = Arc::clone(&request.object);
        match request.action {
            ReconcileAction::Created | ReconcileAction::Resynced => {
                if Self::attach_pending(request.state.as_ref()) {
                    // Only the patch is owed from the previous attempt.
                    self.finalizers
                        .attach(&object)
                        .await
                        .map_err(ReconcileError::new)?;
                    return Ok(ReconcileResult::default());
                }
                if object.deletion_timestamp().is_some() {
                    if self.finalizers.has_finalizer(&object) {
                        return self.deleted(request).await;
                    }
                    return Ok(ReconcileResult::default());
                }
                if self.finalizers.has_finalizer(&object) {
                    return self
                        .reconciler
                        .reconcile(ReconcileRequest {
                            action: ReconcileAction::Resynced,
                            ..request
                        })
                        .await;
                }
                let result = self.reconciler.reconcile(request).await?;
                self.attach_after_create(&object, result).await
            }
            ReconcileAction::Updated => {
                if object.deletion_timestamp().is_some() {
                    if self.finalizers.has_finalizer(&object) {
                        return self.deleted(request).await;
                    }
                    return Ok(ReconcileResult::default());
                }
                if !self.finalizers.has_finalizer(&object) {
                    // Missed add: backfill the finalizer before forwarding.
                    self.finalizers
                        .attach(&object)
                        .await
                        .map_err(ReconcileError::new)?;
                } else if request.old.as_deref().is_some_and(|old| {
                    only_added_finalizer(old, &object, &self.finalizers.finalizer)
                }) {
                    // Echo of our own attach.
                    return Ok(ReconcileResult::default());
                }
                if request
                    .old
                    .as_deref()
                    .is_some_and(|old| old.generation() == object.generation())
                {
                    // Status or metadata churn only.
                    return Ok(ReconcileResult::default());
                }
                self.reconciler.reconcile(request).await
            }
            // The delete already ran during the tombstone update.
            ReconcileAction::Deleted => Ok(ReconcileResult::default()),
            ReconcileAction::Unknown => self.reconciler.reconcile(request).await,
        }
    }
}
