//! Reconciler contracts: actions, requests, results, and typed adapters.

use async_trait::async_trait;
use opkit_core::{BoxError, CannotCastError, DynamicResource, Resource};
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

/// The kind of change an informer observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceAction {
    /// Object was created
    Create,
    /// Object was updated
    Update,
    /// Object was deleted
    Delete,
}

impl Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceAction::Create => f.write_str("CREATE"),
            ResourceAction::Update => f.write_str("UPDATE"),
            ResourceAction::Delete => f.write_str("DELETE"),
        }
    }
}

/// The action presented to a [`Reconciler`].
///
/// A superset of [`ResourceAction`]: `Resynced` is introduced by the
/// finalizer-aware wrappers for objects that were already under management,
/// and `Unknown` is the safe default when a source action cannot be mapped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ReconcileAction {
    /// Object was created
    Created,
    /// Object was updated
    Updated,
    /// Object was deleted
    Deleted,
    /// Object state was re-emitted without an underlying change
    Resynced,
    /// The source action could not be determined
    #[default]
    Unknown,
}

impl Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileAction::Created => f.write_str("CREATED"),
            ReconcileAction::Updated => f.write_str("UPDATED"),
            ReconcileAction::Deleted => f.write_str("DELETED"),
            ReconcileAction::Resynced => f.write_str("RESYNCED"),
            ReconcileAction::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

impl From<ResourceAction> for ReconcileAction {
    fn from(action: ResourceAction) -> Self {
        match action {
            ResourceAction::Create => ReconcileAction::Created,
            ResourceAction::Update => ReconcileAction::Updated,
            ResourceAction::Delete => ReconcileAction::Deleted,
        }
    }
}

/// Opaque checkpoint a reconciler can carry across retries of one logical
/// action.
pub type ReconcileState = HashMap<String, serde_json::Value>;

/// One reconcile invocation.
#[derive(Clone, Debug)]
pub struct ReconcileRequest {
    /// What happened to the object
    pub action: ReconcileAction,

    /// Snapshot of the object the action applies to
    pub object: Arc<DynamicResource>,

    /// State before the change; present only for update actions. Wrappers
    /// use it to tell spec changes apart from status or finalizer churn.
    pub old: Option<Arc<DynamicResource>>,

    /// Checkpoint returned by the previous invocation of this logical
    /// action; `None` on the first call
    pub state: Option<ReconcileState>,
}

/// Outcome of a successful reconcile invocation.
#[derive(Clone, Debug, Default)]
pub struct ReconcileResult {
    /// Re-run the same request after this delay, without consuming retry
    /// budget
    pub requeue_after: Option<Duration>,

    /// Checkpoint to hand to the next invocation
    pub state: Option<ReconcileState>,
}

impl ReconcileResult {
    /// A result requesting a re-run after `delay`
    #[must_use]
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
            state: None,
        }
    }
}

/// A failed reconcile invocation.
///
/// Carries an optional checkpoint so partial progress survives into the
/// retry of the same request.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct ReconcileError {
    /// The underlying failure
    #[source]
    pub source: BoxError,

    /// Checkpoint to hand to the retry; `None` keeps the previous one
    pub state: Option<ReconcileState>,
}

impl ReconcileError {
    /// Wrap an error with no checkpoint
    #[must_use]
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
            state: None,
        }
    }

    /// Attach a checkpoint for the retry
    #[must_use]
    pub fn with_state(mut self, state: ReconcileState) -> Self {
        self.state = Some(state);
        self
    }
}

impl From<BoxError> for ReconcileError {
    fn from(source: BoxError) -> Self {
        Self::new(source)
    }
}

impl From<CannotCastError> for ReconcileError {
    fn from(err: CannotCastError) -> Self {
        Self::new(err)
    }
}

/// Business logic invoked per resource change.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Handle one change. Returning `Err` hands the request to the retry
    /// policy; returning a result with `requeue_after` re-runs it without
    /// consuming retry budget.
    async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileResult, ReconcileError>;
}

/// A reconcile invocation carrying a decoded object.
#[derive(Clone, Debug)]
pub struct TypedReconcileRequest<T> {
    /// What happened to the object
    pub action: ReconcileAction,

    /// The decoded object
    pub object: T,

    /// Checkpoint from the previous invocation
    pub state: Option<ReconcileState>,
}

/// Business logic for a single concrete resource type.
#[async_trait]
pub trait TypedReconciler<T: Resource>: Send + Sync {
    /// Handle one change to a `T`
    async fn reconcile(
        &self,
        request: TypedReconcileRequest<T>,
    ) -> Result<ReconcileResult, ReconcileError>;
}

/// Adapter presenting a [`TypedReconciler`] as a [`Reconciler`].
///
/// Decodes each incoming object into `T`; a kind mismatch or decode failure
/// surfaces [`CannotCastError`], which the controller never retries.
pub struct Typed<T, R> {
    inner: R,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, R> Typed<T, R>
where
    T: Resource,
    R: TypedReconciler<T>,
{
    /// Wrap a typed reconciler
    #[must_use]
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, R> Reconciler for Typed<T, R>
where
    T: Resource,
    R: TypedReconciler<T>,
{
    async fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileResult, ReconcileError> {
        let object: T = request.object.try_into_typed()?;
        self.inner
            .reconcile(TypedReconcileRequest {
                action: request.action,
                object,
                state: request.state,
            })
            .await
    }
}
