//! Coordination of informers, watchers, and reconcilers with retries.

use crate::informer::Informer;
use crate::list_map::ListMap;
use crate::processor::{EventHandler, InformerEvent, ProcessorError};
use crate::reconcile::{
    ReconcileAction, ReconcileRequest, ReconcileState, Reconciler, ResourceAction,
};
use crate::retry::{
    default_retry_policy, RetryFn, RetryOutcome, RetryPolicy, RetryProcessor,
    RetryProcessorConfig, RetryRequest,
};
use crate::watcher::{log_error_handler, ErrorHandler, ResourceWatcher};
use async_trait::async_trait;
use futures::FutureExt;
use opkit_core::{BoxError, CannotCastError, DynamicResource, SharedError};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};

/// Decides whether an incoming event displaces a pending retry.
///
/// Called with the new event's action and object plus the pending
/// [`RetryRequest`]; returning `true` removes the retry.
pub type RetryDequeuePolicy =
    Arc<dyn Fn(ResourceAction, &DynamicResource, &RetryRequest) -> bool + Send + Sync>;

/// The recommended dequeue policy.
///
/// Dequeues a pending retry when a delete arrives, or when the incoming
/// object's generation differs from the queued one: queued work about a spec
/// revision that no longer exists is stale. Identical-generation bursts leave
/// retry state alone.
#[must_use]
pub fn opinionated_retry_dequeue_policy() -> RetryDequeuePolicy {
    Arc::new(|new_action, new_object, pending| {
        if new_action == ResourceAction::Delete {
            return true;
        }
        new_object.generation() != pending.object.generation()
    })
}

/// Errors from controller registration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControllerError {
    /// Registration requires a non-empty resource kind
    #[error("resource kind must not be empty")]
    EmptyKind,

    /// The informer refused the controller's event handler
    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

/// Configuration for [`InformerController`].
#[derive(Clone)]
pub struct InformerControllerConfig {
    /// Receives handler and informer failures
    pub error_handler: ErrorHandler,

    /// Retry policy applied to failed handlers; `None` disables retries
    pub retry_policy: Option<RetryPolicy>,

    /// Dequeue policy applied when new events arrive; `None` dequeues every
    /// pending retry for the key
    pub retry_dequeue_policy: Option<RetryDequeuePolicy>,

    /// Heap re-check interval of the retry processor
    pub retry_ticker_interval: Duration,

    /// Worker shards of the retry processor
    pub retry_worker_pool_size: usize,
}

impl Default for InformerControllerConfig {
    fn default() -> Self {
        let retry_defaults = RetryProcessorConfig::default();
        Self {
            error_handler: log_error_handler(),
            retry_policy: Some(default_retry_policy()),
            retry_dequeue_policy: Some(opinionated_retry_dequeue_policy()),
            retry_ticker_interval: retry_defaults.check_interval,
            retry_worker_pool_size: retry_defaults.worker_pool_size,
        }
    }
}

/// The identity under which retries for one object at one handler slot are
/// tracked.
fn retry_key(kind: &str, handler_index: usize, namespace: Option<&str>, name: &str) -> String {
    format!("{kind}:{handler_index}:{}:{name}", namespace.unwrap_or(""))
}

/// Shared dispatch state, handed to the per-kind event handlers registered on
/// informers. Deliberately does not own the informers, so handlers never form
/// a reference cycle back through them.
struct Dispatcher {
    watchers: ListMap<String, Arc<dyn ResourceWatcher>>,
    reconcilers: ListMap<String, Arc<dyn Reconciler>>,
    retry: RetryProcessor,
    retry_policy: Arc<RwLock<Option<RetryPolicy>>>,
    dequeue_policy: RwLock<Option<RetryDequeuePolicy>>,
    error_handler: ErrorHandler,
}

impl Dispatcher {
    /// Fan one event out to every watcher and reconciler registered for
    /// `kind`, in registration order.
    async fn dispatch(
        &self,
        kind: &str,
        action: ResourceAction,
        old: Option<Arc<DynamicResource>>,
        new: Arc<DynamicResource>,
    ) {
        let kind_key = kind.to_string();
        let watchers = self.watchers.items(&kind_key);
        let reconcilers = self.reconcilers.items(&kind_key);

        for (index, watcher) in watchers.iter().enumerate() {
            let key = retry_key(kind, index, new.namespace(), new.name());
            self.apply_dequeue_policy(&key, action, &new);
            let result = invoke_watcher(watcher, action, old.clone(), Arc::clone(&new))
                .instrument(info_span!("watcher_dispatch", kind, action = %action, object = %new.cache_key()))
                .await;
            if let Err(err) = result {
                self.watcher_failed(key, watcher, action, old.clone(), Arc::clone(&new), err);
            }
        }

        for (offset, reconciler) in reconcilers.iter().enumerate() {
            let key = retry_key(kind, watchers.len() + offset, new.namespace(), new.name());
            self.apply_dequeue_policy(&key, action, &new);
            let reconcile_action = ReconcileAction::from(action);
            let request = ReconcileRequest {
                action: reconcile_action,
                object: Arc::clone(&new),
                old: old.clone(),
                state: None,
            };
            let result = reconciler
                .reconcile(request)
                .instrument(info_span!("reconcile", kind, action = %reconcile_action, object = %new.cache_key()))
                .await;
            match result {
                Ok(outcome) => {
                    if let Some(delay) = outcome.requeue_after {
                        // Explicit requeue bypasses the retry policy and does
                        // not consume retry budget.
                        let state = Arc::new(Mutex::new(outcome.state));
                        self.retry.enqueue(RetryRequest {
                            key,
                            retry_after: Instant::now() + delay,
                            attempt: 0,
                            action,
                            object: Arc::clone(&new),
                            last_error: None,
                            run: reconcile_retry_fn(
                                Arc::clone(reconciler),
                                reconcile_action,
                                old.clone(),
                                Arc::clone(&new),
                                state,
                            ),
                        });
                    }
                }
                Err(err) => {
                    let checkpoint = err.state;
                    let shared: SharedError = Arc::from(err.source);
                    (self.error_handler)(shared.as_ref());
                    if shared.downcast_ref::<CannotCastError>().is_some() {
                        continue;
                    }
                    let Some(policy) = self.retry_policy.read().clone() else {
                        continue;
                    };
                    let Some(delay) = policy(shared.as_ref(), 0) else {
                        continue;
                    };
                    let state = Arc::new(Mutex::new(checkpoint));
                    self.retry.enqueue(RetryRequest {
                        key,
                        retry_after: Instant::now() + delay,
                        attempt: 1,
                        action,
                        object: Arc::clone(&new),
                        last_error: Some(shared),
                        run: reconcile_retry_fn(
                            Arc::clone(reconciler),
                            reconcile_action,
                            old.clone(),
                            Arc::clone(&new),
                            state,
                        ),
                    });
                }
            }
        }
    }

    fn apply_dequeue_policy(&self, key: &str, action: ResourceAction, new: &Arc<DynamicResource>) {
        match self.dequeue_policy.read().clone() {
            Some(policy) => {
                self.retry.dequeue(key, |pending| policy(action, new, pending));
            }
            None => {
                self.retry.dequeue_all(key);
            }
        }
    }

    fn watcher_failed(
        &self,
        key: String,
        watcher: &Arc<dyn ResourceWatcher>,
        action: ResourceAction,
        old: Option<Arc<DynamicResource>>,
        new: Arc<DynamicResource>,
        err: BoxError,
    ) {
        let shared: SharedError = Arc::from(err);
        (self.error_handler)(shared.as_ref());
        if shared.downcast_ref::<CannotCastError>().is_some() {
            return;
        }
        let Some(policy) = self.retry_policy.read().clone() else {
            return;
        };
        let Some(delay) = policy(shared.as_ref(), 0) else {
            return;
        };
        self.retry.enqueue(RetryRequest {
            key,
            retry_after: Instant::now() + delay,
            attempt: 1,
            action,
            object: Arc::clone(&new),
            last_error: Some(shared),
            run: watcher_retry_fn(Arc::clone(watcher), action, old, new),
        });
    }
}

async fn invoke_watcher(
    watcher: &Arc<dyn ResourceWatcher>,
    action: ResourceAction,
    old: Option<Arc<DynamicResource>>,
    new: Arc<DynamicResource>,
) -> Result<(), BoxError> {
    match action {
        ResourceAction::Create => watcher.add(new).await,
        ResourceAction::Update => match old {
            Some(old) => watcher.update(old, new).await,
            // An update with no prior state is an add we missed.
            None => watcher.add(new).await,
        },
        ResourceAction::Delete => watcher.delete(new).await,
    }
}

fn watcher_retry_fn(
    watcher: Arc<dyn ResourceWatcher>,
    action: ResourceAction,
    old: Option<Arc<DynamicResource>>,
    new: Arc<DynamicResource>,
) -> RetryFn {
    Arc::new(move || {
        let watcher = Arc::clone(&watcher);
        let old = old.clone();
        let new = Arc::clone(&new);
        async move {
            let result = invoke_watcher(&watcher, action, old, new).await;
            RetryOutcome {
                requeue_after: None,
                error: result.err().map(SharedError::from),
            }
        }
        .boxed()
    })
}

fn reconcile_retry_fn(
    reconciler: Arc<dyn Reconciler>,
    action: ReconcileAction,
    old: Option<Arc<DynamicResource>>,
    object: Arc<DynamicResource>,
    state: Arc<Mutex<Option<ReconcileState>>>,
) -> RetryFn {
    Arc::new(move || {
        let reconciler = Arc::clone(&reconciler);
        let old = old.clone();
        let object = Arc::clone(&object);
        let state = Arc::clone(&state);
        async move {
            let request = ReconcileRequest {
                action,
                object,
                old,
                state: state.lock().clone(),
            };
            match reconciler.reconcile(request).await {
                Ok(outcome) => {
                    *state.lock() = outcome.state;
                    RetryOutcome {
                        requeue_after: outcome.requeue_after,
                        error: None,
                    }
                }
                Err(err) => {
                    if let Some(checkpoint) = err.state {
                        *state.lock() = Some(checkpoint);
                    }
                    RetryOutcome {
                        requeue_after: None,
                        error: Some(Arc::from(err.source)),
                    }
                }
            }
        }
        .boxed()
    })
}

/// The controller's event handler for one registered kind.
struct KindHandler {
    kind: String,
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl EventHandler for KindHandler {
    async fn handle(&self, event: InformerEvent) {
        match event {
            InformerEvent::Add { object, .. } => {
                self.dispatcher
                    .dispatch(&self.kind, ResourceAction::Create, None, object)
                    .await;
            }
            InformerEvent::Update { old, new } => {
                self.dispatcher
                    .dispatch(&self.kind, ResourceAction::Update, Some(old), new)
                    .await;
            }
            InformerEvent::Delete { object } => {
                self.dispatcher
                    .dispatch(&self.kind, ResourceAction::Delete, None, object)
                    .await;
            }
            InformerEvent::CacheSync { object } => {
                // Cached state re-emitted with no underlying change: present
                // it as an update from the object to itself.
                self.dispatcher
                    .dispatch(
                        &self.kind,
                        ResourceAction::Update,
                        Some(Arc::clone(&object)),
                        object,
                    )
                    .await;
            }
        }
    }
}

/// Binds informers to watchers and reconcilers, applying retry and dequeue
/// policies to every failed handler invocation.
pub struct InformerController {
    informers: ListMap<String, Arc<dyn Informer>>,
    dispatcher: Arc<Dispatcher>,
}

impl InformerController {
    /// Create a controller with `config`
    #[must_use]
    pub fn new(config: InformerControllerConfig) -> Self {
        let retry_policy = Arc::new(RwLock::new(config.retry_policy));
        let policy_source = {
            let slot = Arc::clone(&retry_policy);
            Arc::new(move || slot.read().clone())
        };
        let retry = RetryProcessor::new(
            RetryProcessorConfig {
                worker_pool_size: config.retry_worker_pool_size,
                check_interval: config.retry_ticker_interval,
            },
            policy_source,
        );
        Self {
            informers: ListMap::new(),
            dispatcher: Arc::new(Dispatcher {
                watchers: ListMap::new(),
                reconcilers: ListMap::new(),
                retry,
                retry_policy,
                dequeue_policy: RwLock::new(config.retry_dequeue_policy),
                error_handler: config.error_handler,
            }),
        }
    }

    /// Register `informer` under `kind`, wiring its events into the
    /// controller's fan-out.
    pub fn add_informer(
        &self,
        informer: Arc<dyn Informer>,
        kind: &str,
    ) -> Result<(), ControllerError> {
        if kind.is_empty() {
            return Err(ControllerError::EmptyKind);
        }
        informer.add_event_handler(Arc::new(KindHandler {
            kind: kind.to_string(),
            dispatcher: Arc::clone(&self.dispatcher),
        }))?;
        self.informers.add_item(kind.to_string(), [informer]);
        Ok(())
    }

    /// Drop `informer` from the run set.
    ///
    /// The informer keeps its already-registered event handler; it simply is
    /// no longer started by [`InformerController::run`].
    pub fn remove_informer(&self, informer: &Arc<dyn Informer>, kind: &str) {
        self.informers
            .remove_item(&kind.to_string(), |item| Arc::ptr_eq(item, informer));
    }

    /// Register a watcher for events of `kind`
    pub fn add_watcher(
        &self,
        watcher: Arc<dyn ResourceWatcher>,
        kind: &str,
    ) -> Result<(), ControllerError> {
        if kind.is_empty() {
            return Err(ControllerError::EmptyKind);
        }
        self.dispatcher.watchers.add_item(kind.to_string(), [watcher]);
        Ok(())
    }

    /// Drop a previously registered watcher
    pub fn remove_watcher(&self, watcher: &Arc<dyn ResourceWatcher>, kind: &str) {
        self.dispatcher
            .watchers
            .remove_item(&kind.to_string(), |item| Arc::ptr_eq(item, watcher));
    }

    /// Register a reconciler for events of `kind`
    pub fn add_reconciler(
        &self,
        reconciler: Arc<dyn Reconciler>,
        kind: &str,
    ) -> Result<(), ControllerError> {
        if kind.is_empty() {
            return Err(ControllerError::EmptyKind);
        }
        self.dispatcher.reconcilers.add_item(kind.to_string(), [reconciler]);
        Ok(())
    }

    /// Drop a previously registered reconciler
    pub fn remove_reconciler(&self, reconciler: &Arc<dyn Reconciler>, kind: &str) {
        self.dispatcher
            .reconcilers
            .remove_item(&kind.to_string(), |item| Arc::ptr_eq(item, reconciler));
    }

    /// Replace the retry policy; takes effect for subsequent failures
    pub fn set_retry_policy(&self, policy: Option<RetryPolicy>) {
        *self.dispatcher.retry_policy.write() = policy;
    }

    /// Replace the dequeue policy; takes effect for subsequent events
    pub fn set_retry_dequeue_policy(&self, policy: Option<RetryDequeuePolicy>) {
        *self.dispatcher.dequeue_policy.write() = policy;
    }

    /// Number of retries currently pending
    #[must_use]
    pub fn pending_retries(&self) -> usize {
        self.dispatcher.retry.len()
    }

    /// Whether every registered informer has completed its initial list
    #[must_use]
    pub fn healthy(&self) -> bool {
        let mut synced = true;
        self.informers.range_all(|_, _, informer| {
            synced &= informer.has_synced();
        });
        synced
    }

    /// Run all informers and the retry processor until `ct` is cancelled.
    ///
    /// Informer failures are reported to the error handler; remaining
    /// informers keep running. Pending retries are abandoned on cancellation.
    pub async fn run(&self, ct: CancellationToken) {
        let child = ct.child_token();
        let mut tasks = JoinSet::new();

        {
            let dispatcher = Arc::clone(&self.dispatcher);
            let ct = child.clone();
            tasks.spawn(async move { dispatcher.retry.run(ct).await });
        }

        let mut informers = Vec::new();
        self.informers.range_all(|kind, _, informer| {
            informers.push((kind.clone(), Arc::clone(informer)));
        });
        for (kind, informer) in informers {
            let ct = child.clone();
            let error_handler = Arc::clone(&self.dispatcher.error_handler);
            tasks.spawn(async move {
                if let Err(err) = informer.run(ct).await {
                    warn!(kind = %kind, error = %err, "informer terminated");
                    error_handler(&err);
                }
            });
        }

        ct.cancelled().await;
        child.cancel();
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::informer::InformerError;
    use crate::reconcile::{ReconcileError, ReconcileResult};
    use crate::retry::exponential_backoff_retry_policy;
    use opkit_core::GroupVersionKind;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn widget(name: &str, generation: i64) -> Arc<DynamicResource> {
        let mut obj =
            DynamicResource::new(name, &GroupVersionKind::gvk("example.io", "v1", "Widget"))
                .within("ns");
        obj.metadata.generation = Some(generation);
        Arc::new(obj)
    }

    /// Informer driven by hand: captures the controller's handler so tests
    /// can fire events directly.
    #[derive(Default)]
    struct ManualInformer {
        handler: Mutex<Option<Arc<dyn EventHandler>>>,
        synced: AtomicBool,
    }

    impl ManualInformer {
        async fn fire(&self, event: InformerEvent) {
            let handler = self.handler.lock().clone();
            handler.expect("no handler registered").handle(event).await;
        }
    }

    #[async_trait]
    impl Informer for ManualInformer {
        fn add_event_handler(&self, handler: Arc<dyn EventHandler>) -> Result<(), ProcessorError> {
            *self.handler.lock() = Some(handler);
            Ok(())
        }

        async fn run(&self, ct: CancellationToken) -> Result<(), InformerError> {
            self.synced.store(true, Ordering::SeqCst);
            ct.cancelled().await;
            Ok(())
        }

        fn has_synced(&self) -> bool {
            self.synced.load(Ordering::SeqCst)
        }
    }

    struct CountingWatcher {
        adds: Mutex<Vec<Instant>>,
        deletes: Mutex<Vec<Instant>>,
        fail_adds: bool,
    }

    impl CountingWatcher {
        fn new(fail_adds: bool) -> Self {
            Self {
                adds: Mutex::new(Vec::new()),
                deletes: Mutex::new(Vec::new()),
                fail_adds,
            }
        }
    }

    #[async_trait]
    impl ResourceWatcher for CountingWatcher {
        async fn add(&self, _object: Arc<DynamicResource>) -> Result<(), BoxError> {
            self.adds.lock().push(Instant::now());
            if self.fail_adds {
                Err("add failed".into())
            } else {
                Ok(())
            }
        }

        async fn update(
            &self,
            _old: Arc<DynamicResource>,
            _new: Arc<DynamicResource>,
        ) -> Result<(), BoxError> {
            Ok(())
        }

        async fn delete(&self, _object: Arc<DynamicResource>) -> Result<(), BoxError> {
            self.deletes.lock().push(Instant::now());
            Ok(())
        }
    }

    fn quiet_config() -> InformerControllerConfig {
        InformerControllerConfig {
            error_handler: Arc::new(|_| {}),
            ..InformerControllerConfig::default()
        }
    }

    struct Harness {
        controller: Arc<InformerController>,
        informer: Arc<ManualInformer>,
        ct: CancellationToken,
        runner: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        fn start(config: InformerControllerConfig) -> Self {
            let controller = Arc::new(InformerController::new(config));
            let informer = Arc::new(ManualInformer::default());
            controller
                .add_informer(Arc::clone(&informer) as Arc<dyn Informer>, "widgets")
                .unwrap();
            let ct = CancellationToken::new();
            let runner = {
                let controller = Arc::clone(&controller);
                let ct = ct.clone();
                tokio::spawn(async move { controller.run(ct).await })
            };
            Self { controller, informer, ct, runner }
        }

        async fn shutdown(self) {
            self.ct.cancel();
            self.runner.await.unwrap();
        }
    }

    #[tokio::test]
    async fn registration_rejects_empty_kind() {
        let controller = InformerController::new(quiet_config());
        let informer: Arc<dyn Informer> = Arc::new(ManualInformer::default());
        let watcher: Arc<dyn ResourceWatcher> = Arc::new(CountingWatcher::new(false));
        assert_eq!(
            controller.add_informer(informer, "").unwrap_err(),
            ControllerError::EmptyKind
        );
        assert_eq!(
            controller.add_watcher(watcher, "").unwrap_err(),
            ControllerError::EmptyKind
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failing_watcher_retries_with_exponential_backoff() {
        let mut config = quiet_config();
        config.retry_policy = Some(exponential_backoff_retry_policy(Duration::from_secs(1), 2));
        let harness = Harness::start(config);

        let watcher = Arc::new(CountingWatcher::new(true));
        harness
            .controller
            .add_watcher(Arc::clone(&watcher) as Arc<dyn ResourceWatcher>, "widgets")
            .unwrap();

        let start = Instant::now();
        harness
            .informer
            .fire(InformerEvent::Add { object: widget("o1", 1), is_in_initial_list: false })
            .await;

        tokio::time::sleep(Duration::from_secs(20)).await;

        // Initial call plus two retries at +1s and +3s, then the policy gives
        // up: the budget caps total invocations at max_attempts + 1.
        let adds = watcher.adds.lock();
        assert_eq!(adds.len(), 3);
        assert_eq!(adds[0] - start, Duration::ZERO);
        assert_eq!(adds[1] - start, Duration::from_secs(1));
        assert_eq!(adds[2] - start, Duration::from_secs(3));
        drop(adds);

        assert_eq!(harness.controller.pending_retries(), 0);
        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn delete_dequeues_pending_add_retry() {
        let mut config = quiet_config();
        config.retry_policy = Some(exponential_backoff_retry_policy(Duration::from_secs(1), 5));
        let harness = Harness::start(config);

        let watcher = Arc::new(CountingWatcher::new(true));
        harness
            .controller
            .add_watcher(Arc::clone(&watcher) as Arc<dyn ResourceWatcher>, "widgets")
            .unwrap();

        harness
            .informer
            .fire(InformerEvent::Add { object: widget("o1", 1), is_in_initial_list: false })
            .await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        harness
            .informer
            .fire(InformerEvent::Delete { object: widget("o1", 1) })
            .await;

        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(watcher.adds.lock().len(), 1);
        assert_eq!(watcher.deletes.lock().len(), 1);
        assert_eq!(harness.controller.pending_retries(), 0);
        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn same_generation_update_keeps_pending_retry() {
        let mut config = quiet_config();
        config.retry_policy = Some(exponential_backoff_retry_policy(Duration::from_secs(10), 5));
        let harness = Harness::start(config);

        let watcher = Arc::new(CountingWatcher::new(true));
        harness
            .controller
            .add_watcher(Arc::clone(&watcher) as Arc<dyn ResourceWatcher>, "widgets")
            .unwrap();

        harness
            .informer
            .fire(InformerEvent::Add { object: widget("o1", 1), is_in_initial_list: false })
            .await;
        assert_eq!(harness.controller.pending_retries(), 1);

        // Status-only update: same generation, the pending retry survives.
        harness
            .informer
            .fire(InformerEvent::Update { old: widget("o1", 1), new: widget("o1", 1) })
            .await;
        assert_eq!(harness.controller.pending_retries(), 1);

        // Spec change: higher generation displaces it.
        harness
            .informer
            .fire(InformerEvent::Update { old: widget("o1", 1), new: widget("o1", 2) })
            .await;
        assert_eq!(harness.controller.pending_retries(), 0);
        harness.shutdown().await;
    }

    struct RequeueReconciler {
        calls: Mutex<Vec<Option<ReconcileState>>>,
        remaining: Mutex<usize>,
    }

    #[async_trait]
    impl Reconciler for RequeueReconciler {
        async fn reconcile(
            &self,
            request: ReconcileRequest,
        ) -> Result<ReconcileResult, ReconcileError> {
            self.calls.lock().push(request.state.clone());
            let mut remaining = self.remaining.lock();
            if *remaining == 0 {
                return Ok(ReconcileResult::default());
            }
            *remaining -= 1;
            let mut state = ReconcileState::new();
            state.insert("step".into(), serde_json::json!(*remaining));
            Ok(ReconcileResult {
                requeue_after: Some(Duration::from_secs(1)),
                state: Some(state),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_does_not_consume_retry_budget() {
        let mut config = quiet_config();
        // No retry policy at all: explicit requeues must still be honored.
        config.retry_policy = None;
        let harness = Harness::start(config);

        let reconciler = Arc::new(RequeueReconciler {
            calls: Mutex::new(Vec::new()),
            remaining: Mutex::new(10),
        });
        harness
            .controller
            .add_reconciler(Arc::clone(&reconciler) as Arc<dyn Reconciler>, "widgets")
            .unwrap();

        harness
            .informer
            .fire(InformerEvent::Add { object: widget("o1", 1), is_in_initial_list: false })
            .await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        let calls = reconciler.calls.lock();
        assert_eq!(calls.len(), 11);
        // First call has no state; each requeue carries the previous result's
        // checkpoint forward.
        assert!(calls[0].is_none());
        assert_eq!(calls[1].as_ref().unwrap()["step"], serde_json::json!(9));
        assert_eq!(calls[10].as_ref().unwrap()["step"], serde_json::json!(0));
        drop(calls);
        assert_eq!(harness.controller.pending_retries(), 0);
        harness.shutdown().await;
    }

    struct CheckpointReconciler {
        states_seen: Mutex<Vec<Option<ReconcileState>>>,
    }

    #[async_trait]
    impl Reconciler for CheckpointReconciler {
        async fn reconcile(
            &self,
            request: ReconcileRequest,
        ) -> Result<ReconcileResult, ReconcileError> {
            let mut seen = self.states_seen.lock();
            seen.push(request.state.clone());
            if seen.len() == 1 {
                let mut state = ReconcileState::new();
                state.insert("resume-from".into(), serde_json::json!("phase-two"));
                Err(ReconcileError::new("phase one failed").with_state(state))
            } else {
                Ok(ReconcileResult::default())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn error_checkpoint_reaches_the_retry() {
        let mut config = quiet_config();
        config.retry_policy = Some(exponential_backoff_retry_policy(Duration::from_secs(1), 5));
        let harness = Harness::start(config);

        let reconciler = Arc::new(CheckpointReconciler { states_seen: Mutex::new(Vec::new()) });
        harness
            .controller
            .add_reconciler(Arc::clone(&reconciler) as Arc<dyn Reconciler>, "widgets")
            .unwrap();

        harness
            .informer
            .fire(InformerEvent::Add { object: widget("o1", 1), is_in_initial_list: false })
            .await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let seen = reconciler.states_seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_none());
        assert_eq!(
            seen[1].as_ref().unwrap()["resume-from"],
            serde_json::json!("phase-two")
        );
        harness.shutdown().await;
    }

    struct OldCapturingReconciler {
        seen: Mutex<Vec<(ReconcileAction, Option<i64>)>>,
    }

    #[async_trait]
    impl Reconciler for OldCapturingReconciler {
        async fn reconcile(
            &self,
            request: ReconcileRequest,
        ) -> Result<ReconcileResult, ReconcileError> {
            self.seen
                .lock()
                .push((request.action, request.old.as_ref().map(|old| old.generation())));
            Ok(ReconcileResult::default())
        }
    }

    #[tokio::test]
    async fn dispatch_threads_the_previous_object_to_reconcilers() {
        let harness = Harness::start(quiet_config());
        let reconciler = Arc::new(OldCapturingReconciler { seen: Mutex::new(Vec::new()) });
        harness
            .controller
            .add_reconciler(Arc::clone(&reconciler) as Arc<dyn Reconciler>, "widgets")
            .unwrap();

        harness
            .informer
            .fire(InformerEvent::Add { object: widget("o1", 1), is_in_initial_list: false })
            .await;
        harness
            .informer
            .fire(InformerEvent::Update { old: widget("o1", 1), new: widget("o1", 2) })
            .await;
        // Cache resyncs dispatch as an update from the object to itself, so
        // generation-aware wrappers can recognize and drop them.
        harness
            .informer
            .fire(InformerEvent::CacheSync { object: widget("o1", 2) })
            .await;

        assert_eq!(
            *reconciler.seen.lock(),
            vec![
                (ReconcileAction::Created, None),
                (ReconcileAction::Updated, Some(1)),
                (ReconcileAction::Updated, Some(2)),
            ]
        );
        harness.shutdown().await;
    }

    struct CastFailingReconciler;

    #[async_trait]
    impl Reconciler for CastFailingReconciler {
        async fn reconcile(
            &self,
            request: ReconcileRequest,
        ) -> Result<ReconcileResult, ReconcileError> {
            Err(ReconcileError::new(CannotCastError {
                namespace: request.object.namespace().map(String::from),
                name: request.object.name().to_string(),
                expected: GroupVersionKind::gvk("example.io", "v1", "Gadget"),
                found: request.object.gvk(),
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cast_failures_are_never_retried() {
        let harness = Harness::start(quiet_config());
        harness
            .controller
            .add_reconciler(Arc::new(CastFailingReconciler), "widgets")
            .unwrap();
        harness
            .informer
            .fire(InformerEvent::Add { object: widget("o1", 1), is_in_initial_list: false })
            .await;
        assert_eq!(harness.controller.pending_retries(), 0);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn health_follows_informer_sync() {
        let controller = Arc::new(InformerController::new(quiet_config()));
        let informer = Arc::new(ManualInformer::default());
        controller
            .add_informer(Arc::clone(&informer) as Arc<dyn Informer>, "widgets")
            .unwrap();
        assert!(!controller.healthy());

        let ct = CancellationToken::new();
        let runner = {
            let controller = Arc::clone(&controller);
            let ct = ct.clone();
            tokio::spawn(async move { controller.run(ct).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(controller.healthy());
        ct.cancel();
        runner.await.unwrap();
    }

    #[test]
    fn opinionated_dequeue_policy_rules() {
        let policy = opinionated_retry_dequeue_policy();
        let noop: RetryFn = Arc::new(|| futures::future::ready(RetryOutcome::default()).boxed());
        let pending = RetryRequest {
            key: "widgets:0:ns:o1".into(),
            retry_after: Instant::now(),
            attempt: 1,
            action: ResourceAction::Create,
            object: widget("o1", 1),
            last_error: None,
            run: noop,
        };

        // A delete always dequeues.
        assert!(policy(ResourceAction::Delete, &widget("o1", 1), &pending));
        // Same generation keeps the retry, even across action kinds.
        assert!(!policy(ResourceAction::Update, &widget("o1", 1), &pending));
        assert!(!policy(ResourceAction::Create, &widget("o1", 1), &pending));
        // A generation bump displaces it.
        assert!(policy(ResourceAction::Update, &widget("o1", 2), &pending));
    }
}
