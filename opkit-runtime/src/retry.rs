//! Sharded, time-ordered execution of retryable handler invocations.

use crate::reconcile::ResourceAction;
use futures::future::BoxFuture;
use opkit_core::{DynamicResource, SharedError};
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Decides whether a failed invocation is retried and after how long.
///
/// Called with the error and the number of retries already performed;
/// `Some(delay)` schedules another attempt, `None` gives up.
pub type RetryPolicy =
    Arc<dyn Fn(&(dyn std::error::Error + Send + Sync + 'static), usize) -> Option<Duration> + Send + Sync>;

/// Thunk yielding the current retry policy, so callers can swap policies
/// while the processor is running.
pub type RetryPolicySource = Arc<dyn Fn() -> Option<RetryPolicy> + Send + Sync>;

/// A retry policy doubling the delay on every attempt.
///
/// The k-th retry fires `initial * 2^(k-1)` after the previous attempt; once
/// `max_attempts` retries have run the policy gives up, so a persistently
/// failing invocation runs at most `max_attempts + 1` times.
#[must_use]
pub fn exponential_backoff_retry_policy(initial: Duration, max_attempts: usize) -> RetryPolicy {
    Arc::new(move |_err, attempt| {
        if attempt >= max_attempts {
            None
        } else {
            Some(initial * 2u32.saturating_pow(u32::try_from(attempt).unwrap_or(u32::MAX)))
        }
    })
}

/// The recommended default: exponential backoff from 5 seconds, capped at 5
/// retries.
#[must_use]
pub fn default_retry_policy() -> RetryPolicy {
    exponential_backoff_retry_policy(Duration::from_secs(5), 5)
}

/// The closure re-running one failed invocation.
pub type RetryFn = Arc<dyn Fn() -> BoxFuture<'static, RetryOutcome> + Send + Sync>;

/// Result of executing a [`RetryFn`].
#[derive(Default)]
pub struct RetryOutcome {
    /// Explicit re-run request; scheduled with the same attempt number
    pub requeue_after: Option<Duration>,

    /// Failure of this execution; consulted against the retry policy
    pub error: Option<SharedError>,
}

/// A scheduled re-invocation of a failed handler call.
#[derive(Clone)]
pub struct RetryRequest {
    /// Identity under which retries for one object at one handler slot are
    /// tracked
    pub key: String,

    /// Earliest time the invocation may run
    pub retry_after: Instant,

    /// Number of retries already scheduled for this logical action
    pub attempt: usize,

    /// The action that originally failed
    pub action: ResourceAction,

    /// Snapshot of the object the action applies to
    pub object: Arc<DynamicResource>,

    /// The most recent failure
    pub last_error: Option<SharedError>,

    /// The invocation to re-run
    pub run: RetryFn,
}

impl fmt::Debug for RetryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryRequest")
            .field("key", &self.key)
            .field("retry_after", &self.retry_after)
            .field("attempt", &self.attempt)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

struct HeapEntry {
    at: Instant,
    seq: u64,
    request: RetryRequest,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct ShardState {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    seq: u64,
    /// The request currently being executed by this shard's worker, if any.
    /// Entries are popped one at a time, so per key at most one invocation
    /// is ever in flight.
    executing: Option<RetryRequest>,
    /// Set when a dequeue raced the executing request; its outcome is then
    /// discarded instead of re-enqueued.
    discard_executing: bool,
}

#[derive(Default)]
struct Shard {
    state: Mutex<ShardState>,
    wake: Notify,
}

impl Shard {
    fn push(state: &mut ShardState, request: RetryRequest) {
        state.seq += 1;
        state.heap.push(Reverse(HeapEntry {
            at: request.retry_after,
            seq: state.seq,
            request,
        }));
    }

    /// Pop the earliest due entry, marking it as executing.
    fn take_due(&self) -> Option<RetryRequest> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let due = state
            .heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.at <= now);
        if !due {
            return None;
        }
        let request = state.heap.pop().map(|Reverse(entry)| entry.request)?;
        state.executing = Some(request.clone());
        state.discard_executing = false;
        Some(request)
    }

    /// Record completion of `request` and schedule its follow-up, if any.
    fn complete(&self, request: RetryRequest, outcome: RetryOutcome, policy: &RetryPolicySource) {
        let mut state = self.state.lock();
        let discarded = std::mem::take(&mut state.discard_executing);
        state.executing = None;
        if discarded {
            tracing::debug!(key = %request.key, "retry dequeued mid-execution, outcome discarded");
            return;
        }
        if let Some(delay) = outcome.requeue_after {
            // Explicit requeue does not consume retry budget.
            let next = RetryRequest {
                retry_after: Instant::now() + delay,
                ..request
            };
            Self::push(&mut state, next);
        } else if let Some(error) = outcome.error {
            let Some(policy) = policy() else { return };
            if let Some(delay) = policy(error.as_ref(), request.attempt) {
                let next = RetryRequest {
                    retry_after: Instant::now() + delay,
                    attempt: request.attempt + 1,
                    last_error: Some(error),
                    ..request
                };
                Self::push(&mut state, next);
            } else {
                tracing::debug!(key = %request.key, attempt = request.attempt, "retry budget exhausted");
            }
        }
    }

    async fn work(self: Arc<Self>, policy: RetryPolicySource, tick: Duration, ct: CancellationToken) {
        loop {
            tokio::select! {
                () = ct.cancelled() => return,
                () = self.wake.notified() => {}
                () = tokio::time::sleep(tick) => {}
            }
            while let Some(request) = self.take_due() {
                let outcome = (request.run)().await;
                self.complete(request, outcome, &policy);
                // Let an in-flight execution finish, but start no new work
                // once shutdown has been requested.
                if ct.is_cancelled() {
                    return;
                }
            }
        }
    }
}

/// Configuration for [`RetryProcessor`].
#[derive(Clone, Debug)]
pub struct RetryProcessorConfig {
    /// Number of worker shards
    pub worker_pool_size: usize,

    /// How often each worker re-checks its heap absent a wake signal
    pub check_interval: Duration,
}

impl Default for RetryProcessorConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            check_interval: Duration::from_secs(1),
        }
    }
}

/// Sharded worker pool executing [`RetryRequest`]s at their scheduled time.
///
/// Requests route to a shard by a stable hash of their key, so all retries
/// for one key are executed by one worker, serially, with no cross-shard
/// locking. A worker never runs a request before its `retry_after`.
pub struct RetryProcessor {
    shards: Vec<Arc<Shard>>,
    hasher: ahash::RandomState,
    policy: RetryPolicySource,
    check_interval: Duration,
}

impl RetryProcessor {
    /// Create a processor that consults `policy` when executions fail
    #[must_use]
    pub fn new(config: RetryProcessorConfig, policy: RetryPolicySource) -> Self {
        let workers = config.worker_pool_size.max(1);
        Self {
            shards: (0..workers).map(|_| Arc::new(Shard::default())).collect(),
            // Fixed seeds keep key routing stable for the processor lifetime.
            hasher: ahash::RandomState::with_seeds(0x51ab, 0x7e77, 0x2b8d, 0x94c3),
            policy,
            check_interval: config.check_interval,
        }
    }

    fn shard_for(&self, key: &str) -> &Arc<Shard> {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Schedule a retry and wake its shard
    pub fn enqueue(&self, request: RetryRequest) {
        let shard = self.shard_for(&request.key);
        Shard::push(&mut shard.state.lock(), request);
        shard.wake.notify_one();
    }

    /// Remove pending retries for `key` matching `predicate`.
    ///
    /// Returns the number removed. If the shard is currently executing a
    /// matching request for `key`, that execution finishes but its outcome
    /// is discarded. Returns promptly even while an unrelated request on the
    /// same shard is mid-execution.
    pub fn dequeue(&self, key: &str, predicate: impl Fn(&RetryRequest) -> bool) -> usize {
        let shard = self.shard_for(key);
        let mut guard = shard.state.lock();
        let state = &mut *guard;
        let before = state.heap.len();
        let retained: Vec<Reverse<HeapEntry>> = state
            .heap
            .drain()
            .filter(|Reverse(entry)| !(entry.request.key == key && predicate(&entry.request)))
            .collect();
        state.heap = retained.into();
        let removed = before - state.heap.len();
        if let Some(executing) = &state.executing {
            if executing.key == key && predicate(executing) {
                state.discard_executing = true;
            }
        }
        removed
    }

    /// Remove every pending retry for `key`
    pub fn dequeue_all(&self, key: &str) -> usize {
        self.dequeue(key, |_| true)
    }

    /// Total pending retries across all shards (excluding any mid-execution)
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.state.lock().heap.len()).sum()
    }

    /// Whether no retry is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the worker pool until `ct` is cancelled.
    ///
    /// An execution already in progress at cancellation time completes; no
    /// new executions start afterwards.
    pub async fn run(&self, ct: CancellationToken) {
        let mut workers = JoinSet::new();
        for shard in &self.shards {
            workers.spawn(Arc::clone(shard).work(
                Arc::clone(&self.policy),
                self.check_interval,
                ct.clone(),
            ));
        }
        while workers.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::ResourceAction;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn test_object() -> Arc<DynamicResource> {
        Arc::new(DynamicResource::new(
            "obj",
            &opkit_core::GroupVersionKind::gvk("example.io", "v1", "Widget"),
        ))
    }

    fn request(key: &str, after: Duration, run: RetryFn) -> RetryRequest {
        RetryRequest {
            key: key.to_string(),
            retry_after: Instant::now() + after,
            attempt: 1,
            action: ResourceAction::Create,
            object: test_object(),
            last_error: None,
            run,
        }
    }

    fn no_policy() -> RetryPolicySource {
        Arc::new(|| None)
    }

    #[tokio::test(start_paused = true)]
    async fn never_executes_before_schedule() {
        let processor = Arc::new(RetryProcessor::new(
            RetryProcessorConfig::default(),
            no_policy(),
        ));
        let executed_at: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let scheduled = Instant::now() + Duration::from_secs(5);

        let record = Arc::clone(&executed_at);
        processor.enqueue(request(
            "widgets:0:ns:obj",
            Duration::from_secs(5),
            Arc::new(move || {
                let record = Arc::clone(&record);
                async move {
                    record.lock().push(Instant::now());
                    RetryOutcome::default()
                }
                .boxed()
            }),
        ));

        let ct = CancellationToken::new();
        let runner = {
            let processor = Arc::clone(&processor);
            let ct = ct.clone();
            tokio::spawn(async move { processor.run(ct).await })
        };

        tokio::time::sleep(Duration::from_secs(7)).await;
        ct.cancel();
        runner.await.unwrap();

        let times = executed_at.lock();
        assert_eq!(times.len(), 1);
        assert!(times[0] >= scheduled);
        assert_eq!(processor.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_execution_backs_off_exponentially() {
        let policy = exponential_backoff_retry_policy(Duration::from_secs(1), 2);
        let processor = Arc::new(RetryProcessor::new(
            RetryProcessorConfig::default(),
            Arc::new(move || Some(Arc::clone(&policy))),
        ));
        let executed_at: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let record = Arc::clone(&executed_at);
        processor.enqueue(request(
            "widgets:0:ns:obj",
            Duration::from_secs(1),
            Arc::new(move || {
                let record = Arc::clone(&record);
                async move {
                    record.lock().push(Instant::now());
                    RetryOutcome {
                        requeue_after: None,
                        error: Some(Arc::new(std::io::Error::other("nope"))),
                    }
                }
                .boxed()
            }),
        ));

        let ct = CancellationToken::new();
        let runner = {
            let processor = Arc::clone(&processor);
            let ct = ct.clone();
            tokio::spawn(async move { processor.run(ct).await })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        ct.cancel();
        runner.await.unwrap();

        // Enqueued as attempt 1 at +1s; its failure consults the policy with
        // attempt=1 (delay 2s); the attempt-2 failure is denied (2 >= max).
        let times = executed_at.lock();
        assert_eq!(times.len(), 2);
        assert_eq!(times[0] - start, Duration::from_secs(1));
        assert_eq!(times[1] - start, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_requeue_preserves_attempt() {
        let processor = Arc::new(RetryProcessor::new(
            RetryProcessorConfig::default(),
            no_policy(),
        ));
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        processor.enqueue(request(
            "widgets:0:ns:obj",
            Duration::from_secs(1),
            Arc::new(move || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, AtomicOrdering::SeqCst);
                    RetryOutcome {
                        requeue_after: (n < 3).then(|| Duration::from_secs(1)),
                        error: None,
                    }
                }
                .boxed()
            }),
        ));

        let ct = CancellationToken::new();
        let runner = {
            let processor = Arc::clone(&processor);
            let ct = ct.clone();
            tokio::spawn(async move { processor.run(ct).await })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        ct.cancel();
        runner.await.unwrap();
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 4);
        assert_eq!(processor.len(), 0);
    }

    #[tokio::test]
    async fn dequeue_removes_matching_pending_entries() {
        let processor = RetryProcessor::new(RetryProcessorConfig::default(), no_policy());
        let noop: RetryFn = Arc::new(|| async { RetryOutcome::default() }.boxed());
        processor.enqueue(request("a", Duration::from_secs(60), Arc::clone(&noop)));
        processor.enqueue(request("a", Duration::from_secs(120), Arc::clone(&noop)));
        processor.enqueue(request("b", Duration::from_secs(60), noop));
        assert_eq!(processor.len(), 3);

        assert_eq!(processor.dequeue("a", |req| req.attempt == 1), 2);
        assert_eq!(processor.len(), 1);
        assert_eq!(processor.dequeue_all("b"), 1);
        assert!(processor.is_empty());
    }

    #[tokio::test]
    async fn dequeue_mid_execution_discards_outcome() {
        let processor = Arc::new(RetryProcessor::new(
            RetryProcessorConfig {
                worker_pool_size: 1,
                check_interval: Duration::from_millis(10),
            },
            no_policy(),
        ));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let started_tx = Arc::new(Mutex::new(Some(started_tx)));
        let release_rx = Arc::new(Mutex::new(Some(release_rx)));

        processor.enqueue(request(
            "k",
            Duration::ZERO,
            Arc::new(move || {
                let started_tx = Arc::clone(&started_tx);
                let release_rx = Arc::clone(&release_rx);
                async move {
                    if let Some(tx) = started_tx.lock().take() {
                        let _ = tx.send(());
                    }
                    let gate = release_rx.lock().take();
                    if let Some(gate) = gate {
                        let _ = gate.await;
                    }
                    // Would normally re-run in a millisecond; the dequeue
                    // below must suppress it.
                    RetryOutcome {
                        requeue_after: Some(Duration::from_millis(1)),
                        error: None,
                    }
                }
                .boxed()
            }),
        ));

        let ct = CancellationToken::new();
        let runner = {
            let processor = Arc::clone(&processor);
            let ct = ct.clone();
            tokio::spawn(async move { processor.run(ct).await })
        };

        started_rx.await.unwrap();
        assert_eq!(processor.dequeue_all("k"), 0);
        release_tx.send(()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(processor.len(), 0);
        ct.cancel();
        runner.await.unwrap();
    }
}
