//! Parallel event delivery for a single watcher, order-preserving per object.

use crate::buffered_queue::BufferedQueue;
use crate::watcher::{log_error_handler, ErrorHandler, ResourceWatcher};
use async_trait::async_trait;
use opkit_core::{BoxError, DynamicResource};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Configuration for [`ConcurrentWatcher`].
#[derive(Clone)]
pub struct ConcurrentWatcherConfig {
    /// Number of worker queues
    pub worker_pool_size: usize,

    /// Consumer-side capacity of each worker queue
    pub worker_buffer_size: usize,

    /// Receives errors returned by the wrapped watcher
    pub error_handler: ErrorHandler,
}

impl Default for ConcurrentWatcherConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            worker_buffer_size: crate::buffered_queue::DEFAULT_QUEUE_CAPACITY,
            error_handler: log_error_handler(),
        }
    }
}

/// Errors from [`ConcurrentWatcher`] construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConcurrentWatcherError {
    /// The worker pool must have at least one worker
    #[error("worker pool size must be at least 1")]
    EmptyWorkerPool,
}

#[derive(Clone)]
enum WorkItem {
    Add(Arc<DynamicResource>),
    Update(Arc<DynamicResource>, Arc<DynamicResource>),
    Delete(Arc<DynamicResource>),
}

struct Worker {
    queue: Arc<BufferedQueue<WorkItem>>,
    items: Mutex<Option<mpsc::Receiver<WorkItem>>>,
}

/// Spreads event handling for one [`ResourceWatcher`] across a worker pool.
///
/// Events route to a worker by a stable hash of the object's
/// group/version/kind + namespace + name, so all events for one object land
/// on the same worker and are handled in arrival order; distinct objects may
/// be handled in parallel with no ordering guarantee. Errors from the
/// wrapped watcher go to the configured error handler and are swallowed.
pub struct ConcurrentWatcher {
    watcher: Arc<dyn ResourceWatcher>,
    workers: Vec<Arc<Worker>>,
    hasher: ahash::RandomState,
    error_handler: ErrorHandler,
}

impl ConcurrentWatcher {
    /// Wrap `watcher` with a pool per `config`
    pub fn new(
        watcher: Arc<dyn ResourceWatcher>,
        config: ConcurrentWatcherConfig,
    ) -> Result<Self, ConcurrentWatcherError> {
        if config.worker_pool_size == 0 {
            return Err(ConcurrentWatcherError::EmptyWorkerPool);
        }
        let workers = (0..config.worker_pool_size)
            .map(|_| {
                let (queue, items) = BufferedQueue::channel(config.worker_buffer_size);
                Arc::new(Worker {
                    queue: Arc::new(queue),
                    items: Mutex::new(Some(items)),
                })
            })
            .collect();
        Ok(Self {
            watcher,
            workers,
            // Fixed seeds keep object routing stable for the watcher lifetime.
            hasher: ahash::RandomState::with_seeds(0xc0ff, 0xee11, 0xbeef, 0x6a21),
            error_handler: config.error_handler,
        })
    }

    fn dispatch(&self, object: &DynamicResource, item: WorkItem) {
        let route = (object.gvk(), object.namespace().map(str::to_string), object.name().to_string());
        let index = self.hasher.hash_one(route) as usize % self.workers.len();
        self.workers[index].queue.push(item);
    }

    /// Drain the worker queues until `ct` is cancelled, then stop the queues
    /// and finish whatever they already hold.
    pub async fn run(&self, ct: CancellationToken) {
        let mut tasks = JoinSet::new();
        for worker in &self.workers {
            let queue = Arc::clone(&worker.queue);
            tasks.spawn(async move { queue.run().await });

            let Some(mut items) = worker.items.lock().take() else {
                continue;
            };
            let watcher = Arc::clone(&self.watcher);
            let error_handler = Arc::clone(&self.error_handler);
            tasks.spawn(async move {
                while let Some(item) = items.recv().await {
                    let result = match item {
                        WorkItem::Add(obj) => watcher.add(obj).await,
                        WorkItem::Update(old, new) => watcher.update(old, new).await,
                        WorkItem::Delete(obj) => watcher.delete(obj).await,
                    };
                    if let Err(err) = result {
                        error_handler(err.as_ref());
                    }
                }
            });
        }
        ct.cancelled().await;
        for worker in &self.workers {
            worker.queue.stop();
        }
        while tasks.join_next().await.is_some() {}
    }
}

#[async_trait]
impl ResourceWatcher for ConcurrentWatcher {
    async fn add(&self, object: Arc<DynamicResource>) -> Result<(), BoxError> {
        self.dispatch(&object, WorkItem::Add(Arc::clone(&object)));
        Ok(())
    }

    async fn update(
        &self,
        old: Arc<DynamicResource>,
        new: Arc<DynamicResource>,
    ) -> Result<(), BoxError> {
        let item = WorkItem::Update(old, Arc::clone(&new));
        self.dispatch(&new, item);
        Ok(())
    }

    async fn delete(&self, object: Arc<DynamicResource>) -> Result<(), BoxError> {
        self.dispatch(&object, WorkItem::Delete(Arc::clone(&object)));
        Ok(())
    }
}
