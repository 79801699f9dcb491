//! Fan-out of informer events to registered listeners.

use crate::buffered_queue::BufferedQueue;
use async_trait::async_trait;
use opkit_core::DynamicResource;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A typed event distributed to listeners.
#[derive(Clone, Debug)]
pub enum InformerEvent {
    /// An object appeared
    Add {
        /// The new object
        object: Arc<DynamicResource>,
        /// Whether this event is part of the initial list rather than a
        /// live change
        is_in_initial_list: bool,
    },
    /// An object changed
    Update {
        /// State before the change
        old: Arc<DynamicResource>,
        /// State after the change
        new: Arc<DynamicResource>,
    },
    /// An object went away
    Delete {
        /// Last known state
        object: Arc<DynamicResource>,
    },
    /// Periodic re-emission of cached state, with no underlying change
    CacheSync {
        /// The cached object
        object: Arc<DynamicResource>,
    },
}

/// Consumer of [`InformerEvent`]s.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one event. Slow handlers only delay their own queue.
    async fn handle(&self, event: InformerEvent);
}

/// Errors from processor registration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProcessorError {
    /// Listener registration is frozen once the processor runs
    #[error("cannot add a listener to a processor that has started")]
    AlreadyStarted,
}

struct Listener {
    queue: Arc<BufferedQueue<InformerEvent>>,
    events: Mutex<Option<mpsc::Receiver<InformerEvent>>>,
    handler: Arc<dyn EventHandler>,
}

/// Distributes events from one informer to every registered listener, each
/// served by its own [`BufferedQueue`] so one slow handler cannot stall the
/// others.
pub struct InformerProcessor {
    listeners: Mutex<Vec<Arc<Listener>>>,
    started_tx: watch::Sender<bool>,
    started_rx: watch::Receiver<bool>,
    queue_capacity: usize,
}

impl InformerProcessor {
    /// Create a processor whose listener queues hold `queue_capacity` events
    /// on the consumer side
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        let (started_tx, started_rx) = watch::channel(false);
        Self {
            listeners: Mutex::new(Vec::new()),
            started_tx,
            started_rx,
            queue_capacity,
        }
    }

    /// Register `handler`. Only permitted before [`InformerProcessor::run`].
    pub fn add_listener(&self, handler: Arc<dyn EventHandler>) -> Result<(), ProcessorError> {
        if *self.started_rx.borrow() {
            return Err(ProcessorError::AlreadyStarted);
        }
        let (queue, events) = BufferedQueue::channel(self.queue_capacity);
        self.listeners.lock().push(Arc::new(Listener {
            queue: Arc::new(queue),
            events: Mutex::new(Some(events)),
            handler,
        }));
        Ok(())
    }

    /// Number of registered listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Hand `event` to every listener queue.
    ///
    /// Blocks until [`InformerProcessor::run`] has begun, then pushes without
    /// further blocking.
    pub async fn distribute(&self, event: InformerEvent) {
        let mut started = self.started_rx.clone();
        // watch::Receiver::wait_for resolves immediately when already true.
        if started.wait_for(|running| *running).await.is_err() {
            return;
        }
        for listener in self.listeners.lock().iter() {
            listener.queue.push(event.clone());
        }
    }

    /// Convenience for [`InformerEvent::Add`]
    pub async fn on_add(&self, object: Arc<DynamicResource>, is_in_initial_list: bool) {
        self.distribute(InformerEvent::Add { object, is_in_initial_list }).await;
    }

    /// Convenience for [`InformerEvent::Update`]
    pub async fn on_update(&self, old: Arc<DynamicResource>, new: Arc<DynamicResource>) {
        self.distribute(InformerEvent::Update { old, new }).await;
    }

    /// Convenience for [`InformerEvent::Delete`]
    pub async fn on_delete(&self, object: Arc<DynamicResource>) {
        self.distribute(InformerEvent::Delete { object }).await;
    }

    /// Convenience for [`InformerEvent::CacheSync`]
    pub async fn on_cache_sync(&self, object: Arc<DynamicResource>) {
        self.distribute(InformerEvent::CacheSync { object }).await;
    }

    /// Serve all registered listeners until `ct` is cancelled, then close
    /// every queue and wait for the listeners to drain.
    pub async fn run(&self, ct: CancellationToken) {
        let listeners: Vec<Arc<Listener>> = self.listeners.lock().clone();
        let mut tasks = JoinSet::new();
        for listener in &listeners {
            let queue = Arc::clone(&listener.queue);
            tasks.spawn(async move { queue.run().await });

            let Some(mut events) = listener.events.lock().take() else {
                continue;
            };
            let handler = Arc::clone(&listener.handler);
            tasks.spawn(async move {
                while let Some(event) = events.recv().await {
                    handler.handle(event).await;
                }
            });
        }
        // Unblock distribute() only once the drain loops are in place.
        let _ = self.started_tx.send(true);

        ct.cancelled().await;
        for listener in &listeners {
            listener.queue.stop();
        }
        while tasks.join_next().await.is_some() {}
    }
}
