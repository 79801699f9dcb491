//! A producer-friendly FIFO with elastic internal buffering.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// Default capacity of the consumer-side channel.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Single-producer/single-consumer FIFO whose producer never blocks.
///
/// [`BufferedQueue::push`] always succeeds while the queue is live; when the
/// consumer falls behind, items spill into an internal grow-as-needed buffer
/// instead of back-pressuring the producer. [`BufferedQueue::channel`] returns
/// the queue together with its consumer end, which yields items in FIFO order
/// and closes once the queue is stopped and drained.
#[derive(Debug)]
pub struct BufferedQueue<T> {
    input: Mutex<Option<mpsc::UnboundedSender<T>>>,
    pump: Mutex<Option<Pump<T>>>,
}

#[derive(Debug)]
struct Pump<T> {
    input_rx: mpsc::UnboundedReceiver<T>,
    output_tx: mpsc::Sender<T>,
}

impl<T: Send + 'static> BufferedQueue<T> {
    /// Create a queue and its consumer channel.
    ///
    /// `capacity` bounds only the consumer-side channel; the internal buffer
    /// grows without bound.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(capacity.max(1));
        let queue = Self {
            input: Mutex::new(Some(input_tx)),
            pump: Mutex::new(Some(Pump { input_rx, output_tx })),
        };
        (queue, output_rx)
    }

    /// Enqueue an item.
    ///
    /// Never blocks. After [`BufferedQueue::stop`] the item is silently
    /// dropped.
    pub fn push(&self, item: T) {
        if let Some(tx) = self.input.lock().as_ref() {
            // Send only fails when the pump is gone, which means stop() ran
            // concurrently; dropping is the contract.
            let _ = tx.send(item);
        }
    }

    /// Pump items from the producer side to the consumer channel.
    ///
    /// Runs until the queue is stopped and every buffered item has been
    /// offered to the consumer (or the consumer is dropped). Calling `run`
    /// a second time returns immediately.
    pub async fn run(&self) {
        let Some(Pump { mut input_rx, output_tx }) = self.pump.lock().take() else {
            tracing::warn!("buffered queue already running");
            return;
        };
        let mut buffer: VecDeque<T> = VecDeque::new();
        loop {
            if let Some(item) = buffer.pop_front() {
                tokio::select! {
                    permit = output_tx.reserve() => match permit {
                        Ok(permit) => permit.send(item),
                        // Consumer dropped its receiver; nothing left to do.
                        Err(_) => return,
                    },
                    received = input_rx.recv() => {
                        buffer.push_front(item);
                        match received {
                            Some(next) => buffer.push_back(next),
                            None => break,
                        }
                    }
                }
            } else {
                match input_rx.recv().await {
                    Some(item) => match output_tx.try_send(item) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(item)) => buffer.push_back(item),
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    },
                    None => break,
                }
            }
        }
        // Input side closed; flush whatever spilled into the buffer.
        while let Some(item) = buffer.pop_front() {
            if output_tx.send(item).await.is_err() {
                return;
            }
        }
    }

    /// Stop accepting items.
    ///
    /// Idempotent. The consumer channel closes once the pump has drained all
    /// buffered items.
    pub fn stop(&self) {
        self.input.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_order_with_slow_consumer() {
        let (queue, mut events) = BufferedQueue::channel(2);
        let queue = Arc::new(queue);
        let pump = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.run().await })
        };

        const TOTAL: usize = 500;
        for i in 0..TOTAL {
            queue.push(i);
        }
        queue.stop();

        let mut received = Vec::new();
        while let Some(item) = events.recv().await {
            // Slow the consumer enough that the buffer is actually exercised.
            if item % 100 == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            received.push(item);
        }
        assert_eq!(received, (0..TOTAL).collect::<Vec<_>>());
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn push_after_stop_is_a_silent_drop() {
        let (queue, mut events) = BufferedQueue::channel(4);
        let queue = Arc::new(queue);
        let pump = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.run().await })
        };
        queue.push(1);
        queue.stop();
        queue.stop();
        queue.push(2);

        assert_eq!(events.recv().await, Some(1));
        assert_eq!(events.recv().await, None);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn stop_before_run_still_drains_pending_items() {
        let (queue, mut events) = BufferedQueue::channel(1);
        queue.push("a");
        queue.push("b");
        queue.stop();
        let pump = tokio::spawn(async move { queue.run().await });
        assert_eq!(events.recv().await, Some("a"));
        assert_eq!(events.recv().await, Some("b"));
        assert_eq!(events.recv().await, None);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn second_run_returns_immediately() {
        let (queue, _events) = BufferedQueue::<i32>::channel(1);
        let queue = Arc::new(queue);
        let first = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.run().await })
        };
        tokio::task::yield_now().await;
        queue.run().await;
        queue.stop();
        first.await.unwrap();
    }
}
