//! Directional byte queues shared by a stream pump and its network bridge.
//!
//! A [`DirectedQueue`] is an unbounded FIFO of byte buffers with a
//! "consumer attached" flag. The session owning the queue toggles the flag
//! when a remote client connects or disconnects; the pump uses it to hold
//! back input until someone is actually on the other end.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::{watch, Notify};

struct QueueState {
    buffers: VecDeque<Bytes>,
    closed: bool,
}

/// Thread-safe FIFO of byte buffers with a consumer-attached signal.
pub struct DirectedQueue {
    state: Mutex<QueueState>,
    /// Wakes suspended `get` calls on put and close.
    available: Notify,
    attached: watch::Sender<bool>,
}

impl DirectedQueue {
    /// Creates an empty, open queue with no consumer attached.
    pub fn new() -> Self {
        let (attached, _) = watch::channel(false);
        Self {
            state: Mutex::new(QueueState {
                buffers: VecDeque::new(),
                closed: false,
            }),
            available: Notify::new(),
            attached,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Nothing in this module panics while holding the lock.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueues a buffer without blocking.
    ///
    /// Buffers put after [`close`](Self::close) are discarded.
    pub fn put(&self, buffer: impl Into<Bytes>) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.buffers.push_back(buffer.into());
        }
        self.available.notify_waiters();
    }

    /// Waits until a buffer is available and dequeues it.
    ///
    /// Returns `None` once the queue has been closed. Cancel-safe: a buffer
    /// is only removed in the poll that returns it.
    pub async fn get(&self) -> Option<Bytes> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a put between the check and the
            // await is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(buffer) = state.buffers.pop_front() {
                    return Some(buffer);
                }
            }

            notified.await;
        }
    }

    /// Dequeues a buffer if one is immediately available.
    pub fn try_get(&self) -> Option<Bytes> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.buffers.pop_front()
    }

    /// Tears the queue down, dropping pending buffers and waking all getters.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.buffers.clear();
        }
        self.available.notify_waiters();
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of buffers waiting to be consumed.
    pub fn len(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks a remote consumer as connected and wakes attachment waiters.
    pub fn set_consumer_attached(&self) {
        self.attached.send_replace(true);
    }

    /// Marks the remote consumer as gone.
    pub fn clear_consumer_attached(&self) {
        self.attached.send_replace(false);
    }

    /// Returns `true` while a remote consumer is connected.
    pub fn is_consumer_attached(&self) -> bool {
        *self.attached.borrow()
    }

    /// Waits until a consumer is attached. Returns immediately if one already is.
    pub async fn wait_for_consumer(&self) {
        let mut rx = self.attached.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|attached| *attached).await;
    }
}

impl Default for DirectedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DirectedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("DirectedQueue")
            .field("pending", &state.buffers.len())
            .field("closed", &state.closed)
            .field("attached", &*self.attached.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = DirectedQueue::new();
        queue.put(&b"one"[..]);
        queue.put(&b"two"[..]);
        queue.put(&b"three"[..]);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.get().await.unwrap(), &b"one"[..]);
        assert_eq!(queue.get().await.unwrap(), &b"two"[..]);
        assert_eq!(queue.get().await.unwrap(), &b"three"[..]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_put() {
        let queue = Arc::new(DirectedQueue::new());

        let getter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!getter.is_finished());

        queue.put(b"late".to_vec());
        let got = timeout(Duration::from_secs(1), getter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap(), &b"late"[..]);
    }

    #[tokio::test]
    async fn test_close_wakes_getter() {
        let queue = Arc::new(DirectedQueue::new());

        let getter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let got = timeout(Duration::from_secs(1), getter)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_put_after_close_is_discarded() {
        let queue = DirectedQueue::new();
        queue.close();
        queue.put(&b"ignored"[..]);

        assert!(queue.is_empty());
        assert!(queue.get().await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_get_loses_nothing() {
        let queue = DirectedQueue::new();

        // A get abandoned while waiting must not swallow the next buffer.
        let abandoned = timeout(Duration::from_millis(20), queue.get()).await;
        assert!(abandoned.is_err());

        queue.put(&b"kept"[..]);
        assert_eq!(queue.try_get().unwrap(), &b"kept"[..]);
    }

    #[tokio::test]
    async fn test_many_producers_no_loss() {
        let queue = Arc::new(DirectedQueue::new());
        let mut producers = Vec::new();
        for p in 0..4u8 {
            let queue = Arc::clone(&queue);
            producers.push(tokio::spawn(async move {
                for i in 0..50u8 {
                    queue.put(vec![p, i]);
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        let mut per_producer = vec![Vec::new(); 4];
        while let Some(buffer) = queue.try_get() {
            per_producer[buffer[0] as usize].push(buffer[1]);
        }
        for seen in per_producer {
            assert_eq!(seen, (0..50u8).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_consumer_attached_flag() {
        let queue = DirectedQueue::new();
        assert!(!queue.is_consumer_attached());

        queue.set_consumer_attached();
        assert!(queue.is_consumer_attached());

        queue.clear_consumer_attached();
        assert!(!queue.is_consumer_attached());
    }

    #[tokio::test]
    async fn test_wait_for_consumer() {
        let queue = Arc::new(DirectedQueue::new());

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_for_consumer().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.set_consumer_attached();
        timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already attached: returns at once.
        timeout(Duration::from_millis(100), queue.wait_for_consumer())
            .await
            .unwrap();
    }
}
