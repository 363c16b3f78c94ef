//! Bounded producer/consumer buffer.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::domain::EngineError;

/// Result of a timed dequeue.
#[derive(Debug, PartialEq, Eq)]
pub enum Dequeued<T> {
    Item(T),
    Timeout,
    /// Closed and drained.
    Closed,
}

struct BufferState<T> {
    items: VecDeque<T>,
    closed: bool,
    high_water_mark: usize,
}

/// FIFO buffer of fixed capacity.
///
/// Producers wait while it is full, consumers wait while it is empty. After
/// `close` producers fail with `QueueClosed` and consumers drain what is left.
pub struct BackpressureQueue<T> {
    capacity: usize,
    state: Mutex<BufferState<T>>,
    not_full: Notify,
    not_empty: Notify,
}

impl<T: Send> BackpressureQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(BufferState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                high_water_mark: 0,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for room, then push.
    pub async fn enqueue(&self, item: T) -> Result<(), EngineError> {
        let mut item = Some(item);
        loop {
            // register before looking at the state so a wakeup between the
            // check and the await is not lost
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.state.lock().await;
                if st.closed {
                    return Err(EngineError::QueueClosed);
                }
                if st.items.len() < self.capacity
                    && let Some(item) = item.take()
                {
                    st.items.push_back(item);
                    st.high_water_mark = st.high_water_mark.max(st.items.len());
                    drop(st);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Wait for an item. `None` once closed and empty.
    pub async fn dequeue(&self) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.state.lock().await;
                if let Some(item) = st.items.pop_front() {
                    drop(st);
                    self.not_full.notify_one();
                    return Some(item);
                }
                if st.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    pub async fn dequeue_timeout(&self, timeout: Duration) -> Dequeued<T> {
        match tokio::time::timeout(timeout, self.dequeue()).await {
            Ok(Some(item)) => Dequeued::Item(item),
            Ok(None) => Dequeued::Closed,
            Err(_) => Dequeued::Timeout,
        }
    }

    /// Stop accepting items and wake every waiter.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Fill level, 0.0..=1.0.
    pub async fn fill_ratio(&self) -> f64 {
        self.len().await as f64 / self.capacity as f64
    }

    /// Largest length observed so far.
    pub async fn high_water_mark(&self) -> usize {
        self.state.lock().await.high_water_mark
    }
}
