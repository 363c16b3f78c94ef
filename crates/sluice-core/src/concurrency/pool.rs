//! Bounded worker pool: at most N task bodies in flight.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::domain::EngineError;

/// Counting-semaphore gate around futures.
///
/// Permits are handed out FIFO, so callers start in the order they asked.
/// Cloning shares the permits.
#[derive(Debug, Clone)]
pub struct BoundedWorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl BoundedWorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }

    /// Wait for a permit, then run `fut` while holding it.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = T>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| EngineError::QueueClosed)?;
        Ok(fut.await)
    }

    /// Run `f` over every item with bounded concurrency; output order matches
    /// input order.
    pub async fn map<I, R, F, Fut>(&self, items: Vec<I>, f: F) -> Result<Vec<R>, EngineError>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = R>,
    {
        let f = &f;
        join_all(items.into_iter().map(|item| self.run(f(item))))
            .await
            .into_iter()
            .collect()
    }

    /// Refuse further permits; waiters fail with `QueueClosed`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
