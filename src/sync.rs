use std::future::Future;

use tokio::sync::Semaphore;

use crate::error::{GatewayError, Result};

/// Counting semaphore admitting at most `capacity` concurrent actions
///
/// Waiters are released strictly in arrival order, whether the action that
/// held the slot succeeded, failed or panicked.
#[derive(Debug)]
pub struct AsyncSemaphore {
    permits: Semaphore,
    capacity: usize,
}

impl AsyncSemaphore {
    /// Create a semaphore with a fixed positive capacity
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > Semaphore::MAX_PERMITS {
            return Err(GatewayError::InvalidCapacity { capacity });
        }
        Ok(Self {
            permits: Semaphore::new(capacity),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently free
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `action` once a slot is free
    pub async fn locked<F, Fut, T>(&self, action: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        // The semaphore is owned here and never closed.
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("semaphore is never closed");
        action().await
    }
}

/// Semaphore of capacity one
#[derive(Debug)]
pub struct AsyncMutex {
    inner: AsyncSemaphore,
}

impl AsyncMutex {
    pub fn new() -> Self {
        Self {
            inner: AsyncSemaphore {
                permits: Semaphore::new(1),
                capacity: 1,
            },
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.available() == 0
    }

    /// Run `action` exclusively
    pub async fn locked<F, Fut, T>(&self, action: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.inner.locked(action).await
    }
}

impl Default for AsyncMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;
    use tokio_test::{assert_pending, assert_ready};

    #[test]
    fn test_invalid_capacity() {
        assert!(matches!(
            AsyncSemaphore::new(0),
            Err(GatewayError::InvalidCapacity { capacity: 0 })
        ));
        assert_eq!(AsyncSemaphore::new(3).unwrap().capacity(), 3);
    }

    #[tokio::test]
    async fn test_mutex_fifo_order() {
        let mutex = Arc::new(AsyncMutex::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = {
            let (mutex, order, counter) = (mutex.clone(), order.clone(), counter.clone());
            tokio::spawn(async move {
                mutex
                    .locked(|| async move {
                        order.lock().unwrap().push("first-start");
                        release_rx.await.ok();
                        counter.fetch_add(1, Ordering::SeqCst);
                        order.lock().unwrap().push("first-end");
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(mutex.is_locked());

        let second = {
            let (mutex, order, counter) = (mutex.clone(), order.clone(), counter.clone());
            tokio::spawn(async move {
                mutex
                    .locked(|| async move {
                        assert_eq!(counter.load(Ordering::SeqCst), 1);
                        order.lock().unwrap().push("second");
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(*order.lock().unwrap(), vec!["first-start"]);

        release_tx.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["first-start", "first-end", "second"]
        );
    }

    #[tokio::test]
    async fn test_capacity_bounds_concurrency() {
        let semaphore = AsyncSemaphore::new(2).unwrap();
        let (tx1, rx1) = oneshot::channel::<()>();
        let (tx2, rx2) = oneshot::channel::<()>();

        let mut a = tokio_test::task::spawn(semaphore.locked(|| async move { rx1.await.ok() }));
        let mut b = tokio_test::task::spawn(semaphore.locked(|| async move { rx2.await.ok() }));
        let mut c = tokio_test::task::spawn(semaphore.locked(|| async { 3 }));

        assert_pending!(a.poll());
        assert_pending!(b.poll());
        assert_pending!(c.poll());
        assert_eq!(semaphore.available(), 0);

        tx1.send(()).unwrap();
        assert_ready!(a.poll());
        assert!(c.is_woken());
        assert_eq!(assert_ready!(c.poll()), 3);

        tx2.send(()).unwrap();
        assert_ready!(b.poll());
        assert_eq!(semaphore.available(), 2);
    }

    #[tokio::test]
    async fn test_slot_released_after_panic() {
        let semaphore = Arc::new(AsyncSemaphore::new(1).unwrap());
        let s = semaphore.clone();
        let failed = tokio::spawn(async move {
            s.locked(|| async { panic!("action failed") }).await
        })
        .await;
        assert!(failed.is_err());
        assert_eq!(semaphore.locked(|| async { 5 }).await, 5);
    }
}
