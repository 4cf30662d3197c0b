use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::error::Result;
use crate::sync::AsyncSemaphore;

/// Creates, checks and closes pooled connections
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    type Client: Send + Sync + 'static;

    /// Open a new connection
    async fn create(&self) -> Result<Self::Client>;

    /// Whether a connection can go back to the idle list after a successful action
    fn reusable(&self, client: &Self::Client) -> bool;

    /// Close a connection, it is never handed out again
    fn close(&self, client: &Self::Client);
}

struct PoolState<C> {
    idle: Vec<Arc<C>>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    disposed: bool,
}

struct PoolInner<F: ClientFactory> {
    factory: F,
    slots: AsyncSemaphore,
    idle_timeout: Duration,
    state: Mutex<PoolState<F::Client>>,
}

impl<F: ClientFactory> PoolInner<F> {
    fn state(&self) -> MutexGuard<'_, PoolState<F::Client>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close_all(&self, clients: Vec<Arc<F::Client>>) {
        if !clients.is_empty() {
            tracing::debug!(count = clients.len(), "Closing pooled connections");
        }
        for client in clients {
            self.factory.close(&client);
        }
    }

    fn expire_idle(&self) {
        let idle = {
            let mut state = self.state();
            state.timer = None;
            std::mem::take(&mut state.idle)
        };
        self.close_all(idle);
    }
}

impl<F: ClientFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        if let Some(timer) = self.state().timer.take() {
            timer.abort();
        }
    }
}

/// A checked-out connection, closed on drop unless released
struct Lease<'a, F: ClientFactory> {
    inner: &'a PoolInner<F>,
    client: Option<Arc<F::Client>>,
}

impl<F: ClientFactory> Lease<'_, F> {
    fn release(mut self) -> Option<Arc<F::Client>> {
        self.client.take()
    }
}

impl<F: ClientFactory> Drop for Lease<'_, F> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.inner.factory.close(&client);
        }
    }
}

/// Pool of at most `capacity` concurrently used connections
pub struct ConnectionPool<F: ClientFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ClientFactory> ConnectionPool<F> {
    /// Create a pool; fails if `capacity` is zero
    pub fn new(factory: F, capacity: usize, idle_timeout: Duration) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(PoolInner {
                factory,
                slots: AsyncSemaphore::new(capacity)?,
                idle_timeout,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    generation: 0,
                    timer: None,
                    disposed: false,
                }),
            }),
        })
    }

    pub fn from_config(factory: F, config: &PoolConfig) -> Result<Self> {
        Self::new(factory, config.capacity, config.idle_timeout)
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Current generation; bumped by every [`close_clients`](Self::close_clients)
    pub fn generation(&self) -> u64 {
        self.inner.state().generation
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state().idle.len()
    }

    /// Run `action` with a pooled connection
    ///
    /// Waits for a free slot, then reuses an idle connection or creates one.
    /// An error from `action` closes the connection and is returned as is; so
    /// does a panic, which is propagated after the close.
    pub async fn with_client<T, A, Fut>(&self, action: A) -> Result<T>
    where
        A: FnOnce(Arc<F::Client>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.inner
            .slots
            .locked(|| async {
                let (client, generation) = self.checkout().await?;
                let lease = Lease {
                    inner: &self.inner,
                    client: Some(client.clone()),
                };
                match action(client).await {
                    Ok(value) => {
                        if let Some(client) = lease.release() {
                            self.checkin(client, generation);
                        }
                        Ok(value)
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Pooled action failed, closing connection");
                        drop(lease);
                        Err(e)
                    }
                }
            })
            .await
    }

    async fn checkout(&self) -> Result<(Arc<F::Client>, u64)> {
        let (reused, generation) = {
            let mut state = self.inner.state();
            let reused = state.idle.pop();
            // The timer keeps running for connections still idle.
            if state.idle.is_empty() {
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
            }
            (reused, state.generation)
        };
        match reused {
            Some(client) => Ok((client, generation)),
            None => {
                tracing::debug!("Creating pooled connection");
                let client = self.inner.factory.create().await?;
                Ok((Arc::new(client), generation))
            }
        }
    }

    fn checkin(&self, client: Arc<F::Client>, generation: u64) {
        let current = {
            let state = self.inner.state();
            !state.disposed && state.generation == generation
        };
        if !current || !self.inner.factory.reusable(&client) {
            self.inner.factory.close(&client);
            return;
        }

        let mut state = self.inner.state();
        if state.disposed || state.generation != generation {
            drop(state);
            self.inner.factory.close(&client);
            return;
        }
        state.idle.push(client);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.timer = Some(self.spawn_idle_timer());
    }

    fn spawn_idle_timer(&self) -> JoinHandle<()> {
        let weak: Weak<PoolInner<F>> = Arc::downgrade(&self.inner);
        let timeout = self.inner.idle_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire_idle();
            }
        })
    }

    /// Close every idle connection and invalidate the ones checked out
    pub fn close_clients(&self) {
        let idle = {
            let mut state = self.inner.state();
            state.generation += 1;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut state.idle)
        };
        self.inner.close_all(idle);
    }

    /// Stop the idle timer and close everything
    ///
    /// Connections still checked out are closed when their action finishes.
    pub fn dispose(&self) {
        self.inner.state().disposed = true;
        self.close_clients();
    }
}
