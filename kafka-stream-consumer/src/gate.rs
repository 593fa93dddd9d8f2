use tokio::sync::{Mutex, MutexGuard};

/// Serializes access to the underlying client. Every call to the client
/// goes through a guard obtained here; nothing else may touch it.
/// Rebalance callbacks fire while the poll handler already holds the
/// guard, which is safe because they only mutate actor state.
pub(crate) struct ClientGate<C> {
    inner: Mutex<C>,
}

impl<C> ClientGate<C> {
    pub fn new(client: C) -> Self {
        Self {
            inner: Mutex::new(client),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, C> {
        self.inner.lock().await
    }
}
