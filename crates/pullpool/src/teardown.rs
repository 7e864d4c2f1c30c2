//! Teardown - drain the pool and destroy every instance.
//!
//! While any `destruct` call is outstanding the dispatcher refuses to hand
//! out instances, so running callbacks finish and nothing new starts. Once
//! every entry is free (and no constructor is running) the registry is
//! snapshotted and cleared, and the destructor runs on the snapshot.
//! Requests queued meanwhile are served by fresh instances afterwards.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::pool::{Pool, PoolInner};

/// Holds the teardown flag for the lifetime of one `destruct` call, so a
/// cancelled teardown cannot leave the pool blocked.
struct TeardownGuard<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> TeardownGuard<T> {
    fn enter(inner: &Arc<PoolInner<T>>) -> Self {
        inner.lock().teardowns += 1;
        Self {
            inner: Arc::clone(inner),
        }
    }
}

impl<T: Send + 'static> Drop for TeardownGuard<T> {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        state.teardowns = state.teardowns.saturating_sub(1);
        if state.teardowns == 0 {
            self.inner.settle(&mut state);
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Wait for in-flight work to finish, then destroy every instance.
    ///
    /// A no-op when no destructor is configured. Returns once the destructor
    /// has completed for every instance registered when the pool went idle,
    /// including instances evicted while the teardown was waiting.
    pub async fn destruct(&self) {
        let Some(destructor) = self.inner.lock().destructor.clone() else {
            tracing::debug!("No destructor configured, skipping teardown");
            return;
        };

        let _guard = TeardownGuard::enter(&self.inner);

        let drained = {
            let mut state = self.inner.lock();
            if state.registry.is_quiescent() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.drain_waiters.push(tx);
                tracing::debug!(
                    size = state.registry.len(),
                    busy = state.registry.busy_count(),
                    creating = state.registry.creating(),
                    "Teardown waiting for instances to become idle"
                );
                Some(rx)
            }
        };

        if let Some(rx) = drained {
            // The sender lives in pool state, which outlives this call.
            let _ = rx.await;
        }

        // Destructions go on the shared tracker under the lock, so a concurrent
        // teardown that finds the registry already drained still waits for them.
        let count = {
            let mut state = self.inner.lock();
            let instances = state.registry.drain();
            let count = instances.len();
            tracing::debug!(count, "Destroying pooled instances");
            for (id, instance) in instances {
                tracing::trace!(resource = %id, "Destroying instance");
                let destructor = Arc::clone(&destructor);
                self.inner
                    .destructions
                    .spawn(async move { destructor(instance).await });
            }
            count
        };

        self.inner.destructions.wait().await;

        tracing::debug!(count, "Teardown complete");
    }
}
