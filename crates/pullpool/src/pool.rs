//! Pool manager - admission control and dispatch.
//!
//! All bookkeeping (registry, queue, counters) lives behind one mutex that is
//! never held across an await. Every state change ends with a call to
//! [`PoolInner::settle`], which wakes teardown waiters and runs the dispatch
//! loop, so a queued request is re-examined whenever an instance frees up,
//! a creation fails, the limit changes or a teardown ends.
//!
//! Flow for one request:
//! 1. `submit` queues it and pumps
//! 2. `pump` pops the head once a worker slot and an instance are available,
//!    then spawns a dispatch worker
//! 3. The worker creates the instance if needed, runs the callback, and
//!    releases the instance (free on success, evicted on failure)

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;

use crate::config::{ConfigError, PoolConfig, check_limit};
use crate::error::{BoxError, UseError};
use crate::handle::UseHandle;
use crate::queue::{Outcome, PendingRequest, RequestQueue, UseRequest};
use crate::registry::{Lease, Registry, ResourceId};

/// Future returned by a boxed resource constructor.
pub(crate) type CreateFuture<T> = BoxFuture<'static, Result<T, BoxError>>;

pub(crate) type CreateFn<T> = dyn Fn() -> CreateFuture<T> + Send + Sync;
pub(crate) type DestroyFn<T> = dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync;

pub(crate) struct PoolState<T> {
    pub limit: usize,
    /// Dispatch workers currently holding a busy instance or a creation
    /// reservation.
    pub active: usize,
    pub registry: Registry<T>,
    pub queue: RequestQueue<T>,
    pub destructor: Option<Arc<DestroyFn<T>>>,
    /// Outstanding `destruct` calls. Acquisition is blocked while non-zero.
    pub teardowns: usize,
    pub drain_waiters: Vec<oneshot::Sender<()>>,
}

pub(crate) struct PoolInner<T> {
    creator: Box<CreateFn<T>>,
    state: Mutex<PoolState<T>>,
    /// Evictions in flight. Kept closed so `wait()` resolves whenever it is
    /// empty; spawning still works on a closed tracker.
    pub destructions: TaskTracker,
}

impl<T: Send + 'static> PoolInner<T> {
    pub fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Pool state mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Wake teardown waiters if the pool went quiet, then dispatch.
    pub fn settle(self: &Arc<Self>, state: &mut PoolState<T>) {
        if !state.drain_waiters.is_empty() && state.registry.is_quiescent() {
            tracing::debug!(
                waiters = state.drain_waiters.len(),
                "All instances idle, releasing teardown"
            );
            for tx in state.drain_waiters.drain(..) {
                let _ = tx.send(());
            }
        }
        self.pump(state);
    }

    /// One pass of the dispatch loop.
    fn pump(self: &Arc<Self>, state: &mut PoolState<T>) {
        while state.active < state.limit && state.teardowns == 0 {
            if !state.registry.can_acquire(state.limit) {
                break;
            }
            let Some(request) = state.queue.pop() else {
                break;
            };
            let Some(lease) = state.registry.acquire(state.limit) else {
                state.queue.push_front(request);
                break;
            };

            state.active += 1;
            tracing::trace!(
                active = state.active,
                queued = state.queue.len(),
                "Dispatching request"
            );
            tokio::spawn(Arc::clone(self).dispatch(request, lease));
        }
    }

    async fn dispatch(self: Arc<Self>, request: Box<dyn PendingRequest<T>>, lease: Lease<T>) {
        let (id, mut instance) = match lease {
            Lease::Reused { id, instance } => {
                tracing::trace!(resource = %id, "Reusing free instance");
                (id, instance)
            }
            Lease::Create => match self.create().await {
                Ok(instance) => {
                    let id = self.lock().registry.register_busy();
                    tracing::debug!(resource = %id, "Created instance");
                    (id, instance)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create instance");
                    {
                        let mut state = self.lock();
                        state.registry.abandon_creation();
                        state.active = state.active.saturating_sub(1);
                        self.settle(&mut state);
                    }
                    request.reject(e);
                    return;
                }
            },
        };

        let completion = AssertUnwindSafe(request.run(&mut instance))
            .catch_unwind()
            .await;

        let outcome = match &completion {
            Ok(completion) => completion.outcome,
            Err(_) => {
                // The request (and its continuation) went down with the
                // callback; the caller sees `UseError::Dropped`.
                tracing::error!(resource = %id, "Work callback panicked");
                Outcome::Failed
            }
        };
        if outcome == Outcome::Failed {
            tracing::warn!(resource = %id, "Work callback failed, evicting instance");
        }

        self.release(id, instance, outcome);

        if let Ok(completion) = completion {
            completion.deliver();
        }
    }

    async fn create(&self) -> Result<T, BoxError> {
        match AssertUnwindSafe(async { (self.creator)().await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err("resource constructor panicked".into()),
        }
    }

    /// Return an instance after its callback finished.
    ///
    /// Success marks it free, unless the registry is over the limit and a
    /// destructor exists, in which case it is evicted. Failure always evicts.
    fn release(self: &Arc<Self>, id: ResourceId, instance: T, outcome: Outcome) {
        let leftover = {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);

            let doomed = match outcome {
                Outcome::Completed => match state.registry.mark_free(id, instance) {
                    Ok(()) => {
                        if state.registry.len() > state.limit && state.destructor.is_some() {
                            tracing::debug!(
                                resource = %id,
                                size = state.registry.len(),
                                limit = state.limit,
                                "Evicting instance above limit"
                            );
                            state.registry.evict(id)
                        } else {
                            None
                        }
                    }
                    Err(instance) => {
                        tracing::error!(resource = %id, "Released instance has no registry entry");
                        Some(instance)
                    }
                },
                Outcome::Failed => {
                    state.registry.unregister(id);
                    Some(instance)
                }
            };

            // Eviction destructors are spawned before settling so a teardown
            // released below already sees them on the tracker.
            let leftover = match (doomed, state.destructor.clone()) {
                (Some(instance), Some(destructor)) => {
                    self.destructions
                        .spawn(async move { destructor(instance).await });
                    None
                }
                (doomed, None) => doomed,
                (None, Some(_)) => None,
            };

            self.settle(&mut state);
            leftover
        };

        // No destructor configured: the instance is simply dropped.
        drop(leftover);
    }
}

/// A bounded pool of lazily-created, reusable resource instances.
///
/// Cloning is cheap; all clones share the same instances and queue. Must be
/// used from within a Tokio runtime.
pub struct Pool<T> {
    pub(crate) inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Create a pool. No instance is created until the first request.
    pub fn new<C, Fut, CE>(creator: C, config: PoolConfig) -> Result<Self, ConfigError>
    where
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CE>> + Send + 'static,
        CE: Into<BoxError>,
    {
        config.validate()?;

        let creator: Box<CreateFn<T>> = Box::new(move || -> CreateFuture<T> {
            let fut = creator();
            Box::pin(async move { fut.await.map_err(Into::<BoxError>::into) })
        });

        let destructions = TaskTracker::new();
        destructions.close();

        Ok(Self {
            inner: Arc::new(PoolInner {
                creator,
                state: Mutex::new(PoolState {
                    limit: config.limit,
                    active: 0,
                    registry: Registry::new(),
                    queue: RequestQueue::new(),
                    destructor: None,
                    teardowns: 0,
                    drain_waiters: Vec::new(),
                }),
                destructions,
            }),
        })
    }

    pub fn limit(&self) -> usize {
        self.inner.lock().limit
    }

    /// Replace the concurrency limit.
    ///
    /// Takes effect on the next admission or eviction check. In-flight work
    /// is never aborted and busy instances are never destroyed.
    pub fn set_limit(&self, limit: usize) -> Result<(), ConfigError> {
        check_limit(limit)?;
        let mut state = self.inner.lock();
        tracing::debug!(from = state.limit, to = limit, "Pool limit changed");
        state.limit = limit;
        self.inner.settle(&mut state);
        Ok(())
    }

    /// Register the destructor used for eviction and teardown.
    pub fn set_destructor<D, Fut>(&self, destructor: D)
    where
        D: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let destructor: Arc<DestroyFn<T>> =
            Arc::new(move |instance: T| -> BoxFuture<'static, ()> { Box::pin(destructor(instance)) });
        self.inner.lock().destructor = Some(destructor);
    }

    pub fn has_destructor(&self) -> bool {
        self.inner.lock().destructor.is_some()
    }

    /// Queue `work` for exclusive access to one instance.
    ///
    /// The instance is lent as `&mut T` for the duration of the returned
    /// future. If the callback fails, the instance is evicted and the error
    /// is delivered as [`UseError::Work`].
    pub fn submit<F, R, E>(&self, work: F) -> UseHandle<R, E>
    where
        F: for<'a> FnOnce(&'a mut T) -> BoxFuture<'a, Result<R, E>> + Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock();
        state.queue.push(Box::new(UseRequest::new(work, tx)));
        tracing::trace!(queued = state.queue.len(), "Request queued");
        self.inner.settle(&mut state);
        UseHandle::new(rx)
    }

    /// Submit `work` and wait for its result.
    pub async fn run<F, R, E>(&self, work: F) -> Result<R, UseError<E>>
    where
        F: for<'a> FnOnce(&'a mut T) -> BoxFuture<'a, Result<R, E>> + Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        self.submit(work).await
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Snapshot of (active workers, registry size, busy entries, queued).
    fn counts<T: Send + 'static>(pool: &Pool<T>) -> (usize, usize, usize, usize) {
        let state = pool.inner.lock();
        (
            state.active,
            state.registry.len(),
            state.registry.busy_count(),
            state.queue.len(),
        )
    }

    fn counting_pool(limit: usize) -> (Pool<usize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = Pool::new(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, BoxError>(n) }
            },
            PoolConfig::new().with_limit(limit),
        )
        .unwrap();
        (pool, created)
    }

    #[test]
    fn zero_limit_rejected_at_construction() {
        let result = Pool::new(|| async { Ok::<_, BoxError>(()) }, PoolConfig::new().with_limit(0));
        assert!(matches!(result, Err(ConfigError::ZeroLimit)));
    }

    #[tokio::test]
    async fn set_limit_rejects_zero_and_keeps_old_value() {
        let (pool, _) = counting_pool(2);
        assert_eq!(pool.set_limit(0), Err(ConfigError::ZeroLimit));
        assert_eq!(pool.limit(), 2);
        pool.set_limit(5).unwrap();
        assert_eq!(pool.limit(), 5);
    }

    #[tokio::test]
    async fn instance_returned_free_after_success() {
        let (pool, created) = counting_pool(1);

        let value = pool
            .run(|n: &mut usize| Box::pin(async move { Ok::<_, String>(*n + 100) }))
            .await
            .unwrap();

        assert_eq!(value, 100);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(counts(&pool), (0, 1, 0, 0));
    }

    #[tokio::test]
    async fn busy_and_active_never_exceed_limit() {
        let (pool, _) = counting_pool(3);
        let probe = pool.clone();
        let violations = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let probe = probe.clone();
                let violations = Arc::clone(&violations);
                pool.submit(move |_n: &mut usize| {
                    Box::pin(async move {
                        let (active, size, busy, _) = counts(&probe);
                        if active > 3 || size > 3 || busy > 3 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok::<_, String>(())
                    })
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(counts(&pool), (0, 3, 0, 0));
    }

    #[tokio::test]
    async fn creation_failure_releases_reservation() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let pool = Pool::new(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err::<usize, BoxError>("first connect refused".into())
                    } else {
                        Ok(n)
                    }
                }
            },
            PoolConfig::new(),
        )
        .unwrap();

        let err = pool
            .run(|_n: &mut usize| Box::pin(async { Ok::<_, String>(()) }))
            .await
            .unwrap_err();
        assert!(err.is_create());
        assert_eq!(counts(&pool), (0, 0, 0, 0));
        assert_eq!(pool.inner.lock().registry.creating(), 0);

        let value = pool
            .run(|n: &mut usize| Box::pin(async move { Ok::<_, String>(*n) }))
            .await
            .unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn panicking_creator_is_reported_as_creation_error() {
        let pool: Pool<usize> = Pool::new(
            || async {
                if true {
                    panic!("constructor bug");
                }
                Ok::<usize, BoxError>(0)
            },
            PoolConfig::new(),
        )
        .unwrap();

        let err = pool
            .run(|_n: &mut usize| Box::pin(async { Ok::<_, String>(()) }))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to create resource: resource constructor panicked"
        );
        assert_eq!(counts(&pool), (0, 0, 0, 0));
    }

    #[tokio::test]
    async fn panicking_callback_evicts_instance() {
        let (pool, created) = counting_pool(1);

        let err = pool
            .run(|_n: &mut usize| {
                Box::pin(async {
                    if true {
                        panic!("callback bug");
                    }
                    Ok::<_, String>(())
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, UseError::Dropped));

        // The continuation is dropped with the panicking future, before the
        // worker gets to release the instance.
        for _ in 0..100 {
            if counts(&pool).0 == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(counts(&pool), (0, 0, 0, 0));

        pool.run(|_n: &mut usize| Box::pin(async { Ok::<_, String>(()) }))
            .await
            .unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn raising_limit_admits_queued_requests() {
        let (pool, created) = counting_pool(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = pool.submit(move |_n: &mut usize| {
            Box::pin(async move {
                let _ = release_rx.await;
                Ok::<_, String>(())
            })
        });
        let waiting = pool.submit(|n: &mut usize| Box::pin(async move { Ok::<_, String>(*n) }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counts(&pool).3, 1);

        pool.set_limit(2).unwrap();
        assert_eq!(waiting.await.unwrap(), 1);
        assert_eq!(created.load(Ordering::SeqCst), 2);

        release_tx.send(()).unwrap();
        blocker.await.unwrap();
    }
}
