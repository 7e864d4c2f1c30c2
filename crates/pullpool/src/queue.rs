//! Request queue - FIFO backlog of work waiting for an instance.

use std::collections::VecDeque;

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::error::{BoxError, UseError};

/// How a work callback finished, as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Callback succeeded - the instance goes back to the free set.
    Completed,
    /// Callback failed - the instance is evicted.
    Failed,
}

/// Result of running a request, with its continuation still unresolved.
///
/// The dispatcher releases the instance first and only then delivers, so a
/// caller that observes its result also observes the instance back in the pool.
pub(crate) struct Completion {
    pub outcome: Outcome,
    deliver: Box<dyn FnOnce() + Send>,
}

impl Completion {
    pub fn deliver(self) {
        (self.deliver)();
    }
}

/// A queued unit of work with its completion continuation.
///
/// Type-erased over the callback's result and error types so the queue can
/// hold requests from differently-typed callers.
pub(crate) trait PendingRequest<T>: Send {
    /// Run the work callback against a lent instance.
    fn run<'a>(self: Box<Self>, instance: &'a mut T) -> BoxFuture<'a, Completion>;

    /// Fail the continuation because no instance could be created.
    fn reject(self: Box<Self>, error: BoxError);
}

pub(crate) struct UseRequest<F, R, E> {
    work: F,
    tx: oneshot::Sender<Result<R, UseError<E>>>,
}

impl<F, R, E> UseRequest<F, R, E> {
    pub fn new(work: F, tx: oneshot::Sender<Result<R, UseError<E>>>) -> Self {
        Self { work, tx }
    }
}

impl<T, F, R, E> PendingRequest<T> for UseRequest<F, R, E>
where
    T: Send + 'static,
    F: for<'a> FnOnce(&'a mut T) -> BoxFuture<'a, Result<R, E>> + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    fn run<'a>(self: Box<Self>, instance: &'a mut T) -> BoxFuture<'a, Completion> {
        let UseRequest { work, tx } = *self;
        Box::pin(async move {
            let result = work(instance).await;
            let outcome = if result.is_ok() {
                Outcome::Completed
            } else {
                Outcome::Failed
            };
            Completion {
                outcome,
                // Receiver gone means the caller stopped listening; the
                // work still ran, so the outcome stands.
                deliver: Box::new(move || {
                    let _ = tx.send(result.map_err(UseError::Work));
                }),
            }
        })
    }

    fn reject(self: Box<Self>, error: BoxError) {
        let _ = self.tx.send(Err(UseError::Create(error)));
    }
}

pub(crate) struct RequestQueue<T> {
    items: VecDeque<Box<dyn PendingRequest<T>>>,
}

impl<T> RequestQueue<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    pub fn push(&mut self, request: Box<dyn PendingRequest<T>>) {
        self.items.push_back(request);
    }

    pub fn pop(&mut self) -> Option<Box<dyn PendingRequest<T>>> {
        self.items.pop_front()
    }

    /// Put an unmatched request back at the head, keeping its place.
    pub fn push_front(&mut self, request: Box<dyn PendingRequest<T>>) {
        self.items.push_front(request);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
