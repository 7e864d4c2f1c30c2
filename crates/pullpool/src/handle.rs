//! Handle to the eventual result of a submitted request.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::UseError;

/// Resolves with the work callback's result once the request was served.
///
/// Dropping the handle does not cancel the request: it stays queued and its
/// callback still runs, the result is just discarded.
#[must_use = "the request runs regardless, but its result is only observable through the handle"]
pub struct UseHandle<R, E> {
    rx: oneshot::Receiver<Result<R, UseError<E>>>,
}

impl<R, E> UseHandle<R, E> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<R, UseError<E>>>) -> Self {
        Self { rx }
    }

    pub async fn wait(self) -> Result<R, UseError<E>> {
        self.await
    }

    /// Non-blocking check. Returns `None` while the request is pending.
    pub fn try_result(&mut self) -> Option<Result<R, UseError<E>>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(UseError::Dropped)),
        }
    }
}

impl<R, E> Future for UseHandle<R, E> {
    type Output = Result<R, UseError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(UseError::Dropped)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<R, E> std::fmt::Debug for UseHandle<R, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UseHandle").finish_non_exhaustive()
    }
}
