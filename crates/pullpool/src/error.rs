//! Error types returned to pool consumers.

/// Error produced by a resource constructor.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure of a single `submit`/`run` call.
///
/// Errors are local to the request that caused them: none of these variants
/// affects other queued requests.
#[derive(Debug, thiserror::Error)]
pub enum UseError<E> {
    /// The constructor failed while creating an instance for this request.
    /// The instance was never registered.
    #[error("failed to create resource: {0}")]
    Create(BoxError),

    /// The work callback failed. Its instance was evicted from the pool.
    #[error("work callback failed: {0}")]
    Work(#[source] E),

    /// The request was dropped before its result was delivered (the callback
    /// panicked or the runtime shut down).
    #[error("pool dropped the request before it completed")]
    Dropped,
}

impl<E> UseError<E> {
    pub fn is_create(&self) -> bool {
        matches!(self, Self::Create(_))
    }

    pub fn is_work(&self) -> bool {
        matches!(self, Self::Work(_))
    }

    /// The callback's own error, if that is what failed.
    pub fn into_work(self) -> Option<E> {
        match self {
            Self::Work(e) => Some(e),
            _ => None,
        }
    }
}
