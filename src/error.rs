use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Errors surfaced by promises, futures and the queue.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The promise was queried before it completed.
    #[error("operation is not valid: the promise has not completed yet")]
    NotCompleted,
    /// The producer chose cancellation as the terminal outcome.
    #[error("the operation was canceled")]
    Canceled,
    /// The producer failed; the original cause is carried as-is.
    #[error("{0}")]
    Failed(Cause),
    /// A type-erased future was cast to the wrong value type.
    #[error("incompatible type: the future does not hold a `{expected}`")]
    TypeMismatch { expected: &'static str },
    /// A second `dequeue` was issued while the first one is still outstanding.
    #[error("operation is not valid: a dequeue is already pending")]
    DequeuePending,
    /// Every failure collected by `when_all`, in input order.
    #[error("{} of the awaited futures did not succeed", .0.len())]
    Aggregate(Vec<Error>),
    /// `when_any` was handed nothing to wait for.
    #[error("no futures were supplied")]
    NoFutures,
}

impl Error {
    /// Returns `true` for [`Error::Canceled`].
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    /// Returns the producer-supplied cause for [`Error::Failed`].
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Error::Failed(cause) => Some(cause),
            _ => None,
        }
    }
}

/// The error a producer completed a promise with.
///
/// Cheap to clone: every consumer observes the very same error object, so a
/// failure read twice (or from two threads) is the same allocation.
#[derive(Clone)]
pub struct Cause(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl Cause {
    pub fn new(error: Arc<dyn std::error::Error + Send + Sync + 'static>) -> Self {
        Self(error)
    }

    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        let error: &(dyn std::error::Error + 'static) = &*self.0;
        error.downcast_ref::<E>()
    }

    /// Returns `true` if both causes are the same error object.
    pub fn ptr_eq(&self, other: &Cause) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.0
    }
}

impl<E> From<E> for Cause
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self(Arc::new(error))
    }
}

impl fmt::Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

pub(crate) fn type_mismatch<T: Any>() -> Error {
    Error::TypeMismatch {
        expected: std::any::type_name::<T>(),
    }
}
