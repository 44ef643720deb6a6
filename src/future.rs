//! The read side of a promise.
//!
//! A [`Future`] is an immutable, cloneable view: either a handle on a shared
//! promise (deferred), or a value that was known up front (immediate), in
//! which case no promise is allocated at all. Awaiting it yields
//! `Result<T, Error>`.
//!
//! ```
//! use promise_future::{Future, Promise};
//! use futures::executor::block_on;
//!
//! let ready = Future::from_value(5);
//! assert_eq!(block_on(async { ready.await }).unwrap(), 5);
//!
//! let promise = Promise::<u32>::new();
//! let pending = promise.future();
//! assert!(!pending.is_completed());
//! promise.set_value(7);
//! assert_eq!(pending.wait().unwrap(), 7);
//! ```
use crate::error::{Cause, Error};
use crate::promise::{Inner, Outcome};
use crate::scheduler::{self, SchedulerRef};
use futures::task::AtomicWaker;
use std::fmt;
use std::future::IntoFuture;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

pub struct Future<T> {
    pub(crate) repr: Repr<T>,
}

pub(crate) enum Repr<T> {
    Immediate(T),
    Deferred(Arc<Inner<T>>),
}

impl<T: Clone> Clone for Future<T> {
    fn clone(&self) -> Self {
        let repr = match &self.repr {
            Repr::Immediate(value) => Repr::Immediate(value.clone()),
            Repr::Deferred(inner) => Repr::Deferred(inner.clone()),
        };
        Self { repr }
    }
}

impl<T: fmt::Debug> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Immediate(value) => f.debug_tuple("Future::Immediate").field(value).finish(),
            Repr::Deferred(inner) => match inner.completion() {
                Ok(outcome) => f.debug_tuple("Future::Deferred").field(outcome).finish(),
                Err(_) => f.write_str("Future::Deferred(<pending>)"),
            },
        }
    }
}

impl<T: Default> Default for Future<T> {
    fn default() -> Self {
        Self::from_value(T::default())
    }
}

impl<T: PartialEq> PartialEq for Future<T> {
    /// Deferred futures are equal when they observe the same promise;
    /// immediate futures compare their values.
    fn eq(&self, other: &Self) -> bool {
        match (&self.repr, &other.repr) {
            (Repr::Deferred(a), Repr::Deferred(b)) => Arc::ptr_eq(a, b),
            (Repr::Immediate(a), Repr::Immediate(b)) => a == b,
            _ => false,
        }
    }
}

impl<T> Future<T> {
    /// An immediate future; no promise is allocated.
    pub fn from_value(value: T) -> Self {
        Self {
            repr: Repr::Immediate(value),
        }
    }

    /// A future backed by an already-canceled promise.
    pub fn from_canceled() -> Self {
        Self::deferred(Arc::new(Inner::with_outcome(Outcome::Canceled)))
    }

    /// A future backed by an already-failed promise.
    pub fn from_error<E: Into<Cause>>(error: E) -> Self {
        Self::deferred(Arc::new(Inner::with_outcome(Outcome::Failed(error.into()))))
    }

    pub(crate) fn deferred(inner: Arc<Inner<T>>) -> Self {
        Self {
            repr: Repr::Deferred(inner),
        }
    }

    /// Address of the backing promise, used for identity comparisons.
    pub(crate) fn promise_addr(&self) -> Option<*const ()> {
        match &self.repr {
            Repr::Immediate(_) => None,
            Repr::Deferred(inner) => Some(Arc::as_ptr(inner).cast()),
        }
    }

    pub fn is_completed(&self) -> bool {
        match &self.repr {
            Repr::Immediate(_) => true,
            Repr::Deferred(inner) => inner.is_completed(),
        }
    }

    fn outcome_with<R>(&self, f: impl FnOnce(&Outcome<T>) -> R, immediate: R) -> Result<R, Error> {
        match &self.repr {
            Repr::Immediate(_) => Ok(immediate),
            Repr::Deferred(inner) => inner.completion().map(f),
        }
    }

    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending.
    pub fn is_succeeded(&self) -> Result<bool, Error> {
        self.outcome_with(|outcome| matches!(outcome, Outcome::Succeeded(_)), true)
    }

    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending.
    pub fn is_canceled(&self) -> Result<bool, Error> {
        self.outcome_with(|outcome| matches!(outcome, Outcome::Canceled), false)
    }

    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending.
    pub fn is_failed(&self) -> Result<bool, Error> {
        self.outcome_with(|outcome| matches!(outcome, Outcome::Failed(_)), false)
    }

    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending.
    pub fn exception(&self) -> Result<Option<Error>, Error> {
        self.outcome_with(Outcome::error, None)
    }

    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending, otherwise the captured failure.
    pub fn throw_if_failed(&self) -> Result<(), Error> {
        match self.exception()? {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Borrows the value.
    ///
    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending, otherwise the captured
    /// [`Error::Canceled`] or [`Error::Failed`].
    pub fn value(&self) -> Result<&T, Error> {
        match &self.repr {
            Repr::Immediate(value) => Ok(value),
            Repr::Deferred(inner) => inner.completion()?.as_result(),
        }
    }

    /// Runs `continuation` once the future completes; inline and right away
    /// if it already has.
    pub fn on_completed<F>(&self, continuation: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.repr {
            Repr::Immediate(_) => continuation(),
            Repr::Deferred(inner) => inner.continue_with(Box::new(continuation), None),
        }
    }

    /// Runs `continuation` through `scheduler` once the future completes.
    ///
    /// If the future is already complete and `resume_synchronously` is set,
    /// the continuation runs inline instead; clear it to always hop onto the
    /// scheduler.
    pub fn on_completed_via<F>(&self, continuation: F, scheduler: SchedulerRef, resume_synchronously: bool)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_completed() {
            if resume_synchronously {
                continuation();
            } else {
                scheduler.schedule_continuation(Box::new(continuation));
            }
            return;
        }
        if let Repr::Deferred(inner) = &self.repr {
            inner.continue_with(Box::new(continuation), Some(scheduler));
        }
    }

    /// Awaits this future with its wake-up dispatched through `scheduler`.
    ///
    /// `resume_synchronously` (usually `true`) lets an already-completed
    /// future resolve on the first poll; with `false` the awaiting task is
    /// always woken from the scheduler.
    pub fn configure(self, scheduler: SchedulerRef, resume_synchronously: bool) -> Awaiter<T> {
        Awaiter {
            future: self,
            scheduler: Some(scheduler),
            resume_synchronously,
            signal: None,
        }
    }
}

impl<T: Clone> Future<T> {
    /// Returns a copy of the value or the captured failure.
    ///
    /// # Errors
    ///
    /// Same as [`value`](Self::value).
    pub fn result(&self) -> Result<T, Error> {
        self.value().cloned()
    }

    /// Blocks the current thread until the future completes.
    ///
    /// # Errors
    ///
    /// The captured [`Error::Canceled`] or [`Error::Failed`].
    pub fn wait(&self) -> Result<T, Error> {
        if self.is_completed() {
            return self.result();
        }
        futures::executor::block_on(self.clone().into_future())
    }
}

impl<T: Clone + Send + Sync + 'static> Future<T> {
    /// Runs `continuation` with a handle on this future once it completes.
    ///
    /// The registration only holds the promise weakly, so a promise whose
    /// producers are all gone is freed along with the continuation instead of
    /// being kept alive by it.
    pub(crate) fn on_settled<F>(&self, continuation: F)
    where
        F: FnOnce(Self) + Send + 'static,
    {
        match &self.repr {
            Repr::Immediate(_) => continuation(self.clone()),
            Repr::Deferred(inner) => {
                let weak = Arc::downgrade(inner);
                // Inline entries run inside `complete`, while the completing
                // producer still holds the promise.
                inner.continue_with(
                    Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            continuation(Self::deferred(inner));
                        }
                    }),
                    Some(scheduler::inline()),
                );
            }
        }
    }
}

impl<T: Clone> IntoFuture for Future<T> {
    type Output = Result<T, Error>;
    type IntoFuture = Awaiter<T>;

    fn into_future(self) -> Self::IntoFuture {
        Awaiter {
            future: self,
            scheduler: None,
            resume_synchronously: true,
            signal: None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Signal {
    fired: AtomicBool,
    waker: AtomicWaker,
}

impl Signal {
    pub(crate) fn register(&self, waker: &std::task::Waker) {
        self.waker.register(waker);
    }

    pub(crate) fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        self.waker.wake();
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// The [`std::future::Future`] that awaits a [`Future`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Awaiter<T> {
    future: Future<T>,
    scheduler: Option<SchedulerRef>,
    resume_synchronously: bool,
    signal: Option<Arc<Signal>>,
}

// `T` is only ever reached through shared references, never pinned.
impl<T> Unpin for Awaiter<T> {}

impl<T: fmt::Debug> fmt::Debug for Awaiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Awaiter")
            .field("future", &self.future)
            .field("scheduler", &self.scheduler)
            .field("resume_synchronously", &self.resume_synchronously)
            .finish_non_exhaustive()
    }
}

impl<T: Clone> std::future::Future for Awaiter<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(signal) = &this.signal {
            signal.waker.register(cx.waker());
            return if signal.is_fired() {
                Poll::Ready(this.future.result())
            } else {
                Poll::Pending
            };
        }

        let completed = this.future.is_completed();
        if completed && (this.resume_synchronously || this.scheduler.is_none()) {
            return Poll::Ready(this.future.result());
        }

        let signal = Arc::new(Signal::default());
        signal.waker.register(cx.waker());
        this.signal = Some(signal.clone());
        let wake = move || signal.fire();

        match (&this.future.repr, &this.scheduler) {
            // Only reachable when a forced hop was requested.
            (_, Some(scheduler)) if completed => scheduler.schedule_continuation(Box::new(wake)),
            (Repr::Deferred(inner), scheduler) => inner.continue_with(Box::new(wake), scheduler.clone()),
            (Repr::Immediate(_), _) => wake(),
        }

        match &this.signal {
            Some(signal) if signal.is_fired() => Poll::Ready(this.future.result()),
            _ => Poll::Pending,
        }
    }
}
