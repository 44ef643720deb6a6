//! A type-erased [`Future`], for collections of futures over different value
//! types.
//!
//! Erasing keeps the identity of the backing promise, so an [`AnyFuture`]
//! compares equal to the typed future it came from and can be cast back.
//!
//! ```
//! use promise_future::{AnyFuture, Future, Promise};
//!
//! let promise = Promise::<u32>::new();
//! let erased = AnyFuture::from(promise.future());
//! assert_eq!(promise.future(), erased);
//!
//! promise.set_value(3);
//! let typed: Future<u32> = erased.to_future_of().unwrap();
//! assert_eq!(*typed.value().unwrap(), 3);
//! assert!(erased.to_future_of::<String>().is_err());
//! ```
use crate::error::{type_mismatch, Error};
use crate::future::{Future, Repr, Signal};
use crate::promise::Inner;
use crate::scheduler::{self, Continuation, SchedulerRef};
use std::any::Any;
use std::fmt;
use std::future::IntoFuture;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// An immediate payload with its equality kept behind the erasure.
trait ErasedValue: Send + Sync {
    fn as_any(&self) -> &(dyn Any + Send + Sync);
    fn eq_any(&self, other: &(dyn Any + Send + Sync)) -> bool;
    fn type_name(&self) -> &'static str;
}

impl<T: PartialEq + Send + Sync + 'static> ErasedValue for T {
    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn eq_any(&self, other: &(dyn Any + Send + Sync)) -> bool {
        other.downcast_ref::<T>().is_some_and(|other| self == other)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A promise with its value type erased.
trait ErasedPromise: Send + Sync {
    fn is_completed(&self) -> bool;
    fn error(&self) -> Result<Option<Error>, Error>;
    fn value_any(&self) -> Result<&(dyn Any + Send + Sync), Error>;
    fn continue_with(&self, continuation: Continuation, scheduler: Option<SchedulerRef>);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Send + Sync + 'static> ErasedPromise for Inner<T> {
    fn is_completed(&self) -> bool {
        Inner::is_completed(self)
    }

    fn error(&self) -> Result<Option<Error>, Error> {
        Ok(self.completion()?.error())
    }

    fn value_any(&self) -> Result<&(dyn Any + Send + Sync), Error> {
        let value = self.completion()?.as_result()?;
        Ok(value)
    }

    fn continue_with(&self, continuation: Continuation, scheduler: Option<SchedulerRef>) {
        Inner::continue_with(self, continuation, scheduler);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[derive(Clone)]
enum AnyRepr {
    Immediate(Arc<dyn ErasedValue>),
    Deferred(Arc<dyn ErasedPromise>),
}

#[derive(Clone)]
pub struct AnyFuture {
    repr: AnyRepr,
}

impl<T: PartialEq + Send + Sync + 'static> From<Future<T>> for AnyFuture {
    fn from(future: Future<T>) -> Self {
        let repr = match future.repr {
            Repr::Immediate(value) => AnyRepr::Immediate(Arc::new(value)),
            Repr::Deferred(inner) => AnyRepr::Deferred(inner),
        };
        Self { repr }
    }
}

impl fmt::Debug for AnyFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            AnyRepr::Immediate(value) => write!(f, "AnyFuture::Immediate(<{}>)", value.type_name()),
            AnyRepr::Deferred(inner) => {
                let state = match inner.error() {
                    Ok(None) => "succeeded",
                    Ok(Some(Error::Canceled)) => "canceled",
                    Ok(Some(_)) => "failed",
                    Err(_) => "pending",
                };
                write!(f, "AnyFuture::Deferred({state})")
            }
        }
    }
}

impl AnyFuture {
    fn promise_addr(&self) -> Option<*const ()> {
        match &self.repr {
            AnyRepr::Immediate(_) => None,
            AnyRepr::Deferred(inner) => Some(Arc::as_ptr(inner).cast()),
        }
    }

    pub fn is_completed(&self) -> bool {
        match &self.repr {
            AnyRepr::Immediate(_) => true,
            AnyRepr::Deferred(inner) => inner.is_completed(),
        }
    }

    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending.
    pub fn exception(&self) -> Result<Option<Error>, Error> {
        match &self.repr {
            AnyRepr::Immediate(_) => Ok(None),
            AnyRepr::Deferred(inner) => inner.error(),
        }
    }

    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending.
    pub fn is_succeeded(&self) -> Result<bool, Error> {
        Ok(self.exception()?.is_none())
    }

    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending.
    pub fn is_canceled(&self) -> Result<bool, Error> {
        Ok(matches!(self.exception()?, Some(Error::Canceled)))
    }

    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending.
    pub fn is_failed(&self) -> Result<bool, Error> {
        Ok(matches!(self.exception()?, Some(Error::Failed(_))))
    }

    /// Immediate futures always succeeded, so this only fails for deferred
    /// ones.
    ///
    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending, otherwise the captured failure.
    pub fn throw_if_failed(&self) -> Result<(), Error> {
        match self.exception()? {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending, otherwise the captured failure.
    pub fn value_any(&self) -> Result<&(dyn Any + Send + Sync), Error> {
        match &self.repr {
            AnyRepr::Immediate(value) => Ok(value.as_any()),
            AnyRepr::Deferred(inner) => inner.value_any(),
        }
    }

    /// # Errors
    ///
    /// [`Error::TypeMismatch`] if the value is not a `T`, plus everything
    /// [`value_any`](Self::value_any) can fail with.
    pub fn value<T: Any>(&self) -> Result<&T, Error> {
        self.value_any()?
            .downcast_ref::<T>()
            .ok_or_else(type_mismatch::<T>)
    }

    /// Casts back to a typed future over the same promise.
    ///
    /// # Errors
    ///
    /// [`Error::TypeMismatch`] if the erased value type is not `T`.
    pub fn to_future_of<T: Clone + Send + Sync + 'static>(&self) -> Result<Future<T>, Error> {
        match &self.repr {
            AnyRepr::Immediate(value) => value
                .as_any()
                .downcast_ref::<T>()
                .cloned()
                .map(Future::from_value)
                .ok_or_else(type_mismatch::<T>),
            AnyRepr::Deferred(inner) => inner
                .clone()
                .into_any()
                .downcast::<Inner<T>>()
                .map(Future::deferred)
                .map_err(|_| type_mismatch::<T>()),
        }
    }

    pub fn on_completed<F>(&self, continuation: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.repr {
            AnyRepr::Immediate(_) => continuation(),
            AnyRepr::Deferred(inner) => inner.continue_with(Box::new(continuation), None),
        }
    }

    /// See [`Future::on_completed_via`].
    pub fn on_completed_via<F>(&self, continuation: F, scheduler: SchedulerRef, resume_synchronously: bool)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.repr {
            AnyRepr::Deferred(inner) if !inner.is_completed() => {
                inner.continue_with(Box::new(continuation), Some(scheduler));
            }
            _ if resume_synchronously => continuation(),
            _ => scheduler.schedule_continuation(Box::new(continuation)),
        }
    }

    /// See [`Future::on_settled`].
    pub(crate) fn on_settled<F>(&self, continuation: F)
    where
        F: FnOnce(Self) + Send + 'static,
    {
        match &self.repr {
            AnyRepr::Immediate(_) => continuation(self.clone()),
            AnyRepr::Deferred(inner) => {
                let weak = Arc::downgrade(inner);
                inner.continue_with(
                    Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            continuation(Self {
                                repr: AnyRepr::Deferred(inner),
                            });
                        }
                    }),
                    Some(scheduler::inline()),
                );
            }
        }
    }

    /// Awaits completion with the wake-up dispatched through `scheduler`.
    ///
    /// See [`Future::configure`].
    pub fn configure(self, scheduler: SchedulerRef, resume_synchronously: bool) -> AnyAwaiter {
        AnyAwaiter {
            future: self,
            scheduler: Some(scheduler),
            resume_synchronously,
            signal: None,
        }
    }
}

impl PartialEq for AnyFuture {
    fn eq(&self, other: &Self) -> bool {
        match (&self.repr, &other.repr) {
            (AnyRepr::Immediate(a), AnyRepr::Immediate(b)) => a.eq_any(b.as_any()),
            _ => match (self.promise_addr(), other.promise_addr()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl<T: PartialEq + 'static> PartialEq<AnyFuture> for Future<T> {
    fn eq(&self, other: &AnyFuture) -> bool {
        match (&self.repr, &other.repr) {
            (Repr::Immediate(a), AnyRepr::Immediate(b)) => {
                b.as_any().downcast_ref::<T>().is_some_and(|b| a == b)
            }
            _ => match (self.promise_addr(), other.promise_addr()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl<T: PartialEq + 'static> PartialEq<Future<T>> for AnyFuture {
    fn eq(&self, other: &Future<T>) -> bool {
        other == self
    }
}

/// Awaiting an [`AnyFuture`] waits for completion and relays its failure.
impl IntoFuture for AnyFuture {
    type Output = Result<(), Error>;
    type IntoFuture = AnyAwaiter;

    fn into_future(self) -> Self::IntoFuture {
        AnyAwaiter {
            future: self,
            scheduler: None,
            resume_synchronously: true,
            signal: None,
        }
    }
}

#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct AnyAwaiter {
    future: AnyFuture,
    scheduler: Option<SchedulerRef>,
    resume_synchronously: bool,
    signal: Option<Arc<Signal>>,
}

impl fmt::Debug for AnyAwaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyAwaiter")
            .field("future", &self.future)
            .field("scheduler", &self.scheduler)
            .field("resume_synchronously", &self.resume_synchronously)
            .finish_non_exhaustive()
    }
}

impl std::future::Future for AnyAwaiter {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(signal) = &this.signal {
            signal.register(cx.waker());
            return if signal.is_fired() {
                Poll::Ready(this.future.throw_if_failed())
            } else {
                Poll::Pending
            };
        }

        if this.future.is_completed() && (this.resume_synchronously || this.scheduler.is_none()) {
            return Poll::Ready(this.future.throw_if_failed());
        }

        let signal = Arc::new(Signal::default());
        signal.register(cx.waker());
        this.signal = Some(signal.clone());
        let wake = move || signal.fire();
        match &this.scheduler {
            Some(scheduler) => this.future.on_completed_via(wake, scheduler.clone(), false),
            None => this.future.on_completed(wake),
        }

        match &this.signal {
            Some(signal) if signal.is_fired() => Poll::Ready(this.future.throw_if_failed()),
            _ => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Promise;
    use crate::scheduler::Scheduler;
    use futures::executor::block_on;
    use futures::task::noop_waker_ref;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct Counting {
        dispatches: AtomicUsize,
    }

    impl Scheduler for Counting {
        fn schedule_continuation(&self, continuation: Continuation) {
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            continuation();
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[test]
    fn immediate_equality_crosses_the_erasure() {
        let typed = Future::from_value(5);
        let erased = AnyFuture::from(Future::from_value(5));
        assert_eq!(typed, erased);
        assert_eq!(erased, typed);
        assert_eq!(erased, AnyFuture::from(Future::from_value(5)));
        assert_ne!(erased, AnyFuture::from(Future::from_value(6)));
        assert_ne!(erased, AnyFuture::from(Future::from_value(5u8)));
    }

    #[test]
    fn deferred_identity_survives_round_trip() {
        let promise = Promise::<String>::new();
        let erased = AnyFuture::from(promise.future());
        let typed = erased.to_future_of::<String>().unwrap();
        assert_eq!(typed, promise.future());
        assert_eq!(AnyFuture::from(typed), erased);

        let other = Promise::<String>::new();
        assert_ne!(erased, AnyFuture::from(other.future()));
    }

    #[test]
    fn wrong_cast_is_a_type_mismatch() {
        let erased = AnyFuture::from(Future::from_value(1u32));
        assert!(matches!(erased.to_future_of::<i64>(), Err(Error::TypeMismatch { .. })));
        assert!(matches!(erased.value::<i64>(), Err(Error::TypeMismatch { .. })));
        assert_eq!(*erased.value::<u32>().unwrap(), 1);

        let pending = AnyFuture::from(Promise::<u32>::new().future());
        assert!(matches!(pending.to_future_of::<i64>(), Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn erased_flags_follow_the_promise() {
        let promise = Promise::<u32>::new();
        let erased = AnyFuture::from(promise.future());
        assert!(matches!(erased.is_succeeded(), Err(Error::NotCompleted)));
        assert!(matches!(erased.value_any(), Err(Error::NotCompleted)));
        promise.set_canceled();
        assert!(erased.is_canceled().unwrap());
        assert!(matches!(erased.throw_if_failed(), Err(Error::Canceled)));

        let immediate = AnyFuture::from(Future::from_value("ok"));
        assert!(immediate.throw_if_failed().is_ok());
        assert!(immediate.is_succeeded().unwrap());
        assert!(!immediate.is_failed().unwrap());
    }

    #[test]
    fn await_erased_future() {
        let promise = Promise::<u32>::new();
        let erased = AnyFuture::from(promise.future());
        let waiter = thread::spawn(move || block_on(erased.into_future()));
        promise.set_value(1);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn configured_erased_future_hops_through_the_scheduler() {
        let counting = Arc::new(Counting::default());
        let done = AnyFuture::from(Future::from_value(1u8));
        assert!(block_on(done.clone().configure(counting.clone(), true)).is_ok());
        assert_eq!(counting.dispatches.load(Ordering::SeqCst), 0);
        assert!(block_on(done.configure(counting.clone(), false)).is_ok());
        assert_eq!(counting.dispatches.load(Ordering::SeqCst), 1);

        let promise = Promise::<u32>::new();
        let erased = AnyFuture::from(promise.future());
        let mut awaiter = erased.configure(counting.clone(), true);
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(awaiter.poll_unpin(&mut cx).is_pending());
        promise.set_exception(Error::NoFutures);
        assert!(matches!(block_on(awaiter), Err(Error::Failed(_))));
        assert_eq!(counting.dispatches.load(Ordering::SeqCst), 2);
    }
}
