//! The producer side: a completion cell written exactly once.
//!
//! A [`Promise`] starts pending and ends in one of three terminal outcomes:
//! succeeded with a value, canceled, or failed with a [`Cause`]. Any number of
//! producers may race to complete it; exactly one wins and the others are
//! told so. Consumers observe it through [`Future`]s.
//!
//! ```
//! use promise_future::Promise;
//! use futures::executor::block_on;
//! use std::thread;
//!
//! let promise = Promise::<String>::new();
//! let future = promise.future();
//! let task1 = thread::spawn(move || block_on(async {
//!     println!("Received {:?}", future.await);
//! }));
//! assert!(promise.set_value("Hi".into()));
//! assert!(!promise.set_canceled());
//! task1.join().expect("The task1 thread has panicked.");
//! ```
use crate::chain::{Chain, Entry, Node};
use crate::error::{Cause, Error};
use crate::future::Future;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::scheduler::{Continuation, SchedulerRef};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Low bit of the state word: set when the word points at a boxed terminal
/// [`Outcome`], clear when it points at the (possibly null) continuation
/// chain.
const TERMINAL: usize = 1;

/// The terminal outcome of a promise.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Succeeded(T),
    Canceled,
    Failed(Cause),
}

impl<T> Outcome<T> {
    fn kind(&self) -> &'static str {
        match self {
            Outcome::Succeeded(_) => "succeeded",
            Outcome::Canceled => "canceled",
            Outcome::Failed(_) => "failed",
        }
    }

    /// The failure this outcome represents, if any.
    pub fn error(&self) -> Option<Error> {
        match self {
            Outcome::Succeeded(_) => None,
            Outcome::Canceled => Some(Error::Canceled),
            Outcome::Failed(cause) => Some(Error::Failed(cause.clone())),
        }
    }

    pub fn as_result(&self) -> Result<&T, Error> {
        match self {
            Outcome::Succeeded(value) => Ok(value),
            Outcome::Canceled => Err(Error::Canceled),
            Outcome::Failed(cause) => Err(Error::Failed(cause.clone())),
        }
    }
}

/// Shared completion cell behind [`Promise`] and deferred [`Future`]s.
pub(crate) struct Inner<T> {
    state: AtomicUsize,
    _marker: PhantomData<Outcome<T>>,
}

// Safety: the outcome is moved in by one producer and only handed out by
// shared reference afterwards; continuations are `Send`.
unsafe impl<T: Send> Send for Inner<T> {}
// Safety: see above.
unsafe impl<T: Send + Sync> Sync for Inner<T> {}

#[inline]
fn is_terminal(state: usize) -> bool {
    state & TERMINAL == TERMINAL
}

impl<T> Inner<T> {
    fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    pub(crate) fn with_outcome(outcome: Outcome<T>) -> Self {
        let boxed = Box::into_raw(Box::new(outcome)) as usize;
        debug_assert_eq!(boxed & TERMINAL, 0, "outcome is not sufficiently aligned");
        Self {
            state: AtomicUsize::new(boxed | TERMINAL),
            _marker: PhantomData,
        }
    }

    /// The single completion check everything else goes through.
    pub(crate) fn completion(&self) -> Result<&Outcome<T>, Error> {
        let state = self.state.load(Ordering::Acquire);
        if is_terminal(state) {
            let outcome = (state & !TERMINAL) as *const Outcome<T>;
            // Safety: the terminal box was published by a release CAS that the
            // acquire load above observed, and it is only freed in `drop`.
            Ok(unsafe { &*outcome })
        } else {
            Err(Error::NotCompleted)
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        is_terminal(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn complete(&self, outcome: Outcome<T>, via: Option<&SchedulerRef>) -> bool {
        match self.settle(outcome) {
            Some(chain) => {
                chain.invoke(via);
                true
            }
            None => false,
        }
    }

    /// Publishes `outcome` without running anything, returning the detached
    /// continuations for the caller to invoke. `None` if already completed.
    #[must_use]
    pub(crate) fn settle(&self, outcome: Outcome<T>) -> Option<Chain> {
        let mut current = self.state.load(Ordering::Acquire);
        if is_terminal(current) {
            tracing::trace!(outcome = outcome.kind(), "promise already completed");
            return None;
        }

        let kind = outcome.kind();
        let boxed = Box::into_raw(Box::new(outcome));
        debug_assert_eq!(boxed as usize & TERMINAL, 0, "outcome is not sufficiently aligned");
        let terminal = boxed as usize | TERMINAL;

        loop {
            if is_terminal(current) {
                // Safety: the box was never published.
                drop(unsafe { Box::from_raw(boxed) });
                tracing::trace!(outcome = kind, "promise already completed");
                return None;
            }
            match self.state.compare_exchange_weak(
                current,
                terminal,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        // Safety: the CAS replaced the chain head with the terminal marker, so
        // no other thread can reach these nodes anymore.
        let chain = unsafe { Chain::from_raw(current as *mut Node) };
        tracing::trace!(outcome = kind, continuations = chain.len(), "promise completed");
        Some(chain)
    }

    pub(crate) fn continue_with(&self, continuation: Continuation, scheduler: Option<SchedulerRef>) {
        let entry = Entry::new(continuation, scheduler);
        let mut current = self.state.load(Ordering::Acquire);
        if is_terminal(current) {
            entry.dispatch(None);
            return;
        }

        let node = Node::alloc(entry);
        loop {
            if is_terminal(current) {
                // Safety: the node was never published.
                let entry = unsafe { Node::reclaim(node) };
                entry.dispatch(None);
                return;
            }
            // Safety: the node is still private to this thread.
            unsafe { Node::link(node, current as *mut Node) };
            match self.state.compare_exchange_weak(
                current,
                node as usize,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::trace!("continuation registered");
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let state = self.state.load(Ordering::Acquire);
        if is_terminal(state) {
            // Safety: we are the last owner; the box was leaked by `complete`.
            drop(unsafe { Box::from_raw((state & !TERMINAL) as *mut Outcome<T>) });
        } else {
            // Safety: we are the last owner of the chain.
            let chain = unsafe { Chain::from_raw(state as *mut Node) };
            if chain.len() > 0 {
                tracing::trace!(continuations = chain.len(), "promise dropped while pending");
            }
        }
    }
}

/// The writable end of a promise/future pair.
///
/// Cloning a `Promise` hands out another producer for the same cell.
pub struct Promise<T> {
    pub(crate) inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.completion() {
            Ok(outcome) => outcome.kind(),
            Err(_) => "pending",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new()),
        }
    }

    /// Creates a promise that is already completed with `outcome`.
    pub fn completed(outcome: Outcome<T>) -> Self {
        Self {
            inner: Arc::new(Inner::with_outcome(outcome)),
        }
    }

    /// Returns a read-side handle on this promise.
    pub fn future(&self) -> Future<T> {
        Future::deferred(self.inner.clone())
    }

    /// Completes with `value`. Returns `false` if the promise was already
    /// completed, in which case `value` is dropped.
    pub fn set_value(&self, value: T) -> bool {
        self.complete(Outcome::Succeeded(value))
    }

    pub fn set_canceled(&self) -> bool {
        self.complete(Outcome::Canceled)
    }

    pub fn set_exception<E: Into<Cause>>(&self, error: E) -> bool {
        self.complete(Outcome::Failed(error.into()))
    }

    /// Completes with `outcome`, running continuations that were registered
    /// without a scheduler inline on this thread.
    pub fn complete(&self, outcome: Outcome<T>) -> bool {
        self.inner.complete(outcome, None)
    }

    /// Like [`complete`](Self::complete), but continuations registered without
    /// a scheduler are dispatched through `scheduler`.
    pub fn complete_via(&self, outcome: Outcome<T>, scheduler: &SchedulerRef) -> bool {
        self.inner.complete(outcome, Some(scheduler))
    }

    /// Runs `continuation` once the promise completes, immediately if it
    /// already has. With a `scheduler`, the continuation is dispatched through
    /// it instead of running inline.
    ///
    /// Continuations run in registration order. They must not panic.
    pub fn continue_with<F>(&self, continuation: F, scheduler: Option<SchedulerRef>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.continue_with(Box::new(continuation), scheduler);
    }

    pub fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }

    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending.
    pub fn is_succeeded(&self) -> Result<bool, Error> {
        Ok(matches!(self.inner.completion()?, Outcome::Succeeded(_)))
    }

    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending.
    pub fn is_canceled(&self) -> Result<bool, Error> {
        Ok(matches!(self.inner.completion()?, Outcome::Canceled))
    }

    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending.
    pub fn is_failed(&self) -> Result<bool, Error> {
        Ok(matches!(self.inner.completion()?, Outcome::Failed(_)))
    }

    /// Returns the value.
    ///
    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending, otherwise the captured
    /// [`Error::Canceled`] or [`Error::Failed`].
    pub fn value(&self) -> Result<&T, Error> {
        self.inner.completion()?.as_result()
    }

    /// Returns the captured failure, or `None` if the promise succeeded.
    ///
    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending.
    pub fn exception(&self) -> Result<Option<Error>, Error> {
        Ok(self.inner.completion()?.error())
    }

    pub fn outcome(&self) -> Result<&Outcome<T>, Error> {
        self.inner.completion()
    }

    /// # Errors
    ///
    /// [`Error::NotCompleted`] while pending, otherwise the captured failure
    /// if the promise did not succeed.
    pub fn throw_if_failed(&self) -> Result<(), Error> {
        match self.inner.completion()?.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::scheduler;
    use parking_lot::Mutex;
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    #[error("producer blew up")]
    struct Boom;

    #[test]
    fn only_first_completion_wins() {
        let promise = Promise::<u32>::new();
        assert!(promise.set_value(1));
        assert!(!promise.set_value(2));
        assert!(!promise.set_canceled());
        assert!(!promise.set_exception(Boom));
        assert_eq!(*promise.value().unwrap(), 1);
        assert!(promise.is_succeeded().unwrap());
    }

    #[test]
    fn pending_queries_fail_loudly() {
        let promise = Promise::<u32>::new();
        assert!(!promise.is_completed());
        assert!(matches!(promise.value(), Err(Error::NotCompleted)));
        assert!(matches!(promise.exception(), Err(Error::NotCompleted)));
        assert!(matches!(promise.is_canceled(), Err(Error::NotCompleted)));
        assert!(matches!(promise.is_succeeded(), Err(Error::NotCompleted)));
        assert!(matches!(promise.is_failed(), Err(Error::NotCompleted)));
        assert!(matches!(promise.throw_if_failed(), Err(Error::NotCompleted)));
    }

    #[test]
    fn failure_is_relayed_verbatim() {
        let promise = Promise::<u32>::new();
        let cause = Cause::from(Boom);
        assert!(promise.set_exception(cause.clone()));
        assert!(promise.is_failed().unwrap());
        match promise.value() {
            Err(Error::Failed(seen)) => assert!(seen.ptr_eq(&cause)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(promise.throw_if_failed(), Err(Error::Failed(_))));
        assert!(matches!(promise.exception(), Ok(Some(Error::Failed(_)))));
    }

    #[test]
    fn cancellation_is_a_terminal_outcome() {
        let promise = Promise::<u32>::new();
        assert!(promise.set_canceled());
        assert!(promise.is_canceled().unwrap());
        assert!(matches!(promise.value(), Err(Error::Canceled)));
        assert!(matches!(promise.exception(), Ok(Some(Error::Canceled))));
        assert!(matches!(promise.throw_if_failed(), Err(Error::Canceled)));
    }

    #[test]
    fn succeeded_promise_does_not_throw() {
        let promise = Promise::completed(Outcome::Succeeded("done"));
        assert!(promise.throw_if_failed().is_ok());
        assert!(matches!(promise.exception(), Ok(None)));
    }

    #[test]
    fn continuations_fire_in_registration_order_across_completion() {
        let promise = Promise::<u32>::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            promise.continue_with(move || log.lock().push(i), None);
        }
        assert!(log.lock().is_empty());
        promise.set_value(9);
        for i in 3..5 {
            let log = log.clone();
            promise.continue_with(move || log.lock().push(i), None);
        }
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn wide_fan_in_keeps_order() {
        let promise = Promise::<()>::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..1_000 {
            let log = log.clone();
            promise.continue_with(move || log.lock().push(i), None);
        }
        promise.set_value(());
        assert_eq!(*log.lock(), (0..1_000).collect::<Vec<_>>());
    }

    #[test]
    fn continuation_runs_on_its_scheduler() {
        let promise = Promise::<u32>::new();
        let (tx, rx) = channel();
        promise.continue_with(
            move || tx.send(thread::current().name().map(str::to_owned)).unwrap(),
            Some(scheduler::dedicated_thread()),
        );
        promise.set_value(1);
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("promise-future-dedicated"));
    }

    #[test]
    fn complete_via_dispatches_bare_continuations() {
        let promise = Promise::<u32>::new();
        let (tx, rx) = channel();
        promise.continue_with(
            move || tx.send(thread::current().name().map(str::to_owned)).unwrap(),
            None,
        );
        promise.complete_via(Outcome::Succeeded(3), &scheduler::worker_pool());
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap_or_default();
        assert!(name.starts_with("promise-future-worker"));
    }

    #[test]
    fn racing_producers_complete_once() {
        for _ in 0..50 {
            let promise = Promise::<usize>::new();
            let fired = Arc::new(Mutex::new(0));
            let counter = fired.clone();
            promise.continue_with(move || *counter.lock() += 1, None);

            let winners: usize = (0..4)
                .map(|i| {
                    let promise = promise.clone();
                    thread::spawn(move || promise.set_value(i) as usize)
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .sum();

            assert_eq!(winners, 1);
            assert_eq!(*fired.lock(), 1);
            let first = *promise.value().unwrap();
            assert_eq!(*promise.value().unwrap(), first);
        }
    }

    #[test]
    fn registration_racing_completion_always_fires() {
        for _ in 0..50 {
            let promise = Promise::<()>::new();
            let fired = Arc::new(Mutex::new(0));
            let registrars: Vec<_> = (0..4)
                .map(|_| {
                    let promise = promise.clone();
                    let fired = fired.clone();
                    thread::spawn(move || {
                        for _ in 0..25 {
                            let fired = fired.clone();
                            promise.continue_with(move || *fired.lock() += 1, None);
                        }
                    })
                })
                .collect();
            promise.set_value(());
            for handle in registrars {
                handle.join().unwrap();
            }
            assert_eq!(*fired.lock(), 100);
        }
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::loom::{self, sync::atomic::AtomicUsize};

    #[test]
    fn register_and_complete_race() {
        loom::model(|| {
            let promise = Promise::<u32>::new();
            let fired = std::sync::Arc::new(AtomicUsize::new(0));

            let producer = promise.clone();
            let handle = loom::thread::spawn(move || {
                producer.set_value(1);
            });

            let counter = fired.clone();
            promise.continue_with(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                None,
            );

            handle.join().unwrap();
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        });
    }
}
