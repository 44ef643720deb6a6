//! Aggregation over groups of futures.
//!
//! Both combinators accept typed [`Future`]s or, for mixed value types,
//! [`AnyFuture`]s. Inputs that are already complete never get a continuation
//! registered on them.
//!
//! ```
//! use promise_future::{when_all, when_any, AnyFuture, Future, Promise};
//!
//! let slow = Promise::<u32>::new();
//! let fast = Promise::<String>::new();
//! let inputs = vec![AnyFuture::from(slow.future()), AnyFuture::from(fast.future())];
//!
//! let all = when_all(inputs.clone());
//! let any = when_any(inputs).unwrap();
//!
//! fast.set_value("first".into());
//! assert_eq!(*any.value().unwrap(), fast.future());
//! assert!(!all.is_completed());
//!
//! slow.set_value(2);
//! assert!(all.is_succeeded().unwrap());
//! ```
use crate::any_future::AnyFuture;
use crate::error::Error;
use crate::future::Future;
use crate::promise::Promise;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Anything the combinators can wait on.
pub trait Completable: Clone + Send + Sync + 'static {
    fn completed(&self) -> bool;

    /// The failure of a completed input; `None` when it succeeded or is
    /// still pending.
    fn failure(&self) -> Option<Error>;

    /// Runs `continuation` with a handle on the input once it completes.
    ///
    /// The registration must not keep the input alive: an input whose
    /// producers are all dropped is released even if it never completes.
    fn subscribe(&self, continuation: Box<dyn FnOnce(Self) + Send>);
}

impl<T: Clone + Send + Sync + 'static> Completable for Future<T> {
    fn completed(&self) -> bool {
        self.is_completed()
    }

    fn failure(&self) -> Option<Error> {
        self.exception().ok().flatten()
    }

    fn subscribe(&self, continuation: Box<dyn FnOnce(Self) + Send>) {
        self.on_settled(continuation);
    }
}

impl Completable for AnyFuture {
    fn completed(&self) -> bool {
        self.is_completed()
    }

    fn failure(&self) -> Option<Error> {
        self.exception().ok().flatten()
    }

    fn subscribe(&self, continuation: Box<dyn FnOnce(Self) + Send>) {
        self.on_settled(continuation);
    }
}

/// Count-down shared by the `when_all` continuations. It records failures
/// per input slot and never holds the inputs themselves.
struct WhenAll {
    remaining: AtomicUsize,
    failures: Mutex<Vec<Option<Error>>>,
    promise: Promise<()>,
}

impl WhenAll {
    fn arrive(&self, index: usize, failure: Option<Error>) {
        self.failures.lock()[index] = failure;
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let failures = std::mem::take(&mut *self.failures.lock());
            match aggregate(failures) {
                None => self.promise.set_value(()),
                Some(aggregate) => self.promise.set_exception(aggregate),
            };
        }
    }
}

fn aggregate(failures: Vec<Option<Error>>) -> Option<Error> {
    let failures: Vec<Error> = failures.into_iter().flatten().collect();
    if failures.is_empty() {
        None
    } else {
        Some(Error::Aggregate(failures))
    }
}

/// Completes once every input has completed.
///
/// Succeeds if all inputs succeeded. Otherwise fails with a cause that
/// downcasts to [`Error::Aggregate`], holding every cancellation and failure
/// in input order. Never completes early.
pub fn when_all<I, F>(futures: I) -> Future<()>
where
    I: IntoIterator<Item = F>,
    F: Completable,
{
    let futures: Vec<F> = futures.into_iter().collect();
    let pending: Vec<usize> = (0..futures.len())
        .filter(|&index| !futures[index].completed())
        .collect();
    // Slots of pending inputs are filled in on arrival.
    let failures: Vec<Option<Error>> = futures.iter().map(Completable::failure).collect();

    if pending.is_empty() {
        return match aggregate(failures) {
            None => Future::from_value(()),
            Some(aggregate) => Future::from_error(aggregate),
        };
    }

    tracing::trace!(inputs = futures.len(), pending = pending.len(), "when_all waiting");
    let promise = Promise::new();
    let state = Arc::new(WhenAll {
        remaining: AtomicUsize::new(pending.len()),
        failures: Mutex::new(failures),
        promise: promise.clone(),
    });
    for index in pending {
        let arrival = state.clone();
        futures[index].subscribe(Box::new(move |input: F| arrival.arrive(index, input.failure())));
    }
    promise.future()
}

/// Completes with whichever input completes first, whatever its outcome.
///
/// The result's value is (a clone of) the winning input. Later completions
/// are observed and discarded.
///
/// # Errors
///
/// [`Error::NoFutures`] if `futures` is empty.
pub fn when_any<I, F>(futures: I) -> Result<Future<F>, Error>
where
    I: IntoIterator<Item = F>,
    F: Completable,
{
    let futures: Vec<F> = futures.into_iter().collect();
    if futures.is_empty() {
        return Err(Error::NoFutures);
    }
    if let Some(done) = futures.iter().find(|future| future.completed()) {
        return Ok(Future::from_value(done.clone()));
    }

    tracing::trace!(inputs = futures.len(), "when_any waiting");
    let promise = Promise::new();
    for future in &futures {
        let promise = promise.clone();
        future.subscribe(Box::new(move |winner: F| {
            promise.set_value(winner);
        }));
    }
    Ok(promise.future())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Debug, thiserror::Error)]
    #[error("input two broke")]
    struct Broken;

    fn aggregate_of(future: &Future<()>) -> Vec<Error> {
        match future.value() {
            Err(Error::Failed(cause)) => match cause.downcast_ref::<Error>() {
                Some(Error::Aggregate(errors)) => errors.clone(),
                other => panic!("unexpected cause {other:?}"),
            },
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn all_succeed() {
        let a = Promise::<u32>::new();
        let b = Promise::<u32>::new();
        let all = when_all([a.future(), b.future(), Future::from_value(3)]);
        a.set_value(1);
        assert!(!all.is_completed());
        b.set_value(2);
        assert!(all.is_succeeded().unwrap());
    }

    #[test]
    fn collects_every_failure_regardless_of_order() {
        for cancel_first in [true, false] {
            let f1 = Promise::<u32>::new();
            let f2 = Promise::<u32>::new();
            let f3 = Promise::<u32>::new();
            let all = when_all([f1.future(), f2.future(), f3.future()]);

            if cancel_first {
                f3.set_canceled();
                f2.set_exception(Broken);
            } else {
                f2.set_exception(Broken);
                f3.set_canceled();
            }
            assert!(!all.is_completed());
            f1.set_value(1);

            let errors = aggregate_of(&all);
            assert_eq!(errors.len(), 2);
            assert!(matches!(&errors[0], Error::Failed(cause) if cause.downcast_ref::<Broken>().is_some()));
            assert!(errors[1].is_canceled());
        }
    }

    #[test]
    fn already_completed_inputs_take_the_fast_path() {
        let all = when_all([Future::<u8>::from_canceled(), Future::from_value(1)]);
        assert!(all.is_completed());
        assert_eq!(aggregate_of(&all).len(), 1);

        let empty = when_all(Vec::<Future<u8>>::new());
        assert!(empty.is_succeeded().unwrap());
    }

    #[test]
    fn duplicates_are_tolerated() {
        let a = Promise::<u32>::new();
        let all = when_all([a.future(), a.future()]);
        let any = when_any([a.future(), a.future()]).unwrap();
        a.set_value(5);
        assert!(all.is_succeeded().unwrap());
        assert_eq!(*any.value().unwrap(), a.future());
    }

    #[test]
    fn first_completion_wins() {
        let f1 = Promise::<u32>::new();
        let f2 = Promise::<u32>::new();
        let any = when_any([f1.future(), f2.future()]).unwrap();
        assert!(!any.is_completed());
        f2.set_value(2);
        f1.set_value(1);
        assert_eq!(*any.value().unwrap(), f2.future());
    }

    #[test]
    fn failure_can_win_the_race() {
        let f1 = Promise::<u32>::new();
        let f2 = Promise::<u32>::new();
        let any = when_any([f1.future(), f2.future()]).unwrap();
        f1.set_canceled();
        let winner = any.value().unwrap();
        assert!(winner.is_canceled().unwrap());
    }

    #[test]
    fn completed_input_wins_immediately() {
        let pending = Promise::<u32>::new();
        let any = when_any([pending.future(), Future::from_value(9)]).unwrap();
        assert_eq!(*any.value().unwrap(), Future::from_value(9));
    }

    #[test]
    fn empty_any_is_an_error() {
        assert!(matches!(when_any(Vec::<AnyFuture>::new()), Err(Error::NoFutures)));
    }

    #[test]
    fn heterogeneous_inputs() {
        let number = Promise::<u32>::new();
        let text = Promise::<String>::new();
        let all = when_all([AnyFuture::from(number.future()), AnyFuture::from(text.future())]);
        text.set_value("t".into());
        number.set_exception(Broken);
        assert_eq!(aggregate_of(&all).len(), 1);
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Parks a continuation on `promise` that flags when the cell is freed.
    fn watch_release<T>(promise: &Promise<T>) -> Arc<AtomicBool> {
        let released = Arc::new(AtomicBool::new(false));
        let guard = SetOnDrop(released.clone());
        promise.continue_with(move || drop(guard), None);
        released
    }

    #[test]
    fn abandoned_any_input_is_released() {
        let loser = Promise::<u32>::new();
        let winner = Promise::<u32>::new();
        let released = watch_release(&loser);

        let any = when_any([loser.future(), winner.future()]).unwrap();
        winner.set_value(1);
        assert_eq!(*any.value().unwrap(), winner.future());

        drop(loser);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn abandoned_all_input_is_released() {
        let abandoned = Promise::<u32>::new();
        let released = watch_release(&abandoned);
        let all = when_all([AnyFuture::from(abandoned.future())]);

        drop(abandoned);
        assert!(released.load(Ordering::SeqCst));
        assert!(!all.is_completed());
    }
}
