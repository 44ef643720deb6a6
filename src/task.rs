//! Bridges into plain `std::future::Future` trait objects.
//!
//! A [`Task`] owns no handle on the source future's promise once it has
//! resolved, and can be stored or spawned on any executor.
use crate::any_future::AnyFuture;
use crate::error::Error;
use crate::future::Future;
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt};

/// A boxed native future resolving to the source's result.
pub type Task<T> = BoxFuture<'static, Result<T, Error>>;

impl<T: Clone + Send + Sync + 'static> Future<T> {
    /// Converts into a [`Task`].
    ///
    /// Completed futures become an already-resolved task; pending ones are
    /// wired to a oneshot channel fed by a continuation.
    pub fn to_task(&self) -> Task<T> {
        if self.is_completed() {
            return future::ready(self.result()).boxed();
        }
        let (tx, rx) = oneshot::channel();
        self.on_settled(move |source| {
            // The task may have been dropped already; nobody is waiting then.
            let _ = tx.send(source.result());
        });
        rx.map(|received| received.unwrap_or(Err(Error::Canceled))).boxed()
    }
}

impl AnyFuture {
    /// Converts into a [`Task`] that resolves once the source completes.
    pub fn to_task(&self) -> Task<()> {
        if self.is_completed() {
            return future::ready(self.throw_if_failed()).boxed();
        }
        let (tx, rx) = oneshot::channel();
        self.on_settled(move |source| {
            let _ = tx.send(source.throw_if_failed());
        });
        rx.map(|received| received.unwrap_or(Err(Error::Canceled))).boxed()
    }
}
