//! A lightweight promise/future pair with pluggable continuation dispatch.
//!
//! A [`Promise`] is completed exactly once by whichever producer gets there
//! first; [`Future`]s observe it, can be awaited, and run continuations in
//! registration order. Continuations are dispatched inline or through a
//! [`Scheduler`]: a dedicated thread or a shared worker pool.
//!
//! On top of that sit a single-consumer [`FutureQueue`] and the
//! [`when_all`]/[`when_any`] combinators.
//!
//! # Examples
//!
//! ```
//! use promise_future::{scheduler, Promise};
//! use futures::executor::block_on;
//! use std::thread;
//!
//! let (promise, future) = {
//!     let promise = Promise::<String>::new();
//!     let future = promise.future();
//!     (promise, future)
//! };
//! let task1 = thread::spawn(move || block_on(async {
//!     future.configure(scheduler::worker_pool(), true).await
//! }));
//! promise.set_value(String::from("🍓"));
//! assert_eq!(task1.join().expect("The task1 thread has panicked").unwrap(), "🍓");
//! ```
mod any_future;
mod chain;
mod combinators;
mod error;
mod future;
mod loom;
mod promise;
mod queue;
pub mod scheduler;
mod task;

pub use any_future::{AnyAwaiter, AnyFuture};
pub use combinators::{when_all, when_any, Completable};
pub use error::{Cause, Error};
pub use future::{Awaiter, Future};
pub use promise::{Outcome, Promise};
pub use queue::FutureQueue;
pub use scheduler::{Continuation, Scheduler, SchedulerRef};
pub use task::Task;
