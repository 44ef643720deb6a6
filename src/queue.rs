//! A single-consumer, multi-producer hand-off queue built on [`Promise`].
//!
//! Producers may be cloned freely (share the queue behind an `Arc`), but at
//! most one [`dequeue`](FutureQueue::dequeue) may be outstanding at a time.
//!
//! ```
//! use promise_future::FutureQueue;
//! use futures::executor::block_on;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let queue = Arc::new(FutureQueue::new());
//! let producer = queue.clone();
//! let task1 = thread::spawn(move || {
//!     producer.enqueue(String::from("🍓"));
//! });
//! let item = block_on(async { queue.dequeue().unwrap().await }).unwrap();
//! assert_eq!(item, "🍓");
//! task1.join().expect("The task1 thread has panicked");
//! ```
use crate::error::Error;
use crate::future::Future;
use crate::promise::{Outcome, Promise};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;

pub struct FutureQueue<T> {
    state: Mutex<State<T>>,
}

struct State<T> {
    /// Never non-empty while `consumer` is set.
    backlog: VecDeque<T>,
    consumer: Option<Promise<T>>,
    adding_completed: bool,
    disposed: bool,
}

impl<T> fmt::Debug for FutureQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FutureQueue")
            .field("backlog", &state.backlog.len())
            .field("consumer_pending", &state.consumer.is_some())
            .field("adding_completed", &state.adding_completed)
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl<T> Default for FutureQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FutureQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                backlog: VecDeque::new(),
                consumer: None,
                adding_completed: false,
                disposed: false,
            }),
        }
    }

    /// Hands `item` to the waiting consumer, or buffers it.
    ///
    /// Returns `false`, dropping `item`, once adding has been completed or the
    /// queue was disposed.
    pub fn enqueue(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.adding_completed || state.disposed {
            tracing::trace!("enqueue on a closed queue");
            return false;
        }
        let handed_off = match state.consumer.take() {
            Some(consumer) => {
                tracing::trace!("handing item to the waiting consumer");
                // Published under the lock so no later dequeue can overtake
                // this item; continuations run after unlocking.
                consumer.inner.settle(Outcome::Succeeded(item))
            }
            None => {
                state.backlog.push_back(item);
                None
            }
        };
        drop(state);
        if let Some(continuations) = handed_off {
            continuations.invoke(None);
        }
        true
    }

    /// Returns a future for the next item.
    ///
    /// The future is already completed if an item was buffered, and canceled
    /// once the queue is disposed, or adding was completed and the backlog is
    /// drained.
    ///
    /// # Errors
    ///
    /// [`Error::DequeuePending`] if the previous dequeue has not been served
    /// yet.
    pub fn dequeue(&self) -> Result<Future<T>, Error> {
        let mut state = self.state.lock();
        if state.consumer.is_some() {
            return Err(Error::DequeuePending);
        }
        if state.disposed {
            return Ok(Future::from_canceled());
        }
        if let Some(item) = state.backlog.pop_front() {
            return Ok(Future::from_value(item));
        }
        if state.adding_completed {
            return Ok(Future::from_canceled());
        }

        let consumer = Promise::new();
        let future = consumer.future();
        state.consumer = Some(consumer);
        tracing::trace!("consumer waiting for an item");
        Ok(future)
    }

    /// Pops a buffered item without waiting.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.disposed {
            return None;
        }
        state.backlog.pop_front()
    }

    /// Stops accepting items and cancels a waiting consumer. Items already
    /// buffered can still be dequeued.
    pub fn complete_adding(&self) {
        let consumer = {
            let mut state = self.state.lock();
            state.adding_completed = true;
            state.consumer.take()
        };
        tracing::debug!(consumer_pending = consumer.is_some(), "queue adding completed");
        if let Some(consumer) = consumer {
            consumer.set_canceled();
        }
    }

    /// Closes the queue for good: drops the backlog and cancels a waiting
    /// consumer. Calling it again does nothing.
    pub fn dispose(&self) {
        let (backlog, consumer) = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.adding_completed = true;
            (std::mem::take(&mut state.backlog), state.consumer.take())
        };
        tracing::debug!(dropped = backlog.len(), consumer_pending = consumer.is_some(), "queue disposed");
        drop(backlog);
        if let Some(consumer) = consumer {
            consumer.set_canceled();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_adding_completed(&self) -> bool {
        self.state.lock().adding_completed
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

impl<T> Drop for FutureQueue<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}
