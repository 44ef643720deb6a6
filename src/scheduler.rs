//! Strategies deciding where a continuation runs once its promise completes.
//!
//! A [`Scheduler`] does not own the work it is given, and it does not decide
//! how many threads exist in the process. It only dispatches one continuation
//! at a time. Three strategies ship with the crate and are available as
//! process-wide instances:
//!
//! * [`inline()`] runs the continuation right away on the calling thread.
//! * [`dedicated_thread()`] spawns a named background thread per dispatch.
//! * [`worker_pool()`] hands the continuation to a shared pool of workers.
//!
//! ```
//! use promise_future::scheduler::{self, Scheduler};
//! use std::sync::mpsc::channel;
//!
//! let (tx, rx) = channel();
//! scheduler::worker_pool().schedule_continuation(Box::new(move || {
//!     tx.send(std::thread::current().name().map(str::to_owned)).unwrap();
//! }));
//! let name = rx.recv().unwrap().unwrap_or_default();
//! assert!(name.starts_with("promise-future-worker"));
//! ```
use crate::future::Signal;
use crossbeam_channel::{unbounded, Sender};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::thread;

/// A zero-argument action run once a promise completes.
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// Opaque state handed to a [`Scheduler::schedule_callback`] callback.
pub type CallbackState = Arc<dyn Any + Send + Sync>;

/// Shared handle to a scheduler.
pub type SchedulerRef = Arc<dyn Scheduler>;

pub trait Scheduler: Send + Sync + 'static {
    /// Eventually invokes `continuation` exactly once.
    ///
    /// Only the inline strategy may run it before this call returns.
    fn schedule_continuation(&self, continuation: Continuation);

    /// Like [`schedule_continuation`](Scheduler::schedule_continuation), but
    /// strategies that can carry `(callback, state)` directly skip the boxed
    /// closure.
    fn schedule_callback(&self, callback: fn(CallbackState), state: CallbackState) {
        self.schedule_continuation(Box::new(move || callback(state)));
    }

    /// Short name used in log output.
    fn name(&self) -> &str;
}

impl fmt::Debug for dyn Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Scheduler").field(&self.name()).finish()
    }
}

/// Runs continuations immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct Inline;

impl Scheduler for Inline {
    fn schedule_continuation(&self, continuation: Continuation) {
        continuation();
    }

    fn schedule_callback(&self, callback: fn(CallbackState), state: CallbackState) {
        callback(state);
    }

    fn name(&self) -> &str {
        "inline"
    }
}

/// Spawns a fresh background thread for every dispatch.
#[derive(Debug, Clone)]
pub struct DedicatedThread {
    thread_name: String,
}

impl DedicatedThread {
    pub fn named<N: Into<String>>(thread_name: N) -> Self {
        Self {
            thread_name: thread_name.into(),
        }
    }
}

impl Default for DedicatedThread {
    fn default() -> Self {
        Self::named("promise-future-dedicated")
    }
}

impl Scheduler for DedicatedThread {
    /// # Panics
    ///
    /// Panics if the operating system refuses to create a thread, just like
    /// [`std::thread::spawn`].
    fn schedule_continuation(&self, continuation: Continuation) {
        tracing::trace!(thread = %self.thread_name, "spawning dedicated continuation thread");
        let spawned = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(continuation);
        if let Err(err) = spawned {
            panic!("failed to spawn thread `{}`: {err}", self.thread_name);
        }
    }

    fn name(&self) -> &str {
        &self.thread_name
    }
}

enum Job {
    Continuation(Continuation),
    Callback(fn(CallbackState), CallbackState),
}

impl Job {
    fn run(self) {
        match self {
            Job::Continuation(continuation) => continuation(),
            Job::Callback(callback, state) => callback(state),
        }
    }
}

/// A pool of detached worker threads sharing one job channel.
///
/// Workers exit once the pool (and every clone of its sender) is dropped and
/// the remaining jobs are drained.
pub struct WorkerPool {
    sender: Sender<Job>,
    threads: usize,
    name_prefix: String,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads)
            .field("name_prefix", &self.name_prefix)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolBuilder {
    threads: Option<usize>,
    name_prefix: String,
}

impl WorkerPool {
    #[inline]
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            threads: None,
            name_prefix: "promise-future-worker".into(),
        }
    }

    /// Number of worker threads that were successfully started.
    pub fn threads(&self) -> usize {
        self.threads
    }

    fn submit(&self, job: Job) {
        // The receivers live as long as the workers, which only exit after
        // every sender is gone, so this cannot fail while `self` is alive.
        if self.sender.send(job).is_err() {
            tracing::error!(pool = %self.name_prefix, "worker pool has shut down, dropping job");
        }
    }
}

impl WorkerPoolBuilder {
    /// Sets the number of workers. Defaults to the available parallelism.
    pub fn threads(self, threads: usize) -> Self {
        Self {
            threads: Some(threads.max(1)),
            ..self
        }
    }

    /// Sets the prefix of worker thread names; workers are suffixed `-{index}`.
    pub fn name_prefix<N: Into<String>>(self, name_prefix: N) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            ..self
        }
    }

    /// Starts the workers.
    ///
    /// # Errors
    ///
    /// Returns the spawn error if not a single worker thread could be started.
    /// A pool that starts some but not all of its workers is returned with
    /// fewer threads.
    pub fn build(self) -> io::Result<WorkerPool> {
        let wanted = self
            .threads
            .or_else(|| thread::available_parallelism().ok().map(usize::from))
            .unwrap_or(1);
        let (sender, receiver) = unbounded::<Job>();

        let mut started = 0;
        let mut last_err = None;
        for index in 0..wanted {
            let receiver = receiver.clone();
            let name = format!("{}-{index}", self.name_prefix);
            let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
                tracing::trace!(worker = %name, "worker starting");
                for job in receiver {
                    job.run();
                }
                tracing::trace!(worker = %name, "worker exiting");
            });
            match spawned {
                Ok(_detached) => started += 1,
                Err(err) => {
                    tracing::warn!(%err, index, "failed to start pool worker");
                    last_err = Some(err);
                }
            }
        }

        if started == 0 {
            return Err(last_err.unwrap_or_else(|| io::Error::other("no workers requested")));
        }
        tracing::debug!(pool = %self.name_prefix, threads = started, "worker pool started");

        Ok(WorkerPool {
            sender,
            threads: started,
            name_prefix: self.name_prefix,
        })
    }
}

impl Scheduler for WorkerPool {
    fn schedule_continuation(&self, continuation: Continuation) {
        self.submit(Job::Continuation(continuation));
    }

    fn schedule_callback(&self, callback: fn(CallbackState), state: CallbackState) {
        self.submit(Job::Callback(callback, state));
    }

    fn name(&self) -> &str {
        &self.name_prefix
    }
}

/// The process-wide [`Inline`] scheduler.
pub fn inline() -> SchedulerRef {
    static INLINE: OnceLock<SchedulerRef> = OnceLock::new();
    INLINE.get_or_init(|| Arc::new(Inline)).clone()
}

/// The process-wide [`DedicatedThread`] scheduler.
pub fn dedicated_thread() -> SchedulerRef {
    static DEDICATED: OnceLock<SchedulerRef> = OnceLock::new();
    DEDICATED
        .get_or_init(|| Arc::new(DedicatedThread::default()))
        .clone()
}

/// The process-wide [`WorkerPool`], started on first use.
///
/// Falls back to [`dedicated_thread()`] if no worker could be started.
pub fn worker_pool() -> SchedulerRef {
    static POOL: OnceLock<SchedulerRef> = OnceLock::new();
    POOL.get_or_init(|| match WorkerPool::builder().build() {
        Ok(pool) => Arc::new(pool),
        Err(err) => {
            tracing::error!(%err, "could not start the shared worker pool");
            dedicated_thread()
        }
    })
    .clone()
}

/// Returns `true` if both handles point at the same scheduler instance.
pub fn same_scheduler(a: &SchedulerRef, b: &SchedulerRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Suspends the current task and wakes it from inside `scheduler`.
///
/// Awaiting the result always suspends once, even on the inline scheduler.
///
/// ```
/// use futures::executor::block_on;
/// use promise_future::scheduler;
///
/// block_on(async {
///     scheduler::switch_to(scheduler::worker_pool()).await;
/// });
/// ```
pub fn switch_to(scheduler: SchedulerRef) -> SwitchTo {
    SwitchTo {
        scheduler,
        signal: None,
    }
}

#[must_use = "futures do nothing unless you `.await` or poll them"]
#[derive(Debug)]
pub struct SwitchTo {
    scheduler: SchedulerRef,
    signal: Option<Arc<Signal>>,
}

impl Future for SwitchTo {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match &this.signal {
            Some(signal) => {
                signal.register(cx.waker());
                if signal.is_fired() {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
            None => {
                let signal = Arc::new(Signal::default());
                signal.register(cx.waker());
                this.signal = Some(signal.clone());
                this.scheduler
                    .schedule_continuation(Box::new(move || signal.fire()));
                Poll::Pending
            }
        }
    }
}
