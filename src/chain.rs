//! The persistent list of continuations parked on a pending promise.
//!
//! Nodes are only ever prepended: a registration allocates a new head whose
//! `next` is the head it observed, and publishes it with a CAS. A node is
//! never modified once published, and nodes are only freed by whoever
//! detaches the whole list, which happens when the promise completes (or is
//! dropped). Because the terminal state is permanent, a stale head can never
//! be reinstalled, so a CAS against a freed address cannot succeed.
use crate::scheduler::{same_scheduler, Continuation, SchedulerRef};
use std::ptr;

/// Chains at most this long are unwound recursively; longer ones are first
/// copied into a vector.
const MAX_RECURSION_DEPTH: usize = 12;

pub(crate) struct Entry {
    continuation: Continuation,
    scheduler: Option<SchedulerRef>,
}

impl Entry {
    pub(crate) fn new(continuation: Continuation, scheduler: Option<SchedulerRef>) -> Self {
        Self {
            continuation,
            scheduler,
        }
    }

    /// Runs the continuation through its own scheduler, else through `via`,
    /// else inline.
    pub(crate) fn dispatch(self, via: Option<&SchedulerRef>) {
        match self.scheduler.as_ref().or(via) {
            Some(scheduler) => scheduler.schedule_continuation(self.continuation),
            None => (self.continuation)(),
        }
    }
}

pub(crate) struct Node {
    entry: Entry,
    next: *mut Node,
}

impl Node {
    /// Leaks a fresh, unlinked node. Ownership returns through
    /// [`Node::reclaim`] or by publishing it into a chain.
    pub(crate) fn alloc(entry: Entry) -> *mut Node {
        Box::into_raw(Box::new(Node {
            entry,
            next: ptr::null_mut(),
        }))
    }

    /// # Safety
    ///
    /// `node` must come from [`Node::alloc`] and must not be published yet.
    pub(crate) unsafe fn link(node: *mut Node, next: *mut Node) {
        // Safety: unpublished nodes are exclusively owned by the caller.
        unsafe { (*node).next = next };
    }

    /// # Safety
    ///
    /// `node` must come from [`Node::alloc`] and must not be published.
    pub(crate) unsafe fn reclaim(node: *mut Node) -> Entry {
        // Safety: ensured by the caller.
        unsafe { Box::from_raw(node) }.entry
    }
}

/// A chain detached from its promise, newest node first.
pub(crate) struct Chain {
    head: *mut Node,
}

impl Chain {
    /// # Safety
    ///
    /// `head` must be null or the head of a published chain that the caller
    /// has just detached, so that no one else will touch its nodes again.
    pub(crate) unsafe fn from_raw(head: *mut Node) -> Self {
        Self { head }
    }

    pub(crate) fn len(&self) -> usize {
        let mut len = 0;
        let mut cur = self.head;
        while !cur.is_null() {
            len += 1;
            // Safety: we own every node of the chain.
            cur = unsafe { (*cur).next };
        }
        len
    }

    /// Runs every continuation, oldest registration first.
    ///
    /// `via` applies to entries registered without their own scheduler. When
    /// every entry ends up on the same scheduler, the batch is handed over in
    /// one dispatch instead of one per entry.
    pub(crate) fn invoke(mut self, via: Option<&SchedulerRef>) {
        let head = std::mem::replace(&mut self.head, ptr::null_mut());
        if head.is_null() {
            return;
        }

        // Safety: `head` was detached from the promise and is owned by us.
        unsafe {
            if let Some(scheduler) = uniform_scheduler(head, via) {
                let entries = materialize(head);
                scheduler.schedule_continuation(Box::new(move || {
                    for entry in entries {
                        (entry.continuation)();
                    }
                }));
                return;
            }

            let mut depth = 0;
            let mut cur = head;
            while !cur.is_null() && depth < MAX_RECURSION_DEPTH {
                cur = (*cur).next;
                depth += 1;
            }

            if cur.is_null() {
                invoke_recursive(head, via);
            } else {
                for entry in materialize(head) {
                    entry.dispatch(via);
                }
            }
        }
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        let mut cur = std::mem::replace(&mut self.head, ptr::null_mut());
        while !cur.is_null() {
            // Safety: we own every node of the chain.
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next;
        }
    }
}

/// Returns the shared scheduler if the chain holds at least two entries and
/// all of them would be dispatched to the same scheduler.
unsafe fn uniform_scheduler(head: *mut Node, via: Option<&SchedulerRef>) -> Option<SchedulerRef> {
    let mut first: Option<&SchedulerRef> = None;
    let mut count = 0;
    let mut cur = head;
    while !cur.is_null() {
        // Safety: the caller owns the chain.
        let node = unsafe { &*cur };
        let scheduler = node.entry.scheduler.as_ref().or(via)?;
        match first {
            None => first = Some(scheduler),
            Some(first) if same_scheduler(first, scheduler) => {}
            Some(_) => return None,
        }
        count += 1;
        cur = node.next;
    }
    if count > 1 {
        first.cloned()
    } else {
        None
    }
}

unsafe fn invoke_recursive(node: *mut Node, via: Option<&SchedulerRef>) {
    if node.is_null() {
        return;
    }
    // Safety: the caller owns the chain; each node is reclaimed exactly once.
    let node = unsafe { Box::from_raw(node) };
    unsafe { invoke_recursive(node.next, via) };
    node.entry.dispatch(via);
}

/// Frees the chain into a vector ordered oldest first.
unsafe fn materialize(head: *mut Node) -> Vec<Entry> {
    let mut entries = Vec::new();
    let mut cur = head;
    while !cur.is_null() {
        // Safety: the caller owns the chain; each node is reclaimed exactly once.
        let node = unsafe { Box::from_raw(cur) };
        cur = node.next;
        entries.push(node.entry);
    }
    entries.reverse();
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{self, Scheduler};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn build(len: usize, log: &Arc<Mutex<Vec<usize>>>, scheduler: Option<SchedulerRef>) -> Chain {
        let mut head = ptr::null_mut();
        for i in 0..len {
            let log = log.clone();
            let node = Node::alloc(Entry::new(
                Box::new(move || log.lock().push(i)),
                scheduler.clone(),
            ));
            unsafe { Node::link(node, head) };
            head = node;
        }
        unsafe { Chain::from_raw(head) }
    }

    #[test]
    fn short_chain_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = build(5, &log, None);
        assert_eq!(chain.len(), 5);
        chain.invoke(None);
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn long_chain_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = build(10_000, &log, None);
        chain.invoke(None);
        assert_eq!(*log.lock(), (0..10_000).collect::<Vec<_>>());
    }

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
    fn uniform_scheduler_gets_a_single_dispatch() {
        let counting = Arc::new(Counting::default());
        let as_ref: SchedulerRef = counting.clone();
        let log = Arc::new(Mutex::new(Vec::new()));
        build(20, &log, Some(as_ref)).invoke(None);
        assert_eq!(counting.dispatches.load(Ordering::SeqCst), 1);
        assert_eq!(*log.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn completion_scheduler_applies_to_bare_entries() {
        let counting = Arc::new(Counting::default());
        let as_ref: SchedulerRef = counting.clone();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = log.clone();
        let second = log.clone();
        let older = Node::alloc(Entry::new(Box::new(move || first.lock().push(0)), None));
        let newer = Node::alloc(Entry::new(
            Box::new(move || second.lock().push(1)),
            Some(scheduler::inline()),
        ));
        unsafe { Node::link(newer, older) };
        let chain = unsafe { Chain::from_raw(newer) };

        chain.invoke(Some(&as_ref));
        assert_eq!(counting.dispatches.load(Ordering::SeqCst), 1);
        assert_eq!(*log.lock(), vec![0, 1]);
    }

    #[test]
    fn dropping_a_chain_does_not_run_it() {
        let log = Arc::new(Mutex::new(Vec::new()));
        drop(build(3, &log, None));
        assert!(log.lock().is_empty());
    }
}
