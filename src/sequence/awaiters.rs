//! Lock-free LIFO of parked waiters, shared by the barrier and the
//! multi-producer sequencer.
//!
//! The stack is Treiber-style: push is a CAS prepend, and a publisher takes
//! the whole list with one atomic exchange. Nodes are reference counted; the
//! stack holds one reference per enqueued node (transferred through the raw
//! pointer), so a waiter that is dropped while still enqueued stays valid
//! until the next detach reclaims it.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use futures::task::AtomicWaker;

/// One parked waiter.
///
/// `resume` stores the latest published sequence, marks the node ready and
/// wakes; the poll side registers its waker first and then checks `ready`,
/// so whichever of wake and register happens second completes the handoff
/// and the resumption is performed exactly once.
pub(crate) struct Awaiter {
    pub(crate) target: u64,
    pub(crate) last_known: AtomicU64,
    next: AtomicPtr<Awaiter>,
    waker: AtomicWaker,
    ready: AtomicBool,
}

impl Awaiter {
    pub(crate) fn new(target: u64, last_known: u64) -> Awaiter {
        Awaiter {
            target,
            last_known: AtomicU64::new(last_known),
            next: AtomicPtr::new(ptr::null_mut()),
            waker: AtomicWaker::new(),
            ready: AtomicBool::new(false),
        }
    }

    pub(crate) fn resume(&self, last_known: u64) {
        self.last_known.store(last_known, Ordering::Release);
        self.ready.store(true, Ordering::Release);
        self.waker.wake();
    }

    pub(crate) fn register(&self, waker: &std::task::Waker) {
        self.waker.register(waker);
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

pub(crate) struct AwaiterStack {
    head: AtomicPtr<Awaiter>,
}

impl AwaiterStack {
    pub(crate) fn new() -> AwaiterStack {
        AwaiterStack {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Cheap emptiness probe for the publish fast path.
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::SeqCst).is_null()
    }

    /// CAS-prepend one node, transferring one reference into the stack.
    pub(crate) fn push(&self, node: Arc<Awaiter>) {
        let raw = Arc::into_raw(node) as *mut Awaiter;
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // The node is not reachable through `head` until the CAS lands,
            // so this store cannot race with a detach.
            unsafe { (*raw).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, raw, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(h) => head = h,
            }
        }
    }

    /// Take the whole list. At most one caller wins any given set of nodes;
    /// losing racers get an empty vec and leave the wakeups to the winner.
    pub(crate) fn detach_all(&self) -> Vec<Arc<Awaiter>> {
        let mut raw = self.head.swap(ptr::null_mut(), Ordering::SeqCst);
        let mut out = Vec::new();
        while !raw.is_null() {
            let next = unsafe { (*raw).next.load(Ordering::Relaxed) };
            out.push(unsafe { Arc::from_raw(raw) });
            raw = next;
        }
        out
    }
}

impl Drop for AwaiterStack {
    fn drop(&mut self) {
        // Reclaim the references held by any nodes still enqueued.
        self.detach_all();
    }
}
