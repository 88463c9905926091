//! Single-publisher sequence barrier.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use super::awaiters::{Awaiter, AwaiterStack};
use super::{SequenceOrder, WrappingOrder};

/// A monotonic cursor advanced by exactly one task, awaitable by any number
/// of others.
///
/// The consumer of a ring publishes the highest sequence it has fully
/// retired; producers (via the sequencer's claim path) park here until the
/// slot they want to overwrite has been freed.
pub struct SequenceBarrier<O: SequenceOrder = WrappingOrder> {
    last_published: AtomicU64,
    awaiters: AwaiterStack,
    _order: PhantomData<O>,
}

impl<O: SequenceOrder> Default for SequenceBarrier<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: SequenceOrder> SequenceBarrier<O> {
    /// A barrier starting at the order's initial sequence.
    pub fn new() -> SequenceBarrier<O> {
        Self::with_initial(O::INITIAL)
    }

    pub fn with_initial(initial: u64) -> SequenceBarrier<O> {
        SequenceBarrier {
            last_published: AtomicU64::new(initial),
            awaiters: AwaiterStack::new(),
            _order: PhantomData,
        }
    }

    /// The sequence most recently published.
    pub fn last_published(&self) -> u64 {
        self.last_published.load(Ordering::Acquire)
    }

    /// Advance the cursor to `seq` and wake every waiter whose target it
    /// satisfies. Only the owning (single) publisher may call this.
    pub fn publish(&self, seq: u64) {
        self.last_published.store(seq, Ordering::SeqCst);
        self.resume_ready_awaiters();
    }

    /// Wait until `target` (and every sequence before it) has been
    /// published. Resolves to the published cursor observed on wakeup.
    pub fn wait_until_published(&self, target: u64) -> BarrierWait<'_, O> {
        BarrierWait {
            barrier: self,
            target,
            node: None,
        }
    }

    fn resume_ready_awaiters(&self) {
        if self.awaiters.is_empty() {
            return;
        }
        let mut awaiters = self.awaiters.detach_all();
        let mut to_resume = Vec::new();
        let mut last_known = self.last_published.load(Ordering::SeqCst);
        while !awaiters.is_empty() {
            let mut requeue = Vec::new();
            let mut min_diff = i64::MAX;
            for aw in awaiters.drain(..) {
                let diff = O::difference(aw.target, last_known);
                if diff > 0 {
                    min_diff = min_diff.min(diff);
                    aw.last_known.store(last_known, Ordering::Relaxed);
                    requeue.push(aw);
                } else {
                    to_resume.push(aw);
                }
            }
            if requeue.is_empty() {
                break;
            }
            let earliest_target = last_known.wrapping_add(min_diff as u64);
            for aw in requeue.drain(..) {
                self.awaiters.push(aw);
            }
            // The publisher may have advanced between the detach and the
            // requeue; re-read, and if a requeued waiter is now satisfied,
            // take the list back and go around again.
            last_known = self.last_published.load(Ordering::SeqCst);
            if O::precedes(last_known, earliest_target) {
                break;
            }
            awaiters = self.awaiters.detach_all();
        }
        for aw in to_resume {
            aw.resume(last_known);
        }
    }

    /// Post-enqueue handshake: the publisher may have advanced while a new
    /// waiter was being pushed, in which case no publish call will come to
    /// wake it. Whichever of the waiter and the publisher detaches the list
    /// performs the wakeups.
    fn add_awaiter(&self, awaiter: Arc<Awaiter>) {
        let mut target = awaiter.target;
        let mut last_known = awaiter.last_known.load(Ordering::Relaxed);
        let mut to_enqueue = vec![awaiter];
        let mut to_resume = Vec::new();
        while !to_enqueue.is_empty() {
            for aw in to_enqueue.drain(..) {
                self.awaiters.push(aw);
            }
            last_known = self.last_published.load(Ordering::SeqCst);
            if O::precedes(last_known, target) {
                break;
            }
            let detached = self.awaiters.detach_all();
            if detached.is_empty() {
                // A racing publisher took the list and owns the wakeups.
                break;
            }
            let mut min_diff = i64::MAX;
            for aw in detached {
                let diff = O::difference(aw.target, last_known);
                if diff > 0 {
                    min_diff = min_diff.min(diff);
                    aw.last_known.store(last_known, Ordering::Relaxed);
                    to_enqueue.push(aw);
                } else {
                    to_resume.push(aw);
                }
            }
            if !to_enqueue.is_empty() {
                target = last_known.wrapping_add(min_diff as u64);
            }
        }
        for aw in to_resume {
            aw.resume(last_known);
        }
    }
}

/// Future returned by [`SequenceBarrier::wait_until_published`].
pub struct BarrierWait<'a, O: SequenceOrder = WrappingOrder> {
    barrier: &'a SequenceBarrier<O>,
    target: u64,
    node: Option<Arc<Awaiter>>,
}

impl<O: SequenceOrder> Future for BarrierWait<'_, O> {
    type Output = u64;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u64> {
        let this = self.get_mut();
        if let Some(node) = &this.node {
            node.register(cx.waker());
            if node.is_ready() {
                return Poll::Ready(node.last_known.load(Ordering::Acquire));
            }
            return Poll::Pending;
        }
        let last_known = this.barrier.last_published();
        if !O::precedes(last_known, this.target) {
            return Poll::Ready(last_known);
        }
        let node = Arc::new(Awaiter::new(this.target, last_known));
        node.register(cx.waker());
        this.node = Some(node.clone());
        this.barrier.add_awaiter(node);
        let node = this.node.as_ref().expect("node just installed");
        if node.is_ready() {
            return Poll::Ready(node.last_known.load(Ordering::Acquire));
        }
        Poll::Pending
    }
}
