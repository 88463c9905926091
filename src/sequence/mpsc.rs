//! Multi-producer single-consumer sequencer over a power-of-two ring.
//!
//! Producers claim sequence numbers with one `fetch_add` and publish them in
//! any order; a consumer observes the longest contiguous published prefix.
//! Space accounting goes through the consumer's [`SequenceBarrier`]: claiming
//! sequence `s` waits until `s - buffer_size` has been retired.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use super::awaiters::{Awaiter, AwaiterStack};
use super::barrier::{BarrierWait, SequenceBarrier};
use super::{SequenceOrder, SequenceRange, WrappingOrder};

pub struct MpscSequencer<O: SequenceOrder = WrappingOrder> {
    barrier: Arc<SequenceBarrier<O>>,
    mask: u64,
    published: Box<[AtomicU64]>,
    next_to_claim: AtomicU64,
    awaiters: AwaiterStack,
    _order: PhantomData<O>,
}

impl<O: SequenceOrder> MpscSequencer<O> {
    /// A sequencer starting at the order's initial sequence.
    ///
    /// `buffer_size` must be a power of two no larger than `i64::MAX`.
    pub fn new(barrier: Arc<SequenceBarrier<O>>, buffer_size: usize) -> MpscSequencer<O> {
        Self::with_initial(barrier, buffer_size, O::INITIAL)
    }

    pub fn with_initial(
        barrier: Arc<SequenceBarrier<O>>,
        buffer_size: usize,
        initial: u64,
    ) -> MpscSequencer<O> {
        assert!(
            buffer_size > 0 && buffer_size.is_power_of_two(),
            "buffer size must be a positive power of two"
        );
        assert!(
            buffer_size as u128 <= i64::MAX as u128,
            "buffer size must fit the signed sequence difference"
        );
        let mask = (buffer_size - 1) as u64;
        let published: Box<[AtomicU64]> = (0..buffer_size).map(|_| AtomicU64::new(0)).collect();
        // Seed every slot with the sequence that would have occupied it one
        // lap ago, so nothing at or after `initial + 1` reads as published.
        let mut seq = initial.wrapping_sub(mask);
        loop {
            published[(seq & mask) as usize].store(seq, Ordering::Relaxed);
            if seq == initial {
                break;
            }
            seq = seq.wrapping_add(1);
        }
        MpscSequencer {
            barrier,
            mask,
            published,
            next_to_claim: AtomicU64::new(initial.wrapping_add(1)),
            awaiters: AwaiterStack::new(),
            _order: PhantomData,
        }
    }

    /// The ring capacity; always a power of two.
    pub fn buffer_size(&self) -> usize {
        (self.mask + 1) as usize
    }

    /// Approximate under concurrent producers: another task may take the
    /// last slot immediately after this returns true.
    pub fn any_available(&self) -> bool {
        O::precedes(
            self.next_to_claim.load(Ordering::Relaxed),
            self.barrier
                .last_published()
                .wrapping_add(self.buffer_size() as u64),
        )
    }

    /// Claim one slot, waiting for ring space if needed.
    ///
    /// The claim is lazy: the sequence number is taken on first poll, so an
    /// awaitable that is dropped without being awaited orphans nothing.
    pub fn claim_one(&self) -> ClaimOne<'_, O> {
        ClaimOne {
            sequencer: self,
            claimed: None,
            wait: None,
        }
    }

    /// Claim up to `count` contiguous slots (at least one, at most the ring
    /// capacity). The caller must publish every sequence in the returned
    /// range.
    pub fn claim_up_to(&self, count: usize) -> Claim<'_, O> {
        assert!(count > 0, "cannot claim an empty range");
        Claim {
            sequencer: self,
            count: count.min(self.buffer_size()),
            claimed: None,
            wait: None,
        }
    }

    /// Make `seq` visible to the consumer and wake anyone it satisfies.
    pub fn publish(&self, seq: u64) {
        self.published[(seq & self.mask) as usize].store(seq, Ordering::SeqCst);
        self.resume_ready_awaiters();
    }

    /// Publish a whole claimed range with a single commit point: all but the
    /// front element are stored relaxed, then the front is stored `SeqCst`.
    /// No consumer reads past the front before seeing it published.
    pub fn publish_range(&self, range: &SequenceRange) {
        if range.is_empty() {
            return;
        }
        for seq in range.iter().skip(1) {
            self.published[(seq & self.mask) as usize].store(seq, Ordering::Relaxed);
        }
        let front = range.front();
        self.published[(front & self.mask) as usize].store(front, Ordering::SeqCst);
        self.resume_ready_awaiters();
    }

    /// The end of the contiguous published prefix after `last_known`.
    /// Sequences published out of order past a gap are not reported until
    /// the gap fills.
    pub fn last_published_after(&self, mut last_known: u64) -> u64 {
        let mask = self.mask;
        let mut seq = last_known.wrapping_add(1);
        while self.published[(seq & mask) as usize].load(Ordering::Acquire) == seq {
            last_known = seq;
            seq = seq.wrapping_add(1);
        }
        last_known
    }

    /// Wait until `target` and everything before it is published. Resolves
    /// to the contiguous published prefix observed on wakeup.
    pub fn wait_until_published(&self, target: u64, last_known: u64) -> WaitPublished<'_, O> {
        WaitPublished {
            sequencer: self,
            target,
            last_known,
            node: None,
        }
    }

    fn resume_ready_awaiters(&self) {
        if self.awaiters.is_empty() {
            return;
        }
        let mut awaiters = self.awaiters.detach_all();
        if awaiters.is_empty() {
            // Lost the race; the winner resumes them.
            return;
        }
        let mut to_resume = Vec::new();
        let mut last_known = awaiters[0].last_known.load(Ordering::Relaxed);
        loop {
            last_known = self.last_published_after(last_known);
            let mut requeue = Vec::new();
            let mut min_diff = i64::MAX;
            for aw in awaiters.drain(..) {
                let diff = O::difference(aw.target, last_known);
                aw.last_known.store(last_known, Ordering::Relaxed);
                if diff > 0 {
                    min_diff = min_diff.min(diff);
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
            // A publish may have landed between the detach and the requeue.
            // Re-scan the ring; if it reaches the earliest requeued target,
            // take the list back and go around again.
            let mask = self.mask;
            let mut seq = last_known.wrapping_add(1);
            let mut reacquired = false;
            while self.published[(seq & mask) as usize].load(Ordering::SeqCst) == seq {
                last_known = seq;
                if seq == earliest_target {
                    awaiters = self.awaiters.detach_all();
                    reacquired = !awaiters.is_empty();
                    break;
                }
                seq = seq.wrapping_add(1);
            }
            if !reacquired {
                break;
            }
        }
        for aw in to_resume {
            aw.resume(last_known);
        }
    }

    /// Enqueue a new waiter, then re-scan the ring to close the race with a
    /// publish that completed while the push was in flight (that publisher
    /// may have seen an empty list and resumed nobody).
    fn add_awaiter(&self, awaiter: Arc<Awaiter>) {
        let mask = self.mask;
        let mut target = awaiter.target;
        let mut last_known = awaiter.last_known.load(Ordering::Relaxed);
        let mut to_enqueue = vec![awaiter];
        let mut to_resume = Vec::new();
        while !to_enqueue.is_empty() {
            for aw in to_enqueue.drain(..) {
                self.awaiters.push(aw);
            }
            let mut seq = last_known.wrapping_add(1);
            while self.published[(seq & mask) as usize].load(Ordering::SeqCst) == seq {
                last_known = seq;
                seq = seq.wrapping_add(1);
            }
            if O::precedes(last_known, target) {
                break;
            }
            // Something we just enqueued is satisfied; whoever holds the
            // list must wake it, and that may now be us.
            let detached = self.awaiters.detach_all();
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

/// Future returned by [`MpscSequencer::claim_one`].
pub struct ClaimOne<'a, O: SequenceOrder = WrappingOrder> {
    sequencer: &'a MpscSequencer<O>,
    claimed: Option<u64>,
    wait: Option<BarrierWait<'a, O>>,
}

impl<O: SequenceOrder> Future for ClaimOne<'_, O> {
    type Output = u64;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<u64> {
        let this = self.get_mut();
        let seq = *this.claimed.get_or_insert_with(|| {
            this.sequencer.next_to_claim.fetch_add(1, Ordering::Relaxed)
        });
        let wait = this.wait.get_or_insert_with(|| {
            let freed = seq.wrapping_sub(this.sequencer.buffer_size() as u64);
            this.sequencer.barrier.wait_until_published(freed)
        });
        match Pin::new(wait).poll(cx) {
            Poll::Ready(_) => Poll::Ready(seq),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future returned by [`MpscSequencer::claim_up_to`].
pub struct Claim<'a, O: SequenceOrder = WrappingOrder> {
    sequencer: &'a MpscSequencer<O>,
    count: usize,
    claimed: Option<SequenceRange>,
    wait: Option<BarrierWait<'a, O>>,
}

impl<O: SequenceOrder> Future for Claim<'_, O> {
    type Output = SequenceRange;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<SequenceRange> {
        let this = self.get_mut();
        let range = *this.claimed.get_or_insert_with(|| {
            let first = this
                .sequencer
                .next_to_claim
                .fetch_add(this.count as u64, Ordering::Relaxed);
            SequenceRange::new(first, first.wrapping_add(this.count as u64))
        });
        let wait = this.wait.get_or_insert_with(|| {
            let freed = range.back().wrapping_sub(this.sequencer.buffer_size() as u64);
            this.sequencer.barrier.wait_until_published(freed)
        });
        match Pin::new(wait).poll(cx) {
            Poll::Ready(_) => Poll::Ready(range),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future returned by [`MpscSequencer::wait_until_published`].
pub struct WaitPublished<'a, O: SequenceOrder = WrappingOrder> {
    sequencer: &'a MpscSequencer<O>,
    target: u64,
    last_known: u64,
    node: Option<Arc<Awaiter>>,
}

impl<O: SequenceOrder> Future for WaitPublished<'_, O> {
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
        if !O::precedes(this.last_known, this.target) {
            return Poll::Ready(this.last_known);
        }
        let node = Arc::new(Awaiter::new(this.target, this.last_known));
        node.register(cx.waker());
        this.node = Some(node.clone());
        this.sequencer.add_awaiter(node);
        let node = this.node.as_ref().expect("node just installed");
        if node.is_ready() {
            return Poll::Ready(node.last_known.load(Ordering::Acquire));
        }
        Poll::Pending
    }
}
