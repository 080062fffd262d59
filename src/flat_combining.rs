//! Flat combining of operations issued by the tasks of one core.
//!
//! Each task hands [combine][FlatCombiner::combine] a closure that records its operation in the
//! current batch (an accumulator implementing [Combinable]). The closure reports how far the
//! operation got:
//! - [FcStatus::Satisfied]: answered locally, nothing else to do,
//! - [FcStatus::Matched]: cancelled out against another pending operation of the same batch,
//! - [FcStatus::Blocked]: recorded, the batch has to be synchronized with the rest of the job.
//!
//! Blocked tasks sleep while a single task, the *sender*, synchronizes the batch. A new batch
//! starts collecting operations as soon as the old one is handed to its sender, and the first
//! task waiting on the new batch is elected as its sender once the previous flush is done.
//!
//! ```
//! use lamellar_aggregator::{async_trait, Combinable, FcStatus, FlatCombiner};
//!
//! struct Sum { pending: u64 }
//!
//! #[async_trait(?Send)]
//! impl Combinable for Sum {
//!     async fn sync(&mut self) { /* send self.pending somewhere */ }
//!     fn clear(&mut self) { self.pending = 0 }
//!     fn is_full(&self) -> bool { false }
//!     fn clone_fresh(&self) -> Self { Sum { pending: 0 } }
//! }
//!
//! # async fn add(combiner: &FlatCombiner<Sum>) {
//! combiner.combine(|sum| { sum.pending += 1; FcStatus::Blocked }).await;
//! # }
//! ```
use crate::stats::CombinerStats;
use crate::wait_queue::WakeReason;

use async_trait::async_trait;
use std::cell::{Cell, RefCell};

mod flusher;
use flusher::{FlusherArena, FlusherId, Sender};

/// Outcome of recording one operation in a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcStatus {
    Satisfied,
    Matched,
    Blocked,
}

/// An accumulator of combined operations.
#[async_trait(?Send)]
pub trait Combinable {
    /// Apply every blocked operation of the batch to the distributed state.
    async fn sync(&mut self);
    /// Forget every operation, the accumulator is about to be reused.
    fn clear(&mut self);
    /// True when the batch should not grow any further
    fn is_full(&self) -> bool;
    /// A new empty accumulator targeting the same distributed object
    fn clone_fresh(&self) -> Self
    where
        Self: Sized;
    /// True when a flush has nothing to synchronize, e.g. every operation was matched
    fn is_empty(&self) -> bool {
        false
    }
}

/// Combines the operations of the tasks of one core into batches
#[derive(Debug)]
pub struct FlatCombiner<T: Combinable> {
    arena: FlusherArena<T>,
    current: Cell<FlusherId>,
    inflight: Cell<usize>,
    stats: RefCell<CombinerStats>,
}

impl<T: Combinable> FlatCombiner<T> {
    pub fn new(initial: T) -> FlatCombiner<T> {
        let arena = FlusherArena::new();
        let current = arena.alloc(move || initial);
        FlatCombiner {
            arena,
            current: Cell::new(current),
            inflight: Cell::new(0),
            stats: RefCell::new(CombinerStats::default()),
        }
    }

    /// Record an operation in the current batch and wait until it has taken effect.
    ///
    /// `op` runs synchronously against the current accumulator. If it reports
    /// [Blocked][FcStatus::Blocked] this returns once a flush of that batch has completed.
    pub async fn combine<F>(&self, op: F) -> FcStatus
    where
        F: FnOnce(&mut T) -> FcStatus,
    {
        let id = self.current.get();
        let flusher = self.arena.get(id);
        let status = op(&mut flusher.acc.borrow_mut());
        {
            let mut stats = self.stats.borrow_mut();
            stats.operations += 1;
            match status {
                FcStatus::Satisfied => stats.satisfied += 1,
                FcStatus::Matched => stats.matched += 1,
                FcStatus::Blocked => stats.blocked += 1,
            }
        }
        if status != FcStatus::Blocked {
            return status;
        }
        flusher.ops.set(flusher.ops.get() + 1);

        let full = flusher.acc.borrow().is_full();
        if (full && !flusher.has_sender()) || self.inflight.get() == 0 {
            flusher.set_sender(Sender::Caller);
            self.inflight.set(self.inflight.get() + 1);
            self.retire_current();
            self.flush(id).await;
        } else {
            let wait = flusher.waiters.wait();
            drop(flusher);
            match wait.await {
                WakeReason::Released => {}
                WakeReason::Elected => {
                    if self.current.get() != id || !self.arena.is_live(id) {
                        fatal!("elected sender of flusher {:?} which is no longer current", id);
                    }
                    self.retire_current();
                    self.flush(id).await;
                }
            }
        }
        FcStatus::Blocked
    }

    fn retire_current(&self) {
        let old = self.arena.get(self.current.get());
        let new = self.arena.alloc(|| old.acc.borrow().clone_fresh());
        self.current.set(new);
    }

    async fn flush(&self, id: FlusherId) {
        let flusher = self.arena.get(id);
        let senders = flusher.senders.get() + 1;
        flusher.senders.set(senders);
        {
            let mut stats = self.stats.borrow_mut();
            stats.max_concurrent_senders = stats.max_concurrent_senders.max(senders as u64);
        }
        tracing::trace!(
            "flushing batch of {} operations, sender {:?}, {} in flight",
            flusher.ops.get(),
            flusher.sender(),
            self.inflight.get()
        );

        let skip = flusher.acc.borrow().is_empty();
        if skip {
            self.stats.borrow_mut().skipped_syncs += 1;
        } else {
            self.stats.borrow_mut().syncs += 1;
            // a retired flusher is only reachable by its sender until it is released
            let mut acc = flusher.acc.borrow_mut();
            acc.sync().await;
        }
        flusher.senders.set(flusher.senders.get() - 1);
        {
            let mut stats = self.stats.borrow_mut();
            stats.flushes += 1;
            stats.combining_depth.record(flusher.ops.get() as u64);
        }
        flusher.waiters.broadcast();

        let current = self.arena.get(self.current.get());
        if !current.waiters.is_empty() && !current.has_sender() {
            current.set_sender(Sender::Waiter);
            current.waiters.signal();
            self.stats.borrow_mut().elected_senders += 1;
        } else {
            self.inflight.set(self.inflight.get() - 1);
        }
        self.arena.release(id, |acc| acc.clear());
    }

    /// Number of batches currently being flushed or waiting on an elected sender
    pub fn inflight(&self) -> usize {
        self.inflight.get()
    }

    /// Look at the accumulator that is currently collecting operations
    pub fn with_current<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let flusher = self.arena.get(self.current.get());
        let acc = flusher.acc.borrow();
        f(&acc)
    }

    /// Blocked operations waiting in the current batch
    pub fn pending(&self) -> usize {
        self.arena.get(self.current.get()).ops.get()
    }

    pub fn stats(&self) -> CombinerStats {
        self.stats.borrow().clone()
    }
}
