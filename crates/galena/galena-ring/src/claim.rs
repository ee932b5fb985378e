//! Claim strategies: producer-side reservation of ring slots.
//!
//! A claim hands a producer the sequence of the last slot in a contiguous
//! range it may fill, after making sure the range does not overrun the
//! slowest attached reader. Publication then moves the shared cursor, at
//! which point the range becomes visible to every reader.
//!
//! The single-producer strategy is trivial: with only one claimant the
//! cursor itself tracks the claim frontier. The multi-producer strategy
//! splits claiming from publication with an internal claimed-cursor and a
//! per-slot availability buffer, so that ranges published out of claim
//! order stay invisible until the gap before them is filled.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::error::NoCapacity;
use crate::sequence::{Sequence, SequenceGroup};
use crate::wait::WaitStrategy;

/// Whether a ring accepts claims from one thread or from many.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerKind {
    Single,
    Multi,
}

/// Reservation and publication of contiguous slot ranges.
pub(crate) trait ClaimStrategy: Send + Sync {
    /// Claims `n` slots, blocking through the wait strategy until the
    /// slowest reader has vacated enough space. Returns the sequence of
    /// the last claimed slot. Re-evaluates the reader registry on every
    /// wait iteration, so a reader dropped mid-wait unblocks the claim.
    fn next(&self, readers: &SequenceGroup, n: usize) -> i64;

    /// One-shot variant of [`next`](Self::next): evaluates the capacity
    /// predicate without waiting.
    fn try_next(&self, readers: &SequenceGroup, n: usize) -> Result<i64, NoCapacity>;

    /// Free slots left before the producer would lap the slowest reader.
    fn remaining_capacity(&self, readers: &SequenceGroup) -> usize;

    /// Makes the claimed range `[lo, hi]` visible to readers.
    fn publish(&self, lo: i64, hi: i64);
}

pub(crate) fn make_claim_strategy(
    kind: ProducerKind,
    cursor: Arc<Sequence>,
    wait: Arc<dyn WaitStrategy>,
    size: usize,
) -> Box<dyn ClaimStrategy> {
    match kind {
        ProducerKind::Single => Box::new(SingleProducerClaim::new(cursor, wait, size)),
        ProducerKind::Multi => Box::new(MultiProducerClaim::new(cursor, wait, size)),
    }
}

/// Fast path for exactly one claiming thread.
///
/// Claiming performs no stores at all: the claimed range is implied by the
/// cursor, which only moves at publication.
pub(crate) struct SingleProducerClaim {
    cursor: Arc<Sequence>,
    wait: Arc<dyn WaitStrategy>,
    size: i64,
}

impl SingleProducerClaim {
    pub(crate) fn new(cursor: Arc<Sequence>, wait: Arc<dyn WaitStrategy>, size: usize) -> Self {
        Self {
            cursor,
            wait,
            size: size as i64,
        }
    }
}

impl ClaimStrategy for SingleProducerClaim {
    fn next(&self, readers: &SequenceGroup, n: usize) -> i64 {
        let next = self.cursor.value() + n as i64;
        let wrap_point = next - self.size;
        while readers.minimum_or(self.cursor.value()) < wrap_point {
            self.wait.wait_for(wrap_point, &self.cursor, readers);
        }
        next
    }

    fn try_next(&self, readers: &SequenceGroup, n: usize) -> Result<i64, NoCapacity> {
        let next = self.cursor.value() + n as i64;
        let wrap_point = next - self.size;
        if readers.minimum_or(self.cursor.value()) < wrap_point {
            return Err(NoCapacity);
        }
        Ok(next)
    }

    fn remaining_capacity(&self, readers: &SequenceGroup) -> usize {
        let consumed = self.cursor.value() - readers.minimum_or(self.cursor.value());
        (self.size - consumed) as usize
    }

    fn publish(&self, _lo: i64, hi: i64) {
        self.cursor.set(hi);
        self.wait.signal_all_when_blocking();
    }
}

/// Concurrent claimants coordinated by CAS on an internal claim frontier.
///
/// The availability buffer stamps each slot with the lap number of the
/// claim that filled it, not a bare published bit. A slot still carrying
/// the previous lap's stamp is indistinguishable from unpublished, which
/// is exactly the required reading after the ring wraps.
pub(crate) struct MultiProducerClaim {
    cursor: Arc<Sequence>,
    wait: Arc<dyn WaitStrategy>,
    size: i64,
    /// Sequence of the last slot claimed by any producer. Runs ahead of
    /// the cursor while translators are still filling their ranges.
    claimed: Sequence,
    /// One lap stamp per ring slot, -1 while never published.
    available: Box<[AtomicI32]>,
}

impl MultiProducerClaim {
    pub(crate) fn new(cursor: Arc<Sequence>, wait: Arc<dyn WaitStrategy>, size: usize) -> Self {
        let available = (0..size).map(|_| AtomicI32::new(-1)).collect();
        Self {
            cursor,
            wait,
            size: size as i64,
            claimed: Sequence::default(),
            available,
        }
    }

    #[inline]
    fn slot(&self, seq: i64) -> usize {
        seq.rem_euclid(self.size) as usize
    }

    #[inline]
    fn lap(&self, seq: i64) -> i32 {
        seq.div_euclid(self.size) as i32
    }

    #[inline]
    fn set_available(&self, seq: i64) {
        self.available[self.slot(seq)].store(self.lap(seq), Ordering::Release);
    }

    #[inline]
    fn is_available(&self, seq: i64) -> bool {
        self.available[self.slot(seq)].load(Ordering::Acquire) == self.lap(seq)
    }
}

impl ClaimStrategy for MultiProducerClaim {
    fn next(&self, readers: &SequenceGroup, n: usize) -> i64 {
        let n = n as i64;
        loop {
            let current = self.claimed.value();
            let next = current + n;
            let wrap_point = next - self.size;
            if readers.minimum_or(self.cursor.value()) < wrap_point {
                self.wait.wait_for(wrap_point, &self.cursor, readers);
                continue;
            }
            if self.claimed.compare_and_set(current, next) {
                return next;
            }
        }
    }

    fn try_next(&self, readers: &SequenceGroup, n: usize) -> Result<i64, NoCapacity> {
        let n = n as i64;
        loop {
            let current = self.claimed.value();
            let next = current + n;
            if readers.minimum_or(self.cursor.value()) < next - self.size {
                return Err(NoCapacity);
            }
            // A lost race here is contention, not missing capacity.
            if self.claimed.compare_and_set(current, next) {
                return Ok(next);
            }
        }
    }

    fn remaining_capacity(&self, readers: &SequenceGroup) -> usize {
        let consumed = self.claimed.value() - readers.minimum_or(self.cursor.value());
        (self.size - consumed) as usize
    }

    fn publish(&self, lo: i64, hi: i64) {
        for seq in lo..=hi {
            self.set_available(seq);
        }
        // Drag the cursor over every contiguous published run starting at
        // cursor + 1. Whichever producer wins the CAS advances it; a lost
        // race means somebody else made progress, so re-scan and retry
        // until no run is left.
        loop {
            let current = self.cursor.value();
            let mut next = current;
            while next - current < self.size && self.is_available(next + 1) {
                next += 1;
            }
            if next == current {
                return;
            }
            if self.cursor.compare_and_set(current, next) {
                self.wait.signal_all_when_blocking();
            }
        }
    }
}
