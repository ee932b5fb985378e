//! Monotonic sequence counters and the shared reader registry.
//!
//! A [`Sequence`] names a position in the sample stream: the cursor of a
//! ring holds the highest published position, and every attached reader
//! owns one sequence holding the highest position it has consumed. All
//! back-pressure arithmetic reduces to comparisons between these counters.
//!
//! Each sequence occupies its own cache line. Cursor and reader sequences
//! are written by different threads at high rates; sharing a line between
//! them would turn every publish into a coherence miss for every reader.

use std::fmt;
use std::mem::size_of;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Value of a sequence before anything has been published or consumed.
pub const INITIAL_CURSOR_VALUE: i64 = -1;

const CACHE_LINE: usize = 64;

/// Cache-line aligned atomic stream position.
///
/// Writes are release, reads are acquire: observing a cursor value is
/// what makes the slots up to that value visible, so the ordering on the
/// counter is the ordering of the whole ring.
#[repr(align(64))]
pub struct Sequence {
    value: AtomicI64,
    _pad: [u8; CACHE_LINE - size_of::<AtomicI64>()],
}

impl Sequence {
    pub fn new(initial: i64) -> Self {
        Self {
            value: AtomicI64::new(initial),
            _pad: [0; CACHE_LINE - size_of::<AtomicI64>()],
        }
    }

    #[inline(always)]
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Compare-and-set; returns whether the exchange took place.
    #[inline(always)]
    pub fn compare_and_set(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Adds `n` and returns the updated value.
    #[inline(always)]
    pub fn add_and_get(&self, n: i64) -> i64 {
        self.value.fetch_add(n, Ordering::AcqRel) + n
    }

    /// Adds one and returns the updated value.
    #[inline(always)]
    pub fn increment_and_get(&self) -> i64 {
        self.add_and_get(1)
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(INITIAL_CURSOR_VALUE)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sequence").field(&self.value()).finish()
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Shared registry of the sequences a producer must not overtake.
///
/// The list itself is copy-on-write: mutation builds a fresh `Vec` and
/// swaps the `Arc` in under a write lock, so concurrent observers always
/// iterate an immutable snapshot and never observe a half-edited list.
/// Reading takes the lock only long enough to clone the `Arc`.
#[derive(Default)]
pub struct SequenceGroup {
    entries: RwLock<Arc<Vec<Arc<Sequence>>>>,
}

impl SequenceGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot of the registered sequences.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Sequence>>> {
        Arc::clone(&self.entries.read())
    }

    /// Registers `seq`, first aligning it with the cursor so that a
    /// late-joining reader starts with zero backlog rather than the whole
    /// history of the stream.
    pub fn add(&self, cursor: &Sequence, seq: Arc<Sequence>) {
        let mut entries = self.entries.write();
        seq.set(cursor.value());
        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        next.push(seq);
        *entries = Arc::new(next);
    }

    /// Removes `seq` by pointer identity. Returns whether it was present.
    pub fn remove(&self, seq: &Arc<Sequence>) -> bool {
        let mut entries = self.entries.write();
        let next: Vec<_> = entries
            .iter()
            .filter(|s| !Arc::ptr_eq(s, seq))
            .cloned()
            .collect();
        let removed = next.len() != entries.len();
        if removed {
            *entries = Arc::new(next);
        }
        removed
    }

    /// Minimum over all registered sequences, or `i64::MAX` when empty.
    pub fn minimum(&self) -> i64 {
        self.minimum_or(i64::MAX)
    }

    /// Minimum over all registered sequences and `floor`; `floor` alone
    /// when the group is empty.
    pub fn minimum_or(&self, floor: i64) -> i64 {
        self.snapshot()
            .iter()
            .fold(floor, |min, s| min.min(s.value()))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SequenceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.snapshot().iter()).finish()
    }
}
