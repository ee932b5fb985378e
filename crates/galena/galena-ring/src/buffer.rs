//! The sample ring: core, writer handle, reader handles.
//!
//! One fixed-capacity ring of `size` elements carries a typed sample
//! stream from a producer (or several) to any number of independent
//! readers. Every reader consumes at its own pace; the producer never
//! overwrites a slot the slowest reader has not vacated.
//!
//! ```text
//!  | ring segment (original)      | mirror segment                |
//!  0                            size                          2*size
//!                 writer span  |<---- n < size ---->|
//!     reader span |<-- m -->|
//! ```
//!
//! Both handle types deal exclusively in contiguous spans: a span that
//! would cross the wrap-around point simply runs into the mirror segment,
//! which either aliases the ring (double-mapped region) or holds a copy
//! maintained at publication time (heap region).
//!
//! Slot addressing: the element with stream sequence `s` lives at
//! `s mod size`. Sequences start at -1 ("nothing yet"), so the index math
//! uses euclidean remainders throughout.

use std::marker::PhantomData;
use std::ptr;
use std::slice;
use std::sync::Arc;

use galena_mmap::{AllocatorKind, Region};
use tracing::{debug, trace};

use crate::claim::{make_claim_strategy, ClaimStrategy, ProducerKind};
use crate::error::BufferError;
use crate::sequence::{Sequence, SequenceGroup};
use crate::traits::{SampleBuffer, SampleSink, SampleSource};
use crate::wait::{SleepingWaitStrategy, WaitStrategy};

/// Construction parameters for a [`StreamBuffer`].
///
/// ```
/// use galena_ring::{BufferConfig, ProducerKind};
/// use galena_mmap::AllocatorKind;
///
/// let cfg = BufferConfig::new(4096)
///     .allocator(AllocatorKind::Heap)
///     .producer(ProducerKind::Multi);
/// ```
#[derive(Clone)]
pub struct BufferConfig {
    min_size: usize,
    allocator: AllocatorKind,
    producer: ProducerKind,
    wait: Arc<dyn WaitStrategy>,
}

impl BufferConfig {
    /// Defaults: double-mapped region on Linux (heap elsewhere), single
    /// producer, sleeping wait strategy.
    pub fn new(min_size: usize) -> Self {
        Self {
            min_size,
            allocator: if cfg!(target_os = "linux") {
                AllocatorKind::DoubleMapped
            } else {
                AllocatorKind::Heap
            },
            producer: ProducerKind::Single,
            wait: Arc::new(SleepingWaitStrategy::new()),
        }
    }

    pub fn allocator(mut self, kind: AllocatorKind) -> Self {
        self.allocator = kind;
        self
    }

    pub fn producer(mut self, kind: ProducerKind) -> Self {
        self.producer = kind;
        self
    }

    pub fn wait_strategy(mut self, wait: Arc<dyn WaitStrategy>) -> Self {
        self.wait = wait;
        self
    }
}

struct BufferInner<T> {
    /// Owns the 2*size element backing memory.
    region: Region,
    data: *mut T,
    size: usize,
    is_double_mapped: bool,
    cursor: Arc<Sequence>,
    readers: SequenceGroup,
    claim: Box<dyn ClaimStrategy>,
}

// SAFETY: the raw data pointer is the only non-auto field. Concurrent
// access to the element memory is disciplined by the claim/consume
// protocol: a producer writes only slots beyond every reader sequence,
// readers only borrow slots at or below the cursor, and the two sets are
// disjoint modulo `size`.
unsafe impl<T: Send + Sync> Send for BufferInner<T> {}
unsafe impl<T: Send + Sync> Sync for BufferInner<T> {}

/// Shared-ownership handle to the ring core.
///
/// Cloning is cheap (one reference count); the core is freed when the
/// last clone and the last reader/writer handle are gone.
pub struct StreamBuffer<T> {
    inner: Arc<BufferInner<T>>,
}

impl<T> Clone for StreamBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Copy + Default + Send + Sync> StreamBuffer<T> {
    /// Builds a ring with the platform-default configuration.
    pub fn with_capacity(min_size: usize) -> Result<Self, BufferError> {
        Self::new(BufferConfig::new(min_size))
    }

    pub fn new(config: BufferConfig) -> Result<Self, BufferError> {
        if config.min_size == 0 {
            return Err(BufferError::ZeroCapacity);
        }

        let double_mapped = config.allocator == AllocatorKind::DoubleMapped;
        let size = aligned_size::<T>(config.min_size, double_mapped);
        let region = Region::allocate(config.allocator, size * std::mem::size_of::<T>())?;
        let data = region.as_mut_ptr().cast::<T>();

        // Seed every reachable slot. The mirror of a double-mapped region
        // aliases the first half, so writing the ring half covers it.
        let init = if region.is_double_mapped() {
            size
        } else {
            2 * size
        };
        // SAFETY: the region spans 2*size elements and nothing else can
        // reference it yet.
        unsafe {
            for i in 0..init {
                data.add(i).write(T::default());
            }
        }

        let cursor = Arc::new(Sequence::default());
        let claim = make_claim_strategy(
            config.producer,
            Arc::clone(&cursor),
            Arc::clone(&config.wait),
            size,
        );

        debug!(
            size,
            requested = config.min_size,
            double_mapped = region.is_double_mapped(),
            producer = ?config.producer,
            "created stream buffer"
        );

        Ok(Self {
            inner: Arc::new(BufferInner {
                is_double_mapped: region.is_double_mapped(),
                data,
                size,
                region,
                cursor,
                readers: SequenceGroup::new(),
                claim,
            }),
        })
    }

    /// Capacity in elements. At least the requested minimum; possibly
    /// rounded up to satisfy the page-size constraint of the
    /// double-mapped region.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Number of currently attached readers.
    pub fn n_readers(&self) -> usize {
        self.inner.readers.len()
    }

    /// Whether wrap-around is provided by the memory mapping rather than
    /// by mirror copies.
    pub fn is_double_mapped(&self) -> bool {
        self.inner.is_double_mapped
    }

    /// Attaches a new reader, positioned at the current cursor: it sees
    /// only samples published after this call.
    pub fn new_reader(&self) -> StreamReader<T> {
        StreamReader::attach(Arc::clone(&self.inner))
    }

    /// Creates a writer handle. With [`ProducerKind::Multi`] any number
    /// of writers may publish concurrently, one handle per thread; with
    /// [`ProducerKind::Single`] exactly one thread may publish.
    pub fn new_writer(&self) -> StreamWriter<T> {
        StreamWriter {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Copy + Default + Send + Sync> SampleBuffer<T> for StreamBuffer<T> {
    type Reader = StreamReader<T>;
    type Writer = StreamWriter<T>;

    fn size(&self) -> usize {
        StreamBuffer::size(self)
    }

    fn new_reader(&self) -> StreamReader<T> {
        StreamBuffer::new_reader(self)
    }

    fn new_writer(&self) -> StreamWriter<T> {
        StreamBuffer::new_writer(self)
    }
}

/// Smallest capacity >= `min_size` whose byte length is an exact multiple
/// of the page size: each mapped half must tile whole pages, since the
/// mirror mapping starts at `base + size * sizeof(T)`. Heap rings take
/// the requested minimum unchanged.
fn aligned_size<T>(min_size: usize, double_mapped: bool) -> usize {
    if !double_mapped {
        return min_size;
    }
    let elem = std::mem::size_of::<T>().max(1);
    let page = galena_mmap::page_size();
    // size*elem % page == 0  <=>  size % (page / gcd(elem, page)) == 0
    let period = page / gcd(elem, page);
    min_size.div_ceil(period) * period
}

fn gcd(a: usize, b: usize) -> usize {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Producer-side handle.
pub struct StreamWriter<T> {
    inner: Arc<BufferInner<T>>,
}

impl<T: Copy + Default + Send + Sync> StreamWriter<T> {
    /// Claims `n` slots, runs `translator` over the writable span, and
    /// publishes. Blocks while the ring lacks space.
    ///
    /// With no attached readers the samples are dropped without claiming:
    /// a reader joining later starts at the cursor anyway, so buffering
    /// for it would only let the producer run ahead without bound.
    ///
    /// If `translator` panics the claimed range is still published (a
    /// multi-producer gap would otherwise stall the cursor forever) and
    /// the panic propagates to the caller; the slots carry whatever the
    /// translator wrote before unwinding, or the previous lap's samples.
    ///
    /// # Panics
    /// `n` must not exceed the ring capacity.
    pub fn publish<F>(&mut self, translator: F, n: usize)
    where
        F: FnOnce(&mut [T]),
    {
        assert!(
            n <= self.inner.size,
            "publish of {n} elements exceeds ring capacity {}",
            self.inner.size
        );
        if n == 0 || self.inner.readers.is_empty() {
            return;
        }
        let end = self.inner.claim.next(&self.inner.readers, n);
        self.translate_and_publish(translator, n, end);
    }

    /// As [`publish`](Self::publish), but returns `false` instead of
    /// blocking when the ring lacks space. A zero-length or reader-less
    /// publish trivially succeeds.
    pub fn try_publish<F>(&mut self, translator: F, n: usize) -> bool
    where
        F: FnOnce(&mut [T]),
    {
        assert!(
            n <= self.inner.size,
            "publish of {n} elements exceeds ring capacity {}",
            self.inner.size
        );
        if n == 0 || self.inner.readers.is_empty() {
            return true;
        }
        match self.inner.claim.try_next(&self.inner.readers, n) {
            Ok(end) => {
                self.translate_and_publish(translator, n, end);
                true
            }
            Err(_) => false,
        }
    }

    /// Slots the writer could claim right now without waiting.
    pub fn available(&self) -> usize {
        self.inner.claim.remaining_capacity(&self.inner.readers)
    }

    fn translate_and_publish<F>(&mut self, translator: F, n: usize, end: i64)
    where
        F: FnOnce(&mut [T]),
    {
        let inner = &*self.inner;
        let first = (end - n as i64 + 1).rem_euclid(inner.size as i64) as usize;

        // Completes mirroring and publication even if the translator
        // unwinds; see publish() for the rationale.
        let guard = PublishGuard {
            inner,
            first,
            n,
            end,
        };

        // SAFETY: `first < size` and `n <= size`, so the span lies within
        // the 2*size element region. The claim guarantees no reader holds
        // these slots and no other producer claimed them.
        let span = unsafe { slice::from_raw_parts_mut(inner.data.add(first), n) };
        translator(span);
        drop(guard);
    }
}

impl<T: Copy + Default + Send + Sync> SampleSink<T> for StreamWriter<T> {
    fn publish<F: FnOnce(&mut [T])>(&mut self, translator: F, n: usize) {
        StreamWriter::publish(self, translator, n)
    }

    fn try_publish<F: FnOnce(&mut [T])>(&mut self, translator: F, n: usize) -> bool {
        StreamWriter::try_publish(self, translator, n)
    }

    fn available(&self) -> usize {
        StreamWriter::available(self)
    }
}

struct PublishGuard<'a, T> {
    inner: &'a BufferInner<T>,
    first: usize,
    n: usize,
    end: i64,
}

impl<T> Drop for PublishGuard<'_, T> {
    fn drop(&mut self) {
        let inner = self.inner;
        if !inner.is_double_mapped {
            // Keep the mirror invariant data[i] == data[i + size] for
            // every written slot: copy the in-ring part up, and fold a
            // wrapped tail (written past `size`) back to the front.
            let n_first = self.n.min(inner.size - self.first);
            let n_second = self.n - n_first;
            // SAFETY: source and destination ranges are `size` elements
            // apart and each at most `size` long, hence disjoint; both
            // lie inside the 2*size element region.
            unsafe {
                ptr::copy_nonoverlapping(
                    inner.data.add(self.first),
                    inner.data.add(self.first + inner.size),
                    n_first,
                );
                if n_second > 0 {
                    ptr::copy_nonoverlapping(inner.data.add(inner.size), inner.data, n_second);
                }
            }
        }
        inner
            .claim
            .publish(self.end - self.n as i64 + 1, self.end);
    }
}

/// Consumer-side handle. Each reader advances independently; a slot is
/// reusable by the producer once every reader has consumed past it.
pub struct StreamReader<T> {
    inner: Arc<BufferInner<T>>,
    own: Arc<Sequence>,
    /// Snapshot of `own`, refreshed on consume. Spares the hot path an
    /// atomic load of our own position.
    read_cached: i64,
    /// Readers hand out `&[T]` spans tied to `&self`; keep the handle
    /// single-threaded at a time.
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

impl<T: Copy + Default + Send + Sync> StreamReader<T> {
    fn attach(inner: Arc<BufferInner<T>>) -> Self {
        let own = Arc::new(Sequence::default());
        inner.readers.add(&inner.cursor, Arc::clone(&own));
        let read_cached = own.value();
        trace!(position = read_cached, "reader attached");
        Self {
            inner,
            own,
            read_cached,
            _not_sync: PhantomData,
        }
    }

    /// Samples published but not yet consumed by this reader.
    pub fn available(&self) -> usize {
        (self.inner.cursor.value() - self.read_cached) as usize
    }

    /// Borrows up to `n_requested` unconsumed samples as one contiguous
    /// span; all of them when `n_requested` is zero. The span is clamped
    /// to what is available, so its length is the number of readable
    /// samples.
    pub fn get(&self, n_requested: usize) -> &[T] {
        let available = self.available();
        let n = if n_requested == 0 {
            available
        } else {
            n_requested.min(available)
        };
        let first = (self.read_cached + 1).rem_euclid(self.inner.size as i64) as usize;
        // SAFETY: `first < size` and `n <= size`, so the span lies within
        // the 2*size region; the mirror invariant (or the mapping) makes
        // it contiguous. The producer cannot reclaim these slots before
        // `consume` advances our sequence, which needs `&mut self`.
        unsafe { slice::from_raw_parts(self.inner.data.add(first), n) }
    }

    /// Releases `n` samples back to the producer. Returns `false` (and
    /// consumes nothing) if fewer than `n` are available; `consume(0)` is
    /// a no-op success.
    pub fn consume(&mut self, n: usize) -> bool {
        if n == 0 {
            return true;
        }
        if n > self.available() {
            return false;
        }
        self.read_cached = self.own.add_and_get(n as i64);
        true
    }

    /// The `index`-th unconsumed sample.
    ///
    /// # Panics
    /// `index` must be below `available()`.
    pub fn peek(&self, index: usize) -> &T {
        assert!(
            index < self.available(),
            "peek index {index} out of range ({} available)",
            self.available()
        );
        let slot = (self.read_cached + 1 + index as i64).rem_euclid(self.inner.size as i64) as usize;
        // SAFETY: slot < size, inside the region; visibility follows from
        // the cursor acquire in available().
        unsafe { &*self.inner.data.add(slot) }
    }
}

impl<T: Copy + Default + Send + Sync> SampleSource<T> for StreamReader<T> {
    fn available(&self) -> usize {
        StreamReader::available(self)
    }

    fn get(&self, n_requested: usize) -> &[T] {
        StreamReader::get(self, n_requested)
    }

    fn consume(&mut self, n: usize) -> bool {
        StreamReader::consume(self, n)
    }
}

impl<T> Drop for StreamReader<T> {
    fn drop(&mut self) {
        self.inner.readers.remove(&self.own);
        trace!(position = self.read_cached, "reader detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_buffer(size: usize) -> StreamBuffer<i32> {
        StreamBuffer::new(BufferConfig::new(size).allocator(AllocatorKind::Heap)).unwrap()
    }

    #[test]
    fn fresh_buffer_invariants() {
        let buffer = heap_buffer(1024);
        assert_eq!(buffer.size(), 1024);
        assert_eq!(buffer.n_readers(), 0);

        let mut writer = buffer.new_writer();
        let mut reader = buffer.new_reader();
        assert_eq!(buffer.n_readers(), 1);

        assert_eq!(reader.available(), 0);
        assert_eq!(reader.get(0).len(), 0);
        assert!(reader.consume(0));
        assert!(!reader.consume(1));

        assert!(writer.available() >= buffer.size());
        writer.publish(|_| {}, 0);
        assert!(writer.try_publish(|_| {}, 0));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            StreamBuffer::<i32>::new(BufferConfig::new(0).allocator(AllocatorKind::Heap)),
            Err(BufferError::ZeroCapacity)
        ));
    }

    #[test]
    fn publish_without_readers_drops_samples() {
        let buffer = heap_buffer(16);
        let mut writer = buffer.new_writer();
        writer.publish(|span| span.fill(7), 4);
        assert_eq!(writer.available(), 16);

        // The late reader starts at the cursor regardless.
        let reader = buffer.new_reader();
        assert_eq!(reader.available(), 0);
    }

    #[test]
    fn capacity_identity_holds_at_quiescence() {
        let buffer = heap_buffer(64);
        let mut writer = buffer.new_writer();
        let mut reader = buffer.new_reader();

        for round in 0..5 {
            writer.publish(|span| span.fill(round), 10);
            assert_eq!(writer.available() + reader.available(), buffer.size());
            assert!(reader.consume(5));
            assert_eq!(writer.available() + reader.available(), buffer.size());
        }
    }

    #[test]
    fn peek_indexes_unconsumed_samples() {
        let buffer = heap_buffer(8);
        let mut writer = buffer.new_writer();
        let mut reader = buffer.new_reader();

        writer.publish(
            |span| {
                for (i, v) in span.iter_mut().enumerate() {
                    *v = i as i32;
                }
            },
            4,
        );
        assert!(reader.consume(1));
        assert_eq!(*reader.peek(0), 1);
        assert_eq!(*reader.peek(2), 3);
    }

    #[test]
    #[should_panic(expected = "peek index")]
    fn peek_out_of_range_is_fatal() {
        let buffer = heap_buffer(8);
        let _writer = buffer.new_writer();
        let reader = buffer.new_reader();
        let _ = reader.peek(0);
    }

    #[test]
    #[should_panic(expected = "exceeds ring capacity")]
    fn oversized_publish_is_fatal() {
        let buffer = heap_buffer(8);
        let mut writer = buffer.new_writer();
        let _reader = buffer.new_reader();
        writer.publish(|_| {}, 9);
    }

    #[test]
    fn translator_panic_still_publishes() {
        let buffer = heap_buffer(8);
        let mut writer = buffer.new_writer();
        let reader = buffer.new_reader();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            writer.publish(
                |span| {
                    span[0] = 11;
                    panic!("translator fault");
                },
                2,
            );
        }));
        assert!(outcome.is_err());

        // The claimed range is visible; its contents are whatever the
        // translator managed to write.
        assert_eq!(reader.available(), 2);
        assert_eq!(reader.get(0)[0], 11);
    }

    #[test]
    fn mirror_keeps_wrapped_spans_contiguous() {
        let buffer = heap_buffer(8);
        let mut writer = buffer.new_writer();
        let mut reader = buffer.new_reader();

        // Park the window so the next publish straddles the seam.
        writer.publish(|span| span.fill(0), 6);
        assert!(reader.consume(6));

        writer.publish(
            |span| {
                for (i, v) in span.iter_mut().enumerate() {
                    *v = 100 + i as i32;
                }
            },
            5,
        );
        assert_eq!(reader.get(0), &[100, 101, 102, 103, 104]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn double_mapped_size_is_page_aligned() {
        let buffer =
            StreamBuffer::<i32>::new(BufferConfig::new(10).allocator(AllocatorKind::DoubleMapped))
                .unwrap();
        assert!(buffer.size() >= 10);
        assert!(buffer.is_double_mapped());
        assert_eq!(
            2 * buffer.size() * std::mem::size_of::<i32>() % galena_mmap::page_size(),
            0
        );
    }

    #[test]
    fn aligned_size_handles_odd_element_sizes() {
        // 12-byte elements: the rounded size must still tile whole pages.
        #[repr(C)]
        #[derive(Clone, Copy, Default)]
        struct Sample {
            re: f32,
            im: f32,
            tag: u32,
        }
        let size = aligned_size::<Sample>(1000, true);
        assert!(size >= 1000);
        assert_eq!(2 * size * std::mem::size_of::<Sample>() % galena_mmap::page_size(), 0);
    }
}
