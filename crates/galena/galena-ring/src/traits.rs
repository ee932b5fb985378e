//! Contracts shared by every sample-buffer backend.
//!
//! The concrete ring in [`crate::buffer`] is one implementation; device
//! or accelerator-backed buffers can satisfy the same traits and plug
//! into the same processing blocks.

/// Consuming side of a sample stream.
pub trait SampleSource<T> {
    /// Samples published but not yet consumed by this source.
    fn available(&self) -> usize;

    /// Borrows up to `n_requested` samples as one contiguous span,
    /// clamped to what is available; all of them when zero.
    fn get(&self, n_requested: usize) -> &[T];

    /// Releases `n` samples; `false` without effect when `n` exceeds
    /// `available()`.
    fn consume(&mut self, n: usize) -> bool;
}

/// Producing side of a sample stream.
pub trait SampleSink<T> {
    /// Claims `n` slots, fills them through `translator`, publishes.
    /// Blocks while the stream lacks space.
    fn publish<F: FnOnce(&mut [T])>(&mut self, translator: F, n: usize);

    /// Non-blocking [`publish`](Self::publish); `false` when the stream
    /// lacks space.
    fn try_publish<F: FnOnce(&mut [T])>(&mut self, translator: F, n: usize) -> bool;

    /// Slots claimable right now without waiting.
    fn available(&self) -> usize;
}

/// A buffer that can mint connected sources and sinks.
pub trait SampleBuffer<T> {
    type Reader: SampleSource<T>;
    type Writer: SampleSink<T>;

    /// Capacity in elements.
    fn size(&self) -> usize;

    fn new_reader(&self) -> Self::Reader;
    fn new_writer(&self) -> Self::Writer;
}
