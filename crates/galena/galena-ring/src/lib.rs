//! `galena-ring`: the lock-free sample ring at the heart of galena.
//!
//! Signal-processing blocks exchange typed sample streams through a
//! fixed-capacity circular buffer: one producer (or several) claims and
//! fills contiguous slot ranges, any number of independent readers
//! consume at their own pace, and the slowest reader back-pressures the
//! producer so no unread sample is ever overwritten.
//!
//! # Architecture
//!
//! ```text
//!                    ┌──────────────────────────────┐
//!   StreamWriter ───▶│  StreamBuffer<T>             │───▶ StreamReader
//!    claim / fill    │   cursor ──── Sequence       │      get / consume
//!    / publish       │   readers ─── SequenceGroup  │───▶ StreamReader
//!                    │   region ──── galena-mmap    │      (own pace)
//!                    └──────────────────────────────┘
//! ```
//!
//! Wrap-around is invisible to callers: every `get`/`publish` span is
//! contiguous, either because the backing region is double-mapped (the
//! mirror half aliases the ring half) or because the writer maintains an
//! explicit mirror copy at publication time.
//!
//! Behaviour under contention is pluggable on two axes:
//!
//! - [`ProducerKind`]: the single-producer fast path, or multi-producer
//!   claiming with per-slot publication tracking.
//! - [`WaitStrategy`]: what a stalled producer does while it waits, from
//!   busy-spinning to parking on a condition variable.
//!
//! # Example
//!
//! ```
//! use galena_ring::{BufferConfig, StreamBuffer};
//! use galena_mmap::AllocatorKind;
//!
//! let buffer =
//!     StreamBuffer::<i32>::new(BufferConfig::new(1024).allocator(AllocatorKind::Heap))?;
//! let mut writer = buffer.new_writer();
//! let mut reader = buffer.new_reader();
//!
//! writer.publish(|span| span.copy_from_slice(&[1, 2, 3]), 3);
//! assert_eq!(reader.get(0), &[1, 2, 3]);
//! assert!(reader.consume(3));
//! # Ok::<(), galena_ring::BufferError>(())
//! ```

mod buffer;
mod claim;
mod error;
mod sequence;
mod traits;
mod wait;

pub use buffer::{BufferConfig, StreamBuffer, StreamReader, StreamWriter};
pub use claim::ProducerKind;
pub use error::{BufferError, NoCapacity};
pub use sequence::{Sequence, SequenceGroup, INITIAL_CURSOR_VALUE};
pub use traits::{SampleBuffer, SampleSink, SampleSource};
pub use wait::{
    BlockingWaitStrategy, BusySpinWaitStrategy, SleepingWaitStrategy, SpinLoopWaitStrategy,
    TimeoutBlockingWaitStrategy, WaitStrategy, YieldingWaitStrategy,
};
