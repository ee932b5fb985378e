//! Shared helpers for the galena benchmark suite.

use galena_mmap::AllocatorKind;
use galena_ring::{BufferConfig, StreamBuffer, StreamReader};

/// Ring capacity used by the throughput benches. Large enough that the
/// producer is measured, not the back-pressure.
pub const BENCH_CAPACITY: usize = 1 << 16;

/// Builds a bench ring for the given region kind, panicking loudly on
/// construction failure (bench environments should never hit it).
pub fn bench_buffer(kind: AllocatorKind, capacity: usize) -> StreamBuffer<f32> {
    StreamBuffer::new(BufferConfig::new(capacity).allocator(kind))
        .expect("failed to construct bench ring")
}

/// Every allocator kind available on this platform, with a display label.
pub fn allocator_kinds() -> Vec<(&'static str, AllocatorKind)> {
    #[cfg(target_os = "linux")]
    return vec![
        ("heap", AllocatorKind::Heap),
        ("double_mapped", AllocatorKind::DoubleMapped),
    ];
    #[cfg(not(target_os = "linux"))]
    return vec![("heap", AllocatorKind::Heap)];
}

/// Consumes everything currently readable and returns how much that was.
pub fn drain(reader: &mut StreamReader<f32>) -> usize {
    let n = reader.get(0).len();
    assert!(reader.consume(n));
    n
}
