use thiserror::Error;

/// Construction-time failures. Once a buffer exists, no runtime operation
/// on it allocates or fails with an error; saturation is reported through
/// return values.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("ring capacity must be non-zero")]
    ZeroCapacity,

    #[error("failed to allocate the backing region")]
    Region(#[from] galena_mmap::RegionError),
}

/// The ring has fewer free slots than a claim asked for.
///
/// Returned by the non-blocking claim path; `try_publish` folds it into
/// `false`. The producer is expected to retry after readers have consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("insufficient free slots in the ring")]
pub struct NoCapacity;
