//! Memory-region strategies backing the galena sample ring.
//!
//! A ring of logical length `L` bytes is always backed by a region of
//! `2 * L` bytes so that a span starting near the wrap-around point can
//! extend past it without splitting:
//!
//! ```text
//!  | ring segment (original)      | mirror segment                |
//!  0                              L                             2*L
//! ```
//!
//! Two strategies satisfy that contract:
//!
//! - [`HeapRegion`]: plain zeroed heap memory. The two halves are distinct
//!   pages; the ring core keeps the mirror coherent by copying published
//!   slots across the seam.
//! - [`DoubleMappedRegion`] (Linux): both halves are mapped onto the same
//!   physical pages of an anonymous `memfd` object, so a write at offset
//!   `i` is visible at `i + L` with no copy at all.
//!
//! The region is process-private: the memfd file descriptor is closed as
//! soon as the mappings exist and is never handed to another process.

use std::alloc::{self, Layout};
use std::io;
use std::ptr::NonNull;

use thiserror::Error;
use tracing::debug;

/// Alignment for heap regions. One cache line, so the first slot of the
/// ring never shares a line with an unrelated heap allocation.
const CACHE_LINE: usize = 64;

/// Selects the backing strategy for a ring region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorKind {
    /// Plain heap memory; wrap-around is emulated by mirror copies.
    Heap,
    /// memfd-backed double mapping; wrap-around is free. Linux only.
    DoubleMapped,
}

/// Errors raised while constructing a region. All of these are fatal for
/// the buffer being built; no region operation fails after construction.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("region length must be non-zero")]
    ZeroLength,

    #[error("region length {len} is not a multiple of the page size {page_size}")]
    UnalignedLength { len: usize, page_size: usize },

    #[error("heap allocation of {len} bytes failed")]
    Allocation { len: usize },

    #[error("memfd_create failed")]
    Create(#[source] io::Error),

    #[error("ftruncate to {len} bytes failed")]
    Truncate {
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("mmap failed")]
    Map(#[source] io::Error),

    #[error("double-mapped regions are not supported on this platform")]
    Unsupported,
}

/// Page size of the running system, as reported by the OS.
pub fn page_size() -> usize {
    rustix::param::page_size()
}

/// Zeroed heap region of `2 * len` bytes.
///
/// The mirror half is ordinary memory: it holds copies, not aliases, and
/// the ring core is responsible for keeping it coherent.
pub struct HeapRegion {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl HeapRegion {
    pub fn allocate(len: usize) -> Result<Self, RegionError> {
        if len == 0 {
            return Err(RegionError::ZeroLength);
        }
        let total = len
            .checked_mul(2)
            .ok_or(RegionError::Allocation { len })?;
        let layout = Layout::from_size_align(total, CACHE_LINE)
            .map_err(|_| RegionError::Allocation { len: total })?;

        // SAFETY: layout has non-zero size, checked above.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(RegionError::Allocation { len: total })?;

        debug!(bytes = total, "allocated heap ring region");
        Ok(Self { ptr, len, layout })
    }

    /// Logical length of the ring half, in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to the start of the `2 * len` byte region.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/layout come unmodified from alloc_zeroed in allocate().
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: the region is plain owned memory; access discipline is imposed
// by the ring core, not by the region.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

#[cfg(target_os = "linux")]
pub use linux::DoubleMappedRegion;

#[cfg(target_os = "linux")]
mod linux {
    use super::{page_size, RegionError};
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicU64, Ordering};

    use rustix::fs::MemfdFlags;
    use rustix::mm::{MapFlags, ProtFlags};
    use tracing::debug;

    /// Distinguishes concurrently created regions in `/proc/<pid>/maps`.
    static REGION_COUNTER: AtomicU64 = AtomicU64::new(0);

    /// A `2 * len` byte virtual range in which `[0, len)` and `[len, 2*len)`
    /// alias the same physical pages.
    ///
    /// Construction follows the classic double-map sequence: create an
    /// anonymous shared-memory object, size it, map twice the length in one
    /// piece, then remap the object's first half over the second half of
    /// that range. The object's descriptor is closed before returning; the
    /// mappings keep the pages alive.
    #[derive(Debug)]
    pub struct DoubleMappedRegion {
        ptr: NonNull<u8>,
        len: usize,
    }

    impl DoubleMappedRegion {
        pub fn allocate(len: usize) -> Result<Self, RegionError> {
            if len == 0 {
                return Err(RegionError::ZeroLength);
            }
            let page = page_size();
            if len % page != 0 {
                return Err(RegionError::UnalignedLength {
                    len,
                    page_size: page,
                });
            }

            let name = format!(
                "galena-ring-{}-{}-{}",
                std::process::id(),
                len,
                REGION_COUNTER.fetch_add(1, Ordering::Relaxed)
            );
            let fd = rustix::fs::memfd_create(&name, MemfdFlags::CLOEXEC)
                .map_err(|e| RegionError::Create(e.into()))?;

            rustix::fs::ftruncate(&fd, (2 * len) as u64).map_err(|e| RegionError::Truncate {
                len: 2 * len,
                source: e.into(),
            })?;

            // SAFETY: fresh anonymous mapping, no fixed address requested.
            let first = unsafe {
                rustix::mm::mmap(
                    std::ptr::null_mut(),
                    2 * len,
                    ProtFlags::READ | ProtFlags::WRITE,
                    MapFlags::SHARED,
                    &fd,
                    0,
                )
            }
            .map_err(|e| RegionError::Map(e.into()))?
            .cast::<u8>();

            // Free the second half of the range, then remap the object's
            // first half into the hole. MAP_FIXED is safe here: the target
            // range was obtained from our own mmap call just above.
            // SAFETY: [first + len, first + 2*len) is owned by this mapping.
            let second = unsafe {
                if let Err(e) = rustix::mm::munmap(first.add(len).cast(), len) {
                    let _ = rustix::mm::munmap(first.cast(), 2 * len);
                    return Err(RegionError::Map(e.into()));
                }
                rustix::mm::mmap(
                    first.add(len).cast(),
                    len,
                    ProtFlags::READ | ProtFlags::WRITE,
                    MapFlags::SHARED | MapFlags::FIXED,
                    &fd,
                    0,
                )
            }
            .map_err(|e| {
                // SAFETY: the first half is still mapped; drop it before
                // reporting the failure.
                unsafe {
                    let _ = rustix::mm::munmap(first.cast(), len);
                }
                RegionError::Map(e.into())
            })?;
            debug_assert_eq!(second.cast::<u8>(), unsafe { first.add(len) });

            // fd drops here; the mappings keep the memory alive.
            debug!(bytes = 2 * len, name = %name, "allocated double-mapped ring region");
            Ok(Self {
                ptr: NonNull::new(first).expect("mmap returned a non-null mapping"),
                len,
            })
        }

        /// Logical length of the ring half, in bytes.
        #[inline]
        pub fn len(&self) -> usize {
            self.len
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.len == 0
        }

        /// Pointer to the start of the aliased `2 * len` byte range.
        #[inline]
        pub fn as_mut_ptr(&self) -> *mut u8 {
            self.ptr.as_ptr()
        }
    }

    impl Drop for DoubleMappedRegion {
        fn drop(&mut self) {
            // SAFETY: both halves were mapped by allocate() as one
            // contiguous 2*len range.
            unsafe {
                let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), 2 * self.len);
            }
        }
    }

    // SAFETY: same ownership story as HeapRegion.
    unsafe impl Send for DoubleMappedRegion {}
    unsafe impl Sync for DoubleMappedRegion {}
}

/// A region allocated through one of the [`AllocatorKind`] strategies.
pub enum Region {
    Heap(HeapRegion),
    #[cfg(target_os = "linux")]
    DoubleMapped(DoubleMappedRegion),
}

impl Region {
    /// Allocates `2 * len` bytes for a ring of `len` logical bytes.
    ///
    /// Requesting [`AllocatorKind::DoubleMapped`] off Linux fails with
    /// [`RegionError::Unsupported`]; callers there must fall back to
    /// [`AllocatorKind::Heap`].
    pub fn allocate(kind: AllocatorKind, len: usize) -> Result<Self, RegionError> {
        match kind {
            AllocatorKind::Heap => HeapRegion::allocate(len).map(Region::Heap),
            #[cfg(target_os = "linux")]
            AllocatorKind::DoubleMapped => {
                DoubleMappedRegion::allocate(len).map(Region::DoubleMapped)
            }
            #[cfg(not(target_os = "linux"))]
            AllocatorKind::DoubleMapped => Err(RegionError::Unsupported),
        }
    }

    /// Logical length of the ring half, in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Region::Heap(r) => r.len(),
            #[cfg(target_os = "linux")]
            Region::DoubleMapped(r) => r.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pointer to the start of the `2 * len` byte range.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        match self {
            Region::Heap(r) => r.as_mut_ptr(),
            #[cfg(target_os = "linux")]
            Region::DoubleMapped(r) => r.as_mut_ptr(),
        }
    }

    /// Whether writes to the first half are visible in the second half
    /// without an explicit copy.
    #[inline]
    pub fn is_double_mapped(&self) -> bool {
        match self {
            Region::Heap(_) => false,
            #[cfg(target_os = "linux")]
            Region::DoubleMapped(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_region_is_zeroed_and_sized() {
        let region = HeapRegion::allocate(4096).unwrap();
        assert_eq!(region.len(), 4096);
        let bytes = unsafe { std::slice::from_raw_parts(region.as_mut_ptr(), 2 * 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn heap_region_rejects_zero_length() {
        assert!(matches!(
            HeapRegion::allocate(0),
            Err(RegionError::ZeroLength)
        ));
    }

    #[test]
    fn heap_halves_do_not_alias() {
        let region = HeapRegion::allocate(page_size()).unwrap();
        let len = region.len();
        unsafe {
            region.as_mut_ptr().write(0xA5);
            assert_eq!(region.as_mut_ptr().add(len).read(), 0);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn double_mapped_halves_alias() {
        let region = DoubleMappedRegion::allocate(page_size()).unwrap();
        let len = region.len();
        let ptr = region.as_mut_ptr();
        unsafe {
            ptr.write(0x5A);
            assert_eq!(ptr.add(len).read(), 0x5A);

            // And the other direction: writes in the mirror land in the ring.
            ptr.add(len + 1).write(0xC3);
            assert_eq!(ptr.add(1).read(), 0xC3);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn double_mapped_rejects_unaligned_length() {
        let err = DoubleMappedRegion::allocate(page_size() + 1).unwrap_err();
        assert!(matches!(err, RegionError::UnalignedLength { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn region_enum_reports_aliasing() {
        let len = page_size();
        assert!(!Region::allocate(AllocatorKind::Heap, len)
            .unwrap()
            .is_double_mapped());
        assert!(Region::allocate(AllocatorKind::DoubleMapped, len)
            .unwrap()
            .is_double_mapped());
    }
}
