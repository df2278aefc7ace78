//! Raw memory region acquisition.
//!
//! The engines never call the OS directly; they go through a [`RegionSource`],
//! which is either the process allocator ([`SystemRegions`]) or a
//! caller-supplied delegate (the "sub-allocator" option, used to nest this
//! allocator inside another one). A source hands out page-aligned regions of
//! the requested size or fails; it never blocks or retries.

use std::alloc::Layout;
use std::ptr::NonNull;

use thiserror::Error;

/// Failure to obtain a raw memory region.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegionError {
    /// The underlying allocator returned nothing for this request.
    #[error("region source exhausted: {size} bytes aligned to {align}")]
    Exhausted { size: usize, align: usize },
    /// The size/alignment pair does not form a valid layout.
    #[error("invalid region layout: {size} bytes aligned to {align}")]
    BadLayout { size: usize, align: usize },
}

/// Provider of large raw memory regions.
///
/// `release` must be called with the exact size and alignment the region was
/// allocated with. Implementations must be callable from any thread.
pub trait RegionSource: Send + Sync {
    /// Obtain `size` bytes aligned to `align` (a power of two).
    fn obtain(&self, size: usize, align: usize) -> Result<NonNull<u8>, RegionError>;

    /// Return a region previously handed out by `obtain`.
    fn release(&self, region: NonNull<u8>, size: usize, align: usize);
}

/// Default region source backed by the process allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRegions;

impl RegionSource for SystemRegions {
    fn obtain(&self, size: usize, align: usize) -> Result<NonNull<u8>, RegionError> {
        let layout =
            Layout::from_size_align(size, align).map_err(|_| RegionError::BadLayout { size, align })?;
        // SAFETY: layout has non-zero size; callers never request zero bytes.
        let raw = unsafe { std::alloc::alloc(layout) };
        NonNull::new(raw).ok_or(RegionError::Exhausted { size, align })
    }

    fn release(&self, region: NonNull<u8>, size: usize, align: usize) {
        let layout = Layout::from_size_align(size, align)
            .unwrap_or_else(|_| unreachable!("release called with a layout obtain() rejected"));
        // SAFETY: `region` came from `obtain` with the same layout.
        unsafe { std::alloc::dealloc(region.as_ptr(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obtain_release_roundtrip() {
        let source = SystemRegions;
        let region = source.obtain(4096, 4096).unwrap();
        assert_eq!(region.as_ptr() as usize % 4096, 0);
        // Touch both ends of the region.
        // SAFETY: region is 4096 valid bytes.
        unsafe {
            region.as_ptr().write(0xAB);
            region.as_ptr().add(4095).write(0xCD);
        }
        source.release(region, 4096, 4096);
    }

    #[test]
    fn test_bad_layout_is_reported() {
        let source = SystemRegions;
        assert_eq!(
            source.obtain(16, 3),
            Err(RegionError::BadLayout { size: 16, align: 3 })
        );
    }
}
