//! Construction-time configuration.
//!
//! All options are fixed for the lifetime of a [`Heap`](crate::heap::Heap).
//! Invalid configurations are fatal assertions at construction; nothing is
//! silently coerced.

use std::ptr::NonNull;

use crate::region::RegionSource;

/// Default granularity for region growth and pool pages (one OS page).
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Where the heap's fixed memory block comes from, if it has one.
pub enum FixedBlock {
    /// A caller-owned region. The heap operates entirely inside it and never
    /// grows; the caller frees it after the heap is dropped.
    Borrowed { ptr: NonNull<u8>, size: usize },
    /// The heap obtains a region of this size from its region source at
    /// construction and returns it at drop.
    Owned { size: usize },
}

/// Heap construction options.
///
/// `Default` gives a growable, pooling heap over the process allocator.
pub struct HeapConfig {
    /// Fixed memory block. When set, the heap never calls the region source
    /// for growth; exhaustion becomes allocation failure.
    pub fixed_block: Option<FixedBlock>,
    /// Alignment/granularity of regions. Must be a power of two. Also the
    /// required alignment of a borrowed fixed block.
    pub page_size: usize,
    /// Growth request granularity towards the region source. `0` means
    /// `page_size`. Ignored in fixed-block mode, where `page_size` is used
    /// to subdivide the block.
    pub system_chunk_size: usize,
    /// Size of one small-object pool page. Must be a power of two.
    pub pool_page_size: usize,
    /// When false, every request routes to the tree engine.
    pub enable_pooling: bool,
    /// Optional delegate used instead of
    /// [`SystemRegions`](crate::region::SystemRegions) for obtaining and
    /// returning regions.
    pub sub_allocator: Option<Box<dyn RegionSource>>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            fixed_block: None,
            page_size: DEFAULT_PAGE_SIZE,
            system_chunk_size: 0,
            pool_page_size: DEFAULT_PAGE_SIZE,
            enable_pooling: true,
            sub_allocator: None,
        }
    }
}

impl HeapConfig {
    /// A heap confined to the caller-owned region `[ptr, ptr + size)`.
    pub fn fixed(ptr: NonNull<u8>, size: usize) -> Self {
        Self {
            fixed_block: Some(FixedBlock::Borrowed { ptr, size }),
            ..Self::default()
        }
    }

    /// A heap confined to a region of `size` bytes obtained from the region
    /// source at construction.
    pub fn fixed_owned(size: usize) -> Self {
        Self {
            fixed_block: Some(FixedBlock::Owned { size }),
            ..Self::default()
        }
    }

    /// Validate the configuration. Called by `Heap::new`; violations are
    /// programmer errors, not recoverable conditions.
    pub(crate) fn validate(&self) {
        assert!(
            self.page_size.is_power_of_two(),
            "page size {} must be a power of two",
            self.page_size
        );
        assert!(
            self.pool_page_size.is_power_of_two(),
            "pool page size {} must be a power of two",
            self.pool_page_size
        );
        match &self.fixed_block {
            Some(FixedBlock::Borrowed { ptr, size }) => {
                assert!(
                    size % self.page_size == 0,
                    "fixed block size {} must be a multiple of the page size {}",
                    size,
                    self.page_size
                );
                assert!(
                    (ptr.as_ptr() as usize) % self.page_size == 0,
                    "fixed block must be page size ({} bytes) aligned",
                    self.page_size
                );
            }
            Some(FixedBlock::Owned { size }) => {
                assert!(
                    size % self.page_size == 0,
                    "fixed block size {} must be a multiple of the page size {}",
                    size,
                    self.page_size
                );
            }
            None => {}
        }
    }

    /// Region growth granularity for the tree engine.
    pub(crate) fn tree_page_size(&self) -> usize {
        if self.fixed_block.is_some() {
            self.page_size
        } else if self.system_chunk_size != 0 {
            self.system_chunk_size
        } else {
            self.page_size
        }
    }
}
