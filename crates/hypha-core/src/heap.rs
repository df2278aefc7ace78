//! Top-level dispatcher.
//!
//! [`Heap`] routes each request to the bucket engine (`size + guard <= 512`,
//! pooling enabled) or the tree engine, and classifies incoming pointers by
//! provenance before trusting any caller-declared size. Provenance is an
//! explicit registry of bucket page base addresses; the per-page marker is
//! kept as a debug cross-check on every registry hit.
//!
//! Lock order: bucket lock, then (fixed-mode page growth only) tree lock.
//! The page registry and probe are leaf locks, never held across an engine
//! call that could block.

use std::collections::HashSet;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::config::{FixedBlock, HeapConfig};
use crate::debug::{AllocProbe, AllocSource, NoProbe};
use crate::region::{RegionError, RegionSource, SystemRegions};
use crate::small::{
    MAX_SMALL_ALLOCATION, MIN_ALLOCATION, SmallEngine, bucket_elem_size, bucket_index,
};
use crate::tree::TreeEngine;

struct OwnedRegion {
    base: usize,
    size: usize,
    align: usize,
}

/// Hybrid pool/tree heap.
///
/// All methods taking a raw pointer are `unsafe`: the pointer must have been
/// returned by this heap and still be live. `allocate` and the introspection
/// calls are safe.
pub struct Heap {
    small: Option<SmallEngine>,
    tree: TreeEngine,
    source: Arc<dyn RegionSource>,
    /// Base addresses of every live bucket page.
    pages: RwLock<HashSet<usize>>,
    probe: Arc<dyn AllocProbe>,
    guard: usize,
    pool_page_size: usize,
    fixed_mode: bool,
    owned_fixed: Option<OwnedRegion>,
    small_allocated: AtomicUsize,
    /// Pool-page bytes obtained directly from the source (growth mode only;
    /// fixed-mode pages are counted by the tree).
    small_capacity: AtomicUsize,
}

impl Heap {
    pub fn new(config: HeapConfig) -> Result<Self, RegionError> {
        Self::with_probe(config, Arc::new(NoProbe))
    }

    /// Build a heap with a debug probe observing every allocation. Callers
    /// keep their own clone of the probe to inspect it afterwards.
    pub fn with_probe(
        config: HeapConfig,
        probe: Arc<dyn AllocProbe>,
    ) -> Result<Self, RegionError> {
        config.validate();
        let tree_page_size = config.tree_page_size();
        let HeapConfig {
            fixed_block,
            page_size,
            system_chunk_size: _,
            pool_page_size,
            enable_pooling,
            sub_allocator,
        } = config;
        let source: Arc<dyn RegionSource> = match sub_allocator {
            Some(delegate) => Arc::from(delegate),
            None => Arc::new(SystemRegions),
        };
        let fixed_mode = fixed_block.is_some();
        let tree = TreeEngine::new(source.clone(), tree_page_size, pool_page_size, fixed_mode);
        let mut owned_fixed = None;
        match fixed_block {
            Some(FixedBlock::Borrowed { ptr, size }) => tree.add_fixed_region(ptr, size),
            Some(FixedBlock::Owned { size }) => {
                let mem = source.obtain(size, page_size)?;
                tree.add_fixed_region(mem, size);
                owned_fixed = Some(OwnedRegion {
                    base: mem.as_ptr() as usize,
                    size,
                    align: page_size,
                });
            }
            None => {}
        }
        let guard = probe.guard_size();
        Ok(Self {
            small: enable_pooling.then(|| SmallEngine::new(pool_page_size)),
            tree,
            source,
            pages: RwLock::new(HashSet::new()),
            probe,
            guard,
            pool_page_size,
            fixed_mode,
            owned_fixed,
            small_allocated: AtomicUsize::new(0),
            small_capacity: AtomicUsize::new(0),
        })
    }

    /// Allocate `size` bytes at the default (8-byte) alignment. Zero bytes
    /// and exhaustion yield `None`.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let total = size.checked_add(self.guard)?;
        let (ptr, origin) = match self.small_index(total) {
            Some(index) => (self.bucket_alloc(index)?, AllocSource::Buckets),
            None => (self.tree.alloc(total)?, AllocSource::Tree),
        };
        self.probe.on_alloc(ptr, size, origin);
        Some(ptr)
    }

    /// Allocate `size` bytes at a power-of-two `alignment`.
    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        debug_assert!(alignment.is_power_of_two());
        if alignment <= MIN_ALLOCATION {
            return self.allocate(size);
        }
        if size == 0 {
            return None;
        }
        let total = size.checked_add(self.guard)?;
        let (ptr, origin) = match self.small_index_aligned(total, alignment) {
            Some(index) => (self.bucket_alloc(index)?, AllocSource::Buckets),
            None => (self.tree.alloc_aligned(total, alignment)?, AllocSource::Tree),
        };
        debug_assert_eq!(ptr.as_ptr() as usize % alignment, 0);
        self.probe.on_alloc(ptr, size, origin);
        Some(ptr)
    }

    /// Reallocate. A null `ptr` allocates; `size == 0` frees and yields
    /// `None`. On exhaustion the original block is left intact.
    ///
    /// # Safety
    /// A non-null `ptr` must be live and owned by this heap.
    pub unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: forwarded contract.
        unsafe { self.reallocate_aligned(ptr, size, MIN_ALLOCATION) }
    }

    /// Aligned form of [`reallocate`](Self::reallocate).
    ///
    /// # Safety
    /// A non-null `ptr` must be live, owned by this heap, and allocated with
    /// `alignment`.
    pub unsafe fn reallocate_aligned(
        &self,
        ptr: *mut u8,
        size: usize,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return self.allocate_aligned(size, alignment);
        }
        if size == 0 {
            // SAFETY: `ptr` is live per contract.
            unsafe { self.deallocate(ptr) };
            return None;
        }
        self.probe.on_check(ptr);
        let total = size.checked_add(self.guard)?;
        // SAFETY: `ptr` is live per contract throughout.
        unsafe {
            if self.ptr_in_bucket(ptr) {
                let small = self.small_engine();
                let elem = small.ptr_size(ptr);
                let target = if alignment <= MIN_ALLOCATION {
                    self.small_index(total)
                } else {
                    self.small_index_aligned(total, alignment)
                };
                if target.map(bucket_elem_size) == Some(elem) {
                    // Same size class: the slot already fits.
                    self.probe.on_free(ptr, AllocSource::Buckets);
                    let kept = NonNull::new(ptr)?;
                    self.probe.on_alloc(kept, size, AllocSource::Buckets);
                    return Some(kept);
                }
                return self.realloc_move(ptr, elem - self.guard, size, alignment);
            }
            if self.small_route(total, alignment) {
                // Shrinking across the boundary into a bucket slot.
                let old = self.tree.ptr_size(ptr) - self.guard;
                return self.realloc_move(ptr, old, size, alignment);
            }
            let old = self.tree.ptr_size(ptr) - self.guard;
            self.probe.on_free(ptr, AllocSource::Tree);
            match self.tree.realloc_aligned(ptr, total, alignment) {
                Some(moved) => {
                    self.probe.on_alloc(moved, size, AllocSource::Tree);
                    Some(moved)
                }
                None => {
                    // Exhaustion leaves the block untouched; restore the
                    // probe record.
                    if let Some(kept) = NonNull::new(ptr) {
                        self.probe.on_alloc(kept, old, AllocSource::Tree);
                    }
                    None
                }
            }
        }
    }

    /// Best-effort in-place resize; never moves. Returns the resulting
    /// usable size, possibly smaller than requested.
    ///
    /// # Safety
    /// `ptr` must be live and owned by this heap.
    pub unsafe fn resize(&self, ptr: *mut u8, size: usize) -> usize {
        if ptr.is_null() {
            return 0;
        }
        self.probe.on_check(ptr);
        let total = size.saturating_add(self.guard);
        // SAFETY: `ptr` is live per contract.
        unsafe {
            if self.ptr_in_bucket(ptr) {
                // A slot never moves or changes class; its capacity is the
                // answer.
                self.small_engine().ptr_size(ptr) - self.guard
            } else {
                // Tree blocks never shrink below the routing boundary, or a
                // later sized deallocate would misroute them. The probe
                // record moves to the achieved size, so guard bytes track
                // the block's new end.
                let clamped = total.max(MAX_SMALL_ALLOCATION + MIN_ALLOCATION);
                self.probe.on_free(ptr, AllocSource::Tree);
                let granted = self.tree.resize(ptr, clamped);
                let usable = granted - self.guard;
                if let Some(live) = NonNull::new(ptr) {
                    self.probe.on_alloc(live, usable, AllocSource::Tree);
                }
                usable
            }
        }
    }

    /// Free. Null is a no-op.
    ///
    /// # Safety
    /// A non-null `ptr` must be live and owned by this heap.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: `ptr` is live per contract.
        unsafe {
            if self.ptr_in_bucket(ptr) {
                self.probe.on_free(ptr, AllocSource::Buckets);
                let small = self.small_engine();
                let elem = small.ptr_size(ptr);
                small.free(ptr);
                self.small_allocated.fetch_sub(elem, Ordering::Relaxed);
            } else {
                self.probe.on_free(ptr, AllocSource::Tree);
                self.tree.free(ptr);
            }
        }
    }

    /// Free with the caller's original request size, skipping the provenance
    /// probe. Debug builds still verify the routing against provenance.
    ///
    /// # Safety
    /// As [`deallocate`](Self::deallocate); `size` must be the size passed
    /// to the call that produced `ptr` (after any reallocation).
    pub unsafe fn deallocate_sized(&self, ptr: *mut u8, size: usize) {
        // SAFETY: forwarded contract.
        unsafe { self.deallocate_sized_aligned(ptr, size, MIN_ALLOCATION) };
    }

    /// # Safety
    /// As [`deallocate_sized`](Self::deallocate_sized), with the original
    /// alignment.
    pub unsafe fn deallocate_sized_aligned(&self, ptr: *mut u8, size: usize, alignment: usize) {
        if ptr.is_null() {
            return;
        }
        let total = size.saturating_add(self.guard);
        // SAFETY: `ptr` is live per contract.
        unsafe {
            if self.small_route(total, alignment) {
                debug_assert!(self.ptr_in_bucket(ptr), "size hint says bucket, pointer disagrees");
                self.probe.on_free(ptr, AllocSource::Buckets);
                let small = self.small_engine();
                let elem = small.ptr_size(ptr);
                debug_assert!(elem >= total);
                small.free(ptr);
                self.small_allocated.fetch_sub(elem, Ordering::Relaxed);
            } else {
                debug_assert!(!self.ptr_in_bucket(ptr), "size hint says tree, pointer disagrees");
                self.probe.on_free(ptr, AllocSource::Tree);
                self.tree.free(ptr);
            }
        }
    }

    /// Usable size of a live allocation (at least the size requested).
    ///
    /// # Safety
    /// `ptr` must be live and owned by this heap.
    pub unsafe fn allocated_size(&self, ptr: *mut u8) -> usize {
        self.probe.on_check(ptr);
        // SAFETY: `ptr` is live per contract.
        unsafe {
            if self.ptr_in_bucket(ptr) {
                self.small_engine().ptr_size(ptr) - self.guard
            } else {
                self.tree.ptr_size(ptr) - self.guard
            }
        }
    }

    /// Return every fully unused page and region. Buckets first: in fixed
    /// mode their pages are tree-backed, so tree purging must see the pages
    /// come home before it runs.
    pub fn purge(&self) {
        if let Some(small) = &self.small {
            small.purge(|page| {
                self.pages.write().remove(&(page.as_ptr() as usize));
                if self.fixed_mode {
                    // SAFETY: the page was carved by `alloc_page` and its
                    // shadowed header is intact.
                    unsafe { self.tree.free_page(page.as_ptr()) };
                } else {
                    self.small_capacity
                        .fetch_sub(self.pool_page_size, Ordering::Relaxed);
                    self.source
                        .release(page, self.pool_page_size, self.pool_page_size);
                }
            });
        }
        self.tree.purge();
    }

    /// Largest request that can currently succeed. Growth-mode heaps are
    /// bounded only by the source, so this reports `usize::MAX`; fixed-mode
    /// heaps purge and report the largest free extent in either engine.
    pub fn max_allocation_size(&self) -> usize {
        if !self.fixed_mode {
            return usize::MAX;
        }
        self.purge();
        let slot = self
            .small
            .as_ref()
            .map_or(0, SmallEngine::max_free_slot_size)
            .saturating_sub(self.guard);
        self.tree.max_free_block().max(slot)
    }

    pub fn max_contiguous_allocation_size(&self) -> usize {
        if !self.fixed_mode {
            return usize::MAX;
        }
        self.tree.max_free_block()
    }

    /// Free bytes currently held by the heap (slots and tree blocks).
    pub fn unallocated_memory(&self) -> usize {
        let small = self.small.as_ref().map_or(0, SmallEngine::unused_memory);
        small + self.tree.unused_memory()
    }

    /// Live bytes as granted (slot/block sizes, not request sizes).
    pub fn allocated_bytes(&self) -> usize {
        self.small_allocated.load(Ordering::Relaxed) + self.tree.allocated_bytes()
    }

    /// Total bytes currently obtained from the source (or the fixed block).
    pub fn capacity_bytes(&self) -> usize {
        self.small_capacity.load(Ordering::Relaxed) + self.tree.capacity_bytes()
    }

    fn small_engine(&self) -> &SmallEngine {
        debug_assert!(self.small.is_some());
        self.small
            .as_ref()
            .unwrap_or_else(|| unreachable!("bucket pointer with pooling disabled"))
    }

    /// Size class for an unaligned request of `total` bytes, if it routes to
    /// the buckets.
    fn small_index(&self, total: usize) -> Option<usize> {
        if self.small.is_none() || total > MAX_SMALL_ALLOCATION {
            return None;
        }
        Some(bucket_index(total))
    }

    /// Aligned requests round the class up so every slot of it sits on an
    /// `alignment` boundary (slots are laid out from the page end, which is
    /// itself aligned).
    fn small_index_aligned(&self, total: usize, alignment: usize) -> Option<usize> {
        self.small.as_ref()?;
        let rounded = total.checked_next_multiple_of(alignment.max(MIN_ALLOCATION))?;
        if rounded > MAX_SMALL_ALLOCATION {
            return None;
        }
        Some(bucket_index(rounded))
    }

    fn small_route(&self, total: usize, alignment: usize) -> bool {
        if alignment <= MIN_ALLOCATION {
            self.small_index(total).is_some()
        } else {
            self.small_index_aligned(total, alignment).is_some()
        }
    }

    fn bucket_alloc(&self, index: usize) -> Option<NonNull<u8>> {
        let small = self.small.as_ref()?;
        let ptr = small.alloc(index, || self.obtain_pool_page())?;
        self.small_allocated
            .fetch_add(bucket_elem_size(index), Ordering::Relaxed);
        Some(ptr)
    }

    /// One fresh pool page, registered before it can serve a slot.
    fn obtain_pool_page(&self) -> Option<NonNull<u8>> {
        let page = if self.fixed_mode {
            self.tree.alloc_page()?
        } else {
            let size = self.pool_page_size;
            let mem = self.source.obtain(size, size).ok()?;
            self.small_capacity.fetch_add(size, Ordering::Relaxed);
            mem
        };
        self.pages.write().insert(page.as_ptr() as usize);
        Some(page)
    }

    /// Provenance: registry lookup on the page-aligned base, cross-checked
    /// against the page marker in debug builds.
    fn ptr_in_bucket(&self, ptr: *const u8) -> bool {
        let Some(small) = &self.small else {
            return false;
        };
        let hit = self.pages.read().contains(&small.page_base(ptr));
        if hit {
            debug_assert!(small.marker_matches(ptr), "registered page with bad marker");
        }
        hit
    }

    /// Move `ptr`'s content into a freshly routed allocation.
    ///
    /// # Safety
    /// `ptr` must be live with at least `old_payload` readable bytes.
    unsafe fn realloc_move(
        &self,
        ptr: *mut u8,
        old_payload: usize,
        size: usize,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        let dst = self.allocate_aligned(size, alignment)?;
        // SAFETY: distinct allocations never overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, dst.as_ptr(), old_payload.min(size));
            self.deallocate(ptr);
        }
        Some(dst)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.purge();
        // Skipped while unwinding: a caller panic with live allocations must
        // not escalate into an abort.
        debug_assert!(
            std::thread::panicking() || self.allocated_bytes() == 0,
            "live allocations at heap teardown"
        );
        if let Some(owned) = self.owned_fixed.take() {
            if let Some(mem) = NonNull::new(owned.base as *mut u8) {
                self.source.release(mem, owned.size, owned.align);
            }
        }
    }
}
