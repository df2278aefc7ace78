//! Large-object free-block tree engine.
//!
//! Memory arrives in regions (from the region source, or one caller-supplied
//! fixed block). Each region is fenced: a zero-size used header at the front,
//! a zero-size used header at the back, and real blocks in between, doubly
//! linked in address order through each header's `prev` pointer (the forward
//! direction is computed from the stored size). Free blocks are additionally
//! indexed by `(size, address)` in an ordered set, which gives O(log n)
//! best-fit lookup and a bounded window scan for aligned requests.
//!
//! Locking follows a single-entry discipline: every public method on
//! [`TreeEngine`] takes the state mutex exactly once and then calls plain
//! `&mut TreeState` routines. Nothing in here ever re-acquires the lock.

use std::collections::BTreeSet;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::region::RegionSource;

/// Header preceding every block. `size_and_flags` packs the payload size
/// (a multiple of 16) with the used bit; the next header in address order
/// lives at `self + 16 + size`.
#[repr(C)]
pub(crate) struct BlockHeader {
    prev: *mut BlockHeader,
    size_and_flags: usize,
}

pub(crate) const BLOCK_HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

/// Smallest payload a free block may have: enough to have once held an
/// index node in the intrusive original layout. Keeping the constant keeps
/// the split thresholds, so fragmentation behavior carries over.
const FREE_NODE_SIZE: usize = 32;

const BL_USED: usize = 1;
const FLAG_MASK: usize = BLOCK_HEADER_SIZE - 1;

/// Round a request so any future free block can always be re-indexed.
/// `None` when the rounding itself would overflow.
fn round_tree_size(size: usize) -> Option<usize> {
    size.max(FREE_NODE_SIZE)
        .checked_next_multiple_of(BLOCK_HEADER_SIZE)
}

unsafe fn block_size(block: *const BlockHeader) -> usize {
    // SAFETY: caller guarantees `block` points at a live header.
    unsafe { (*block).size_and_flags & !FLAG_MASK }
}

unsafe fn is_used(block: *const BlockHeader) -> bool {
    // SAFETY: caller guarantees `block` points at a live header.
    unsafe { (*block).size_and_flags & BL_USED != 0 }
}

unsafe fn set_used(block: *mut BlockHeader) {
    // SAFETY: caller guarantees `block` points at a live header.
    unsafe { (*block).size_and_flags |= BL_USED };
}

unsafe fn set_unused(block: *mut BlockHeader) {
    // SAFETY: caller guarantees `block` points at a live header.
    unsafe { (*block).size_and_flags &= !BL_USED };
}

/// Change the payload size, preserving the flag bits.
unsafe fn set_size(block: *mut BlockHeader, size: usize) {
    debug_assert_eq!(size & FLAG_MASK, 0);
    // SAFETY: caller guarantees `block` points at a live header.
    unsafe {
        (*block).size_and_flags = ((*block).size_and_flags & FLAG_MASK) | size;
    }
}

unsafe fn next_block(block: *mut BlockHeader) -> *mut BlockHeader {
    // SAFETY: caller guarantees `block` is live and fenced, so the computed
    // address is the next header within the same region.
    unsafe { block.cast::<u8>().add(BLOCK_HEADER_SIZE + block_size(block)) }.cast()
}

unsafe fn block_mem(block: *mut BlockHeader) -> *mut u8 {
    // SAFETY: the payload starts right after the header.
    unsafe { block.cast::<u8>().add(BLOCK_HEADER_SIZE) }
}

unsafe fn header_of(ptr: *mut u8) -> *mut BlockHeader {
    // SAFETY: caller guarantees `ptr` is a payload pointer from this engine.
    unsafe { ptr.sub(BLOCK_HEADER_SIZE) }.cast()
}

/// Carve the trailing part of `block` off as a new header with
/// `total - size - 16` bytes of payload. The remainder is returned
/// unused and unattached.
unsafe fn split_block(block: *mut BlockHeader, size: usize) -> *mut BlockHeader {
    // SAFETY: caller guarantees the remainder fits a header plus free node.
    unsafe {
        let total = block_size(block);
        debug_assert!(total >= size + BLOCK_HEADER_SIZE + FREE_NODE_SIZE);
        let rest = block_mem(block).add(size).cast::<BlockHeader>();
        (*rest).size_and_flags = 0;
        set_size(rest, total - size - BLOCK_HEADER_SIZE);
        (*rest).prev = block;
        (*next_block(rest)).prev = rest;
        set_size(block, size);
        rest
    }
}

struct TreeState {
    /// Free blocks keyed by `(payload size, header address)`. A block is in
    /// here iff its used bit is clear.
    free_index: BTreeSet<(usize, usize)>,
    page_size: usize,
    pool_page_size: usize,
    /// Front-fence address of the fixed region, exempt from purging.
    fixed_base: Option<usize>,
    fixed_mode: bool,
    allocated: usize,
    capacity: usize,
}

impl TreeState {
    unsafe fn attach(&mut self, block: *mut BlockHeader) {
        // SAFETY: caller guarantees `block` is live and unused.
        debug_assert!(!unsafe { is_used(block) });
        let fresh = self
            .free_index
            .insert((unsafe { block_size(block) }, block as usize));
        debug_assert!(fresh, "block indexed twice");
    }

    unsafe fn detach(&mut self, block: *mut BlockHeader) {
        // SAFETY: caller guarantees `block` is live.
        let present = self
            .free_index
            .remove(&(unsafe { block_size(block) }, block as usize));
        debug_assert!(present, "detaching an unindexed block");
    }

    /// Best fit: smallest free block of at least `size`, lowest address on
    /// ties. Removes it from the index.
    fn extract(&mut self, size: usize) -> Option<*mut BlockHeader> {
        let &entry = self.free_index.range((size, 0)..).next()?;
        self.free_index.remove(&entry);
        Some(entry.1 as *mut BlockHeader)
    }

    /// Aligned best fit: scan the window `[size, size + align)` for the
    /// first block still sufficient after its alignment offset, then fall
    /// back to the first block past the window (which always suffices).
    fn extract_aligned(&mut self, size: usize, align: usize) -> Option<*mut BlockHeader> {
        let upper = size.checked_add(align)?;
        let mut chosen = None;
        for &(found, addr) in self.free_index.range((size, 0)..(upper, 0)) {
            let mem = addr + BLOCK_HEADER_SIZE;
            let offs = mem.next_multiple_of(align) - mem;
            if found >= size + offs {
                chosen = Some((found, addr));
                break;
            }
        }
        if chosen.is_none() {
            chosen = self.free_index.range((upper, 0)..).next().copied();
        }
        let entry = chosen?;
        self.free_index.remove(&entry);
        Some(entry.1 as *mut BlockHeader)
    }

    /// Like [`extract_aligned`], but for pool pages: the *header* lands on
    /// the alignment boundary, because the whole page (header included) is
    /// handed to the bucket engine.
    fn extract_page(&mut self, size: usize, align: usize) -> Option<*mut BlockHeader> {
        let lower = size.saturating_sub(BLOCK_HEADER_SIZE);
        let upper = size.checked_add(align)?;
        let mut chosen = None;
        for &(found, addr) in self.free_index.range((lower, 0)..(upper, 0)) {
            let offs = addr.next_multiple_of(align) - addr;
            if found + BLOCK_HEADER_SIZE >= size + offs {
                chosen = Some((found, addr));
                break;
            }
        }
        if chosen.is_none() {
            chosen = self.free_index.range((upper, 0)..).next().copied();
        }
        let entry = chosen?;
        self.free_index.remove(&entry);
        Some(entry.1 as *mut BlockHeader)
    }

    /// Fence a fresh region and index its single interior block.
    unsafe fn add_region(&mut self, mem: *mut u8, region: usize) {
        debug_assert!(region >= 3 * BLOCK_HEADER_SIZE + FREE_NODE_SIZE);
        // SAFETY: caller hands us `region` exclusively owned writable bytes.
        unsafe {
            let front = mem.cast::<BlockHeader>();
            (*front).prev = std::ptr::null_mut();
            (*front).size_and_flags = BL_USED;

            let block = mem.add(BLOCK_HEADER_SIZE).cast::<BlockHeader>();
            (*block).prev = front;
            (*block).size_and_flags = 0;
            set_size(block, region - 3 * BLOCK_HEADER_SIZE);

            let back = mem.add(region - BLOCK_HEADER_SIZE).cast::<BlockHeader>();
            (*back).prev = block;
            (*back).size_and_flags = BL_USED;

            self.capacity += region;
            self.attach(block);
        }
    }

    /// Obtain one more region sized for a `size`-byte block. Fails in fixed
    /// mode and on source exhaustion.
    fn grow(&mut self, size: usize, source: &dyn RegionSource) -> Option<()> {
        if self.fixed_mode {
            return None;
        }
        let with_fences = size.checked_add(3 * BLOCK_HEADER_SIZE)?;
        let region = with_fences.max(self.page_size);
        let mem = source.obtain(region, self.page_size).ok()?;
        // SAFETY: the source just handed us `region` exclusive bytes.
        unsafe { self.add_region(mem.as_ptr(), region) };
        Some(())
    }

    /// Split the trailing excess of `block` down to `size` when the
    /// remainder is big enough to index; otherwise grant the whole block.
    unsafe fn trim(&mut self, block: *mut BlockHeader, size: usize) {
        // SAFETY: caller guarantees `block` is live, detached, with at least
        // `size` payload.
        unsafe {
            if block_size(block) >= size + BLOCK_HEADER_SIZE + FREE_NODE_SIZE {
                let rest = split_block(block, size);
                self.release_remainder(rest);
            }
        }
    }

    /// Index a freshly carved remainder, first merging it with a free
    /// successor. Its predecessor is the block it was carved from, so no
    /// backward merge is possible.
    unsafe fn release_remainder(&mut self, rest: *mut BlockHeader) {
        // SAFETY: caller guarantees `rest` is live, unused, unattached.
        unsafe {
            let next = next_block(rest);
            if !is_used(next) {
                self.detach(next);
                set_size(rest, block_size(rest) + BLOCK_HEADER_SIZE + block_size(next));
                (*next_block(rest)).prev = rest;
            }
            self.attach(rest);
        }
    }

    unsafe fn alloc(&mut self, size: usize, source: &dyn RegionSource) -> Option<*mut u8> {
        let size = round_tree_size(size)?;
        let block = match self.extract(size) {
            Some(block) => block,
            None => {
                self.grow(size, source)?;
                self.extract(size)?
            }
        };
        // SAFETY: extracted blocks are live, detached, and big enough.
        unsafe {
            self.trim(block, size);
            set_used(block);
            self.allocated += block_size(block);
            Some(block_mem(block))
        }
    }

    unsafe fn alloc_aligned(
        &mut self,
        size: usize,
        align: usize,
        source: &dyn RegionSource,
    ) -> Option<*mut u8> {
        if align <= BLOCK_HEADER_SIZE {
            // SAFETY: forwarded contract.
            return unsafe { self.alloc(size, source) };
        }
        let size = round_tree_size(size)?;
        let mut block = match self.extract_aligned(size, align) {
            Some(block) => block,
            None => {
                self.grow(size.checked_add(align)?, source)?;
                self.extract_aligned(size, align)?
            }
        };
        // SAFETY: extracted blocks are live, detached, and sufficient for
        // `size` past their alignment offset.
        unsafe {
            let mem = block_mem(block) as usize;
            let aligned = mem.next_multiple_of(align);
            let offs = aligned - mem;
            if offs > 0 {
                if offs >= BLOCK_HEADER_SIZE + FREE_NODE_SIZE {
                    block = self.split_leading(block, offs);
                } else {
                    block = self.shift_block(block, offs);
                }
            }
            self.trim(block, size);
            set_used(block);
            self.allocated += block_size(block);
            Some(aligned as *mut u8)
        }
    }

    /// Move a free, detached block's header forward by `offs` bytes,
    /// absorbing the gap into the physically previous block (which always
    /// exists: a fence at worst). Used when an alignment remainder is too
    /// small to index.
    unsafe fn shift_block(&mut self, block: *mut BlockHeader, offs: usize) -> *mut BlockHeader {
        debug_assert!(offs > 0 && offs & FLAG_MASK == 0);
        // SAFETY: caller guarantees `block` is live, detached, unused, and
        // that `offs` is smaller than its payload.
        unsafe {
            let prev = (*block).prev;
            debug_assert!(!prev.is_null());
            debug_assert!(is_used(prev), "adjacent free blocks left uncoalesced");
            // The absorbed bytes now belong to the neighbor. Its eventual
            // free subtracts the grown size, so charge them to `allocated`.
            // Fences are never freed; their growth is settled at purge.
            if !(*prev).prev.is_null() {
                self.allocated += offs;
            }
            let size = block_size(block) - offs;
            set_size(prev, block_size(prev) + offs);
            let moved = block.cast::<u8>().add(offs).cast::<BlockHeader>();
            (*moved).size_and_flags = 0;
            set_size(moved, size);
            (*moved).prev = prev;
            (*next_block(moved)).prev = moved;
            moved
        }
    }

    /// Re-index the leading `offs` bytes of `block` as their own free block
    /// and return the new header at `block + offs`.
    unsafe fn split_leading(&mut self, block: *mut BlockHeader, offs: usize) -> *mut BlockHeader {
        // SAFETY: caller guarantees `offs >= 48` and `offs` < payload.
        unsafe {
            let total = block_size(block);
            let moved = block.cast::<u8>().add(offs).cast::<BlockHeader>();
            (*moved).size_and_flags = 0;
            set_size(moved, total - offs);
            (*moved).prev = block;
            (*next_block(moved)).prev = moved;
            set_size(block, offs - BLOCK_HEADER_SIZE);
            self.attach(block);
            moved
        }
    }

    /// Carve one pool page, `pool_page_size` bytes at a `pool_page_size`
    /// boundary, with the block header kept at the page base (the bucket
    /// engine shadows it there). No growth: this path exists for fixed mode.
    unsafe fn alloc_page(&mut self) -> Option<*mut u8> {
        let page = self.pool_page_size;
        let mut block = self.extract_page(page, page)?;
        // SAFETY: extract_page guarantees the aligned page fits the block.
        unsafe {
            let offs = (block as usize).next_multiple_of(page) - block as usize;
            if offs > 0 {
                if offs >= BLOCK_HEADER_SIZE + FREE_NODE_SIZE {
                    block = self.split_leading(block, offs);
                } else {
                    block = self.shift_block(block, offs);
                }
            }
            self.trim(block, page - BLOCK_HEADER_SIZE);
            set_used(block);
            self.allocated += block_size(block);
            Some(block.cast::<u8>())
        }
    }

    unsafe fn free_block(&mut self, block: *mut BlockHeader) {
        let mut block = block;
        // SAFETY: caller guarantees `block` is a live used block; fences
        // bound both merges.
        unsafe {
            debug_assert!(is_used(block), "double free of tree block");
            self.allocated -= block_size(block);
            set_unused(block);
            let prev = (*block).prev;
            if !prev.is_null() && !is_used(prev) {
                self.detach(prev);
                let next = next_block(block);
                set_size(prev, block_size(prev) + BLOCK_HEADER_SIZE + block_size(block));
                (*next).prev = prev;
                block = prev;
            }
            let next = next_block(block);
            if !is_used(next) {
                self.detach(next);
                set_size(block, block_size(block) + BLOCK_HEADER_SIZE + block_size(next));
                (*next_block(block)).prev = block;
            }
            self.attach(block);
        }
    }

    unsafe fn realloc(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        source: &dyn RegionSource,
    ) -> Option<*mut u8> {
        let size = round_tree_size(new_size)?;
        // SAFETY: caller guarantees `ptr` is a live tree payload.
        unsafe {
            let block = header_of(ptr);
            let cur = block_size(block);
            if size <= cur {
                self.trim(block, size);
                self.allocated = self.allocated - cur + block_size(block);
                return Some(ptr);
            }
            if self.absorb_next(block, size) {
                self.allocated = self.allocated - cur + block_size(block);
                return Some(ptr);
            }
            let prev = (*block).prev;
            if !prev.is_null() && !is_used(prev) {
                let next = next_block(block);
                let take_next = !is_used(next);
                let mut merged = block_size(prev) + BLOCK_HEADER_SIZE + cur;
                if take_next {
                    merged += BLOCK_HEADER_SIZE + block_size(next);
                }
                if merged >= size {
                    self.detach(prev);
                    if take_next {
                        self.detach(next);
                    }
                    set_size(prev, merged);
                    set_used(prev);
                    (*next_block(prev)).prev = prev;
                    let dst = block_mem(prev);
                    // Source and destination overlap.
                    std::ptr::copy(ptr, dst, cur);
                    self.trim(prev, size);
                    self.allocated = self.allocated - cur + block_size(prev);
                    return Some(dst);
                }
            }
            let dst = self.alloc(size, source)?;
            std::ptr::copy_nonoverlapping(ptr, dst, cur);
            self.free_block(header_of(ptr));
            Some(dst)
        }
    }

    unsafe fn realloc_aligned(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        align: usize,
        source: &dyn RegionSource,
    ) -> Option<*mut u8> {
        if align <= BLOCK_HEADER_SIZE {
            // SAFETY: forwarded contract.
            return unsafe { self.realloc(ptr, new_size, source) };
        }
        debug_assert_eq!(ptr as usize % align, 0);
        let size = round_tree_size(new_size)?;
        // SAFETY: caller guarantees `ptr` is a live tree payload allocated
        // with alignment `align`.
        unsafe {
            let block = header_of(ptr);
            let cur = block_size(block);
            if size <= cur {
                self.trim(block, size);
                self.allocated = self.allocated - cur + block_size(block);
                return Some(ptr);
            }
            // Absorbing the successor keeps the address, hence the alignment.
            if self.absorb_next(block, size) {
                self.allocated = self.allocated - cur + block_size(block);
                return Some(ptr);
            }
            let prev = (*block).prev;
            if !prev.is_null() && !is_used(prev) {
                let next = next_block(block);
                let take_next = !is_used(next);
                let mut merged = block_size(prev) + BLOCK_HEADER_SIZE + cur;
                if take_next {
                    merged += BLOCK_HEADER_SIZE + block_size(next);
                }
                let mem = block_mem(prev) as usize;
                let aligned = mem.next_multiple_of(align);
                let offs = aligned - mem;
                if merged >= size + offs {
                    self.detach(prev);
                    if take_next {
                        self.detach(next);
                    }
                    set_size(prev, merged);
                    (*next_block(prev)).prev = prev;
                    let mut merged_block = prev;
                    if offs > 0 {
                        if offs >= BLOCK_HEADER_SIZE + FREE_NODE_SIZE {
                            merged_block = self.split_leading(merged_block, offs);
                        } else {
                            merged_block = self.shift_block(merged_block, offs);
                        }
                    }
                    set_used(merged_block);
                    std::ptr::copy(ptr, aligned as *mut u8, cur);
                    self.trim(merged_block, size);
                    self.allocated = self.allocated - cur + block_size(merged_block);
                    return Some(aligned as *mut u8);
                }
            }
            let dst = self.alloc_aligned(size, align, source)?;
            std::ptr::copy_nonoverlapping(ptr, dst, cur);
            self.free_block(header_of(ptr));
            Some(dst)
        }
    }

    /// Grow `block` in place by swallowing a free successor, then trim back
    /// down to `size`. Returns false when that cannot reach `size`.
    unsafe fn absorb_next(&mut self, block: *mut BlockHeader, size: usize) -> bool {
        // SAFETY: caller guarantees `block` is a live used block.
        unsafe {
            let cur = block_size(block);
            let next = next_block(block);
            if is_used(next) || cur + BLOCK_HEADER_SIZE + block_size(next) < size {
                return false;
            }
            self.detach(next);
            set_size(block, cur + BLOCK_HEADER_SIZE + block_size(next));
            (*next_block(block)).prev = block;
            self.trim(block, size);
            true
        }
    }

    /// Best-effort in-place resize; never moves. Returns the resulting
    /// payload size.
    unsafe fn resize(&mut self, ptr: *mut u8, new_size: usize) -> usize {
        // SAFETY: caller guarantees `ptr` is a live tree payload.
        unsafe {
            let block = header_of(ptr);
            let cur = block_size(block);
            let Some(size) = round_tree_size(new_size) else {
                return cur;
            };
            if size <= cur {
                self.trim(block, size);
            } else {
                self.absorb_next(block, size);
            }
            self.allocated = self.allocated - cur + block_size(block);
            block_size(block)
        }
    }

    /// A region is reclaimable when its interior is one free block touching
    /// both fences. The fixed region never qualifies.
    unsafe fn purgeable(&self, block: *mut BlockHeader) -> Option<(usize, usize)> {
        // SAFETY: caller guarantees `block` is a live free block.
        unsafe {
            let front = (*block).prev;
            if front.is_null() || !(*front).prev.is_null() {
                return None;
            }
            if block_size(next_block(block)) != 0 {
                return None;
            }
            if Some(front as usize) == self.fixed_base {
                return None;
            }
            // The front fence may have absorbed alignment slivers; its size
            // is part of the region handed back to the source.
            Some((
                front as usize,
                block_size(front) + block_size(block) + 3 * BLOCK_HEADER_SIZE,
            ))
        }
    }
}

pub(crate) struct TreeEngine {
    state: Mutex<TreeState>,
    source: Arc<dyn RegionSource>,
    page_size: usize,
}

impl TreeEngine {
    pub(crate) fn new(
        source: Arc<dyn RegionSource>,
        page_size: usize,
        pool_page_size: usize,
        fixed_mode: bool,
    ) -> Self {
        Self {
            state: Mutex::new(TreeState {
                free_index: BTreeSet::new(),
                page_size,
                pool_page_size,
                fixed_base: None,
                fixed_mode,
                allocated: 0,
                capacity: 0,
            }),
            source,
            page_size,
        }
    }

    /// Register the caller-supplied fixed region. Called once, before any
    /// allocation.
    pub(crate) fn add_fixed_region(&self, mem: NonNull<u8>, size: usize) {
        let mut state = self.state.lock();
        debug_assert!(state.fixed_base.is_none());
        state.fixed_base = Some(mem.as_ptr() as usize);
        // SAFETY: the caller hands over `size` exclusive bytes for the life
        // of the engine.
        unsafe { state.add_region(mem.as_ptr(), size) };
    }

    pub(crate) fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        // SAFETY: state invariants hold under the lock.
        let ptr = unsafe { state.alloc(size, &*self.source) }?;
        NonNull::new(ptr)
    }

    pub(crate) fn alloc_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        // SAFETY: state invariants hold under the lock.
        let ptr = unsafe { state.alloc_aligned(size, align, &*self.source) }?;
        NonNull::new(ptr)
    }

    /// One pool page for the bucket engine, header left in place at the page
    /// base.
    pub(crate) fn alloc_page(&self) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        // SAFETY: state invariants hold under the lock.
        let ptr = unsafe { state.alloc_page() }?;
        NonNull::new(ptr)
    }

    /// # Safety
    /// `ptr` must be a live payload returned by this engine.
    pub(crate) unsafe fn free(&self, ptr: *mut u8) {
        let mut state = self.state.lock();
        // SAFETY: forwarded contract.
        unsafe { state.free_block(header_of(ptr)) };
    }

    /// # Safety
    /// `page` must be a live page returned by [`alloc_page`](Self::alloc_page).
    pub(crate) unsafe fn free_page(&self, page: *mut u8) {
        let mut state = self.state.lock();
        // SAFETY: the page base carries the block header.
        unsafe { state.free_block(page.cast()) };
    }

    /// # Safety
    /// `ptr` must be a live payload returned by this engine.
    pub(crate) unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        // SAFETY: forwarded contract.
        let moved = unsafe { state.realloc(ptr, size, &*self.source) }?;
        NonNull::new(moved)
    }

    /// # Safety
    /// `ptr` must be a live payload allocated with alignment `align`.
    pub(crate) unsafe fn realloc_aligned(
        &self,
        ptr: *mut u8,
        size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        // SAFETY: forwarded contract.
        let moved = unsafe { state.realloc_aligned(ptr, size, align, &*self.source) }?;
        NonNull::new(moved)
    }

    /// # Safety
    /// `ptr` must be a live payload returned by this engine.
    pub(crate) unsafe fn resize(&self, ptr: *mut u8, size: usize) -> usize {
        let mut state = self.state.lock();
        // SAFETY: forwarded contract.
        unsafe { state.resize(ptr, size) }
    }

    /// # Safety
    /// `ptr` must be a live payload returned by this engine.
    pub(crate) unsafe fn ptr_size(&self, ptr: *mut u8) -> usize {
        let _state = self.state.lock();
        // SAFETY: block sizes only change under the lock we hold.
        unsafe { block_size(header_of(ptr)) }
    }

    /// Largest free block currently indexed.
    pub(crate) fn max_free_block(&self) -> usize {
        let state = self.state.lock();
        state
            .free_index
            .iter()
            .next_back()
            .map(|&(size, _)| size)
            .unwrap_or(0)
    }

    pub(crate) fn unused_memory(&self) -> usize {
        let state = self.state.lock();
        state.free_index.iter().map(|&(size, _)| size).sum()
    }

    pub(crate) fn allocated_bytes(&self) -> usize {
        self.state.lock().allocated
    }

    pub(crate) fn capacity_bytes(&self) -> usize {
        self.state.lock().capacity
    }

    /// Return every fully free region to the source.
    pub(crate) fn purge(&self) {
        let mut regions = Vec::new();
        {
            let mut state = self.state.lock();
            let snapshot: Vec<(usize, usize)> = state.free_index.iter().copied().collect();
            for (size, addr) in snapshot {
                let block = addr as *mut BlockHeader;
                // SAFETY: indexed blocks are live and free.
                if let Some((front, region)) = unsafe { state.purgeable(block) } {
                    state.free_index.remove(&(size, addr));
                    state.capacity -= region;
                    regions.push((front, region));
                }
            }
        }
        for (front, region) in regions {
            #[cfg(debug_assertions)]
            // SAFETY: the region is unlinked; nothing references it anymore.
            unsafe {
                std::ptr::write_bytes(front as *mut u8, 0xFF, region);
            }
            if let Some(mem) = NonNull::new(front as *mut u8) {
                self.source.release(mem, region, self.page_size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::SystemRegions;

    const PAGE: usize = 4096;

    fn engine() -> TreeEngine {
        TreeEngine::new(Arc::new(SystemRegions), PAGE, PAGE, false)
    }

    #[test]
    fn test_round_tree_size() {
        assert_eq!(round_tree_size(1), Some(32));
        assert_eq!(round_tree_size(32), Some(32));
        assert_eq!(round_tree_size(33), Some(48));
        assert_eq!(round_tree_size(100), Some(112));
        assert_eq!(round_tree_size(usize::MAX - 10), None);
    }

    #[test]
    fn test_alloc_free_roundtrip() {
        let tree = engine();
        let ptr = tree.alloc(1000).unwrap();
        assert_eq!(ptr.as_ptr() as usize % BLOCK_HEADER_SIZE, 0);
        unsafe {
            assert_eq!(tree.ptr_size(ptr.as_ptr()), 1008);
            ptr.as_ptr().write_bytes(0xAB, 1000);
            tree.free(ptr.as_ptr());
        }
        assert_eq!(tree.allocated_bytes(), 0);
        tree.purge();
        assert_eq!(tree.capacity_bytes(), 0);
    }

    #[test]
    fn test_sequential_allocs_carve_one_region() {
        let tree = engine();
        let a = tree.alloc(64).unwrap().as_ptr();
        let b = tree.alloc(64).unwrap().as_ptr();
        // Best fit reuses the split remainder right behind `a`.
        assert_eq!(b as usize, a as usize + 64 + BLOCK_HEADER_SIZE);
        assert_eq!(tree.capacity_bytes(), PAGE);
        unsafe {
            tree.free(a);
            tree.free(b);
        }
        tree.purge();
        assert_eq!(tree.capacity_bytes(), 0);
    }

    #[test]
    fn test_coalescing_both_orders() {
        for forward in [true, false] {
            let tree = engine();
            let a = tree.alloc(64).unwrap().as_ptr();
            let b = tree.alloc(64).unwrap().as_ptr();
            let _c = tree.alloc(64).unwrap().as_ptr();
            unsafe {
                if forward {
                    tree.free(a);
                    tree.free(b);
                } else {
                    tree.free(b);
                    tree.free(a);
                }
            }
            // One merged block: both payloads plus the reclaimed header.
            let merged = tree.alloc(64 + BLOCK_HEADER_SIZE + 64).unwrap().as_ptr();
            assert_eq!(merged, a);
        }
    }

    #[test]
    fn test_free_preserves_block_size_for_reuse() {
        let tree = engine();
        let a = tree.alloc(200).unwrap().as_ptr();
        let b = tree.alloc(200).unwrap().as_ptr();
        unsafe { tree.free(a) };
        // The freed block keeps its 208-byte size in the index, so an
        // exact-fit request lands back on it.
        let again = tree.alloc(200).unwrap().as_ptr();
        assert_eq!(again, a);
        unsafe {
            tree.free(again);
            tree.free(b);
        }
        assert_eq!(tree.allocated_bytes(), 0);
    }

    #[test]
    fn test_alignment_sliver_absorbed_by_used_neighbor() {
        let tree = engine();
        let a = tree.alloc(64).unwrap().as_ptr();
        // The aligned request starts 16 bytes into the next free block, too
        // little to index: the sliver is absorbed into `a`'s block.
        let b = tree.alloc_aligned(64, 64).unwrap().as_ptr();
        assert_eq!(b as usize % 64, 0);
        unsafe {
            assert_eq!(tree.ptr_size(a), 64 + 16);
            tree.free(b);
            tree.free(a);
        }
        assert_eq!(tree.allocated_bytes(), 0);
    }

    #[test]
    fn test_purge_after_fence_absorption_returns_full_region() {
        let tree = engine();
        // First allocation in a fresh region: the 32-byte alignment sliver
        // is absorbed into the front fence.
        let b = tree.alloc_aligned(600, 64).unwrap().as_ptr();
        assert_eq!(b as usize % 64, 0);
        unsafe { tree.free(b) };
        tree.purge();
        assert_eq!(tree.capacity_bytes(), 0);
        assert_eq!(tree.allocated_bytes(), 0);
    }

    #[test]
    fn test_absurd_requests_fail_without_panicking() {
        let tree = engine();
        assert!(tree.alloc(usize::MAX - 10).is_none());
        assert!(tree.alloc_aligned(usize::MAX - 100, 4096).is_none());
        let a = tree.alloc(64).unwrap().as_ptr();
        unsafe {
            assert!(tree.realloc(a, usize::MAX - 10).is_none());
            assert_eq!(tree.resize(a, usize::MAX - 10), 64);
            tree.free(a);
        }
        assert_eq!(tree.allocated_bytes(), 0);
    }

    #[test]
    fn test_aligned_alloc_grid() {
        let tree = engine();
        let mut live = Vec::new();
        for align_log2 in 4..=12 {
            let align = 1 << align_log2;
            for size in [1, 100, 600] {
                let ptr = tree.alloc_aligned(size, align).unwrap();
                assert_eq!(ptr.as_ptr() as usize % align, 0, "align {align} size {size}");
                live.push(ptr);
            }
        }
        for ptr in live {
            unsafe { tree.free(ptr.as_ptr()) };
        }
        tree.purge();
        assert_eq!(tree.capacity_bytes(), 0);
        assert_eq!(tree.allocated_bytes(), 0);
    }

    #[test]
    fn test_realloc_grows_in_place_into_next() {
        let tree = engine();
        let a = tree.alloc(64).unwrap().as_ptr();
        unsafe {
            a.write_bytes(0x77, 64);
            let grown = tree.realloc(a, 256).unwrap().as_ptr();
            assert_eq!(grown, a, "successor block was free and adjacent");
            for i in 0..64 {
                assert_eq!(grown.add(i).read(), 0x77);
            }
            tree.free(grown);
        }
    }

    #[test]
    fn test_realloc_moves_and_preserves_content() {
        let tree = engine();
        let a = tree.alloc(64).unwrap().as_ptr();
        let blocker = tree.alloc(64).unwrap().as_ptr();
        unsafe {
            for i in 0..64 {
                a.add(i).write(i as u8);
            }
            let moved = tree.realloc(a, 8192).unwrap().as_ptr();
            assert_ne!(moved, a);
            for i in 0..64 {
                assert_eq!(moved.add(i).read(), i as u8);
            }
            tree.free(moved);
            tree.free(blocker);
        }
    }

    #[test]
    fn test_realloc_shrink_reindexes_tail() {
        let tree = engine();
        let a = tree.alloc(512).unwrap().as_ptr();
        let free_before = tree.unused_memory();
        unsafe {
            let shrunk = tree.realloc(a, 64).unwrap().as_ptr();
            assert_eq!(shrunk, a);
            assert_eq!(tree.ptr_size(a), 64);
        }
        assert!(tree.unused_memory() > free_before);
        unsafe { tree.free(a) };
    }

    #[test]
    fn test_resize_never_moves() {
        let tree = engine();
        let a = tree.alloc(64).unwrap().as_ptr();
        let blocker = tree.alloc(64).unwrap().as_ptr();
        unsafe {
            // Successor is used: growth is denied, size stays.
            assert_eq!(tree.resize(a, 4096), 64);
            tree.free(blocker);
            // Successor free: in-place growth succeeds.
            assert!(tree.resize(a, 256) >= 256);
            assert!(tree.resize(a, 64) >= 64);
            tree.free(a);
        }
    }

    #[test]
    fn test_purge_is_idempotent() {
        let tree = engine();
        let a = tree.alloc(64).unwrap().as_ptr();
        unsafe { tree.free(a) };
        tree.purge();
        let capacity = tree.capacity_bytes();
        let unused = tree.unused_memory();
        tree.purge();
        assert_eq!(tree.capacity_bytes(), capacity);
        assert_eq!(tree.unused_memory(), unused);
    }

    #[test]
    fn test_fixed_mode_never_grows_or_purges() {
        let source = SystemRegions;
        let region = source.obtain(4 * PAGE, PAGE).unwrap();
        let tree = TreeEngine::new(Arc::new(SystemRegions), PAGE, PAGE, true);
        tree.add_fixed_region(region, 4 * PAGE);
        assert_eq!(tree.capacity_bytes(), 4 * PAGE);

        let a = tree.alloc(2048).unwrap();
        assert!(tree.alloc(64 * 1024).is_none(), "fixed block cannot grow");
        unsafe { tree.free(a.as_ptr()) };
        tree.purge();
        assert_eq!(tree.capacity_bytes(), 4 * PAGE, "fixed region is never released");

        drop(tree);
        source.release(region, 4 * PAGE, PAGE);
    }

    #[test]
    fn test_page_alloc_is_page_aligned_with_header_in_place() {
        let source = SystemRegions;
        let region = source.obtain(8 * PAGE, PAGE).unwrap();
        let tree = TreeEngine::new(Arc::new(SystemRegions), PAGE, PAGE, true);
        tree.add_fixed_region(region, 8 * PAGE);

        let page = tree.alloc_page().unwrap();
        assert_eq!(page.as_ptr() as usize % PAGE, 0);
        unsafe {
            let header = page.as_ptr().cast::<BlockHeader>();
            assert!(is_used(header));
            assert!(block_size(header) >= PAGE - BLOCK_HEADER_SIZE);
            // The bucket engine owns everything past the shadowed header.
            page.as_ptr().add(BLOCK_HEADER_SIZE).write_bytes(0xCD, PAGE - BLOCK_HEADER_SIZE);
            tree.free_page(page.as_ptr());
        }
        assert_eq!(tree.allocated_bytes(), 0);

        drop(tree);
        source.release(region, 8 * PAGE, PAGE);
    }

    #[test]
    fn test_unused_memory_tracks_free_blocks() {
        let tree = engine();
        assert_eq!(tree.unused_memory(), 0);
        let a = tree.alloc(64).unwrap().as_ptr();
        let unused = tree.unused_memory();
        assert_eq!(unused, PAGE - 3 * BLOCK_HEADER_SIZE - 64 - BLOCK_HEADER_SIZE);
        unsafe { tree.free(a) };
        assert_eq!(tree.unused_memory(), PAGE - 3 * BLOCK_HEADER_SIZE);
        tree.purge();
        assert_eq!(tree.unused_memory(), 0);
    }
}
