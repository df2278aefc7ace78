//! Small-object bucket engine.
//!
//! Sixty-four size classes spaced linearly 8..=512 bytes, one bucket per
//! class. A bucket owns a doubly linked list of fixed-size pages, each
//! subdivided into equal slots threaded on a singly linked free list. The
//! list is kept partitioned: pages with at least one free slot stay near the
//! front, full pages sink to the back, so the allocation scan is O(1).
//!
//! The engine does not obtain memory itself. Callers hand `alloc` a growth
//! closure that produces one pool-page-aligned page; in fixed-block mode that
//! closure reaches into the tree engine, otherwise it goes to the region
//! source. The closure runs while the bucket lock is held, which fixes the
//! lock order at bucket before tree.

use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::tree::BLOCK_HEADER_SIZE;

/// Smallest slot size and rounding granularity.
pub const MIN_ALLOCATION: usize = 8;
const MIN_ALLOCATION_LOG2: usize = 3;
/// Largest size served by the bucket engine.
pub const MAX_SMALL_ALLOCATION: usize = 512;
/// Number of size classes.
pub(crate) const NUM_BUCKETS: usize = MAX_SMALL_ALLOCATION / MIN_ALLOCATION;

/// Size class for `size` (1..=512): linear spacing, rounded up to 8.
pub(crate) fn bucket_index(size: usize) -> usize {
    debug_assert!(size <= MAX_SMALL_ALLOCATION);
    ((size.max(1) + MIN_ALLOCATION - 1) >> MIN_ALLOCATION_LOG2) - 1
}

/// Slot size of size class `index`. Inverse of [`bucket_index`].
pub(crate) fn bucket_elem_size(index: usize) -> usize {
    debug_assert!(index < NUM_BUCKETS);
    (index + 1) << MIN_ALLOCATION_LOG2
}

/// A free slot reuses its own payload as the list link.
#[repr(C)]
struct FreeSlot {
    next: *mut FreeSlot,
}

/// Header at the base of every pool page.
///
/// `block_shadow` keeps the first 16 bytes untouched: pages carved out of the
/// tree engine in fixed-block mode still carry their tree block header there,
/// and it must survive until the page is handed back.
#[repr(C)]
struct PageHeader {
    block_shadow: [u8; BLOCK_HEADER_SIZE],
    prev: *mut PageHeader,
    next: *mut PageHeader,
    free_list: *mut FreeSlot,
    marker: usize,
    bucket_index: u16,
    elem_size: u16,
    used_count: u16,
}

const PAGE_HEADER_SIZE: usize = std::mem::size_of::<PageHeader>();

/// Intrusive page list with front/back reordering.
struct PageList {
    head: *mut PageHeader,
    tail: *mut PageHeader,
}

// SAFETY: the raw page pointers are only dereferenced by the bucket that owns
// this list, under that bucket's mutex.
unsafe impl Send for PageList {}

impl PageList {
    const fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
            tail: std::ptr::null_mut(),
        }
    }

    unsafe fn push_front(&mut self, page: *mut PageHeader) {
        // SAFETY: caller guarantees `page` is a live, unlinked page header.
        unsafe {
            (*page).prev = std::ptr::null_mut();
            (*page).next = self.head;
            if self.head.is_null() {
                self.tail = page;
            } else {
                (*self.head).prev = page;
            }
        }
        self.head = page;
    }

    unsafe fn push_back(&mut self, page: *mut PageHeader) {
        // SAFETY: caller guarantees `page` is a live, unlinked page header.
        unsafe {
            (*page).next = std::ptr::null_mut();
            (*page).prev = self.tail;
            if self.tail.is_null() {
                self.head = page;
            } else {
                (*self.tail).next = page;
            }
        }
        self.tail = page;
    }

    unsafe fn unlink(&mut self, page: *mut PageHeader) {
        // SAFETY: caller guarantees `page` is currently linked in this list.
        unsafe {
            if (*page).prev.is_null() {
                self.head = (*page).next;
            } else {
                (*(*page).prev).next = (*page).next;
            }
            if (*page).next.is_null() {
                self.tail = (*page).prev;
            } else {
                (*(*page).next).prev = (*page).prev;
            }
        }
    }

    unsafe fn move_to_front(&mut self, page: *mut PageHeader) {
        if self.head != page {
            // SAFETY: `page` is linked; unlink then relink keeps it live.
            unsafe {
                self.unlink(page);
                self.push_front(page);
            }
        }
    }

    unsafe fn move_to_back(&mut self, page: *mut PageHeader) {
        if self.tail != page {
            // SAFETY: `page` is linked; unlink then relink keeps it live.
            unsafe {
                self.unlink(page);
                self.push_back(page);
            }
        }
    }
}

struct Bucket {
    pages: Mutex<PageList>,
    /// Randomized per bucket; each page stores `marker ^ page_address`.
    marker: usize,
}

pub(crate) struct SmallEngine {
    buckets: Vec<Bucket>,
    pool_page_size: usize,
}

impl SmallEngine {
    pub(crate) fn new(pool_page_size: usize) -> Self {
        assert!(pool_page_size.is_power_of_two());
        assert!(
            pool_page_size >= PAGE_HEADER_SIZE + MAX_SMALL_ALLOCATION,
            "pool page size {pool_page_size} cannot host a 512-byte slot"
        );
        let mut state = marker_seed();
        let buckets = (0..NUM_BUCKETS)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                Bucket {
                    pages: Mutex::new(PageList::new()),
                    marker: state as usize,
                }
            })
            .collect();
        Self {
            buckets,
            pool_page_size,
        }
    }

    pub(crate) fn pool_page_size(&self) -> usize {
        self.pool_page_size
    }

    /// Pool-page base address containing `ptr`.
    pub(crate) fn page_base(&self, ptr: *const u8) -> usize {
        ptr as usize & !(self.pool_page_size - 1)
    }

    /// Marker cross-check for a pointer whose page base is already known to
    /// be a registered bucket page. Never call this on unverified addresses.
    pub(crate) fn marker_matches(&self, ptr: *const u8) -> bool {
        let page = self.page_base(ptr) as *const PageHeader;
        // SAFETY: caller has confirmed `page` is a live bucket page.
        let header = unsafe { &*page };
        let index = header.bucket_index as usize;
        index < NUM_BUCKETS && header.marker == (self.buckets[index].marker ^ page as usize)
    }

    /// Serve one slot from size class `index`. When every page is full,
    /// `grow` is called (under the bucket lock) for one new
    /// pool-page-aligned page of `pool_page_size` bytes.
    pub(crate) fn alloc(
        &self,
        index: usize,
        grow: impl FnOnce() -> Option<NonNull<u8>>,
    ) -> Option<NonNull<u8>> {
        let bucket = &self.buckets[index];
        let mut pages = bucket.pages.lock();

        let page = if !pages.head.is_null()
            // SAFETY: list heads are live page headers owned by this bucket.
            && !unsafe { (*pages.head).free_list }.is_null()
        {
            pages.head
        } else {
            let mem = grow()?;
            let page = unsafe { self.init_page(mem, index) };
            // SAFETY: freshly initialized page is unlinked.
            unsafe { pages.push_front(page) };
            page
        };

        // SAFETY: `page` is live, its free list is non-empty, and we hold the
        // bucket lock.
        let slot = unsafe {
            let header = &mut *page;
            let slot = header.free_list;
            header.free_list = (*slot).next;
            header.used_count += 1;
            if header.free_list.is_null() {
                pages.move_to_back(page);
            }
            slot
        };
        NonNull::new(slot.cast::<u8>())
    }

    /// Return a slot. The owning page is derived from the pointer address;
    /// the page's size class picks the bucket lock.
    ///
    /// # Safety
    /// `ptr` must be a slot previously returned by [`alloc`](Self::alloc)
    /// and not freed since.
    pub(crate) unsafe fn free(&self, ptr: *mut u8) {
        let page = self.page_base(ptr) as *mut PageHeader;
        // Size class is immutable for the life of the page.
        // SAFETY: per contract, `ptr` lies inside a live bucket page.
        let index = unsafe { (*page).bucket_index } as usize;
        debug_assert!(self.marker_matches(ptr));

        let bucket = &self.buckets[index];
        let mut pages = bucket.pages.lock();
        // SAFETY: page fields are guarded by the bucket lock we hold; the
        // slot is unused so its payload may become the list link.
        unsafe {
            let header = &mut *page;
            let was_full = header.free_list.is_null();
            let slot = ptr.cast::<FreeSlot>();
            (*slot).next = header.free_list;
            header.free_list = slot;
            debug_assert!(header.used_count > 0, "double free in bucket page");
            header.used_count -= 1;
            if was_full {
                pages.move_to_front(page);
            }
        }
    }

    /// Slot size backing `ptr`.
    ///
    /// # Safety
    /// `ptr` must point into a live bucket page.
    pub(crate) unsafe fn ptr_size(&self, ptr: *const u8) -> usize {
        let page = self.page_base(ptr) as *const PageHeader;
        // SAFETY: per contract the page header is live; elem_size is
        // immutable after page init.
        unsafe { (*page).elem_size as usize }
    }

    /// Largest slot size with a free slot available right now. The partition
    /// invariant puts any page with room at the head of its bucket's list.
    pub(crate) fn max_free_slot_size(&self) -> usize {
        for index in (0..NUM_BUCKETS).rev() {
            let pages = self.buckets[index].pages.lock();
            // SAFETY: list heads are live page headers owned by this bucket.
            if !pages.head.is_null() && !unsafe { (*pages.head).free_list }.is_null() {
                return bucket_elem_size(index);
            }
        }
        0
    }

    /// Sum of free slot bytes across partially used pages. The scan stops at
    /// the first full page per bucket; the partition invariant puts every
    /// page behind it in the full region too.
    pub(crate) fn unused_memory(&self) -> usize {
        let capacity = self.page_slot_capacity();
        let mut unused = 0;
        for bucket in &self.buckets {
            let pages = bucket.pages.lock();
            let mut cursor = pages.head;
            while !cursor.is_null() {
                // SAFETY: linked pages are live; we hold the bucket lock.
                let header = unsafe { &*cursor };
                if header.free_list.is_null() {
                    break;
                }
                let elem = header.elem_size as usize;
                let free = capacity / elem - header.used_count as usize;
                unused += free * elem;
                cursor = header.next;
            }
        }
        unused
    }

    /// Unlink and release every completely unused page. `release` receives
    /// page base addresses and runs outside the bucket locks.
    pub(crate) fn purge(&self, mut release: impl FnMut(NonNull<u8>)) {
        for bucket in &self.buckets {
            let mut reclaimed = Vec::new();
            {
                let mut pages = bucket.pages.lock();
                let mut cursor = pages.head;
                while !cursor.is_null() {
                    // SAFETY: linked pages are live; we hold the bucket lock.
                    let header = unsafe { &*cursor };
                    if header.free_list.is_null() {
                        break;
                    }
                    let next = header.next;
                    if header.used_count == 0 {
                        // SAFETY: `cursor` is linked in this list.
                        unsafe { pages.unlink(cursor) };
                        reclaimed.push(cursor as usize);
                    }
                    cursor = next;
                }
            }
            for page in reclaimed {
                if let Some(base) = NonNull::new(page as *mut u8) {
                    release(base);
                }
            }
        }
    }

    fn page_slot_capacity(&self) -> usize {
        self.pool_page_size - PAGE_HEADER_SIZE
    }

    /// Lay a page header over `mem` and thread the slot free list from the
    /// page end downwards. The first 16 bytes are left untouched.
    unsafe fn init_page(&self, mem: NonNull<u8>, index: usize) -> *mut PageHeader {
        let base = mem.as_ptr();
        debug_assert_eq!(base as usize & (self.pool_page_size - 1), 0);
        let elem = bucket_elem_size(index);
        let count = self.page_slot_capacity() / elem;
        debug_assert!(count > 0);

        let page = base.cast::<PageHeader>();
        // Field-by-field on purpose: a whole-struct write would clobber the
        // tree block header shadowed at the page base.
        // SAFETY: `mem` is `pool_page_size` writable bytes owned by us.
        unsafe {
            (*page).prev = std::ptr::null_mut();
            (*page).next = std::ptr::null_mut();
            (*page).marker = self.buckets[index].marker ^ page as usize;
            (*page).bucket_index = index as u16;
            (*page).elem_size = elem as u16;
            (*page).used_count = 0;

            let first = base.add(self.pool_page_size - count * elem);
            let mut head = std::ptr::null_mut::<FreeSlot>();
            for slot_index in (0..count).rev() {
                let slot = first.add(slot_index * elem).cast::<FreeSlot>();
                (*slot).next = head;
                head = slot;
            }
            (*page).free_list = head;
        }
        page
    }
}

fn marker_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0x9E3779B97F4A7C15)
}
