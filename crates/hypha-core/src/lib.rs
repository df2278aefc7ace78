//! Hybrid pool/heap allocator.
//!
//! Small requests (up to 512 bytes) are served from per-size-class slot
//! pools; everything else comes from a best-fit free-block tree with
//! address-order coalescing. A dispatcher routes requests, classifies
//! incoming pointers by provenance, and keeps both engines safe to use from
//! any number of threads. The heap can grow on demand through a pluggable
//! [`RegionSource`], or run entirely inside one fixed memory block and never
//! touch the OS after construction.
//!
//! ```no_run
//! use hypha_core::{Heap, HeapConfig};
//!
//! let heap = Heap::new(HeapConfig::default())?;
//! let ptr = heap.allocate(100).ok_or(hypha_core::RegionError::Exhausted {
//!     size: 100,
//!     align: 8,
//! })?;
//! unsafe { heap.deallocate(ptr.as_ptr()) };
//! # Ok::<(), hypha_core::RegionError>(())
//! ```

pub mod config;
pub mod debug;
pub mod heap;
pub mod region;
mod small;
mod tree;

pub use config::{DEFAULT_PAGE_SIZE, FixedBlock, HeapConfig};
pub use debug::{AllocProbe, AllocSource, NoProbe, RecordingProbe};
pub use heap::Heap;
pub use region::{RegionError, RegionSource, SystemRegions};
pub use small::{MAX_SMALL_ALLOCATION, MIN_ALLOCATION};
