//! A fenced, checksummed first-fit heap allocator over a growable byte region.
//!
//! The allocator core never talks to the operating system directly: growing
//! and shrinking the managed region is delegated to a [`region::RegionProvider`],
//! which stands in for the real `brk`/`sbrk`-style primitive a host would
//! supply. Wiring a real provider to an OS break is out of scope for this
//! crate; [`region::TestRegion`] is the only implementation shipped, backing
//! this crate's own tests.
//!
//! Every user block is wrapped in a fixed-width [`block::Header`] and flanked
//! by two 4-byte red-zone fences; [`heap::Heap::validate`] walks the list and
//! reports structural corruption or a broken fence without ever panicking or
//! attempting to repair what it finds. [`heap::Heap::classify`] answers "what
//! is this pointer, relative to the heap's current layout" for any address,
//! not just ones the allocator itself produced.
//!
//! ```ignore
//! // `TestRegion` requires the `testing` feature; see the `tests/` directory
//! // for a runnable version of this example.
//! use guardheap::heap::Heap;
//! use guardheap::region::TestRegion;
//!
//! let mut heap = Heap::setup(TestRegion::with_capacity(1 << 20)).expect("setup");
//! let p = heap.allocate(64);
//! assert!(!p.is_null());
//! heap.free(p);
//! ```

#![no_std]

extern crate alloc;

pub mod block;
pub mod diagnostics;
pub mod error;
pub mod free_list;
pub mod heap;
pub mod integrity;
pub mod region;

pub use diagnostics::{HeapStatus, PointerClass};
pub use error::RegionError;
pub use heap::Heap;
pub use region::RegionProvider;
