//! MemForge - GPU memory sub-allocation and residency engine
//!
//! Sits between a graphics API's raw heap creation calls and an application
//! making many device-memory requests. Instead of one driver heap per
//! request, requests are packed into shared heaps by a stack of composable
//! strategies (slab cache, virtual buddy, segmented pool, standalone), while
//! a residency manager keeps the working set inside a memory budget with
//! fence-safe LRU eviction.
//!
//! The driver itself stays behind the [`backend::MemoryBackend`] trait; a
//! host-memory implementation ships in-tree for tests and benchmarks.

pub mod allocator;
pub mod backend;
pub mod buddy;
pub mod error;
pub mod memory;
pub mod residency;
pub mod size_class;
pub mod suballoc;

pub use allocator::{AllocatorConfig, AllocatorFlags, AllocatorStats, DeviceAllocator};
pub use backend::{HeapKind, HostBackend, MemoryBackend, SegmentGroup};
pub use buddy::BuddyAllocator;
pub use error::{AllocResult, ErrorCategory, MemForgeError};
pub use memory::{
    Allocation, AllocationFlags, AllocationMethod, AllocationRequest, AllocatorInfo, Block,
    Memory, MemoryAllocator, MemoryId, ResidencyState,
};
pub use residency::{ResidencyManager, ResidencySet};
