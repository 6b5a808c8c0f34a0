//! Composable sub-allocation strategies
//!
//! Each allocator here implements [`crate::memory::MemoryAllocator`] and
//! wraps an inner allocator, so stacks are built by nesting: a slab cache
//! over a virtual buddy over a pool over the device heap leaf.

pub mod conditional;
pub mod heap;
pub mod pool;
pub mod slab;
pub mod standalone;
pub mod virtual_buddy;

pub use conditional::ConditionalAllocator;
pub use heap::DeviceHeapAllocator;
pub use pool::SegmentedPoolAllocator;
pub use slab::SlabCacheAllocator;
pub use standalone::StandaloneAllocator;
pub use virtual_buddy::VirtualBuddyAllocator;
