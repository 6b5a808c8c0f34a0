//! Memory and allocation value objects plus the shared allocator contract

mod allocator;
mod types;

pub use allocator::{AllocatorInfo, AllocatorRef, MemoryAllocator};
pub use types::{
    Allocation, AllocationFlags, AllocationMethod, AllocationRequest, Block, Memory, MemoryId,
    ResidencyState,
};
