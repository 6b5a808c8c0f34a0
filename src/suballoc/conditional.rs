//! Conditional allocator
//!
//! Dispatches between two inner allocators on a size threshold: requests at
//! or below the threshold take the fast sub-allocating path, larger ones the
//! fallback. Deallocation follows the owner recorded on the allocation, so
//! no size bookkeeping is needed on release.

use crate::error::AllocResult;
use crate::memory::{
    Allocation, AllocationRequest, AllocatorInfo, MemoryAllocator,
};
use std::sync::Arc;

#[derive(Debug)]
pub struct ConditionalAllocator {
    small: Arc<dyn MemoryAllocator>,
    large: Arc<dyn MemoryAllocator>,
    threshold: u64,
}

impl ConditionalAllocator {
    pub fn new(
        small: Arc<dyn MemoryAllocator>,
        large: Arc<dyn MemoryAllocator>,
        threshold: u64,
    ) -> Arc<Self> {
        Arc::new(ConditionalAllocator {
            small,
            large,
            threshold,
        })
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }
}

impl MemoryAllocator for ConditionalAllocator {
    fn try_allocate(&self, request: &AllocationRequest) -> AllocResult<Option<Allocation>> {
        if request.size <= self.threshold {
            self.small.try_allocate(request)
        } else {
            self.large.try_allocate(request)
        }
    }

    fn deallocate(&self, allocation: Allocation) {
        match allocation.owner().upgrade() {
            Some(owner) => owner.deallocate(allocation),
            None => {
                tracing::warn!("conditional: owner gone, dropping allocation untracked");
            }
        }
    }

    fn release_memory(&self) {
        self.small.release_memory();
        self.large.release_memory();
    }

    fn query_info(&self) -> AllocatorInfo {
        let mut info = self.small.query_info();
        info.accumulate(&self.large.query_info());
        info
    }

    fn memory_alignment(&self) -> u64 {
        self.small.memory_alignment().max(self.large.memory_alignment())
    }
}
