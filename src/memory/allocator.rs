//! The allocator contract shared by every layer of a stack

use crate::error::AllocResult;
use crate::memory::types::{Allocation, AllocationRequest};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Weak};

/// Usage counters reported by [`MemoryAllocator::query_info`]
///
/// Block counters track bytes actually handed out to callers; memory
/// counters track live backing heaps; `free_memory_bytes` is memory retained
/// by pools and caches awaiting reuse. Chained allocators fold their inner
/// allocator's counters into their own, so querying the head of a stack
/// covers the whole stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorInfo {
    /// Number of live sub-allocated blocks
    pub used_block_count: u64,
    /// Bytes handed out in live blocks
    pub used_block_bytes: u64,
    /// Number of live backing memories
    pub used_memory_count: u64,
    /// Bytes in live backing memories
    pub used_memory_bytes: u64,
    /// Bytes pooled or cached, awaiting reuse
    pub free_memory_bytes: u64,
}

impl AllocatorInfo {
    /// Fold another info into this one
    pub fn accumulate(&mut self, other: &AllocatorInfo) {
        self.used_block_count += other.used_block_count;
        self.used_block_bytes += other.used_block_bytes;
        self.used_memory_count += other.used_memory_count;
        self.used_memory_bytes += other.used_memory_bytes;
        self.free_memory_bytes += other.free_memory_bytes;
    }
}

/// Contract implemented by every allocator in a stack
///
/// Allocators are shared behind `Arc` and internally synchronized. The
/// `Ok(None)` return from `try_allocate` means "cannot serve this request,
/// try the next strategy"; hard failures are `Err`.
pub trait MemoryAllocator: Send + Sync + fmt::Debug {
    /// Attempt to serve a request
    fn try_allocate(&self, request: &AllocationRequest) -> AllocResult<Option<Allocation>>;

    /// Release an allocation previously produced by this allocator
    ///
    /// Never fails. The allocation is consumed, so a double release is
    /// unrepresentable; internal faults are logged and swallowed.
    fn deallocate(&self, allocation: Allocation);

    /// Drop pooled or cached memory not currently referenced
    fn release_memory(&self);

    /// Usage counters for this allocator and everything below it
    fn query_info(&self) -> AllocatorInfo;

    /// Fixed backing-memory size, when this allocator has one
    ///
    /// Callers use this to reject oversized requests up front instead of
    /// churning create-then-release cycles.
    fn memory_size(&self) -> Option<u64> {
        None
    }

    /// Alignment of backing memories produced below this allocator
    fn memory_alignment(&self) -> u64 {
        1
    }
}

/// Weak reference to the allocator that produced an allocation
///
/// Weak so that pooled allocations never keep their allocator alive in a
/// cycle. If the allocator is gone by release time the allocation is dropped
/// with a warning instead of panicking.
#[derive(Clone)]
pub struct AllocatorRef {
    inner: Weak<dyn MemoryAllocator>,
}

impl AllocatorRef {
    pub(crate) fn new(inner: Weak<dyn MemoryAllocator>) -> Self {
        AllocatorRef { inner }
    }

    /// A reference pointing at no allocator, for tests and placeholders
    pub(crate) fn detached() -> Self {
        let arc: Arc<dyn MemoryAllocator> = Arc::new(NullAllocator);
        let weak = Arc::downgrade(&arc);
        drop(arc);
        AllocatorRef { inner: weak }
    }

    pub fn upgrade(&self) -> Option<Arc<dyn MemoryAllocator>> {
        self.inner.upgrade()
    }
}

impl fmt::Debug for AllocatorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.upgrade() {
            Some(_) => write!(f, "AllocatorRef(live)"),
            None => write!(f, "AllocatorRef(dead)"),
        }
    }
}

/// Allocator that serves nothing, backing detached references
#[derive(Debug)]
struct NullAllocator;

impl MemoryAllocator for NullAllocator {
    fn try_allocate(&self, _request: &AllocationRequest) -> AllocResult<Option<Allocation>> {
        Ok(None)
    }

    fn deallocate(&self, _allocation: Allocation) {}

    fn release_memory(&self) {}

    fn query_info(&self) -> AllocatorInfo {
        AllocatorInfo::default()
    }
}
