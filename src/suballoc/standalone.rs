//! Standalone allocator
//!
//! Degenerate strategy for requests that must not share memory: every
//! allocation owns a backing memory sized exactly to it, returned as a
//! full-extent range at offset zero.

use crate::error::AllocResult;
use crate::memory::{
    Allocation, AllocationRequest, AllocatorInfo, AllocatorRef, MemoryAllocator,
};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug)]
pub struct StandaloneAllocator {
    self_ref: Weak<StandaloneAllocator>,
    inner: Arc<dyn MemoryAllocator>,
    info: Mutex<AllocatorInfo>,
}

impl StandaloneAllocator {
    pub fn new(inner: Arc<dyn MemoryAllocator>) -> Arc<Self> {
        Arc::new_cyclic(|me| StandaloneAllocator {
            self_ref: me.clone(),
            inner,
            info: Mutex::new(AllocatorInfo::default()),
        })
    }

    fn owner_ref(&self) -> AllocatorRef {
        let weak: Weak<dyn MemoryAllocator> = self.self_ref.clone();
        AllocatorRef::new(weak)
    }
}

impl MemoryAllocator for StandaloneAllocator {
    fn try_allocate(&self, request: &AllocationRequest) -> AllocResult<Option<Allocation>> {
        let Some(allocation) = self.inner.try_allocate(request)? else {
            return Ok(None);
        };
        debug_assert_eq!(allocation.offset(), 0);

        {
            let mut info = self.info.lock()?;
            info.used_block_count += 1;
            info.used_block_bytes += allocation.size();
        }
        Ok(Some(allocation.reowned(self.owner_ref())))
    }

    fn deallocate(&self, allocation: Allocation) {
        if let Ok(mut info) = self.info.lock() {
            info.used_block_count = info.used_block_count.saturating_sub(1);
            info.used_block_bytes = info.used_block_bytes.saturating_sub(allocation.size());
        }
        self.inner.deallocate(allocation);
    }

    fn release_memory(&self) {
        self.inner.release_memory();
    }

    fn query_info(&self) -> AllocatorInfo {
        let mut info = self.inner.query_info();
        if let Ok(own) = self.info.lock() {
            info.used_block_count += own.used_block_count;
            info.used_block_bytes += own.used_block_bytes;
        }
        info
    }

    fn memory_alignment(&self) -> u64 {
        self.inner.memory_alignment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeapKind, HostBackend};
    use crate::memory::AllocationMethod;
    use crate::suballoc::heap::DeviceHeapAllocator;

    fn standalone_stack() -> (Arc<HostBackend>, Arc<StandaloneAllocator>) {
        let backend = Arc::new(HostBackend::new());
        let heap = DeviceHeapAllocator::new(
            backend.clone(),
            None,
            HeapKind::DeviceLocal,
            4096,
            false,
        );
        (backend.clone(), StandaloneAllocator::new(heap))
    }

    #[test]
    fn test_each_request_gets_own_memory() {
        let (backend, allocator) = standalone_stack();

        let a = allocator
            .try_allocate(&AllocationRequest::new(4096, 64))
            .unwrap()
            .unwrap();
        let b = allocator
            .try_allocate(&AllocationRequest::new(4096, 64))
            .unwrap()
            .unwrap();

        assert_ne!(a.memory().id(), b.memory().id());
        assert_eq!(a.offset(), 0);
        assert_eq!(a.method(), AllocationMethod::Standalone);
        assert_eq!(backend.stats().create_count, 2);

        let info = allocator.query_info();
        assert_eq!(info.used_block_count, 2);
        assert_eq!(info.used_memory_count, 2);

        allocator.deallocate(a);
        allocator.deallocate(b);
        assert_eq!(backend.stats().destroy_count, 2);
        assert_eq!(allocator.query_info().used_block_count, 0);
    }
}
