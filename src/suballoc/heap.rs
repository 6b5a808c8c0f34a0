//! Device heap allocator
//!
//! The leaf of every stack: each request becomes one driver heap created
//! through the backend. New heaps register with the residency manager, and
//! with `always_in_budget` the manager pre-evicts before creation so the
//! process never exceeds its budget even transiently.

use crate::backend::{HeapKind, MemoryBackend, SegmentGroup};
use crate::error::AllocResult;
use crate::memory::{
    Allocation, AllocationMethod, AllocationRequest, AllocatorInfo, AllocatorRef, Memory,
    MemoryAllocator,
};
use crate::residency::ResidencyManager;
use crate::size_class::{align_to, is_aligned};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug)]
pub struct DeviceHeapAllocator {
    self_ref: Weak<DeviceHeapAllocator>,
    backend: Arc<dyn MemoryBackend>,
    residency: Option<Arc<ResidencyManager>>,
    segment: SegmentGroup,
    kind: HeapKind,
    heap_alignment: u64,
    always_in_budget: bool,
    info: Mutex<AllocatorInfo>,
}

impl DeviceHeapAllocator {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        residency: Option<Arc<ResidencyManager>>,
        kind: HeapKind,
        heap_alignment: u64,
        always_in_budget: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| DeviceHeapAllocator {
            self_ref: me.clone(),
            backend,
            residency,
            segment: kind.segment_group(),
            kind,
            heap_alignment,
            always_in_budget,
            info: Mutex::new(AllocatorInfo::default()),
        })
    }

    fn owner_ref(&self) -> AllocatorRef {
        let weak: Weak<dyn MemoryAllocator> = self.self_ref.clone();
        AllocatorRef::new(weak)
    }
}

impl MemoryAllocator for DeviceHeapAllocator {
    fn try_allocate(&self, request: &AllocationRequest) -> AllocResult<Option<Allocation>> {
        if request.flags.never_allocate || request.size == 0 {
            return Ok(None);
        }

        let size = align_to(request.size, self.heap_alignment);
        if !is_aligned(request.size, self.heap_alignment) {
            tracing::warn!(
                "heap size grew from {} to {} bytes to satisfy heap alignment {}",
                request.size,
                size,
                self.heap_alignment
            );
        }
        let alignment = request.alignment.max(self.heap_alignment);

        if self.always_in_budget {
            if let Some(residency) = &self.residency {
                residency.evict(size, self.segment)?;
            }
        }

        let handle = self
            .backend
            .create_memory(size, alignment, self.segment, self.kind)?;
        let memory = Arc::new(Memory::new(handle, size, alignment, self.segment, self.kind));

        if let Some(residency) = &self.residency {
            residency.insert(&memory)?;
        }

        {
            let mut info = self.info.lock()?;
            info.used_memory_count += 1;
            info.used_memory_bytes += size;
        }

        tracing::debug!(
            "heap: created memory {} ({} bytes, {:?}/{:?})",
            memory.id(),
            size,
            self.segment,
            self.kind
        );
        Ok(Some(Allocation::new(
            memory,
            0,
            size,
            AllocationMethod::Standalone,
            None,
            self.owner_ref(),
        )))
    }

    fn deallocate(&self, allocation: Allocation) {
        let memory = allocation.memory().clone();
        allocation.release_memory_ref();
        drop(allocation);

        if memory.sub_alloc_refs() != 0 {
            tracing::warn!(
                "heap: destroying memory {} with {} live sub-allocations",
                memory.id(),
                memory.sub_alloc_refs()
            );
        }

        if let Some(residency) = &self.residency {
            residency.untrack(&memory);
        }
        self.backend.destroy_memory(memory.handle());

        if let Ok(mut info) = self.info.lock() {
            info.used_memory_count = info.used_memory_count.saturating_sub(1);
            info.used_memory_bytes = info.used_memory_bytes.saturating_sub(memory.size());
        }
        tracing::debug!("heap: destroyed memory {}", memory.id());
    }

    fn release_memory(&self) {
        // Nothing pooled at the leaf.
    }

    fn query_info(&self) -> AllocatorInfo {
        self.info.lock().map(|info| *info).unwrap_or_default()
    }

    fn memory_alignment(&self) -> u64 {
        self.heap_alignment
    }
}
