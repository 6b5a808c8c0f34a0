//! Segmented memory pool
//!
//! Recycles whole backing memories instead of destroying them. Released
//! memories are pushed onto a per-size segment and handed back LIFO, so the
//! most recently used heap (warmest in the driver) is reused first. The pool
//! never sub-allocates.

use crate::error::AllocResult;
use crate::memory::{
    Allocation, AllocationRequest, AllocatorInfo, AllocatorRef, MemoryAllocator,
};
use crate::size_class::align_to;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Default)]
struct PoolState {
    /// Size segment -> LIFO stack of recycled memories
    segments: BTreeMap<u64, Vec<Allocation>>,
    free_bytes: u64,
}

#[derive(Debug)]
pub struct SegmentedPoolAllocator {
    self_ref: Weak<SegmentedPoolAllocator>,
    inner: Arc<dyn MemoryAllocator>,
    /// Granularity for size segments, usually the heap alignment
    pool_alignment: u64,
    /// Per-segment cap; the oldest entry is released when exceeded
    max_entries_per_segment: Option<usize>,
    state: Mutex<PoolState>,
}

impl SegmentedPoolAllocator {
    pub fn new(
        inner: Arc<dyn MemoryAllocator>,
        pool_alignment: u64,
        max_entries_per_segment: Option<usize>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| SegmentedPoolAllocator {
            self_ref: me.clone(),
            inner,
            pool_alignment: pool_alignment.max(1),
            max_entries_per_segment,
            state: Mutex::new(PoolState::default()),
        })
    }

    fn owner_ref(&self) -> AllocatorRef {
        let weak: Weak<dyn MemoryAllocator> = self.self_ref.clone();
        AllocatorRef::new(weak)
    }

    /// Number of memories currently pooled
    pub fn pooled_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.segments.values().map(|v| v.len()).sum())
            .unwrap_or(0)
    }
}

impl MemoryAllocator for SegmentedPoolAllocator {
    fn try_allocate(&self, request: &AllocationRequest) -> AllocResult<Option<Allocation>> {
        let segment_size = align_to(request.size, self.pool_alignment);

        {
            let mut state = self.state.lock()?;
            if let Some(list) = state.segments.get_mut(&segment_size) {
                // Most entries share the pool alignment; scan back to front
                // for one that also satisfies a stricter request.
                if let Some(position) = list
                    .iter()
                    .rposition(|a| a.memory().alignment() >= request.alignment)
                {
                    let allocation = list.remove(position);
                    state.free_bytes = state.free_bytes.saturating_sub(allocation.size());
                    tracing::trace!(
                        "pool: reused {} byte memory {}",
                        allocation.size(),
                        allocation.memory().id()
                    );
                    return Ok(Some(allocation.reowned(self.owner_ref())));
                }
            }
        }

        let inner_request = AllocationRequest {
            size: segment_size,
            alignment: request.alignment.max(self.pool_alignment),
            flags: request.flags,
        };
        match self.inner.try_allocate(&inner_request)? {
            Some(allocation) => Ok(Some(allocation.reowned(self.owner_ref()))),
            None => Ok(None),
        }
    }

    fn deallocate(&self, allocation: Allocation) {
        let evicted = {
            let Ok(mut state) = self.state.lock() else {
                tracing::error!("pool: state lock poisoned, releasing memory directly");
                self.inner.deallocate(allocation);
                return;
            };

            let segment_size = allocation.size();
            state.free_bytes += segment_size;
            let list = state.segments.entry(segment_size).or_default();
            list.push(allocation);

            match self.max_entries_per_segment {
                Some(cap) if list.len() > cap => {
                    // LIFO pool: the front is the coldest entry.
                    let oldest = list.remove(0);
                    state.free_bytes = state.free_bytes.saturating_sub(oldest.size());
                    Some(oldest)
                }
                _ => None,
            }
        };

        if let Some(oldest) = evicted {
            tracing::trace!("pool: segment over capacity, releasing oldest memory");
            self.inner.deallocate(oldest);
        }
    }

    fn release_memory(&self) {
        let drained = {
            let Ok(mut state) = self.state.lock() else {
                tracing::error!("pool: state lock poisoned in release_memory");
                return;
            };

            let mut drained = Vec::new();
            for list in state.segments.values_mut() {
                // Memories pinned by the residency manager stay pooled.
                let mut kept = Vec::new();
                for allocation in list.drain(..) {
                    if allocation.memory().lock_count() > 0 {
                        kept.push(allocation);
                    } else {
                        drained.push(allocation);
                    }
                }
                *list = kept;
            }
            state.segments.retain(|_, list| !list.is_empty());
            state.free_bytes = state
                .segments
                .values()
                .flatten()
                .map(|a| a.size())
                .sum();
            drained
        };

        for allocation in drained {
            self.inner.deallocate(allocation);
        }
        self.inner.release_memory();
    }

    fn query_info(&self) -> AllocatorInfo {
        let mut info = self.inner.query_info();
        if let Ok(state) = self.state.lock() {
            info.free_memory_bytes += state.free_bytes;
        }
        info
    }

    fn memory_size(&self) -> Option<u64> {
        self.inner.memory_size()
    }

    fn memory_alignment(&self) -> u64 {
        self.pool_alignment
    }
}

impl Drop for SegmentedPoolAllocator {
    fn drop(&mut self) {
        // Return pooled memories to the inner allocator so backing heaps
        // are destroyed rather than leaked.
        let drained: Vec<Allocation> = match self.state.lock() {
            Ok(mut state) => {
                state.free_bytes = 0;
                state.segments.values_mut().flat_map(|l| l.drain(..)).collect()
            }
            Err(_) => return,
        };
        for allocation in drained {
            self.inner.deallocate(allocation);
        }
    }
}
