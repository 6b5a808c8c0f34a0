//! Slab cache allocator
//!
//! Serves bounded-size requests from slabs: backing memories partitioned
//! into equal power-of-two blocks. Each (block size, alignment) class keeps
//! a partial list (slabs with free blocks) and a full set; allocation pops a
//! block from the front partial slab and creates a new slab only when the
//! class has none. Requests whose internal fragmentation would exceed the
//! configured limit fall through to the inner allocator untouched.

use crate::error::{AllocResult, MemForgeError};
use crate::memory::{
    Allocation, AllocationMethod, AllocationRequest, AllocatorInfo, AllocatorRef, Block,
    MemoryAllocator, MemoryId,
};
use crate::size_class::{is_power_of_two, next_power_of_two};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

/// (block size, alignment) pair identifying one slab class
type ClassKey = (u64, u64);

#[derive(Debug)]
struct Slab {
    backing: Allocation,
    /// LIFO stack of free block indices
    free_blocks: Vec<u32>,
    used_count: u32,
}

#[derive(Debug)]
struct SlabClass {
    block_size: u64,
    blocks_per_slab: u32,
    slabs: Vec<Option<Slab>>,
    free_slots: Vec<usize>,
    /// Slabs with at least one free block, front served first
    partial: VecDeque<usize>,
    full: HashSet<usize>,
    /// Keep the last slab alive when it empties instead of releasing it
    retain_on_empty: bool,
}

impl SlabClass {
    fn new(block_size: u64, blocks_per_slab: u32) -> Self {
        SlabClass {
            block_size,
            blocks_per_slab,
            slabs: Vec::new(),
            free_slots: Vec::new(),
            partial: VecDeque::new(),
            full: HashSet::new(),
            retain_on_empty: false,
        }
    }

    fn insert_slab(&mut self, slab: Slab) -> usize {
        match self.free_slots.pop() {
            Some(slot) => {
                self.slabs[slot] = Some(slab);
                slot
            }
            None => {
                self.slabs.push(Some(slab));
                self.slabs.len() - 1
            }
        }
    }

    fn empty_slab_count(&self) -> usize {
        self.slabs
            .iter()
            .flatten()
            .filter(|slab| slab.used_count == 0)
            .count()
    }
}

#[derive(Debug, Default)]
struct CacheState {
    classes: HashMap<ClassKey, SlabClass>,
    /// (memory id, slab base offset) -> slab location, for deallocation
    locations: HashMap<(MemoryId, u64), (ClassKey, usize)>,
    info: AllocatorInfo,
}

#[derive(Debug)]
pub struct SlabCacheAllocator {
    self_ref: Weak<SlabCacheAllocator>,
    min_block_size: u64,
    max_slab_size: u64,
    slab_size: u64,
    slab_alignment: u64,
    fragmentation_limit: f64,
    prefetch_enabled: bool,
    inner: Arc<dyn MemoryAllocator>,
    state: Mutex<CacheState>,
}

impl SlabCacheAllocator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        min_block_size: u64,
        max_slab_size: u64,
        slab_size: u64,
        slab_alignment: u64,
        fragmentation_limit: f64,
        prefetch_enabled: bool,
        inner: Arc<dyn MemoryAllocator>,
    ) -> AllocResult<Arc<Self>> {
        if !is_power_of_two(min_block_size) || !is_power_of_two(slab_size) {
            return Err(MemForgeError::InvalidArgument(format!(
                "slab sizes must be powers of two: min block {}, slab {}",
                min_block_size, slab_size
            )));
        }
        if slab_size > max_slab_size {
            return Err(MemForgeError::InvalidArgument(format!(
                "slab size {} exceeds maximum {}",
                slab_size, max_slab_size
            )));
        }
        if !(0.0..1.0).contains(&fragmentation_limit) {
            return Err(MemForgeError::InvalidArgument(format!(
                "fragmentation limit {} outside [0, 1)",
                fragmentation_limit
            )));
        }

        Ok(Arc::new_cyclic(|me| SlabCacheAllocator {
            self_ref: me.clone(),
            min_block_size,
            max_slab_size,
            slab_size,
            slab_alignment,
            fragmentation_limit,
            prefetch_enabled,
            inner,
            state: Mutex::new(CacheState::default()),
        }))
    }

    fn owner_ref(&self) -> AllocatorRef {
        let weak: Weak<dyn MemoryAllocator> = self.self_ref.clone();
        AllocatorRef::new(weak)
    }

    fn class_block_size(&self, request: &AllocationRequest) -> u64 {
        next_power_of_two(
            request
                .size
                .max(self.min_block_size)
                .max(request.alignment),
        )
    }

    /// Create one slab for `key` and link it as partial, returning its index
    fn grow_class(
        &self,
        state: &mut CacheState,
        key: ClassKey,
        alignment: u64,
    ) -> AllocResult<Option<usize>> {
        let inner_request =
            AllocationRequest::new(self.slab_size, self.slab_alignment.max(alignment));
        let Some(backing) = self.inner.try_allocate(&inner_request)? else {
            return Ok(None);
        };

        let class = state
            .classes
            .get_mut(&key)
            .expect("class created before growing");
        let blocks_per_slab = class.blocks_per_slab;
        let location = (backing.memory().id(), backing.offset());
        let slab = Slab {
            backing,
            // Stack order makes block 0 pop first
            free_blocks: (0..blocks_per_slab).rev().collect(),
            used_count: 0,
        };
        let slab_idx = class.insert_slab(slab);
        class.partial.push_front(slab_idx);
        state.locations.insert(location, (key, slab_idx));
        tracing::trace!(
            "slab: grew class ({} B, align {}) with slab {}",
            key.0,
            key.1,
            slab_idx
        );
        Ok(Some(slab_idx))
    }

    /// Number of slab classes currently tracked, for diagnostics
    pub fn class_count(&self) -> usize {
        self.state.lock().map(|s| s.classes.len()).unwrap_or(0)
    }

    /// Number of live slabs across all classes, for diagnostics
    pub fn slab_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| {
                s.classes
                    .values()
                    .map(|c| c.slabs.iter().flatten().count())
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Check per-class block accounting, for tests
    ///
    /// For every class, free blocks plus used blocks must equal slab count
    /// times blocks per slab.
    pub fn check_invariants(&self) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        state.classes.values().all(|class| {
            let slabs: Vec<&Slab> = class.slabs.iter().flatten().collect();
            let free: u32 = slabs.iter().map(|s| s.free_blocks.len() as u32).sum();
            let used: u32 = slabs.iter().map(|s| s.used_count).sum();
            free + used == slabs.len() as u32 * class.blocks_per_slab
        })
    }
}

impl MemoryAllocator for SlabCacheAllocator {
    fn try_allocate(&self, request: &AllocationRequest) -> AllocResult<Option<Allocation>> {
        if request.size == 0 {
            return Ok(None);
        }

        let block_size = self.class_block_size(request);

        // Requests the slab geometry cannot hold go straight down.
        if block_size > self.slab_size || block_size > self.max_slab_size {
            return self.inner.try_allocate(request);
        }

        // Rounding to the class would waste more than the allowed fraction.
        let usage = request.size as f64 / block_size as f64;
        if usage < 1.0 - self.fragmentation_limit {
            tracing::trace!(
                "slab: fragmentation {:.2} over limit for {} byte request, falling through",
                1.0 - usage,
                request.size
            );
            return self.inner.try_allocate(request);
        }

        let key: ClassKey = (block_size, request.alignment);
        let mut guard = self.state.lock()?;
        let state = &mut *guard;

        let class = state
            .classes
            .entry(key)
            .or_insert_with(|| {
                SlabClass::new(block_size, (self.slab_size / block_size) as u32)
            });
        if request.flags.cache_size {
            class.retain_on_empty = true;
        }

        let slab_idx = match class.partial.front().copied() {
            Some(idx) => idx,
            None => {
                if request.flags.never_allocate {
                    return Ok(None);
                }
                match self.grow_class(state, key, request.alignment)? {
                    Some(idx) => idx,
                    None => return Ok(None),
                }
            }
        };

        let class = state
            .classes
            .get_mut(&key)
            .expect("class exists for served request");
        let slab = class.slabs[slab_idx]
            .as_mut()
            .expect("partial list holds live slabs");
        let block_index = slab
            .free_blocks
            .pop()
            .expect("partial slab has a free block");
        slab.used_count += 1;
        let became_full = slab.free_blocks.is_empty();
        let base_offset = slab.backing.offset();
        let memory = slab.backing.memory().clone();

        if became_full {
            let front = class.partial.pop_front();
            debug_assert_eq!(front, Some(slab_idx));
            class.full.insert(slab_idx);
        }

        state.info.used_block_count += 1;
        state.info.used_block_bytes += block_size;

        // Keep one spare slab queued when asked to stay ahead of demand.
        if request.flags.prefetch_memory
            && self.prefetch_enabled
            && !request.flags.never_allocate
            && state
                .classes
                .get(&key)
                .map(|c| c.partial.is_empty())
                .unwrap_or(false)
        {
            match self.grow_class(state, key, request.alignment) {
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("slab: prefetch failed: {}", err);
                }
            }
        }

        let offset = base_offset + block_index as u64 * block_size;
        Ok(Some(Allocation::new(
            memory,
            offset,
            block_size,
            AllocationMethod::SubAllocated,
            Some(Block {
                offset: block_index as u64 * block_size,
                size: block_size,
            }),
            self.owner_ref(),
        )))
    }

    fn deallocate(&self, allocation: Allocation) {
        let Some(block) = allocation.block() else {
            tracing::error!("slab: allocation without block record");
            return;
        };

        let released = {
            let Ok(mut guard) = self.state.lock() else {
                tracing::error!("slab: state lock poisoned in deallocate");
                return;
            };
            let state = &mut *guard;

            let base_offset = allocation.offset() - block.offset;
            let location = (allocation.memory().id(), base_offset);
            let Some(&(key, slab_idx)) = state.locations.get(&location) else {
                tracing::error!(
                    "slab: deallocate for unknown slab at memory {} offset {}",
                    allocation.memory().id(),
                    base_offset
                );
                return;
            };

            let class = state
                .classes
                .get_mut(&key)
                .expect("location map points at live class");
            let slab = class.slabs[slab_idx]
                .as_mut()
                .expect("location map points at live slab");

            slab.free_blocks.push((block.offset / class.block_size) as u32);
            slab.used_count -= 1;
            let now_empty = slab.used_count == 0;

            if class.full.remove(&slab_idx) {
                class.partial.push_back(slab_idx);
            }

            state.info.used_block_count = state.info.used_block_count.saturating_sub(1);
            state.info.used_block_bytes =
                state.info.used_block_bytes.saturating_sub(block.size);

            if now_empty && !class.retain_on_empty {
                class.partial.retain(|&i| i != slab_idx);
                class.free_slots.push(slab_idx);
                let slab = class.slabs[slab_idx].take();
                state.locations.remove(&location);
                slab.map(|s| s.backing)
            } else {
                None
            }
        };

        allocation.release_memory_ref();
        if let Some(backing) = released {
            self.inner.deallocate(backing);
        }
    }

    fn release_memory(&self) {
        let released = {
            let Ok(mut guard) = self.state.lock() else {
                tracing::error!("slab: state lock poisoned in release_memory");
                return;
            };
            let state = &mut *guard;

            let mut released = Vec::new();
            for class in state.classes.values_mut() {
                for slab_idx in 0..class.slabs.len() {
                    let empty_and_unlocked = class.slabs[slab_idx]
                        .as_ref()
                        .map(|slab| {
                            slab.used_count == 0 && slab.backing.memory().lock_count() == 0
                        })
                        .unwrap_or(false);
                    if !empty_and_unlocked {
                        continue;
                    }

                    class.partial.retain(|&i| i != slab_idx);
                    class.free_slots.push(slab_idx);
                    if let Some(slab) = class.slabs[slab_idx].take() {
                        state
                            .locations
                            .remove(&(slab.backing.memory().id(), slab.backing.offset()));
                        released.push(slab.backing);
                    }
                }
            }
            released
        };

        for backing in released {
            self.inner.deallocate(backing);
        }
        self.inner.release_memory();
    }

    fn query_info(&self) -> AllocatorInfo {
        let mut info = self.inner.query_info();
        if let Ok(state) = self.state.lock() {
            info.used_block_count += state.info.used_block_count;
            info.used_block_bytes += state.info.used_block_bytes;
            let empty_slabs: usize = state
                .classes
                .values()
                .map(|c| c.empty_slab_count())
                .sum();
            info.free_memory_bytes += empty_slabs as u64 * self.slab_size;
        }
        info
    }

    fn memory_alignment(&self) -> u64 {
        self.slab_alignment
    }
}

impl Drop for SlabCacheAllocator {
    fn drop(&mut self) {
        let released = match self.state.lock() {
            Ok(mut guard) => {
                let state = &mut *guard;
                if state.info.used_block_count != 0 {
                    tracing::warn!(
                        "slab cache dropped with {} live blocks",
                        state.info.used_block_count
                    );
                }
                state.locations.clear();
                let mut released = Vec::new();
                for class in state.classes.values_mut() {
                    for slab in class.slabs.iter_mut() {
                        if let Some(slab) = slab.take() {
                            released.push(slab.backing);
                        }
                    }
                }
                released
            }
            Err(_) => return,
        };
        for backing in released {
            self.inner.deallocate(backing);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeapKind, HostBackend};
    use crate::memory::AllocationFlags;
    use crate::suballoc::heap::DeviceHeapAllocator;

    const SLAB_SIZE: u64 = 65536;

    fn slab_stack(
        fragmentation_limit: f64,
        prefetch: bool,
    ) -> (Arc<HostBackend>, Arc<SlabCacheAllocator>) {
        let backend = Arc::new(HostBackend::new());
        let heap =
            DeviceHeapAllocator::new(backend.clone(), None, HeapKind::DeviceLocal, 1, false);
        let cache = SlabCacheAllocator::new(
            256,
            1 << 26,
            SLAB_SIZE,
            SLAB_SIZE,
            fragmentation_limit,
            prefetch,
            heap,
        )
        .unwrap();
        (backend, cache)
    }

    #[test]
    fn test_invalid_construction() {
        let backend = Arc::new(HostBackend::new());
        let heap =
            DeviceHeapAllocator::new(backend.clone(), None, HeapKind::DeviceLocal, 1, false);
        assert!(
            SlabCacheAllocator::new(100, 1 << 20, 65536, 65536, 0.25, false, heap.clone())
                .is_err()
        );
        assert!(
            SlabCacheAllocator::new(256, 1024, 65536, 65536, 0.25, false, heap.clone()).is_err()
        );
        assert!(
            SlabCacheAllocator::new(256, 1 << 20, 65536, 65536, 1.5, false, heap).is_err()
        );
    }

    #[test]
    fn test_blocks_share_one_slab() {
        let (backend, cache) = slab_stack(0.25, false);

        let a = cache
            .try_allocate(&AllocationRequest::new(1024, 1))
            .unwrap()
            .unwrap();
        let b = cache
            .try_allocate(&AllocationRequest::new(1024, 1))
            .unwrap()
            .unwrap();

        assert_eq!(a.memory().id(), b.memory().id());
        assert_eq!(backend.stats().create_count, 1);
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 1024);
        assert!(cache.check_invariants());

        cache.deallocate(a);
        cache.deallocate(b);
        // Last block freed releases the slab memory
        assert_eq!(backend.stats().destroy_count, 1);
        assert_eq!(cache.slab_count(), 0);
        assert!(cache.check_invariants());
    }

    #[test]
    fn test_size_rounds_to_class() {
        let (_backend, cache) = slab_stack(0.25, false);

        let a = cache
            .try_allocate(&AllocationRequest::new(900, 1))
            .unwrap()
            .unwrap();
        // 900 rounds to the 1024 class (fragmentation 0.12 under the limit)
        assert_eq!(a.size(), 1024);
        cache.deallocate(a);
    }

    #[test]
    fn test_fragmentation_limit_falls_through() {
        let (backend, cache) = slab_stack(0.25, false);

        // 40000 / 65536 = 0.61 usage, worse than the 0.75 floor
        let a = cache
            .try_allocate(&AllocationRequest::new(40000, 1))
            .unwrap()
            .unwrap();

        // Served by the inner heap directly, not from a slab
        assert_eq!(cache.slab_count(), 0);
        assert_eq!(backend.stats().create_count, 1);
        assert_eq!(a.size(), 40000);
        assert!(a.block().is_none());

        // The inner allocator recorded itself as owner
        let owner = a.owner().upgrade().unwrap();
        owner.deallocate(a);
        assert_eq!(backend.stats().destroy_count, 1);
    }

    #[test]
    fn test_slab_fills_then_grows() {
        let (backend, cache) = slab_stack(0.25, false);
        let blocks_per_slab = (SLAB_SIZE / 4096) as usize;

        let mut allocations = Vec::new();
        for _ in 0..blocks_per_slab {
            allocations.push(
                cache
                    .try_allocate(&AllocationRequest::new(4096, 1))
                    .unwrap()
                    .unwrap(),
            );
        }
        assert_eq!(backend.stats().create_count, 1);
        assert_eq!(cache.slab_count(), 1);

        // One more block forces a second slab
        allocations.push(
            cache
                .try_allocate(&AllocationRequest::new(4096, 1))
                .unwrap()
                .unwrap(),
        );
        assert_eq!(backend.stats().create_count, 2);
        assert_eq!(cache.slab_count(), 2);
        assert!(cache.check_invariants());

        for allocation in allocations {
            cache.deallocate(allocation);
        }
        assert_eq!(cache.slab_count(), 0);
    }

    #[test]
    fn test_full_slab_returns_to_partial() {
        let (_backend, cache) = slab_stack(0.25, false);
        let blocks_per_slab = (SLAB_SIZE / 32768) as usize;
        assert_eq!(blocks_per_slab, 2);

        let a = cache
            .try_allocate(&AllocationRequest::new(32768, 1))
            .unwrap()
            .unwrap();
        let b = cache
            .try_allocate(&AllocationRequest::new(32768, 1))
            .unwrap()
            .unwrap();

        // Slab is full; freeing one block must make it partial again
        cache.deallocate(a);
        let c = cache
            .try_allocate(&AllocationRequest::new(32768, 1))
            .unwrap()
            .unwrap();
        assert_eq!(c.memory().id(), b.memory().id());
        assert_eq!(cache.slab_count(), 1);

        cache.deallocate(b);
        cache.deallocate(c);
    }

    #[test]
    fn test_never_allocate_with_warm_slab() {
        let (backend, cache) = slab_stack(0.25, false);

        let flags = AllocationFlags {
            never_allocate: true,
            ..Default::default()
        };
        let request = AllocationRequest::new(1024, 1).with_flags(flags);
        assert!(cache.try_allocate(&request).unwrap().is_none());
        assert_eq!(backend.stats().create_count, 0);

        // Warm the class, free the block while retaining the slab
        let retain = AllocationFlags {
            cache_size: true,
            ..Default::default()
        };
        let a = cache
            .try_allocate(&AllocationRequest::new(1024, 1).with_flags(retain))
            .unwrap()
            .unwrap();
        cache.deallocate(a);
        assert_eq!(cache.slab_count(), 1);
        assert_eq!(backend.stats().destroy_count, 0);

        // The warm slab now serves never_allocate requests
        let b = cache.try_allocate(&request).unwrap().unwrap();
        assert_eq!(backend.stats().create_count, 1);
        cache.deallocate(b);
    }

    #[test]
    fn test_cache_size_retains_empty_slab() {
        let (backend, cache) = slab_stack(0.25, false);

        let flags = AllocationFlags {
            cache_size: true,
            ..Default::default()
        };
        let a = cache
            .try_allocate(&AllocationRequest::new(4096, 1).with_flags(flags))
            .unwrap()
            .unwrap();
        cache.deallocate(a);

        assert_eq!(cache.slab_count(), 1);
        assert_eq!(cache.query_info().free_memory_bytes, SLAB_SIZE);
        assert_eq!(backend.stats().destroy_count, 0);

        // release_memory drops retained slabs
        cache.release_memory();
        assert_eq!(cache.slab_count(), 0);
        assert_eq!(backend.stats().destroy_count, 1);
    }

    #[test]
    fn test_prefetch_keeps_spare_slab() {
        let (backend, cache) = slab_stack(0.25, true);
        let blocks_per_slab = (SLAB_SIZE / 32768) as usize;
        assert_eq!(blocks_per_slab, 2);

        let flags = AllocationFlags {
            prefetch_memory: true,
            ..Default::default()
        };

        let a = cache
            .try_allocate(&AllocationRequest::new(32768, 1).with_flags(flags))
            .unwrap()
            .unwrap();
        let b = cache
            .try_allocate(&AllocationRequest::new(32768, 1).with_flags(flags))
            .unwrap()
            .unwrap();

        // Filling the slab triggered a prefetched spare
        assert_eq!(backend.stats().create_count, 2);
        assert_eq!(cache.slab_count(), 2);
        assert!(cache.check_invariants());

        cache.deallocate(a);
        cache.deallocate(b);
    }

    #[test]
    fn test_prefetch_disabled_by_construction() {
        let (backend, cache) = slab_stack(0.25, false);

        let flags = AllocationFlags {
            prefetch_memory: true,
            ..Default::default()
        };
        let a = cache
            .try_allocate(&AllocationRequest::new(32768, 1).with_flags(flags))
            .unwrap()
            .unwrap();
        let b = cache
            .try_allocate(&AllocationRequest::new(32768, 1).with_flags(flags))
            .unwrap()
            .unwrap();

        assert_eq!(backend.stats().create_count, 1);
        cache.deallocate(a);
        cache.deallocate(b);
    }

    #[test]
    fn test_alignment_separates_classes() {
        let (_backend, cache) = slab_stack(0.25, false);

        let a = cache
            .try_allocate(&AllocationRequest::new(4096, 1))
            .unwrap()
            .unwrap();
        let b = cache
            .try_allocate(&AllocationRequest::new(4096, 4096))
            .unwrap()
            .unwrap();

        assert_eq!(cache.class_count(), 2);
        assert_eq!(b.offset() % 4096, 0);

        cache.deallocate(a);
        cache.deallocate(b);
    }

    #[test]
    fn test_oversized_request_falls_through() {
        let (backend, cache) = slab_stack(0.25, false);

        let a = cache
            .try_allocate(&AllocationRequest::new(SLAB_SIZE * 2, 1))
            .unwrap()
            .unwrap();
        assert_eq!(cache.slab_count(), 0);
        assert_eq!(backend.stats().create_count, 1);

        let owner = a.owner().upgrade().unwrap();
        owner.deallocate(a);
    }
}
