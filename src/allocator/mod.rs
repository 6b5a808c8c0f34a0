//! Allocator facade
//!
//! Owns one allocator stack per heap kind and the residency manager, and is
//! the only surface clients talk to. The standard stack sub-allocates
//! through slab cache, virtual buddy, and segmented pool layers down to the
//! device heap leaf; requests too large to sub-allocate dispatch to a
//! standalone stack. Escalation between the two happens here, as does the
//! rollback when backend resource creation fails after memory was found.

mod config;
mod stats;

pub use config::{AllocatorConfig, AllocatorFlags};
pub use stats::AllocatorStats;

use crate::backend::{HeapKind, MemoryBackend};
use crate::error::{AllocResult, MemForgeError};
use crate::memory::{
    Allocation, AllocationFlags, AllocationRequest, AllocatorInfo, MemoryAllocator,
};
use crate::residency::ResidencyManager;
use crate::size_class::{is_aligned, prev_power_of_two, POWER_OF_TWO_CACHE_SIZES};
use crate::suballoc::{
    ConditionalAllocator, DeviceHeapAllocator, SegmentedPoolAllocator, SlabCacheAllocator,
    StandaloneAllocator,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct HeapStack {
    /// Entry point: conditional dispatch, or the standalone chain alone
    /// when sub-allocation is disabled
    entry: Arc<dyn MemoryAllocator>,
    /// Fallback chain for requests the entry could not serve
    standalone: Arc<dyn MemoryAllocator>,
    /// Slab head kept for cache priming, absent with `always_committed`
    suballoc_head: Option<Arc<SlabCacheAllocator>>,
}

/// Facade composing the allocator stacks and residency manager
#[derive(Debug)]
pub struct DeviceAllocator {
    config: AllocatorConfig,
    residency: Arc<ResidencyManager>,
    stacks: HashMap<HeapKind, HeapStack>,
    /// Serializes allocate, deallocate, trim, and stat queries
    ops_lock: Mutex<()>,
}

impl DeviceAllocator {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        config: AllocatorConfig,
    ) -> AllocResult<Arc<Self>> {
        config.validate()?;

        let residency = ResidencyManager::new(
            backend.clone(),
            config.max_video_memory_budget,
            config.total_resource_budget_limit,
            config.evict_batch_size,
        )?;

        let mut stacks = HashMap::new();
        for kind in HeapKind::ALL {
            stacks.insert(kind, Self::build_stack(&backend, &residency, &config, kind)?);
        }

        let allocator = Arc::new(DeviceAllocator {
            config,
            residency,
            stacks,
            ops_lock: Mutex::new(()),
        });
        allocator.prime_size_caches();
        Ok(allocator)
    }

    fn build_stack(
        backend: &Arc<dyn MemoryBackend>,
        residency: &Arc<ResidencyManager>,
        config: &AllocatorConfig,
        kind: HeapKind,
    ) -> AllocResult<HeapStack> {
        let pooled_or_on_demand = |heap: Arc<DeviceHeapAllocator>| -> Arc<dyn MemoryAllocator> {
            if config.flags.always_on_demand {
                heap
            } else {
                SegmentedPoolAllocator::new(
                    heap,
                    config.heap_alignment,
                    config.pool_capacity_per_segment,
                )
            }
        };

        let standalone_heap = DeviceHeapAllocator::new(
            backend.clone(),
            Some(residency.clone()),
            kind,
            config.heap_alignment,
            config.flags.always_in_budget,
        );
        let standalone: Arc<dyn MemoryAllocator> =
            StandaloneAllocator::new(pooled_or_on_demand(standalone_heap));

        if config.flags.always_committed {
            return Ok(HeapStack {
                entry: standalone.clone(),
                standalone,
                suballoc_head: None,
            });
        }

        let general_heap = DeviceHeapAllocator::new(
            backend.clone(),
            Some(residency.clone()),
            kind,
            config.heap_alignment,
            config.flags.always_in_budget,
        );
        let buddy = crate::suballoc::VirtualBuddyAllocator::new(
            prev_power_of_two(config.max_memory_size),
            config.preferred_memory_size,
            config.heap_alignment,
            pooled_or_on_demand(general_heap),
        )?;
        let slab_head = SlabCacheAllocator::new(
            config.min_block_size,
            prev_power_of_two(config.max_memory_size),
            config.preferred_memory_size,
            config.heap_alignment,
            config.fragmentation_limit,
            !config.flags.disable_prefetch,
            buddy,
        )?;

        let entry = ConditionalAllocator::new(
            slab_head.clone(),
            standalone.clone(),
            config.preferred_memory_size,
        );

        Ok(HeapStack {
            entry,
            standalone,
            suballoc_head: Some(slab_head),
        })
    }

    /// Warm the slab caches for commonly requested sizes
    ///
    /// Runs with `never_allocate` so no backing memory is created; the pass
    /// only pre-builds cache entries so first real requests hit a warm path.
    fn prime_size_caches(&self) {
        let flags = AllocationFlags {
            never_allocate: true,
            cache_size: true,
            ..Default::default()
        };

        for stack in self.stacks.values() {
            let Some(head) = &stack.suballoc_head else {
                continue;
            };
            for &size in POWER_OF_TWO_CACHE_SIZES.iter() {
                if size > self.config.preferred_memory_size {
                    continue;
                }
                for alignment in [self.config.min_block_size, self.config.heap_alignment] {
                    if !is_aligned(size, alignment) {
                        continue;
                    }
                    let request = AllocationRequest::new(size, alignment).with_flags(flags);
                    if let Err(err) = head.try_allocate(&request) {
                        tracing::warn!("size cache priming failed: {}", err);
                    }
                }
            }
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn residency(&self) -> &Arc<ResidencyManager> {
        &self.residency
    }

    fn stack(&self, kind: HeapKind) -> AllocResult<&HeapStack> {
        self.stacks.get(&kind).ok_or_else(|| {
            MemForgeError::InvalidArgument(format!("no allocator stack for {:?}", kind))
        })
    }

    fn allocate_locked(
        &self,
        kind: HeapKind,
        request: &AllocationRequest,
    ) -> AllocResult<Option<Allocation>> {
        if request.size == 0 {
            return Err(MemForgeError::InvalidArgument(
                "zero-size allocation requested".to_string(),
            ));
        }
        if request.size > self.config.max_memory_size {
            return Err(MemForgeError::OutOfMemory(format!(
                "request of {} bytes exceeds maximum memory size {}",
                request.size, self.config.max_memory_size
            )));
        }

        let stack = self.stack(kind)?;
        if let Some(allocation) = stack.entry.try_allocate(request)? {
            return Ok(Some(allocation));
        }
        // The sub-allocating chain came up empty; fall back to a dedicated
        // memory unless both paths are one and the same.
        if Arc::ptr_eq(&stack.entry, &stack.standalone) {
            return Ok(None);
        }
        stack.standalone.try_allocate(request)
    }

    /// Allocate device memory for a request
    ///
    /// Returns `Ok(None)` only when `never_allocate` prevented serving the
    /// request from warm caches. Budget exhaustion surfaces as
    /// `OutOfMemory`.
    pub fn try_allocate_memory(
        &self,
        kind: HeapKind,
        request: &AllocationRequest,
    ) -> AllocResult<Option<Allocation>> {
        let _guard = self.ops_lock.lock()?;
        self.allocate_locked(kind, request).map_err(translate_budget_error)
    }

    /// Allocate memory and create a backend resource in it
    ///
    /// `create_fn` receives each candidate allocation; when it fails the
    /// memory is returned to its allocator before the next strategy runs,
    /// so a failed creation never strands memory.
    pub fn try_allocate_resource<R>(
        &self,
        kind: HeapKind,
        request: &AllocationRequest,
        mut create_fn: impl FnMut(&Allocation) -> AllocResult<R>,
    ) -> AllocResult<(Allocation, R)> {
        let _guard = self.ops_lock.lock()?;

        if request.size == 0 {
            return Err(MemForgeError::InvalidArgument(
                "zero-size resource requested".to_string(),
            ));
        }
        if request.size > self.config.max_memory_size {
            return Err(MemForgeError::OutOfMemory(format!(
                "resource of {} bytes exceeds maximum memory size {}",
                request.size, self.config.max_memory_size
            )));
        }

        let stack = self.stack(kind)?;
        let mut strategies: Vec<&Arc<dyn MemoryAllocator>> = vec![&stack.entry];
        if !Arc::ptr_eq(&stack.entry, &stack.standalone) {
            strategies.push(&stack.standalone);
        }

        let mut last_error = None;
        for strategy in strategies {
            let allocation = match strategy.try_allocate(request) {
                Ok(Some(allocation)) => allocation,
                Ok(None) => continue,
                Err(err) => {
                    last_error = Some(translate_budget_error(err));
                    continue;
                }
            };

            match create_fn(&allocation) {
                Ok(resource) => return Ok((allocation, resource)),
                Err(err) => {
                    tracing::warn!("resource creation failed, rolling back memory: {}", err);
                    Self::route_deallocate(allocation);
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            MemForgeError::OutOfMemory(format!(
                "no strategy could serve {} bytes",
                request.size
            ))
        }))
    }

    fn route_deallocate(allocation: Allocation) {
        match allocation.owner().upgrade() {
            Some(owner) => owner.deallocate(allocation),
            None => {
                tracing::warn!("owning allocator gone, dropping allocation untracked");
            }
        }
    }

    /// Release an allocation back to the allocator that produced it
    pub fn deallocate(&self, allocation: Allocation) {
        let _guard = match self.ops_lock.lock() {
            Ok(guard) => guard,
            Err(err) => {
                tracing::error!("facade lock poisoned in deallocate: {}", err);
                return;
            }
        };
        Self::route_deallocate(allocation);
    }

    /// Drop every pooled and cached memory not currently referenced
    pub fn release_memory(&self) {
        self.trim();
    }

    /// Drop every pooled and cached memory not currently referenced
    pub fn trim(&self) {
        let _guard = match self.ops_lock.lock() {
            Ok(guard) => guard,
            Err(err) => {
                tracing::error!("facade lock poisoned in trim: {}", err);
                return;
            }
        };
        for stack in self.stacks.values() {
            stack.entry.release_memory();
        }
    }

    /// Usage counters aggregated across all stacks
    pub fn query_info(&self) -> AllocatorStats {
        let _guard = match self.ops_lock.lock() {
            Ok(guard) => guard,
            Err(_) => return AllocatorStats::default(),
        };

        let mut stats = AllocatorStats::default();
        for (&kind, stack) in self.stacks.iter() {
            stats.record(kind, stack.entry.query_info());
        }
        stats
    }

    /// Usage counters for one heap kind
    pub fn query_kind_info(&self, kind: HeapKind) -> AllocatorInfo {
        let _guard = match self.ops_lock.lock() {
            Ok(guard) => guard,
            Err(_) => return AllocatorInfo::default(),
        };
        self.stacks
            .get(&kind)
            .map(|stack| stack.entry.query_info())
            .unwrap_or_default()
    }
}

fn translate_budget_error(err: MemForgeError) -> MemForgeError {
    match err {
        MemForgeError::BudgetExceeded {
            segment,
            needed_bytes,
        } => MemForgeError::OutOfMemory(format!(
            "cannot free {} bytes of budget in segment {:?}",
            needed_bytes, segment
        )),
        other => other,
    }
}
