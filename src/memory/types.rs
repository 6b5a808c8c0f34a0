//! Core value objects shared by every allocator layer
//!
//! A [`Memory`] is one driver heap with residency bookkeeping. An
//! [`Allocation`] is the unit handed back to callers: a range inside some
//! memory plus the identity of the allocator that produced it, so
//! deallocation can be routed back without the caller knowing the stack.

use crate::backend::{DeviceMemoryHandle, HeapKind, SegmentGroup};
use crate::memory::allocator::AllocatorRef;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Unique id assigned to every backing memory
pub type MemoryId = u64;

static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(1);

/// Residency state of a backing memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidencyState {
    /// Accessible by the device
    Resident,
    /// Paged out, must be made resident before use
    Evicted,
    /// Paging operation in flight
    Pending,
    /// Not tracked by any residency manager
    Unmanaged,
}

impl ResidencyState {
    fn to_u8(self) -> u8 {
        match self {
            ResidencyState::Resident => 0,
            ResidencyState::Evicted => 1,
            ResidencyState::Pending => 2,
            ResidencyState::Unmanaged => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ResidencyState::Resident,
            1 => ResidencyState::Evicted,
            2 => ResidencyState::Pending,
            _ => ResidencyState::Unmanaged,
        }
    }
}

/// One driver heap plus the counters every layer shares
///
/// Counter fields are atomic so telemetry can read them without taking any
/// allocator lock. The residency manager owns all state transitions; the
/// counters here are storage, not policy.
#[derive(Debug)]
pub struct Memory {
    id: MemoryId,
    handle: DeviceMemoryHandle,
    size: u64,
    alignment: u64,
    segment: SegmentGroup,
    kind: HeapKind,
    state: AtomicU8,
    lock_count: AtomicU32,
    last_used_fence: AtomicU64,
    sub_alloc_refs: AtomicU32,
}

impl Memory {
    pub(crate) fn new(
        handle: DeviceMemoryHandle,
        size: u64,
        alignment: u64,
        segment: SegmentGroup,
        kind: HeapKind,
    ) -> Self {
        Memory {
            id: NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed),
            handle,
            size,
            alignment,
            segment,
            kind,
            state: AtomicU8::new(ResidencyState::Unmanaged.to_u8()),
            lock_count: AtomicU32::new(0),
            last_used_fence: AtomicU64::new(0),
            sub_alloc_refs: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> MemoryId {
        self.id
    }

    pub fn handle(&self) -> DeviceMemoryHandle {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn segment_group(&self) -> SegmentGroup {
        self.segment
    }

    pub fn heap_kind(&self) -> HeapKind {
        self.kind
    }

    pub fn residency_state(&self) -> ResidencyState {
        ResidencyState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_residency_state(&self, state: ResidencyState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    /// Non-zero while any use-site holds this memory pinned against eviction
    pub fn lock_count(&self) -> u32 {
        self.lock_count.load(Ordering::Acquire)
    }

    pub(crate) fn increment_lock(&self) -> u32 {
        self.lock_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn decrement_lock(&self) -> u32 {
        self.lock_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Fence token stamped at the memory's last use
    pub fn last_used_fence(&self) -> u64 {
        self.last_used_fence.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_used_fence(&self, fence: u64) {
        self.last_used_fence.store(fence, Ordering::Release);
    }

    /// Number of live allocations pointing into this memory
    pub fn sub_alloc_refs(&self) -> u32 {
        self.sub_alloc_refs.load(Ordering::Acquire)
    }

    pub(crate) fn add_sub_alloc_ref(&self) -> u32 {
        self.sub_alloc_refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn release_sub_alloc_ref(&self) -> u32 {
        self.sub_alloc_refs.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        let refs = self.sub_alloc_refs.load(Ordering::Acquire);
        if refs != 0 {
            tracing::warn!(
                "memory {} dropped with {} live sub-allocations",
                self.id,
                refs
            );
        }
    }
}

/// Half-open range `[offset, offset + size)` inside a sub-allocator
///
/// For buddy allocations the offset is in the virtual buddy address space;
/// for slab allocations it is relative to the slab base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub offset: u64,
    pub size: u64,
}

/// How an allocation was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMethod {
    /// Carved out of a shared backing memory
    SubAllocated,
    /// Carved out of an already-placed resource
    SubAllocatedWithinResource,
    /// Owns its backing memory outright
    Standalone,
}

/// Behavior toggles understood by every allocator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationFlags {
    /// Serve only from caches and pools, never create backing memory
    pub never_allocate: bool,
    /// Keep the produced memory warm for future identical requests
    pub cache_size: bool,
    /// After fulfilling, create one spare memory of the same class
    pub prefetch_memory: bool,
}

/// One allocation request as it flows down a stack
#[derive(Debug, Clone, Copy)]
pub struct AllocationRequest {
    pub size: u64,
    pub alignment: u64,
    pub flags: AllocationFlags,
}

impl AllocationRequest {
    pub fn new(size: u64, alignment: u64) -> Self {
        AllocationRequest {
            size,
            alignment,
            flags: AllocationFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: AllocationFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Result of a successful allocation
///
/// Carries everything needed to use the range (memory identity plus offset)
/// and to release it (the producing allocator). Deallocation consumes the
/// value, so releasing twice is unrepresentable.
pub struct Allocation {
    memory: std::sync::Arc<Memory>,
    offset: u64,
    size: u64,
    method: AllocationMethod,
    block: Option<Block>,
    owner: AllocatorRef,
}

impl Allocation {
    pub(crate) fn new(
        memory: std::sync::Arc<Memory>,
        offset: u64,
        size: u64,
        method: AllocationMethod,
        block: Option<Block>,
        owner: AllocatorRef,
    ) -> Self {
        memory.add_sub_alloc_ref();
        Allocation {
            memory,
            offset,
            size,
            method,
            block,
            owner,
        }
    }

    pub fn memory(&self) -> &std::sync::Arc<Memory> {
        &self.memory
    }

    /// Byte offset of this allocation inside its backing memory
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn method(&self) -> AllocationMethod {
        self.method
    }

    pub fn block(&self) -> Option<Block> {
        self.block
    }

    pub fn owner(&self) -> &AllocatorRef {
        &self.owner
    }

    /// Re-stamp the owning allocator, keeping the memory refcount untouched
    pub(crate) fn reowned(mut self, owner: AllocatorRef) -> Self {
        self.owner = owner;
        self
    }

    /// Drop the memory refcount held by this allocation
    ///
    /// Called exactly once by the allocator that terminally destroys the
    /// allocation. Pass-through layers must not call it.
    pub(crate) fn release_memory_ref(&self) {
        self.memory.release_sub_alloc_ref();
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("memory", &self.memory.id())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("method", &self.method)
            .field("block", &self.block)
            .finish()
    }
}
