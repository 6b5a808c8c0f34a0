//! Residency manager tests: budget-driven eviction ordering, lock pinning,
//! fence gating, and budget accounting invariants

mod common;

use common::budgeted_backend;
use memforge::suballoc::DeviceHeapAllocator;
use memforge::{
    AllocationRequest, HeapKind, MemoryAllocator, MemForgeError, MemoryBackend, ResidencyManager,
    ResidencySet, ResidencyState, SegmentGroup,
};
use std::sync::Arc;

const MIB: u64 = 1 << 20;

/// Heap allocator wired to a residency manager with a budget of `limit`
fn residency_stack(
    limit: u64,
) -> (
    Arc<memforge::HostBackend>,
    Arc<ResidencyManager>,
    Arc<DeviceHeapAllocator>,
) {
    let backend = budgeted_backend(limit, limit);
    let residency = ResidencyManager::new(backend.clone(), 1.0, 0, 0).unwrap();
    let heap = DeviceHeapAllocator::new(
        backend.clone(),
        Some(residency.clone()),
        HeapKind::DeviceLocal,
        4096,
        true,
    );
    (backend, residency, heap)
}

#[test]
fn test_allocation_evicts_oldest() {
    let (backend, residency, heap) = residency_stack(3 * MIB);

    let a = heap
        .try_allocate(&AllocationRequest::new(MIB, 1))
        .unwrap()
        .unwrap();
    let b = heap
        .try_allocate(&AllocationRequest::new(MIB, 1))
        .unwrap()
        .unwrap();
    let c = heap
        .try_allocate(&AllocationRequest::new(MIB, 1))
        .unwrap()
        .unwrap();

    // Budget full: a fourth allocation pushes out the oldest memory
    let d = heap
        .try_allocate(&AllocationRequest::new(MIB, 1))
        .unwrap()
        .unwrap();

    assert_eq!(a.memory().residency_state(), ResidencyState::Evicted);
    assert_eq!(b.memory().residency_state(), ResidencyState::Resident);
    assert_eq!(
        residency.lru_order(SegmentGroup::Local),
        vec![b.memory().id(), c.memory().id(), d.memory().id()]
    );
    assert_eq!(residency.budget(SegmentGroup::Local).used_bytes, 3 * MIB);
    assert_eq!(backend.stats().page_out_count, 1);

    for allocation in [a, b, c, d] {
        heap.deallocate(allocation);
    }
}

#[test]
fn test_locked_memory_survives_eviction() {
    let (_backend, residency, heap) = residency_stack(3 * MIB);

    let a = heap
        .try_allocate(&AllocationRequest::new(MIB, 1))
        .unwrap()
        .unwrap();
    let b = heap
        .try_allocate(&AllocationRequest::new(MIB, 1))
        .unwrap()
        .unwrap();
    let c = heap
        .try_allocate(&AllocationRequest::new(MIB, 1))
        .unwrap()
        .unwrap();

    // Pin the oldest; the next-oldest unlocked memory must go instead
    residency.lock(a.memory()).unwrap();
    let d = heap
        .try_allocate(&AllocationRequest::new(MIB, 1))
        .unwrap()
        .unwrap();

    assert_eq!(a.memory().residency_state(), ResidencyState::Resident);
    assert_eq!(b.memory().residency_state(), ResidencyState::Evicted);
    assert!(!residency
        .lru_order(SegmentGroup::Local)
        .contains(&a.memory().id()));

    residency.unlock(a.memory()).unwrap();
    for allocation in [a, b, c, d] {
        heap.deallocate(allocation);
    }
}

#[test]
fn test_budget_accounting_matches_resident_sizes() {
    let (_backend, residency, heap) = residency_stack(8 * MIB);

    let mut live = Vec::new();
    for _ in 0..5 {
        live.push(
            heap.try_allocate(&AllocationRequest::new(MIB, 1))
                .unwrap()
                .unwrap(),
        );
    }

    let resident_bytes: u64 = live
        .iter()
        .filter(|a| a.memory().residency_state() == ResidencyState::Resident)
        .map(|a| a.memory().size())
        .sum();
    assert_eq!(
        residency.budget(SegmentGroup::Local).used_bytes,
        resident_bytes
    );

    // Locked memories never appear in the LRU
    residency.lock(live[0].memory()).unwrap();
    assert!(!residency
        .lru_order(SegmentGroup::Local)
        .contains(&live[0].memory().id()));
    residency.unlock(live[0].memory()).unwrap();

    for allocation in live {
        heap.deallocate(allocation);
    }
    assert_eq!(residency.budget(SegmentGroup::Local).used_bytes, 0);
}

#[test]
fn test_all_locked_is_out_of_budget() {
    let (_backend, residency, heap) = residency_stack(2 * MIB);

    let a = heap
        .try_allocate(&AllocationRequest::new(MIB, 1))
        .unwrap()
        .unwrap();
    let b = heap
        .try_allocate(&AllocationRequest::new(MIB, 1))
        .unwrap()
        .unwrap();
    residency.lock(a.memory()).unwrap();
    residency.lock(b.memory()).unwrap();

    // Nothing evictable remains
    let result = heap.try_allocate(&AllocationRequest::new(MIB, 1));
    assert!(matches!(
        result,
        Err(MemForgeError::BudgetExceeded { .. })
    ));

    residency.unlock(a.memory()).unwrap();
    residency.unlock(b.memory()).unwrap();
    heap.deallocate(a);
    heap.deallocate(b);
}

#[test]
fn test_eviction_gated_on_fence_completion() {
    let (backend, residency, heap) = residency_stack(MIB);

    let a = heap
        .try_allocate(&AllocationRequest::new(MIB, 1))
        .unwrap()
        .unwrap();

    // Use the memory in a submission whose fence is still pending
    residency.lock(a.memory()).unwrap();
    let pending = backend.signal_fence(SegmentGroup::Local);
    residency.unlock(a.memory()).unwrap();
    assert!(a.memory().last_used_fence() > backend.completed_fence(SegmentGroup::Local));

    // Eviction must wait out the fence before paging the memory away
    residency.evict(MIB, SegmentGroup::Local).unwrap();
    assert!(backend.completed_fence(SegmentGroup::Local) >= pending);
    assert_eq!(a.memory().residency_state(), ResidencyState::Evicted);

    heap.deallocate(a);
}

#[test]
fn test_residency_set_submission() {
    let (backend, residency, heap) = residency_stack(8 * MIB);

    let a = heap
        .try_allocate(&AllocationRequest::new(MIB, 1))
        .unwrap()
        .unwrap();
    let b = heap
        .try_allocate(&AllocationRequest::new(MIB, 1))
        .unwrap()
        .unwrap();

    let mut set = ResidencySet::new();
    residency.update_residency_set(&mut set, a.memory());
    residency.update_residency_set(&mut set, a.memory());
    assert_eq!(set.len(), 1);

    residency.submit(&set).unwrap();

    // The submitted memory moved to MRU behind the untouched one
    assert_eq!(
        residency.lru_order(SegmentGroup::Local),
        vec![b.memory().id(), a.memory().id()]
    );
    assert_eq!(
        a.memory().last_used_fence(),
        backend.current_fence(SegmentGroup::Local)
    );

    heap.deallocate(a);
    heap.deallocate(b);
}

#[test]
fn test_submit_pages_evicted_members_back_in() {
    let (_backend, residency, heap) = residency_stack(2 * MIB);

    let a = heap
        .try_allocate(&AllocationRequest::new(MIB, 1))
        .unwrap()
        .unwrap();
    let b = heap
        .try_allocate(&AllocationRequest::new(MIB, 1))
        .unwrap()
        .unwrap();
    let c = heap
        .try_allocate(&AllocationRequest::new(MIB, 1))
        .unwrap()
        .unwrap();
    assert_eq!(a.memory().residency_state(), ResidencyState::Evicted);

    let mut set = ResidencySet::new();
    residency.update_residency_set(&mut set, a.memory());
    residency.submit(&set).unwrap();

    // Paging `a` back in pushed out the then-oldest resident memory
    assert_eq!(a.memory().residency_state(), ResidencyState::Resident);
    assert_eq!(b.memory().residency_state(), ResidencyState::Evicted);

    for allocation in [a, b, c] {
        heap.deallocate(allocation);
    }
}
