//! Host backend for testing and benchmarking
//!
//! Provides a no-device implementation of [`MemoryBackend`]: heaps are fake
//! handles with byte accounting, residency is a counter, and the fence clock
//! is advanced manually by the caller. Allocation strategy code can be
//! exercised end to end without a GPU in the process.

use crate::backend::{DeviceMemoryHandle, HeapKind, MemoryBackend, MemoryBudget, SegmentGroup};
use crate::error::{AllocResult, MemForgeError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Statistics tracked per backend call for test assertions
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostBackendStats {
    /// Number of create_memory() calls
    pub create_count: u64,
    /// Number of destroy_memory() calls
    pub destroy_count: u64,
    /// Number of heaps paged in via make_resident()
    pub page_in_count: u64,
    /// Number of heaps paged out via make_non_resident()
    pub page_out_count: u64,
    /// Bytes currently live (created minus destroyed)
    pub live_bytes: u64,
}

#[derive(Debug)]
struct FenceClock {
    current: AtomicU64,
    completed: AtomicU64,
}

impl FenceClock {
    fn new() -> Self {
        FenceClock {
            current: AtomicU64::new(1),
            completed: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Default)]
struct HostState {
    heaps: HashMap<u64, u64>,
    resident_bytes: HashMap<SegmentGroup, u64>,
    stats: HostBackendStats,
}

/// Host-memory reference backend
///
/// Heap handles are sequential ids, no real memory is reserved. Each segment
/// group has a manual fence clock: `signal_fence` models a submission,
/// `complete_fence` models device progress. `wait_fence` completes
/// immediately since there is no device to wait for.
#[derive(Debug)]
pub struct HostBackend {
    next_handle: AtomicU64,
    budget_limits: HashMap<SegmentGroup, u64>,
    local_fence: FenceClock,
    non_local_fence: FenceClock,
    state: Mutex<HostState>,
    fail_creation: AtomicU64,
}

impl HostBackend {
    /// Create a backend with effectively unlimited budgets
    pub fn new() -> Self {
        Self::with_budgets(u64::MAX / 2, u64::MAX / 2)
    }

    /// Create a backend with explicit budget limits per segment group
    pub fn with_budgets(local_limit: u64, non_local_limit: u64) -> Self {
        let mut budget_limits = HashMap::new();
        budget_limits.insert(SegmentGroup::Local, local_limit);
        budget_limits.insert(SegmentGroup::NonLocal, non_local_limit);

        HostBackend {
            next_handle: AtomicU64::new(1),
            budget_limits,
            local_fence: FenceClock::new(),
            non_local_fence: FenceClock::new(),
            state: Mutex::new(HostState::default()),
            fail_creation: AtomicU64::new(0),
        }
    }

    fn clock(&self, segment: SegmentGroup) -> &FenceClock {
        match segment {
            SegmentGroup::Local => &self.local_fence,
            SegmentGroup::NonLocal => &self.non_local_fence,
        }
    }

    /// Snapshot call statistics
    pub fn stats(&self) -> HostBackendStats {
        self.state
            .lock()
            .map(|s| s.stats)
            .unwrap_or_default()
    }

    /// Number of heaps currently live
    pub fn live_heap_count(&self) -> u64 {
        self.state
            .lock()
            .map(|s| s.heaps.len() as u64)
            .unwrap_or(0)
    }

    /// Model a submission: advance the pending fence and return the token
    /// the submission will signal
    pub fn signal_fence(&self, segment: SegmentGroup) -> u64 {
        self.clock(segment).current.fetch_add(1, Ordering::AcqRel)
    }

    /// Model device progress: mark every token up to `value` completed
    pub fn complete_fence(&self, segment: SegmentGroup, value: u64) {
        self.clock(segment).completed.fetch_max(value, Ordering::AcqRel);
    }

    /// Make the next `count` create_memory calls fail, for fault injection
    pub fn fail_next_creations(&self, count: u64) {
        self.fail_creation.store(count, Ordering::Release);
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend for HostBackend {
    fn create_memory(
        &self,
        size: u64,
        alignment: u64,
        segment: SegmentGroup,
        _kind: HeapKind,
    ) -> AllocResult<DeviceMemoryHandle> {
        if size == 0 {
            return Err(MemForgeError::InvalidArgument(
                "zero-size heap requested".to_string(),
            ));
        }

        let pending = self.fail_creation.load(Ordering::Acquire);
        if pending > 0
            && self
                .fail_creation
                .compare_exchange(pending, pending - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Err(MemForgeError::Backend(format!(
                "injected heap creation failure ({} bytes)",
                size
            )));
        }

        let handle = self.next_handle.fetch_add(1, Ordering::AcqRel);
        let mut state = self.state.lock()?;
        state.heaps.insert(handle, size);
        state.stats.create_count += 1;
        state.stats.live_bytes += size;
        *state.resident_bytes.entry(segment).or_insert(0) += size;

        tracing::debug!(
            "HostBackend: created heap {:#x} ({} bytes, align {}, {:?})",
            handle,
            size,
            alignment,
            segment
        );
        Ok(DeviceMemoryHandle(handle))
    }

    fn destroy_memory(&self, handle: DeviceMemoryHandle) {
        let Ok(mut state) = self.state.lock() else {
            tracing::error!("HostBackend: state lock poisoned in destroy_memory");
            return;
        };
        match state.heaps.remove(&handle.0) {
            Some(size) => {
                state.stats.destroy_count += 1;
                state.stats.live_bytes = state.stats.live_bytes.saturating_sub(size);
                tracing::debug!("HostBackend: destroyed heap {:#x} ({} bytes)", handle.0, size);
            }
            None => {
                tracing::warn!("HostBackend: destroy of unknown heap {:#x}", handle.0);
            }
        }
    }

    fn make_resident(&self, handles: &[DeviceMemoryHandle]) -> AllocResult<()> {
        let mut state = self.state.lock()?;
        state.stats.page_in_count += handles.len() as u64;
        Ok(())
    }

    fn make_non_resident(&self, handles: &[DeviceMemoryHandle]) {
        if let Ok(mut state) = self.state.lock() {
            state.stats.page_out_count += handles.len() as u64;
        }
    }

    fn query_budget(&self, segment: SegmentGroup) -> MemoryBudget {
        let used = self
            .state
            .lock()
            .map(|s| s.resident_bytes.get(&segment).copied().unwrap_or(0))
            .unwrap_or(0);
        MemoryBudget {
            limit_bytes: self.budget_limits.get(&segment).copied().unwrap_or(0),
            used_bytes: used,
        }
    }

    fn current_fence(&self, segment: SegmentGroup) -> u64 {
        self.clock(segment).current.load(Ordering::Acquire)
    }

    fn completed_fence(&self, segment: SegmentGroup) -> u64 {
        self.clock(segment).completed.load(Ordering::Acquire)
    }

    fn wait_fence(&self, segment: SegmentGroup, value: u64) -> AllocResult<()> {
        // No device behind the clock, waiting completes the token directly.
        self.complete_fence(segment, value);
        Ok(())
    }
}
