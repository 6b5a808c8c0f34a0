//! Residency manager
//!
//! Keeps the working set of backing memories inside a per-segment budget.
//! Unlocked resident memories sit in an LRU list ordered by last-use fence
//! (FIFO between equal fences); eviction walks the list head, waiting for
//! each victim's fence to complete before paging it out. Locking a memory
//! pins it outside the LRU so it can never be evicted mid-use.

use crate::backend::{MemoryBackend, SegmentGroup};
use crate::error::{AllocResult, MemForgeError};
use crate::memory::{Memory, MemoryId, ResidencyState};
use crate::residency::set::ResidencySet;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Budget state for one segment group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetInfo {
    /// Bytes this manager may keep resident
    pub limit_bytes: u64,
    /// Bytes currently resident under this manager
    pub used_bytes: u64,
}

#[derive(Debug, Default)]
struct ManagerState {
    budgets: HashMap<SegmentGroup, BudgetInfo>,
    lru: HashMap<SegmentGroup, VecDeque<Arc<Memory>>>,
}

impl ManagerState {
    fn budget_mut(&mut self, segment: SegmentGroup) -> &mut BudgetInfo {
        self.budgets.entry(segment).or_default()
    }

    fn lru_mut(&mut self, segment: SegmentGroup) -> &mut VecDeque<Arc<Memory>> {
        self.lru.entry(segment).or_default()
    }

    fn unlink(&mut self, memory: &Arc<Memory>) -> bool {
        let list = self.lru_mut(memory.segment_group());
        match list.iter().position(|m| m.id() == memory.id()) {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Budget enforcement and eviction across all tracked memories
#[derive(Debug)]
pub struct ResidencyManager {
    backend: Arc<dyn MemoryBackend>,
    /// Extra bytes evicted beyond the strict requirement, to amortize
    /// paging across bursts of allocations
    evict_batch_size: u64,
    state: Mutex<ManagerState>,
}

impl ResidencyManager {
    /// Create a manager with budgets sampled from the backend
    ///
    /// `max_budget_fraction` scales the driver-reported limit; a non-zero
    /// `total_budget_limit` caps the result outright.
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        max_budget_fraction: f64,
        total_budget_limit: u64,
        evict_batch_size: u64,
    ) -> AllocResult<Arc<Self>> {
        if !(0.0..=1.0).contains(&max_budget_fraction) {
            return Err(MemForgeError::InvalidArgument(format!(
                "budget fraction {} outside [0, 1]",
                max_budget_fraction
            )));
        }

        let manager = Arc::new(ResidencyManager {
            backend,
            evict_batch_size,
            state: Mutex::new(ManagerState::default()),
        });

        for segment in [SegmentGroup::Local, SegmentGroup::NonLocal] {
            manager.refresh_budget(segment, max_budget_fraction, total_budget_limit)?;
        }

        Ok(manager)
    }

    /// Re-sample the driver budget for one segment group
    pub fn refresh_budget(
        &self,
        segment: SegmentGroup,
        max_budget_fraction: f64,
        total_budget_limit: u64,
    ) -> AllocResult<()> {
        let sample = self.backend.query_budget(segment);
        let mut limit = (sample.limit_bytes as f64 * max_budget_fraction) as u64;
        if total_budget_limit > 0 {
            limit = limit.min(total_budget_limit);
        }

        let mut state = self.state.lock()?;
        state.budget_mut(segment).limit_bytes = limit;
        tracing::debug!("residency: budget for {:?} set to {} bytes", segment, limit);
        Ok(())
    }

    /// Register a freshly created memory
    ///
    /// Newly created heaps are implicitly resident, so the memory joins the
    /// LRU tail and its size counts against the segment budget.
    pub fn insert(&self, memory: &Arc<Memory>) -> AllocResult<()> {
        let mut state = self.state.lock()?;
        memory.set_residency_state(ResidencyState::Resident);
        let segment = memory.segment_group();
        state.budget_mut(segment).used_bytes += memory.size();
        debug_assert!(!state.lru_mut(segment).iter().any(|m| m.id() == memory.id()));
        state.lru_mut(segment).push_back(memory.clone());
        Ok(())
    }

    /// Stop tracking a memory that is being destroyed
    pub fn untrack(&self, memory: &Arc<Memory>) {
        let Ok(mut state) = self.state.lock() else {
            tracing::error!("residency: state lock poisoned in untrack");
            return;
        };
        state.unlink(memory);
        if memory.residency_state() == ResidencyState::Resident {
            let budget = state.budget_mut(memory.segment_group());
            budget.used_bytes = budget.used_bytes.saturating_sub(memory.size());
        }
        memory.set_residency_state(ResidencyState::Unmanaged);
    }

    /// Pin a memory against eviction, paging it back in first if needed
    pub fn lock(&self, memory: &Arc<Memory>) -> AllocResult<()> {
        let mut state = self.state.lock()?;

        if memory.residency_state() == ResidencyState::Evicted {
            self.page_in_locked(&mut state, memory)?;
        }

        if memory.increment_lock() == 1 {
            state.unlink(memory);
        }
        Ok(())
    }

    /// Release one pin; at zero the memory rejoins the LRU at MRU position
    /// stamped with the current pending fence
    pub fn unlock(&self, memory: &Arc<Memory>) -> AllocResult<()> {
        let mut state = self.state.lock()?;

        if memory.lock_count() == 0 {
            return Err(MemForgeError::InvalidArgument(format!(
                "unlock of memory {} which is not locked",
                memory.id()
            )));
        }

        if memory.decrement_lock() == 0 && memory.residency_state() == ResidencyState::Resident {
            let segment = memory.segment_group();
            memory.set_last_used_fence(self.backend.current_fence(segment));
            state.lru_mut(segment).push_back(memory.clone());
        }
        Ok(())
    }

    /// Evict LRU memories until `required_bytes` more fit under the budget
    ///
    /// Returns the bytes actually paged out. Fails with `BudgetExceeded`
    /// when every remaining resident memory is pinned.
    pub fn evict(&self, required_bytes: u64, segment: SegmentGroup) -> AllocResult<u64> {
        let mut state = self.state.lock()?;
        self.evict_locked(&mut state, required_bytes, segment)
    }

    fn evict_locked(
        &self,
        state: &mut ManagerState,
        required_bytes: u64,
        segment: SegmentGroup,
    ) -> AllocResult<u64> {
        let mut freed = 0u64;

        while {
            let budget = state.budget_mut(segment);
            budget.used_bytes + required_bytes > budget.limit_bytes
        } {
            let Some(victim) = state.lru_mut(segment).pop_front() else {
                return Err(MemForgeError::BudgetExceeded {
                    segment,
                    needed_bytes: required_bytes,
                });
            };

            self.page_out(state, &victim, segment)?;
            freed += victim.size();
        }

        // Evict a little extra while cheap candidates remain, so bursts of
        // allocations do not page one heap at a time.
        while freed > 0 && freed < required_bytes + self.evict_batch_size {
            let Some(victim) = state.lru_mut(segment).pop_front() else {
                break;
            };
            self.page_out(state, &victim, segment)?;
            freed += victim.size();
        }

        if freed > 0 {
            tracing::debug!("residency: evicted {} bytes from {:?}", freed, segment);
        }
        Ok(freed)
    }

    fn page_out(
        &self,
        state: &mut ManagerState,
        victim: &Arc<Memory>,
        segment: SegmentGroup,
    ) -> AllocResult<()> {
        debug_assert_eq!(victim.lock_count(), 0);

        // Reuse is only safe once the device is done with the heap.
        let fence = victim.last_used_fence();
        if fence > self.backend.completed_fence(segment) {
            self.backend.wait_fence(segment, fence)?;
        }

        self.backend.make_non_resident(&[victim.handle()]);
        victim.set_residency_state(ResidencyState::Evicted);
        let budget = state.budget_mut(segment);
        budget.used_bytes = budget.used_bytes.saturating_sub(victim.size());
        Ok(())
    }

    fn page_in_locked(&self, state: &mut ManagerState, memory: &Arc<Memory>) -> AllocResult<()> {
        let segment = memory.segment_group();
        self.evict_locked(state, memory.size(), segment)?;

        memory.set_residency_state(ResidencyState::Pending);
        if let Err(err) = self.backend.make_resident(&[memory.handle()]) {
            memory.set_residency_state(ResidencyState::Evicted);
            return Err(err);
        }

        memory.set_residency_state(ResidencyState::Resident);
        state.budget_mut(segment).used_bytes += memory.size();
        if memory.lock_count() == 0 {
            state.lru_mut(segment).push_back(memory.clone());
        }
        Ok(())
    }

    /// Page a group of memories back in, evicting others to make room
    pub fn make_resident(&self, memories: &[Arc<Memory>]) -> AllocResult<()> {
        let mut state = self.state.lock()?;
        for memory in memories {
            if memory.residency_state() == ResidencyState::Evicted {
                self.page_in_locked(&mut state, memory)?;
            }
        }
        Ok(())
    }

    /// Record that `memory` will be referenced by the submission `set`
    pub fn update_residency_set(&self, set: &mut ResidencySet, memory: &Arc<Memory>) {
        set.insert(memory);
    }

    /// Prepare a submission's memories and stamp them with its fence
    ///
    /// Every member is made resident, stamped with the current pending
    /// fence, and moved to the MRU end of its list.
    pub fn submit(&self, set: &ResidencySet) -> AllocResult<()> {
        let mut state = self.state.lock()?;

        for memory in set.iter() {
            if memory.residency_state() == ResidencyState::Evicted {
                self.page_in_locked(&mut state, memory)?;
            }

            let segment = memory.segment_group();
            memory.set_last_used_fence(self.backend.current_fence(segment));
            if memory.lock_count() == 0 && state.unlink(memory) {
                state.lru_mut(segment).push_back(memory.clone());
            }
        }
        Ok(())
    }

    /// Budget counters for one segment group
    pub fn budget(&self, segment: SegmentGroup) -> BudgetInfo {
        self.state
            .lock()
            .map(|mut s| *s.budget_mut(segment))
            .unwrap_or_default()
    }

    /// LRU order from oldest to newest, for diagnostics and tests
    pub fn lru_order(&self, segment: SegmentGroup) -> Vec<MemoryId> {
        self.state
            .lock()
            .map(|mut s| s.lru_mut(segment).iter().map(|m| m.id()).collect())
            .unwrap_or_default()
    }
}
