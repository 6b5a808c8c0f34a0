//! Virtual buddy allocator
//!
//! Runs a buddy system over a large virtual range and projects its offsets
//! onto backing memories of one fixed size, created on demand from the inner
//! allocator. Slot `i` backs the offsets `[i * memory_size, (i+1) *
//! memory_size)`; its refcount equals the live allocations inside that
//! window, and the backing memory lives exactly while the count is non-zero.

use crate::buddy::BuddyAllocator;
use crate::error::{AllocResult, MemForgeError};
use crate::memory::{
    Allocation, AllocationMethod, AllocationRequest, AllocatorInfo, AllocatorRef, MemoryAllocator,
};
use crate::size_class::is_power_of_two;
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug)]
struct Slot {
    refcount: u32,
    backing: Allocation,
}

#[derive(Debug)]
struct BuddyState {
    buddy: BuddyAllocator,
    /// Sparse table indexed by `offset / memory_size`
    slots: Vec<Option<Slot>>,
    info: AllocatorInfo,
}

#[derive(Debug)]
pub struct VirtualBuddyAllocator {
    self_ref: Weak<VirtualBuddyAllocator>,
    memory_size: u64,
    memory_alignment: u64,
    inner: Arc<dyn MemoryAllocator>,
    state: Mutex<BuddyState>,
}

impl VirtualBuddyAllocator {
    /// Create a buddy system spanning `max_system_size` virtual bytes with
    /// backing memories of `memory_size` bytes
    pub fn new(
        max_system_size: u64,
        memory_size: u64,
        memory_alignment: u64,
        inner: Arc<dyn MemoryAllocator>,
    ) -> AllocResult<Arc<Self>> {
        if !is_power_of_two(memory_size) {
            return Err(MemForgeError::InvalidArgument(format!(
                "backing memory size {} is not a power of two",
                memory_size
            )));
        }
        if memory_size > max_system_size {
            return Err(MemForgeError::InvalidArgument(format!(
                "backing memory size {} exceeds system size {}",
                memory_size, max_system_size
            )));
        }

        let buddy = BuddyAllocator::new(max_system_size, 1)?;
        Ok(Arc::new_cyclic(|me| VirtualBuddyAllocator {
            self_ref: me.clone(),
            memory_size,
            memory_alignment,
            inner,
            state: Mutex::new(BuddyState {
                buddy,
                slots: Vec::new(),
                info: AllocatorInfo::default(),
            }),
        }))
    }

    fn owner_ref(&self) -> AllocatorRef {
        let weak: Weak<dyn MemoryAllocator> = self.self_ref.clone();
        AllocatorRef::new(weak)
    }

    /// Number of backing memories currently held, for diagnostics
    pub fn backing_memory_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.slots.iter().flatten().count())
            .unwrap_or(0)
    }

    /// Refcount of the slot backing `memory_index`, for diagnostics
    pub fn slot_refcount(&self, memory_index: usize) -> u32 {
        self.state
            .lock()
            .ok()
            .and_then(|s| {
                s.slots
                    .get(memory_index)
                    .and_then(|slot| slot.as_ref().map(|s| s.refcount))
            })
            .unwrap_or(0)
    }
}

impl MemoryAllocator for VirtualBuddyAllocator {
    fn try_allocate(&self, request: &AllocationRequest) -> AllocResult<Option<Allocation>> {
        if request.size == 0 {
            return Ok(None);
        }

        let mut state = self.state.lock()?;

        // Blocks never span backing memories, so anything larger than one
        // memory cannot be served here.
        if state
            .buddy
            .effective_block_size(request.size, request.alignment)
            > self.memory_size
        {
            return Ok(None);
        }

        let Some(block) = state.buddy.allocate(request.size, request.alignment) else {
            return Ok(None);
        };

        let index = (block.offset / self.memory_size) as usize;
        if state.slots.len() <= index {
            state.slots.resize_with(index + 1, || None);
        }

        let occupied = state.slots[index]
            .as_ref()
            .map(|slot| slot.refcount > 0)
            .unwrap_or(false);

        if occupied {
            if let Some(slot) = state.slots[index].as_mut() {
                slot.refcount += 1;
            }
        } else {
            if request.flags.never_allocate {
                state.buddy.deallocate(block);
                return Ok(None);
            }

            let inner_request =
                AllocationRequest::new(self.memory_size, self.memory_alignment);
            let backing = match self.inner.try_allocate(&inner_request) {
                Ok(Some(backing)) => backing,
                Ok(None) => {
                    state.buddy.deallocate(block);
                    return Ok(None);
                }
                Err(err) => {
                    state.buddy.deallocate(block);
                    return Err(err);
                }
            };
            state.slots[index] = Some(Slot {
                refcount: 1,
                backing,
            });
        }

        let slot = state.slots[index]
            .as_ref()
            .expect("slot populated above");
        let offset_in_memory = slot.backing.offset() + block.offset % self.memory_size;
        let memory = slot.backing.memory().clone();

        state.info.used_block_count += 1;
        state.info.used_block_bytes += block.size;

        Ok(Some(Allocation::new(
            memory,
            offset_in_memory,
            block.size,
            AllocationMethod::SubAllocated,
            Some(block),
            self.owner_ref(),
        )))
    }

    fn deallocate(&self, allocation: Allocation) {
        let Some(block) = allocation.block() else {
            tracing::error!("virtual buddy: allocation without block record");
            return;
        };

        let released = {
            let Ok(mut state) = self.state.lock() else {
                tracing::error!("virtual buddy: state lock poisoned in deallocate");
                return;
            };

            let index = (block.offset / self.memory_size) as usize;
            let mut released = None;
            match state.slots.get_mut(index) {
                Some(entry) => {
                    let now_empty = match entry.as_mut() {
                        Some(slot) => {
                            slot.refcount -= 1;
                            slot.refcount == 0
                        }
                        None => false,
                    };
                    if now_empty {
                        released = entry.take().map(|slot| slot.backing);
                    }
                }
                None => {
                    tracing::error!("virtual buddy: deallocate for unknown slot {}", index);
                }
            }

            state.buddy.deallocate(block);
            state.info.used_block_count = state.info.used_block_count.saturating_sub(1);
            state.info.used_block_bytes = state.info.used_block_bytes.saturating_sub(block.size);
            released
        };

        allocation.release_memory_ref();
        if let Some(backing) = released {
            self.inner.deallocate(backing);
        }
    }

    fn release_memory(&self) {
        // Backing memories are held only while referenced; pooled memory
        // lives below this layer.
        self.inner.release_memory();
    }

    fn query_info(&self) -> AllocatorInfo {
        let mut info = self.inner.query_info();
        if let Ok(state) = self.state.lock() {
            info.used_block_count += state.info.used_block_count;
            info.used_block_bytes += state.info.used_block_bytes;
        }
        info
    }

    fn memory_size(&self) -> Option<u64> {
        Some(self.memory_size)
    }

    fn memory_alignment(&self) -> u64 {
        self.memory_alignment
    }
}

impl Drop for VirtualBuddyAllocator {
    fn drop(&mut self) {
        if let Ok(state) = self.state.lock() {
            let live: u32 = state
                .slots
                .iter()
                .flatten()
                .map(|slot| slot.refcount)
                .sum();
            if live != 0 {
                tracing::warn!("virtual buddy dropped with {} live allocations", live);
            }
        }
    }
}
