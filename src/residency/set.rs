//! Residency sets
//!
//! A set collects the memories referenced by one command submission so the
//! manager can page them all in and fence-stamp them together.

use crate::memory::{Memory, MemoryId};
use std::collections::HashSet;
use std::sync::Arc;

/// Memories referenced by an in-flight submission
#[derive(Debug, Default)]
pub struct ResidencySet {
    members: Vec<Arc<Memory>>,
    ids: HashSet<MemoryId>,
}

impl ResidencySet {
    pub fn new() -> Self {
        ResidencySet::default()
    }

    /// Add a memory, ignoring duplicates
    ///
    /// Returns true when the memory was newly inserted.
    pub fn insert(&mut self, memory: &Arc<Memory>) -> bool {
        if !self.ids.insert(memory.id()) {
            return false;
        }
        self.members.push(memory.clone());
        true
    }

    pub fn contains(&self, memory: &Arc<Memory>) -> bool {
        self.ids.contains(&memory.id())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Memory>> {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Drop all members, keeping allocations untouched
    pub fn reset(&mut self) {
        self.members.clear();
        self.ids.clear();
    }
}
