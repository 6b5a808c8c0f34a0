//! Allocator configuration

use crate::error::{AllocResult, MemForgeError};
use crate::size_class::{is_power_of_two, KB, MB};
use serde::Serialize;

/// Behavior switches for the allocator facade
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorFlags {
    /// Disable sub-allocation; every request gets its own memory
    pub always_committed: bool,
    /// Disable pooling; released memories are destroyed immediately
    pub always_on_demand: bool,
    /// Evict through the residency manager before any memory creation
    pub always_in_budget: bool,
    /// Turn off slab prefetching regardless of request flags
    pub disable_prefetch: bool,
}

/// Configuration consumed at facade construction
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AllocatorConfig {
    /// Size used for non-standalone backing memories
    pub preferred_memory_size: u64,
    /// Upper bound on any single request
    pub max_memory_size: u64,
    /// Smallest slab block size
    pub min_block_size: u64,
    /// Driver heap size and alignment granularity
    pub heap_alignment: u64,
    /// Slab classes wasting more than this fraction reject the request
    pub fragmentation_limit: f64,
    /// Per-segment cap on pooled memories, unbounded when absent
    pub pool_capacity_per_segment: Option<usize>,
    pub flags: AllocatorFlags,
    /// Fraction of the driver budget this process may keep resident
    pub max_video_memory_budget: f64,
    /// Hard cap on resident bytes, 0 for no cap
    pub total_resource_budget_limit: u64,
    /// Extra bytes evicted beyond the strict requirement
    pub evict_batch_size: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            preferred_memory_size: 4 * MB,
            max_memory_size: 4096 * MB,
            min_block_size: 256,
            heap_alignment: 64 * KB,
            fragmentation_limit: 0.125,
            pool_capacity_per_segment: None,
            flags: AllocatorFlags::default(),
            max_video_memory_budget: 0.95,
            total_resource_budget_limit: 0,
            evict_batch_size: 0,
        }
    }
}

impl AllocatorConfig {
    /// Create a validated configuration from the two sizing knobs
    pub fn new(preferred_memory_size: u64, max_memory_size: u64) -> AllocResult<Self> {
        let config = AllocatorConfig {
            preferred_memory_size,
            max_memory_size,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_flags(mut self, flags: AllocatorFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_fragmentation_limit(mut self, limit: f64) -> Self {
        self.fragmentation_limit = limit;
        self
    }

    pub fn with_heap_alignment(mut self, alignment: u64) -> Self {
        self.heap_alignment = alignment;
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity_per_segment = Some(capacity);
        self
    }

    pub fn with_budget(mut self, fraction: f64, total_limit: u64, evict_batch: u64) -> Self {
        self.max_video_memory_budget = fraction;
        self.total_resource_budget_limit = total_limit;
        self.evict_batch_size = evict_batch;
        self
    }

    /// Check internal consistency
    pub fn validate(&self) -> AllocResult<()> {
        if !is_power_of_two(self.preferred_memory_size) {
            return Err(MemForgeError::InvalidArgument(format!(
                "preferred memory size {} is not a power of two",
                self.preferred_memory_size
            )));
        }
        if self.preferred_memory_size > self.max_memory_size {
            return Err(MemForgeError::InvalidArgument(format!(
                "preferred memory size {} exceeds maximum {}",
                self.preferred_memory_size, self.max_memory_size
            )));
        }
        if !is_power_of_two(self.min_block_size) {
            return Err(MemForgeError::InvalidArgument(format!(
                "minimum block size {} is not a power of two",
                self.min_block_size
            )));
        }
        if !is_power_of_two(self.heap_alignment) {
            return Err(MemForgeError::InvalidArgument(format!(
                "heap alignment {} is not a power of two",
                self.heap_alignment
            )));
        }
        if self.heap_alignment > self.preferred_memory_size {
            return Err(MemForgeError::InvalidArgument(format!(
                "heap alignment {} exceeds preferred memory size {}",
                self.heap_alignment, self.preferred_memory_size
            )));
        }
        if !(0.0..1.0).contains(&self.fragmentation_limit) {
            return Err(MemForgeError::InvalidArgument(format!(
                "fragmentation limit {} outside [0, 1)",
                self.fragmentation_limit
            )));
        }
        if !(0.0..=1.0).contains(&self.max_video_memory_budget) {
            return Err(MemForgeError::InvalidArgument(format!(
                "video memory budget fraction {} outside [0, 1]",
                self.max_video_memory_budget
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AllocatorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_new_validates() {
        assert!(AllocatorConfig::new(4 * MB, 256 * MB).is_ok());

        // preferred above max
        assert!(AllocatorConfig::new(256 * MB, 4 * MB).is_err());
        // not a power of two
        assert!(AllocatorConfig::new(3_000_000, 256 * MB).is_err());
    }

    #[test]
    fn test_invalid_fragmentation_limit() {
        let config = AllocatorConfig::default().with_fragmentation_limit(1.0);
        assert!(config.validate().is_err());

        let config = AllocatorConfig::default().with_fragmentation_limit(-0.1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_budget_fraction() {
        let config = AllocatorConfig::default().with_budget(1.5, 0, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heap_alignment_bound() {
        let mut config = AllocatorConfig::default();
        config.heap_alignment = config.preferred_memory_size * 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_chain() {
        let config = AllocatorConfig::new(MB, 64 * MB)
            .unwrap()
            .with_flags(AllocatorFlags {
                always_on_demand: true,
                ..Default::default()
            })
            .with_pool_capacity(8)
            .with_budget(0.8, 512 * MB, 16 * MB);

        assert!(config.validate().is_ok());
        assert!(config.flags.always_on_demand);
        assert_eq!(config.pool_capacity_per_segment, Some(8));
        assert_eq!(config.total_resource_budget_limit, 512 * MB);
    }
}
