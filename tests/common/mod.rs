//! Common test fixtures for allocator stacks
//!
//! Every test builds its own host backend so tests stay independent; the
//! tracing subscriber is shared and installed once.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use memforge::{
    AllocatorConfig, DeviceAllocator, HostBackend,
};
use once_cell::sync::Lazy;
use std::sync::Arc;

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
});

/// Install the shared tracing subscriber and return a fresh backend
pub fn test_backend() -> Arc<HostBackend> {
    Lazy::force(&TRACING);
    Arc::new(HostBackend::new())
}

/// Backend with explicit budget limits for residency tests
pub fn budgeted_backend(local_limit: u64, non_local_limit: u64) -> Arc<HostBackend> {
    Lazy::force(&TRACING);
    Arc::new(HostBackend::with_budgets(local_limit, non_local_limit))
}

/// Small-geometry config keeping test heaps tiny
pub fn test_config() -> AllocatorConfig {
    AllocatorConfig {
        preferred_memory_size: 65536,
        max_memory_size: 16 * 1024 * 1024,
        min_block_size: 256,
        heap_alignment: 4096,
        ..Default::default()
    }
}

/// Facade over a fresh backend with the small test geometry
pub fn test_allocator() -> (Arc<HostBackend>, Arc<DeviceAllocator>) {
    let backend = test_backend();
    let allocator = DeviceAllocator::new(backend.clone(), test_config()).unwrap();
    (backend, allocator)
}
