//! Device backend abstraction
//!
//! The allocator core never talks to a driver directly. Everything it needs
//! from the device is pinned behind [`MemoryBackend`]: heap creation and
//! destruction, residency paging, budget sampling, and fence tokens for
//! eviction safety. A host-memory implementation used by tests and benches
//! lives in [`host`].

use crate::error::AllocResult;
use serde::Serialize;
use std::fmt;

pub mod host;

pub use host::HostBackend;

/// Budget pool a backing memory counts against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SegmentGroup {
    /// Dedicated video memory
    Local,
    /// System memory visible to the device
    NonLocal,
}

/// Kind of driver heap to create
///
/// Determines CPU visibility and the segment group the heap is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HeapKind {
    /// Device-local heap, fastest for GPU access
    DeviceLocal,
    /// CPU-writable upload heap
    Upload,
    /// CPU-readable readback heap
    Readback,
}

impl HeapKind {
    /// Segment group heaps of this kind are charged to
    pub fn segment_group(self) -> SegmentGroup {
        match self {
            HeapKind::DeviceLocal => SegmentGroup::Local,
            HeapKind::Upload | HeapKind::Readback => SegmentGroup::NonLocal,
        }
    }

    pub const ALL: [HeapKind; 3] = [HeapKind::DeviceLocal, HeapKind::Upload, HeapKind::Readback];
}

/// Driver budget sample for one segment group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryBudget {
    /// Bytes the process may keep resident before the OS starts demoting
    pub limit_bytes: u64,
    /// Bytes currently reported resident by the driver
    pub used_bytes: u64,
}

/// Opaque handle to a driver heap created by the backend
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceMemoryHandle(pub u64);

impl fmt::Debug for DeviceMemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceMemoryHandle({:#x})", self.0)
    }
}

/// Device services the allocator core consumes
///
/// Fences are monotonic per segment group: `current_fence` is the token the
/// next submission will signal, `completed_fence` the highest token known to
/// have finished on the device. Eviction only touches memories whose
/// last-use fence has completed.
pub trait MemoryBackend: Send + Sync + fmt::Debug {
    /// Allocate a driver heap
    fn create_memory(
        &self,
        size: u64,
        alignment: u64,
        segment: SegmentGroup,
        kind: HeapKind,
    ) -> AllocResult<DeviceMemoryHandle>;

    /// Release a driver heap
    fn destroy_memory(&self, handle: DeviceMemoryHandle);

    /// Page heaps into device memory
    fn make_resident(&self, handles: &[DeviceMemoryHandle]) -> AllocResult<()>;

    /// Page heaps out of device memory
    fn make_non_resident(&self, handles: &[DeviceMemoryHandle]);

    /// Sample the driver budget for a segment group
    fn query_budget(&self, segment: SegmentGroup) -> MemoryBudget;

    /// Token the next submission in this segment group will signal
    fn current_fence(&self, segment: SegmentGroup) -> u64;

    /// Highest token known to have completed on the device
    fn completed_fence(&self, segment: SegmentGroup) -> u64;

    /// Block until `value` has completed on the device
    fn wait_fence(&self, segment: SegmentGroup, value: u64) -> AllocResult<()>;
}
