//! Aggregated allocator statistics

use crate::backend::HeapKind;
use crate::memory::AllocatorInfo;
use crate::size_class::format_bytes;
use serde::Serialize;

/// Usage snapshot across every stack the facade owns
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AllocatorStats {
    pub total: AllocatorInfo,
    pub device_local: AllocatorInfo,
    pub upload: AllocatorInfo,
    pub readback: AllocatorInfo,
}

impl AllocatorStats {
    pub(crate) fn record(&mut self, kind: HeapKind, info: AllocatorInfo) {
        match kind {
            HeapKind::DeviceLocal => self.device_local = info,
            HeapKind::Upload => self.upload = info,
            HeapKind::Readback => self.readback = info,
        }
        self.total.accumulate(&info);
    }

    /// Fraction of backing memory bytes actually handed out in blocks
    pub fn utilization(&self) -> f64 {
        if self.total.used_memory_bytes == 0 {
            return 0.0;
        }
        self.total.used_block_bytes as f64 / self.total.used_memory_bytes as f64
    }

    /// Print a usage report
    pub fn report(&self) {
        println!("\n  GPU Memory Allocator:");
        println!(
            "    Used blocks:        {} ({} blocks)",
            format_bytes(self.total.used_block_bytes),
            self.total.used_block_count
        );
        println!(
            "    Used memory:        {} ({} heaps)",
            format_bytes(self.total.used_memory_bytes),
            self.total.used_memory_count
        );
        println!(
            "    Pooled memory:      {}",
            format_bytes(self.total.free_memory_bytes)
        );
        println!("    Utilization:        {:.2}%", self.utilization() * 100.0);
    }
}
