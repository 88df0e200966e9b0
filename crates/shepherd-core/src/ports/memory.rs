use std::time::Duration;

use async_trait::async_trait;

use crate::domain::Result;

/// Platform specific free system memory reader.
#[async_trait]
pub trait FreeMemoryReader: Send + Sync {
    /// Free memory in MB. Must give up after `timeout`.
    async fn free_memory_mb(&self, timeout: Duration) -> Result<u64>;
}

/// Peak resident memory of the current process.
pub trait OwnMemoryProbe: Send + Sync {
    /// Bytes; 0 when unknown.
    fn peak_memory_bytes(&self) -> u64;
}

/// Resident memory of a child process tree.
pub trait ProcessMemoryProbe: Send + Sync {
    /// RSS bytes of `pid` plus its direct children; 0 once `pid` is gone.
    fn process_memory_bytes(&self, pid: u32) -> u64;
}
