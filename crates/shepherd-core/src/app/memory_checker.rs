//! Advisory memory checks for one task run. Nothing here blocks processing.

use std::sync::Arc;

use tracing::warn;

use crate::config::TaskConfig;
use crate::domain::ReceivedMessage;
use crate::ports::OwnMemoryProbe;

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryWarning {
    /// The received bodies together exceed the per-chunk budget.
    ChunkTooLarge {
        chunk_kb: u64,
        limit_kb: u64,
        recommended_chunk_size: usize,
    },
    /// The task process itself has peaked above the per-task budget.
    PeakTooHigh { peak_mb: u64, limit_mb: u64 },
}

pub struct TaskMemoryUsageChecker {
    max_chunk_kb: Option<u64>,
    max_task_mb: Option<u64>,
    probe: Arc<dyn OwnMemoryProbe>,
}

impl TaskMemoryUsageChecker {
    pub fn new(config: &TaskConfig, probe: Arc<dyn OwnMemoryProbe>) -> Self {
        Self {
            max_chunk_kb: config.max_memory_chunk_size_kb,
            max_task_mb: config.max_memory_size_mb,
            probe,
        }
    }

    /// Logs and returns every budget the received chunk breaks.
    pub fn check(
        &self,
        queue_name: &str,
        messages: &[ReceivedMessage],
        chunk_size: usize,
    ) -> Vec<MemoryWarning> {
        let mut warnings = Vec::new();

        if let Some(limit_kb) = self.max_chunk_kb
            && !messages.is_empty()
        {
            let chunk_bytes: u64 = messages.iter().map(|m| m.body.len() as u64).sum();
            if chunk_bytes > limit_kb * KB {
                let average = (chunk_bytes / messages.len() as u64).max(1);
                let recommended_chunk_size = ((limit_kb * KB) / average).max(1) as usize;
                warn!(
                    queue = queue_name,
                    chunk_size,
                    chunk_kb = chunk_bytes / KB,
                    limit_kb,
                    recommended_chunk_size,
                    "message chunk exceeds the memory budget, consider a smaller chunk size"
                );
                warnings.push(MemoryWarning::ChunkTooLarge {
                    chunk_kb: chunk_bytes / KB,
                    limit_kb,
                    recommended_chunk_size,
                });
            }
        }

        if let Some(limit_mb) = self.max_task_mb {
            let peak_mb = self.probe.peak_memory_bytes() / MB;
            if peak_mb > limit_mb {
                warn!(queue = queue_name, peak_mb, limit_mb, "task memory exceeds its budget");
                warnings.push(MemoryWarning::PeakTooHigh { peak_mb, limit_mb });
            }
        }

        warnings
    }
}
