use serde::{Deserialize, Serialize};

/// Pending-message snapshot for one (queue, store | region) pair.
///
/// Created fresh on every scan and never persisted. `priority` is the only
/// field a strategy writes after the scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub queue_name: String,
    pub store_name: Option<String>,
    pub region_name: Option<String>,
    pub message_count: u64,
    pub batch_size: u64,
    pub priority: i32,
    pub message_to_chunk_size_ratio: u64,
}

impl QueueMetrics {
    pub fn new(
        queue_name: impl Into<String>,
        store_name: Option<String>,
        region_name: Option<String>,
        message_count: u64,
        batch_size: u64,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            store_name,
            region_name,
            message_count,
            batch_size,
            priority: 0,
            message_to_chunk_size_ratio: chunk_ratio(message_count, batch_size),
        }
    }

    /// Store name, else region name, else `"-"`.
    pub fn location(&self) -> &str {
        self.store_name
            .as_deref()
            .or(self.region_name.as_deref())
            .unwrap_or("-")
    }

    /// `true` when at least one full batch is pending.
    pub fn has_full_batch(&self) -> bool {
        self.message_count >= self.batch_size
    }
}

/// Number of full batches pending, rounded half up.
///
/// A queue without a configured batch size counts as one batch.
pub fn chunk_ratio(message_count: u64, batch_size: u64) -> u64 {
    if batch_size == 0 {
        return u64::from(message_count > 0);
    }
    (message_count * 2 + batch_size) / (batch_size * 2)
}
