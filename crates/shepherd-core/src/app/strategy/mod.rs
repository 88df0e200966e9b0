//! Queue processing strategies: which queue the worker services next.

pub mod cursor;
pub mod dynamic;
pub mod ordered;

use async_trait::async_trait;

use crate::domain::{QueueMetrics, Result};

pub use self::cursor::RepeatCursor;
pub use self::dynamic::{DynamicOrderQueueProcessingStrategy, QueuePrefixes, prioritize, score};
pub use self::ordered::OrderedQueueProcessingStrategy;

#[async_trait]
pub trait QueueProcessingStrategy: Send {
    /// Next queue to dispatch, rescanning once the current snapshot is used up.
    /// `None` means nothing is pending right now.
    async fn next_queue(&mut self) -> Result<Option<QueueMetrics>>;

    /// Current per-queue process cap, for strategies whose settings can change at runtime.
    fn limit_per_queue(&self) -> Option<u32> {
        None
    }
}
