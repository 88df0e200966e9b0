use std::time::Duration;

use async_trait::async_trait;

use crate::app::scanner::QueueScan;
use crate::app::strategy::{QueueProcessingStrategy, RepeatCursor};
use crate::domain::{QueueMetrics, Result};

/// Services queues strictly in scan order (declaration order, then store order).
pub struct OrderedQueueProcessingStrategy {
    scanner: Box<dyn QueueScan>,
    store_names: Vec<String>,
    empty_scan_cooldown: Duration,
    cursor: RepeatCursor,
}

impl OrderedQueueProcessingStrategy {
    pub fn new(
        scanner: Box<dyn QueueScan>,
        store_names: Vec<String>,
        empty_scan_cooldown: Duration,
    ) -> Self {
        Self {
            scanner,
            store_names,
            empty_scan_cooldown,
            cursor: RepeatCursor::default(),
        }
    }
}

#[async_trait]
impl QueueProcessingStrategy for OrderedQueueProcessingStrategy {
    async fn next_queue(&mut self) -> Result<Option<QueueMetrics>> {
        if self.cursor.is_exhausted() {
            let metrics = self
                .scanner
                .scan_queues(&self.store_names, self.empty_scan_cooldown)
                .await;
            self.cursor = RepeatCursor::once_each(metrics);
        }
        Ok(self.cursor.next())
    }
}
