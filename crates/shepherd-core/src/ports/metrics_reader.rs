use async_trait::async_trait;

use crate::domain::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsRequest {
    pub queue_name: String,
    pub store_name: Option<String>,
    pub region_name: Option<String>,
}

/// Reads pending-message counts for one queue adapter.
///
/// Readers are consulted in registration order; the first one that is
/// applicable to the queue's adapter answers.
#[async_trait]
pub trait MetricsReader: Send + Sync {
    fn is_applicable(&self, adapter_name: &str) -> bool;

    async fn read(&self, request: &MetricsRequest) -> Result<u64>;
}
