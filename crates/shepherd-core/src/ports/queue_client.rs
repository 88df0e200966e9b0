use async_trait::async_trait;

use crate::domain::{ReceivedMessage, Result};

/// Broker transport as seen by a task subprocess.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receive up to `chunk_size` messages. `options` are the queue's receiver options.
    async fn receive_messages(
        &self,
        queue_name: &str,
        chunk_size: usize,
        options: &serde_json::Value,
    ) -> Result<Vec<ReceivedMessage>>;

    async fn acknowledge(&self, message: &ReceivedMessage) -> Result<()>;

    async fn reject(&self, message: &ReceivedMessage) -> Result<()>;

    async fn handle_error(&self, message: &ReceivedMessage) -> Result<()>;
}
