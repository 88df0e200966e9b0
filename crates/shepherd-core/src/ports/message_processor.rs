use async_trait::async_trait;

use crate::domain::ReceivedMessage;

/// Business processing for one queue.
///
/// Returns the subset of messages it handled, with `acknowledge` / `reject` /
/// `has_error` set. Anything left out stays pending on the broker.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process_messages(&self, messages: Vec<ReceivedMessage>) -> Vec<ReceivedMessage>;

    /// Default number of messages fetched per receive call.
    fn chunk_size(&self) -> usize;
}
