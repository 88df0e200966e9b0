use serde::{Deserialize, Serialize};

/// One message handed out by a `QueueClient`.
///
/// The processor flips `acknowledge` / `reject` / `has_error`; the task manager
/// reads the flags afterwards to decide what to tell the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub queue_name: String,
    pub body: String,
    pub routing_key: Option<String>,
    pub store_name: Option<String>,
    pub delivery_tag: Option<String>,
    pub acknowledge: bool,
    pub reject: bool,
    pub has_error: bool,
    pub retry_queue_exists: bool,
}

impl ReceivedMessage {
    pub fn new(queue_name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            body: body.into(),
            routing_key: None,
            store_name: None,
            delivery_tag: None,
            acknowledge: false,
            reject: false,
            has_error: false,
            retry_queue_exists: true,
        }
    }

    pub fn with_delivery_tag(mut self, tag: impl Into<String>) -> Self {
        self.delivery_tag = Some(tag.into());
        self
    }

    pub fn acknowledged(mut self) -> Self {
        self.acknowledge = true;
        self
    }

    pub fn rejected(mut self) -> Self {
        self.reject = true;
        self
    }

    pub fn failed(mut self) -> Self {
        self.has_error = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskOptions {
    /// Leave every processed message untouched on the broker.
    pub no_ack: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResult {
    pub is_successful: bool,
    pub message: String,
    pub received_count: usize,
    pub processed_count: usize,
}

impl TaskResult {
    pub(crate) fn unsuccessful(message: String, received_count: usize) -> Self {
        Self {
            is_successful: false,
            message,
            received_count,
            processed_count: 0,
        }
    }
}
