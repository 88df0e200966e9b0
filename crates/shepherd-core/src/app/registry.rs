//! ProcessorRegistry - キュー名 → MessageProcessor
//!
//! 起動時に組み立てて、その後は読み取り専用で共有する（ロック不要）。
//! 登録順を保持するので、ログや `queue_names()` の並びが安定する。

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::QueuesConfig;
use crate::ports::MessageProcessor;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a message processor for queue '{0}' is already registered")]
    DuplicateProcessor(String),
}

#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn MessageProcessor>>,
    order: Vec<String>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            processors: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        queue_name: impl Into<String>,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<(), RegistryError> {
        let queue_name = queue_name.into();
        if self.processors.contains_key(&queue_name) {
            return Err(RegistryError::DuplicateProcessor(queue_name));
        }
        self.order.push(queue_name.clone());
        self.processors.insert(queue_name, processor);
        Ok(())
    }

    pub fn get(&self, queue_name: &str) -> Option<Arc<dyn MessageProcessor>> {
        self.processors.get(queue_name).cloned()
    }

    pub fn contains(&self, queue_name: &str) -> bool {
        self.processors.contains_key(queue_name)
    }

    /// Registered queues in registration order.
    pub fn queue_names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Messages fetched per task run: config override, else the processor's default.
    pub fn chunk_size(&self, queue_name: &str, queues: &QueuesConfig) -> Option<usize> {
        queues
            .chunk_size_override(queue_name)
            .or_else(|| self.get(queue_name).map(|processor| processor.chunk_size()))
    }

    /// Batch size of every configured or registered queue, as the scanner needs it.
    /// Queues without override and processor are left out (batch size 0).
    pub fn chunk_sizes(&self, queues: &QueuesConfig) -> HashMap<String, u64> {
        queues
            .names
            .iter()
            .chain(self.order.iter())
            .filter_map(|queue_name| {
                self.chunk_size(queue_name, queues)
                    .map(|size| (queue_name.clone(), size as u64))
            })
            .collect()
    }
}
