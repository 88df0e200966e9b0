//! TaskManager - サブプロセス 1 回分の仕事
//!
//! # 流れ
//! 1. queue の MessageProcessor を引く（なければ設定ミスとして即エラー）
//! 2. chunk size 分だけ受信（0 件なら失敗扱いだがエラーではない）
//! 3. retry キューの有無を各メッセージに付ける
//! 4. processor にバッチごと渡し、返ってきたものだけを ack / reject / error 処理する
//! 5. エラー付きのメッセージを queue-errors ターゲットに記録

use std::sync::Arc;

use tracing::{debug, info};

use crate::app::logger::QueueErrorLogger;
use crate::app::memory_checker::TaskMemoryUsageChecker;
use crate::app::registry::ProcessorRegistry;
use crate::config::QueuesConfig;
use crate::domain::{ReceivedMessage, Result, TaskOptions, TaskResult, WorkerError};
use crate::ports::QueueClient;

const RETRY_QUEUE_SUFFIX: &str = ".retry";

pub struct TaskManager {
    client: Arc<dyn QueueClient>,
    queues: QueuesConfig,
    registry: Arc<ProcessorRegistry>,
    memory_checker: TaskMemoryUsageChecker,
    error_logger: QueueErrorLogger,
}

impl TaskManager {
    pub fn new(
        client: Arc<dyn QueueClient>,
        queues: QueuesConfig,
        registry: Arc<ProcessorRegistry>,
        memory_checker: TaskMemoryUsageChecker,
        error_logger: QueueErrorLogger,
    ) -> Self {
        Self {
            client,
            queues,
            registry,
            memory_checker,
            error_logger,
        }
    }

    pub async fn run(&self, queue_name: &str, options: TaskOptions) -> Result<TaskResult> {
        let processor = self
            .registry
            .get(queue_name)
            .ok_or_else(|| WorkerError::MissingProcessor(queue_name.to_string()))?;
        let chunk_size = self
            .queues
            .chunk_size_override(queue_name)
            .unwrap_or_else(|| processor.chunk_size());

        let mut messages = self
            .client
            .receive_messages(queue_name, chunk_size, self.queues.receiver_options(queue_name))
            .await?;
        if messages.is_empty() {
            return Ok(TaskResult::unsuccessful(
                format!("No messages received from the queue \"{queue_name}\"."),
                0,
            ));
        }

        let received_count = messages.len();
        debug!(queue = queue_name, received = received_count, chunk_size, "received messages");
        self.memory_checker.check(queue_name, &messages, chunk_size);
        self.mark_retry_queue(queue_name, &mut messages);

        let processed = processor.process_messages(messages).await;
        if processed.is_empty() {
            return Ok(TaskResult::unsuccessful(
                format!(
                    "No messages processed from the queue \"{queue_name}\". Check the processor registered for it."
                ),
                received_count,
            ));
        }

        if !options.no_ack {
            self.post_process(&processed).await?;
        }
        self.error_logger.log_failed_messages(queue_name, &processed);

        let processed_count = processed.len();
        info!(queue = queue_name, received = received_count, processed = processed_count, "task done");
        Ok(TaskResult {
            is_successful: true,
            message: format!(
                "Received messages: \"{received_count}\", Processed messages: \"{processed_count}\""
            ),
            received_count,
            processed_count,
        })
    }

    fn mark_retry_queue(&self, queue_name: &str, messages: &mut [ReceivedMessage]) {
        if queue_name.ends_with(RETRY_QUEUE_SUFFIX) {
            return;
        }
        if self
            .registry
            .contains(&format!("{queue_name}{RETRY_QUEUE_SUFFIX}"))
        {
            return;
        }
        for message in messages {
            message.retry_queue_exists = false;
        }
    }

    async fn post_process(&self, processed: &[ReceivedMessage]) -> Result<()> {
        for message in processed {
            if message.acknowledge {
                self.client.acknowledge(message).await?;
            }
            if message.reject {
                self.client.reject(message).await?;
            }
            if message.has_error {
                self.client.handle_error(message).await?;
            }
        }
        Ok(())
    }
}
