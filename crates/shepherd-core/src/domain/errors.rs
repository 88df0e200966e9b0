//! Errors - エラー型と分類
//!
//! # 分類
//! - 設定エラー: MissingProcessor / MissingAdapter（そのタスク実行だけを失敗させる）
//! - 一時的な I/O エラー: QueueClient / MetricsRead / MemoryRead（ログしてサイクルをスキップ）
//! - 資源枯渇: FreeMemoryUndetected（呼び出し元に伝播させる）

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(
        "there is no message processor registered for this queue: {0}, register one before starting a task for it"
    )]
    MissingProcessor(String),

    #[error("no queue adapter is configured for queue={0}")]
    MissingAdapter(String),

    #[error(
        "could not detect free memory; set resources.ignore_zero_memory_read = true to run anyway"
    )]
    FreeMemoryUndetected,

    #[error("free memory read failed: {0}")]
    MemoryRead(String),

    #[error("free memory read timed out after {0:?}")]
    MemoryReadTimeout(Duration),

    #[error("queue client error: {0}")]
    QueueClient(String),

    #[error("metrics read failed for queue={queue} store={store:?}: {reason}")]
    MetricsRead {
        queue: String,
        store: Option<String>,
        reason: String,
    },

    #[error("store provider error: {0}")]
    StoreProvider(String),

    #[error("process store error: {0}")]
    ProcessStore(String),

    #[error("process spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("unsupported shutdown signal: {0}")]
    UnknownSignal(String),
}

impl WorkerError {
    /// Configuration errors are never retried; they fail the invocation that hit them.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            WorkerError::MissingProcessor(_)
                | WorkerError::MissingAdapter(_)
                | WorkerError::UnknownSignal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
