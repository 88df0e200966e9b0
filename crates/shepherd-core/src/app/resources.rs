//! SystemResourcesManager - dispatch 前のメモリ判定
//!
//! - free memory が 0 と読めたら「測れていない」とみなす。ignore フラグがなければエラー
//!   （0 を「余裕あり」と扱って無制限に spawn しないため）
//! - 自プロセスの peak memory の伸び率（初回呼び出し時を基準）

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::ResourcesConfig;
use crate::domain::{Result, WorkerError};
use crate::ports::{FreeMemoryReader, OwnMemoryProbe};

pub struct SystemResourcesManager {
    reader: Arc<dyn FreeMemoryReader>,
    probe: Arc<dyn OwnMemoryProbe>,
    config: ResourcesConfig,
    baseline_peak: Option<u64>,
    last_free_memory_mb: u64,
}

impl SystemResourcesManager {
    pub fn new(
        reader: Arc<dyn FreeMemoryReader>,
        probe: Arc<dyn OwnMemoryProbe>,
        config: ResourcesConfig,
    ) -> Self {
        Self {
            reader,
            probe,
            config,
            baseline_peak: None,
            last_free_memory_mb: 0,
        }
    }

    /// `true` when free memory is above the configured buffer.
    ///
    /// A zero reading is an error unless `should_ignore_zero_memory` is set.
    pub async fn enough_resources(&mut self, should_ignore_zero_memory: bool) -> Result<bool> {
        let free_memory = self.free_memory(self.config.memory_read_timeout()).await;
        self.last_free_memory_mb = free_memory;

        if free_memory == 0 && !should_ignore_zero_memory {
            return Err(WorkerError::FreeMemoryUndetected);
        }
        Ok(free_memory > self.config.free_memory_buffer_mb)
    }

    /// Free memory in MB; 0 when the read fails or exceeds `timeout`.
    pub async fn free_memory(&self, timeout: Duration) -> u64 {
        match tokio::time::timeout(timeout, self.reader.free_memory_mb(timeout)).await {
            Ok(Ok(free_memory)) => free_memory,
            Ok(Err(err)) => {
                warn!(error = %err, "free memory read failed");
                0
            }
            Err(_) => {
                warn!(error = %WorkerError::MemoryReadTimeout(timeout), "free memory read failed");
                0
            }
        }
    }

    /// One reading with the configured timeout, without touching the admission state.
    pub async fn current_free_memory(&self) -> u64 {
        self.free_memory(self.config.memory_read_timeout()).await
    }

    /// Reading taken by the last `enough_resources` call.
    pub fn last_free_memory_mb(&self) -> u64 {
        self.last_free_memory_mb
    }

    /// Growth of the own peak memory in percent over the first observed peak.
    pub fn own_peak_memory_growth(&mut self) -> u64 {
        let current = self.probe.peak_memory_bytes();
        let baseline = *self.baseline_peak.get_or_insert(current);
        if baseline == 0 || current <= baseline {
            return 0;
        }
        ((current - baseline) as f64 * 100.0 / baseline as f64).round() as u64
    }
}
