//! DynamicOrderQueueProcessingStrategy - スコアで並べ替える strategy
//!
//! # スコア
//! - モードビットごとに +1（publish / sync prefix、big / small queue）
//! - 1 バッチ分に満たないキューは −100（どの +1 の組み合わせより必ず下になる）
//!
//! 並び順は priority 降順、同点は message_count 降順、それも同じならスキャン順（安定ソート）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::app::scanner::QueueScan;
use crate::app::strategy::{QueueProcessingStrategy, RepeatCursor};
use crate::domain::{DynamicSettings, QueueMetrics, ReadModeFlag, Result};
use crate::ports::DynamicSettingsUpdater;

const SUB_BATCH_PENALTY: i32 = -100;
const TOP_QUEUES_LOGGED: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePrefixes {
    pub publish: String,
    pub sync: String,
}

impl Default for QueuePrefixes {
    fn default() -> Self {
        Self {
            publish: "publish".to_string(),
            sync: "sync".to_string(),
        }
    }
}

pub fn score(metrics: &QueueMetrics, settings: &DynamicSettings, prefixes: &QueuePrefixes) -> i32 {
    let mode = settings.mode;
    let threshold = settings.big_queue_threshold_batches;
    let ratio = metrics.message_to_chunk_size_ratio;

    let rules = [
        mode.is_active(ReadModeFlag::PreferPub) && metrics.queue_name.starts_with(&prefixes.publish),
        mode.is_active(ReadModeFlag::PreferSync) && metrics.queue_name.starts_with(&prefixes.sync),
        mode.is_active(ReadModeFlag::PreferBig) && ratio > threshold,
        mode.is_active(ReadModeFlag::PreferSmall) && ratio < threshold,
    ];
    let bonus = rules.iter().filter(|applies| **applies).count() as i32;

    if metrics.has_full_batch() {
        bonus
    } else {
        bonus + SUB_BATCH_PENALTY
    }
}

/// Assigns priorities and sorts: priority desc, then message count desc, then scan order.
pub fn prioritize(
    mut metrics: Vec<QueueMetrics>,
    settings: &DynamicSettings,
    prefixes: &QueuePrefixes,
) -> Vec<QueueMetrics> {
    for entry in &mut metrics {
        entry.priority = score(entry, settings, prefixes);
    }
    metrics.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.message_count.cmp(&a.message_count))
    });
    metrics
}

/// How many dispatches in a row one entry may take, never less than one.
fn consecutive_dispatches(metrics: &QueueMetrics, limit_per_queue: u32) -> u64 {
    metrics
        .message_to_chunk_size_ratio
        .min(u64::from(limit_per_queue))
        .max(1)
}

pub struct DynamicOrderQueueProcessingStrategy {
    scanner: Box<dyn QueueScan>,
    store_names: Vec<String>,
    empty_scan_cooldown: Duration,
    settings: DynamicSettings,
    updaters: Vec<Arc<dyn DynamicSettingsUpdater>>,
    prefixes: QueuePrefixes,
    last_scan: Vec<QueueMetrics>,
    cursor: RepeatCursor,
}

impl DynamicOrderQueueProcessingStrategy {
    pub fn new(
        scanner: Box<dyn QueueScan>,
        store_names: Vec<String>,
        empty_scan_cooldown: Duration,
        settings: DynamicSettings,
    ) -> Self {
        Self {
            scanner,
            store_names,
            empty_scan_cooldown,
            settings,
            updaters: Vec::new(),
            prefixes: QueuePrefixes::default(),
            last_scan: Vec::new(),
            cursor: RepeatCursor::default(),
        }
    }

    pub fn with_updaters(mut self, updaters: Vec<Arc<dyn DynamicSettingsUpdater>>) -> Self {
        self.updaters = updaters;
        self
    }

    pub fn with_prefixes(mut self, prefixes: QueuePrefixes) -> Self {
        self.prefixes = prefixes;
        self
    }

    pub fn settings(&self) -> &DynamicSettings {
        &self.settings
    }

    async fn rescan(&mut self) {
        let previous = std::mem::take(&mut self.last_scan);
        self.settings = self
            .updaters
            .iter()
            .fold(self.settings.clone(), |settings, updater| {
                updater.update(settings, &previous)
            });

        let metrics = self
            .scanner
            .scan_queues(&self.store_names, self.empty_scan_cooldown)
            .await;
        let metrics = prioritize(metrics, &self.settings, &self.prefixes);

        if !metrics.is_empty() {
            self.log_priorities(&metrics);
        }

        let limit = self.settings.limit_per_queue;
        self.cursor = RepeatCursor::new(
            metrics
                .iter()
                .map(|entry| (entry.clone(), consecutive_dispatches(entry, limit))),
        );
        self.last_scan = metrics;
    }

    fn log_priorities(&self, metrics: &[QueueMetrics]) {
        info!(
            "WORKER ACTIVE MODES: {}",
            self.settings.mode.active_names().join(", ")
        );
        info!("WORKER calculated priorities - top {TOP_QUEUES_LOGGED}");
        info!(
            "  - {:<50} | {:^8} | {:^8} | {:^9} | {:^8}",
            "queue name", "Batch", "Msgs", "# Batches", "Prio"
        );
        for entry in metrics.iter().take(TOP_QUEUES_LOGGED) {
            info!(
                "  > {:<50} | {:^8} | {:^8} | {:^9} | {:^8}",
                format!("{} / {}", entry.location(), entry.queue_name),
                entry.batch_size,
                entry.message_count,
                entry.message_to_chunk_size_ratio,
                entry.priority
            );
        }
    }
}

#[async_trait]
impl QueueProcessingStrategy for DynamicOrderQueueProcessingStrategy {
    async fn next_queue(&mut self) -> Result<Option<QueueMetrics>> {
        if self.cursor.is_exhausted() {
            self.rescan().await;
        }
        Ok(self.cursor.next())
    }

    fn limit_per_queue(&self) -> Option<u32> {
        Some(self.settings.limit_per_queue)
    }
}
