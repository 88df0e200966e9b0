//! QueueScanner - キューごとの未処理メッセージ数のスナップショット
//!
//! # 振る舞い
//! - 前回のスキャンで非空キューが 1 つもなく、cooldown 未満なら即座に空を返す
//!   （アイドル時にブローカーを叩き続けない）
//! - それ以外はキュー × ストア（またはリージョン）ごとに MetricsReader で件数を読む
//! - 1 ペアの読み取り失敗は他のペアに影響しない（ログしてスキップ）

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::app::context::WorkerContext;
use crate::config::{QueuesConfig, ScannerConfig};
use crate::domain::{QueueMetrics, Result, WorkerError};
use crate::ports::{MetricsReader, MetricsRequest, StoreProvider, elapsed_since};

/// Count assumed for a queue nobody can measure; one task run will find out.
pub const DEFAULT_QUEUE_MESSAGE_COUNT: u64 = 1;

#[async_trait]
pub trait QueueScan: Send {
    /// Never fails; unreadable pairs are left out of the result.
    async fn scan_queues(
        &mut self,
        store_names: &[String],
        empty_scan_cooldown: Duration,
    ) -> Vec<QueueMetrics>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Location {
    store: Option<String>,
    region: Option<String>,
}

pub struct QueueScanner {
    ctx: Arc<WorkerContext>,
    queues: QueuesConfig,
    chunk_sizes: HashMap<String, u64>,
    metrics_readers: Vec<Arc<dyn MetricsReader>>,
    store_provider: Arc<dyn StoreProvider>,
    dynamic_store_enabled: bool,
    current_region: Option<String>,
    last_scan_at: Option<DateTime<Utc>>,
    last_scan_had_queues: bool,
    scan_count: u64,
    warned_missing_adapter: HashSet<String>,
}

impl QueueScanner {
    /// `chunk_sizes` holds the resolved batch size per queue (config override, else processor default).
    pub fn new(
        ctx: Arc<WorkerContext>,
        queues: QueuesConfig,
        chunk_sizes: HashMap<String, u64>,
        store_provider: Arc<dyn StoreProvider>,
    ) -> Self {
        Self {
            ctx,
            queues,
            chunk_sizes,
            metrics_readers: Vec::new(),
            store_provider,
            dynamic_store_enabled: false,
            current_region: None,
            last_scan_at: None,
            last_scan_had_queues: false,
            scan_count: 0,
            warned_missing_adapter: HashSet::new(),
        }
    }

    pub fn with_metrics_readers(mut self, readers: Vec<Arc<dyn MetricsReader>>) -> Self {
        self.metrics_readers = readers;
        self
    }

    pub fn with_scanner_config(mut self, config: &ScannerConfig) -> Self {
        self.dynamic_store_enabled = config.dynamic_store_enabled;
        self.current_region = config.current_region.clone();
        self
    }

    pub fn scan_count(&self) -> u64 {
        self.scan_count
    }

    async fn direct_scan(&mut self, store_names: &[String]) -> Vec<QueueMetrics> {
        self.scan_count += 1;
        debug!(scan = self.scan_count, "> SCANNING QUEUES - {}...", self.scan_count);

        let locations = match self.resolve_locations(store_names).await {
            Ok(locations) => locations,
            Err(err) => {
                warn!(error = %err, "could not resolve stores to scan");
                return Vec::new();
            }
        };

        let queue_names = self.queues.names.clone();
        let mut scanned_pairs = 0u64;
        let mut total_messages = 0u64;
        let mut metrics = Vec::new();
        for queue_name in &queue_names {
            for location in &locations {
                scanned_pairs += 1;
                let count = match self.read_message_count(queue_name, location).await {
                    Ok(count) => count,
                    Err(err) => {
                        warn!(error = %err, queue = %queue_name, "skipping queue in this scan");
                        continue;
                    }
                };
                if count == 0 {
                    continue;
                }

                total_messages += count;
                let batch_size = self.chunk_sizes.get(queue_name).copied().unwrap_or(0);
                metrics.push(QueueMetrics::new(
                    queue_name.clone(),
                    location.store.clone(),
                    location.region.clone(),
                    count,
                    batch_size,
                ));
            }
        }

        let average = if scanned_pairs > 0 {
            total_messages / scanned_pairs
        } else {
            0
        };
        info!(
            "> SCANNING {} DONE: {} / {} queues, {} messages total, {} msg/queue avg",
            self.scan_count,
            metrics.len(),
            scanned_pairs,
            total_messages,
            average
        );
        metrics
    }

    /// Requested stores, else every known store, else one global location for the region.
    async fn resolve_locations(&self, store_names: &[String]) -> Result<Vec<Location>> {
        let store_names = if !store_names.is_empty() {
            store_names.to_vec()
        } else if self.dynamic_store_enabled {
            Vec::new()
        } else {
            self.ctx.store_names(self.store_provider.as_ref()).await?
        };

        if store_names.is_empty() {
            return Ok(vec![Location {
                store: None,
                region: self.current_region.clone(),
            }]);
        }
        Ok(store_names
            .into_iter()
            .map(|store| Location {
                store: Some(store),
                region: self.current_region.clone(),
            })
            .collect())
    }

    async fn read_message_count(&mut self, queue_name: &str, location: &Location) -> Result<u64> {
        let Some(adapter) = self.queues.queue_adapter(queue_name) else {
            if self.warned_missing_adapter.insert(queue_name.to_string()) {
                warn!(
                    error = %WorkerError::MissingAdapter(queue_name.to_string()),
                    "assuming {DEFAULT_QUEUE_MESSAGE_COUNT} pending message(s)"
                );
            }
            return Ok(DEFAULT_QUEUE_MESSAGE_COUNT);
        };

        let Some(reader) = self
            .metrics_readers
            .iter()
            .find(|reader| reader.is_applicable(adapter))
        else {
            return Ok(DEFAULT_QUEUE_MESSAGE_COUNT);
        };

        let request = MetricsRequest {
            queue_name: queue_name.to_string(),
            store_name: location.store.clone(),
            region_name: location.region.clone(),
        };
        reader
            .read(&request)
            .await
            .map_err(|err| WorkerError::MetricsRead {
                queue: queue_name.to_string(),
                store: location.store.clone(),
                reason: err.to_string(),
            })
    }
}

#[async_trait]
impl QueueScan for QueueScanner {
    async fn scan_queues(
        &mut self,
        store_names: &[String],
        empty_scan_cooldown: Duration,
    ) -> Vec<QueueMetrics> {
        if !self.last_scan_had_queues
            && let Some(last_scan_at) = self.last_scan_at
            && elapsed_since(self.ctx.clock(), last_scan_at) < empty_scan_cooldown
        {
            return Vec::new();
        }

        let metrics = self.direct_scan(store_names).await;

        self.last_scan_at = Some(self.ctx.clock().now());
        self.last_scan_had_queues = !metrics.is_empty();
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::StaticStoreProvider;
    use crate::ports::FixedClock;
    use crate::testing::{ScriptedMetricsReader, fixed_clock, queues_config};

    fn scanner(
        clock: Arc<FixedClock>,
        reader: Arc<ScriptedMetricsReader>,
        queue_names: &[&str],
    ) -> QueueScanner {
        let ctx = Arc::new(WorkerContext::new(clock));
        let stores = StaticStoreProvider::new(vec!["DE".to_string(), "US".to_string()]);
        QueueScanner::new(
            ctx,
            queues_config(queue_names),
            HashMap::from([("event".to_string(), 10)]),
            Arc::new(stores),
        )
        .with_metrics_readers(vec![reader as Arc<dyn MetricsReader>])
    }

    #[tokio::test]
    async fn zero_counts_are_filtered_out() {
        let clock = fixed_clock();
        let reader = Arc::new(ScriptedMetricsReader::new().with_count("event", Some("DE"), 0));
        let mut scanner = scanner(clock, reader, &["event"]);

        let metrics = scanner.scan_queues(&[], Duration::from_secs(10)).await;

        assert!(metrics.is_empty());
    }

    #[tokio::test]
    async fn scans_only_requested_stores() {
        let clock = fixed_clock();
        let reader = Arc::new(
            ScriptedMetricsReader::new()
                .with_count("event", Some("DE"), 0)
                .with_count("event", Some("AT"), 3),
        );
        let mut scanner = scanner(clock, reader.clone(), &["event"]);

        let first = scanner.scan_queues(&["AT".to_string()], Duration::from_secs(5)).await;
        let second = scanner.scan_queues(&["AT".to_string()], Duration::from_secs(5)).await;

        for metrics in [&first, &second] {
            assert_eq!(metrics.len(), 1);
            assert_eq!(metrics[0].store_name.as_deref(), Some("AT"));
            assert_eq!(metrics[0].message_count, 3);
        }
        assert_eq!(reader.calls(), 2);
    }

    #[tokio::test]
    async fn empty_scan_cools_down_before_reading_again() {
        let clock = fixed_clock();
        let reader = Arc::new(ScriptedMetricsReader::new());
        let mut scanner = scanner(clock.clone(), reader.clone(), &["event"]);

        assert!(scanner.scan_queues(&[], Duration::from_secs(10)).await.is_empty());
        let calls_after_first = reader.calls();
        assert_eq!(calls_after_first, 2);

        clock.advance(Duration::from_secs(9));
        assert!(scanner.scan_queues(&[], Duration::from_secs(10)).await.is_empty());
        assert_eq!(reader.calls(), calls_after_first);

        clock.advance(Duration::from_secs(1));
        assert!(scanner.scan_queues(&[], Duration::from_secs(10)).await.is_empty());
        assert_eq!(reader.calls(), calls_after_first * 2);
    }

    #[tokio::test]
    async fn defaults_to_provider_stores_and_computes_ratio() {
        let clock = fixed_clock();
        let reader = Arc::new(
            ScriptedMetricsReader::new()
                .with_count("event", Some("DE"), 25)
                .with_count("event", Some("US"), 4),
        );
        let mut scanner = scanner(clock, reader, &["event"]);

        let metrics = scanner.scan_queues(&[], Duration::from_secs(5)).await;

        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].store_name.as_deref(), Some("DE"));
        assert_eq!(metrics[0].batch_size, 10);
        assert_eq!(metrics[0].message_to_chunk_size_ratio, 3);
        assert_eq!(metrics[1].store_name.as_deref(), Some("US"));
        assert_eq!(metrics[1].message_to_chunk_size_ratio, 0);
    }

    #[tokio::test]
    async fn failing_pair_does_not_abort_the_scan() {
        let clock = fixed_clock();
        let reader = Arc::new(
            ScriptedMetricsReader::new()
                .with_count("event", Some("US"), 7)
                .failing_for("event", Some("DE")),
        );
        let mut scanner = scanner(clock, reader, &["event"]);

        let metrics = scanner.scan_queues(&[], Duration::from_secs(5)).await;

        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].store_name.as_deref(), Some("US"));
    }

    #[tokio::test]
    async fn dynamic_store_scans_once_per_queue_for_the_region() {
        let clock = fixed_clock();
        let reader = Arc::new(ScriptedMetricsReader::new().with_count("event", None, 5));
        let config = ScannerConfig {
            dynamic_store_enabled: true,
            current_region: Some("EU".to_string()),
            ..ScannerConfig::default()
        };
        let mut scanner = scanner(clock, reader.clone(), &["event"]).with_scanner_config(&config);

        let metrics = scanner.scan_queues(&[], Duration::from_secs(5)).await;

        assert_eq!(reader.calls(), 1);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].store_name, None);
        assert_eq!(metrics[0].region_name.as_deref(), Some("EU"));
    }

    #[tokio::test]
    async fn no_known_store_scans_globally() {
        let clock = fixed_clock();
        let reader = Arc::new(ScriptedMetricsReader::new().with_count("event", None, 4));
        let mut scanner = QueueScanner::new(
            Arc::new(WorkerContext::new(clock)),
            queues_config(&["event"]),
            HashMap::new(),
            Arc::new(StaticStoreProvider::new(Vec::new())),
        )
        .with_metrics_readers(vec![reader.clone() as Arc<dyn MetricsReader>]);

        let metrics = scanner.scan_queues(&[], Duration::from_secs(5)).await;

        assert_eq!(reader.calls(), 1);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].location(), "-");
    }

    #[tokio::test]
    async fn queue_without_adapter_assumes_default_count() {
        let clock = fixed_clock();
        let reader = Arc::new(ScriptedMetricsReader::new());
        let ctx = Arc::new(WorkerContext::new(clock));
        let mut queues = queues_config(&["event"]);
        queues.default_adapter = None;
        let mut scanner = QueueScanner::new(
            ctx,
            queues,
            HashMap::new(),
            Arc::new(StaticStoreProvider::new(vec!["DE".to_string()])),
        )
        .with_metrics_readers(vec![reader.clone() as Arc<dyn MetricsReader>]);

        let metrics = scanner.scan_queues(&[], Duration::from_secs(5)).await;

        assert_eq!(reader.calls(), 0);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].message_count, DEFAULT_QUEUE_MESSAGE_COUNT);
        assert_eq!(metrics[0].batch_size, 0);
        assert_eq!(metrics[0].message_to_chunk_size_ratio, 1);
    }
}
