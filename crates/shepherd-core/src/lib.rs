//! shepherd-core
//!
//! Queue worker orchestration: decides which queue to service next, admits
//! subprocesses by free memory and slot count, and runs one batch per subprocess.
//!
//! # モジュール構成
//! - **domain**: 値オブジェクト（QueueMetrics, ReadMode, ReceivedMessage, WorkerStats, errors）
//! - **ports**: 外部との境界（QueueClient, MetricsReader, ProcessSupervisor, Clock, など）
//! - **app**: scanner, strategies, workers, process manager, task manager, builder
//! - **impls**: ports の実装（OS プロセス, /proc メモリ, spool ディレクトリキュー, in-memory store）
//! - **config**: TOML 設定
//! - **telemetry**: tracing subscriber の初期化

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;
