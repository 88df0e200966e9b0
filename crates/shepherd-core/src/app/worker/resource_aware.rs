//! ResourceAwareQueueWorker - メインの制御ループ
//!
//! # 1 サイクル
//! 1. 終了したプロセスを回収してスロットを空ける
//! 2. free memory が足りない → skip (no_mem)
//! 3. 空きスロットがない → skip (no_slot)
//! 4. 前回 dispatch から interval 未満 → skip (cooldown)
//! 5. strategy から次のキューを取り出して spawn（キューごとの上限は strategy の現在値）
//! 6. 自プロセスの peak memory の伸びが上限を超えたらループを抜ける
//!
//! ループを抜けたら drain（残りのプロセスの終了を待つ）。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{Instrument, Level, debug, error, info, info_span};

use crate::app::context::WorkerContext;
use crate::app::logger::WorkerLogger;
use crate::app::process_manager::ProcessManager;
use crate::app::resources::SystemResourcesManager;
use crate::app::shutdown::ShutdownSignal;
use crate::app::strategy::QueueProcessingStrategy;
use crate::app::worker::{
    ProcessMemoryTracker, QueueWorker, RunningSlot, SlotTable, TerminationReason, WorkerOptions,
    WorkerReport, build_process_command, drain, record_finished,
};
use crate::config::WorkerConfig;
use crate::domain::stats::{PROC_FAILED, PROC_NEW, SkipReason};
use crate::domain::{QueueMetrics, Result, WorkerRunId, WorkerStats};
use crate::ports::elapsed_since;

const MEMORY_GROWTH_METRIC: &str = "mem-growth";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    Dispatched,
    Skipped(SkipReason),
}

pub struct ResourceAwareQueueWorker {
    ctx: Arc<WorkerContext>,
    config: WorkerConfig,
    ignore_zero_memory: bool,
    limit_per_queue: u32,
    process_manager: Arc<ProcessManager>,
    strategy: Box<dyn QueueProcessingStrategy>,
    resources: SystemResourcesManager,
    logger: WorkerLogger,
    shutdown: ShutdownSignal,
    slots: SlotTable,
    memory_tracker: ProcessMemoryTracker,
    stats: WorkerStats,
    last_dispatch_at: Option<DateTime<Utc>>,
}

impl ResourceAwareQueueWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<WorkerContext>,
        config: WorkerConfig,
        ignore_zero_memory: bool,
        limit_per_queue: u32,
        process_manager: Arc<ProcessManager>,
        strategy: Box<dyn QueueProcessingStrategy>,
        resources: SystemResourcesManager,
        shutdown: ShutdownSignal,
    ) -> Self {
        let logger = WorkerLogger::new(ctx.clone(), config.log_interval());
        let slots = SlotTable::new(config.max_processes);
        Self {
            ctx,
            config,
            ignore_zero_memory,
            limit_per_queue,
            process_manager,
            strategy,
            resources,
            logger,
            shutdown,
            slots,
            memory_tracker: ProcessMemoryTracker::disabled(),
            stats: WorkerStats::new(),
            last_dispatch_at: None,
        }
    }

    pub fn with_memory_tracker(mut self, memory_tracker: ProcessMemoryTracker) -> Self {
        self.memory_tracker = memory_tracker;
        self
    }

    async fn run(&mut self, run_id: WorkerRunId, command: &str, options: WorkerOptions) -> Result<WorkerReport> {
        self.stats = WorkerStats::new();
        self.last_dispatch_at = None;
        self.memory_tracker.reset();
        let started_at = self.ctx.clock().now();
        let max_threshold = self.config.max_threshold();
        info!(
            slots = self.slots.capacity(),
            budget = ?max_threshold,
            "WORKER started"
        );

        let termination = loop {
            if elapsed_since(self.ctx.clock(), started_at) >= max_threshold {
                break TerminationReason::TimeBudget;
            }
            if self.shutdown.is_requested() {
                info!("shutdown requested, stopping after this cycle");
                break TerminationReason::Shutdown;
            }

            self.stats.add_cycle();
            let free_slot = self.rescan_processes().await;

            let enough = match self.resources.enough_resources(self.ignore_zero_memory).await {
                Ok(enough) => enough,
                Err(err) => {
                    error!(error = %err, running = self.slots.running(), "WORKER aborted");
                    return Err(err);
                }
            };
            if !enough {
                let free_memory = self.resources.last_free_memory_mb();
                self.logger.log_not_often_than("no-mem", Level::WARN, || {
                    format!("NO MEMORY: {free_memory} MB free, waiting")
                });
                self.stats.add_skip(SkipReason::NoMemory);
                self.pause().await;
                continue;
            }

            match free_slot {
                None => {
                    let running = self.slots.running();
                    self.logger.log_not_often_than("busy", Level::DEBUG, || {
                        format!("BUSY: {running} processes running")
                    });
                    self.stats.add_skip(SkipReason::NoSlot);
                }
                Some(slot) if self.dispatch_cooldown_elapsed() => {
                    self.last_dispatch_at = Some(self.ctx.clock().now());
                    let outcome = self.dispatch(slot, command).await;
                    if outcome == DispatchOutcome::Skipped(SkipReason::Empty)
                        && options.stop_when_empty
                        && self.slots.running() == 0
                    {
                        break TerminationReason::QueuesEmpty;
                    }
                }
                Some(_) => self.stats.add_skip(SkipReason::Cooldown),
            }

            let elapsed = elapsed_since(self.ctx.clock(), started_at);
            let free_memory = self.resources.last_free_memory_mb();
            let running = self.slots.running();
            self.logger.log_not_often_than("time-mem", Level::INFO, || {
                format!(
                    "TIME: {:.1}s | FREE MEM: {free_memory} MB | RUNNING: {running}",
                    elapsed.as_secs_f64()
                )
            });

            if self.memory_growth_exceeded() {
                break TerminationReason::MemoryGrowth;
            }
            self.pause().await;
        };

        drain(
            &self.ctx,
            &self.config,
            &self.shutdown,
            &mut self.slots,
            &mut self.stats,
            &mut self.memory_tracker,
        )
        .await;

        let report = WorkerReport::new(run_id, termination, self.stats.clone());
        report.log();
        Ok(report)
    }

    /// Reaps finished processes and returns a free slot, if any.
    async fn rescan_processes(&mut self) -> Option<usize> {
        let finished = self.slots.reap();
        let free_memory = if finished.iter().any(|process| process.exit_code != Some(0)) {
            Some(self.resources.current_free_memory().await)
        } else {
            None
        };
        for process in &finished {
            let memory = self.memory_tracker.memory_info(process.pid);
            record_finished(&mut self.stats, process, free_memory, &memory);
        }

        self.stats.record_running(self.slots.running() as u64);
        self.slots.first_free()
    }

    async fn dispatch(&mut self, slot: usize, command: &str) -> DispatchOutcome {
        let metrics = match self.strategy.next_queue().await {
            Ok(Some(metrics)) => metrics,
            Ok(None) => {
                self.logger
                    .log_not_often_than("empty", Level::DEBUG, || "EMPTY: no queue has messages".to_string());
                self.stats.add_skip(SkipReason::Empty);
                return DispatchOutcome::Skipped(SkipReason::Empty);
            }
            Err(err) => {
                error!(error = %err, "QUEUE READ ERROR");
                self.stats.add_error("queue-read");
                self.stats.add_skip(SkipReason::QueueReadError);
                return DispatchOutcome::Skipped(SkipReason::QueueReadError);
            }
        };

        if self.queue_limit_reached(&metrics) {
            debug!(queue = %metrics.queue_name, location = metrics.location(), "queue at its process limit");
            self.stats.add_skip(SkipReason::QueueLimit);
            return DispatchOutcome::Skipped(SkipReason::QueueLimit);
        }

        let location = metrics.location().to_string();
        let process_command = build_process_command(&self.config, command, &metrics);
        self.stats.add_proc(PROC_NEW, 1);
        self.stats.add_queue(&metrics.queue_name);
        self.stats.add_location(&location);
        self.stats.add_location(&format!("{location}:{}", metrics.queue_name));

        match self
            .process_manager
            .trigger_queue_process(&process_command, &metrics.queue_name)
            .await
        {
            Ok(process) => {
                let memory = self.memory_tracker.memory_info(process.pid());
                info!(
                    queue = %metrics.queue_name,
                    location = %location,
                    messages = metrics.message_count,
                    pid = ?process.pid(),
                    memory = %memory,
                    "RUN [{} +1] {}:{}",
                    self.slots.running(),
                    location,
                    metrics.queue_name
                );
                self.slots.occupy(
                    slot,
                    RunningSlot {
                        process,
                        queue_name: metrics.queue_name,
                        location,
                    },
                );
                self.stats.record_running(self.slots.running() as u64);
                DispatchOutcome::Dispatched
            }
            Err(err) => {
                error!(error = %err, queue = %metrics.queue_name, command = %process_command, "could not start queue process");
                self.stats.add_proc(PROC_FAILED, 1);
                self.stats.add_error("spawn");
                self.stats.add_skip(SkipReason::SpawnError);
                DispatchOutcome::Skipped(SkipReason::SpawnError)
            }
        }
    }

    /// The strategy's live limit wins over the configured one; 0 still allows one process.
    fn queue_limit_reached(&self, metrics: &QueueMetrics) -> bool {
        let limit = self
            .strategy
            .limit_per_queue()
            .unwrap_or(self.limit_per_queue)
            .max(1);
        self.slots.running_for(&metrics.queue_name, metrics.location()) >= limit as usize
    }

    fn dispatch_cooldown_elapsed(&self) -> bool {
        self.last_dispatch_at
            .is_none_or(|last| elapsed_since(self.ctx.clock(), last) > self.config.interval())
    }

    fn memory_growth_exceeded(&mut self) -> bool {
        let growth = self.resources.own_peak_memory_growth();
        self.stats.set_metric(MEMORY_GROWTH_METRIC, growth as i64);
        if growth > self.config.max_allowed_memory_growth_percent {
            error!(
                growth_percent = growth,
                max_percent = self.config.max_allowed_memory_growth_percent,
                "own memory grew too much, stopping the worker early"
            );
            return true;
        }
        if growth > 0 {
            self.logger.log_not_often_than("mem-growth", Level::DEBUG, || {
                format!("MEM GROWTH: {growth}%")
            });
        }
        false
    }

    async fn pause(&mut self) {
        self.ctx.clock().sleep(self.config.cycle_pause()).await;
    }
}

#[async_trait]
impl QueueWorker for ResourceAwareQueueWorker {
    async fn start(&mut self, command: &str, options: WorkerOptions) -> Result<WorkerReport> {
        let run_id = WorkerRunId::generate(self.ctx.clock());
        let span = info_span!(
            "queue_worker",
            run_id = %run_id,
            server_id = %self.process_manager.server_id()
        );
        self.run(run_id, command, options).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::shutdown::shutdown_channel;
    use crate::app::strategy::DynamicOrderQueueProcessingStrategy;
    use crate::config::ResourcesConfig;
    use crate::domain::{DynamicSettings, ReadMode, WorkerError};
    use crate::impls::InMemoryProcessStore;
    use crate::ports::DynamicSettingsUpdater;
    use crate::testing::{
        FakeSupervisor, ScriptedPeakMemory, ScriptedProcessMemory, ScriptedScan, StaticFreeMemory,
        fixed_clock,
    };
    use std::time::Duration;

    struct Harness {
        supervisor: Arc<FakeSupervisor>,
        worker: ResourceAwareQueueWorker,
    }

    fn worker_config(max_processes: usize) -> WorkerConfig {
        WorkerConfig {
            max_processes,
            interval_ms: 0,
            max_threshold_secs: 1,
            cycle_pause_ms: 10,
            waiting_processes_complete_timeout_secs: 5,
            check_processes_complete_interval_ms: 10,
            ..WorkerConfig::default()
        }
    }

    fn dynamic_strategy(scans: Vec<Vec<QueueMetrics>>, limit_per_queue: u32) -> DynamicOrderQueueProcessingStrategy {
        DynamicOrderQueueProcessingStrategy::new(
            Box::new(ScriptedScan::new(scans)),
            Vec::new(),
            Duration::from_secs(5),
            DynamicSettings {
                mode: ReadMode::default(),
                big_queue_threshold_batches: 10,
                limit_per_queue,
            },
        )
    }

    fn harness(
        config: WorkerConfig,
        supervisor: FakeSupervisor,
        scans: Vec<Vec<QueueMetrics>>,
        free_mb: u64,
        peaks: Vec<u64>,
        shutdown: ShutdownSignal,
    ) -> Harness {
        harness_with_strategy(config, supervisor, dynamic_strategy(scans, 2), free_mb, peaks, shutdown)
    }

    fn harness_with_strategy(
        config: WorkerConfig,
        supervisor: FakeSupervisor,
        strategy: DynamicOrderQueueProcessingStrategy,
        free_mb: u64,
        peaks: Vec<u64>,
        shutdown: ShutdownSignal,
    ) -> Harness {
        let ctx = Arc::new(WorkerContext::new(fixed_clock()));
        let supervisor = Arc::new(supervisor);
        let process_manager = Arc::new(
            ProcessManager::new(
                ctx.clone(),
                "server-a",
                supervisor.clone(),
                supervisor.clone(),
                Arc::new(InMemoryProcessStore::new()),
            )
            .with_persistence(false),
        );
        let resources = SystemResourcesManager::new(
            Arc::new(StaticFreeMemory::new(free_mb)),
            Arc::new(ScriptedPeakMemory::new(peaks)),
            ResourcesConfig {
                free_memory_buffer_mb: 100,
                ..ResourcesConfig::default()
            },
        );
        let worker = ResourceAwareQueueWorker::new(
            ctx,
            config,
            false,
            2,
            process_manager,
            Box::new(strategy),
            resources,
            shutdown,
        );
        Harness { supervisor, worker }
    }

    #[tokio::test]
    async fn hot_queue_takes_both_slots_before_the_next_queue() {
        let mut h = harness(
            worker_config(2),
            FakeSupervisor::new(5),
            vec![vec![
                QueueMetrics::new("q2", Some("DE".into()), None, 10, 10),
                QueueMetrics::new("q1", Some("DE".into()), None, 20, 10),
            ]],
            1000,
            vec![100],
            ShutdownSignal::never(),
        );

        let report = h.worker.start("task", WorkerOptions::default()).await.unwrap();

        assert_eq!(
            h.supervisor.spawned(),
            vec![
                "APPLICATION_STORE=DE task q1",
                "APPLICATION_STORE=DE task q1",
                "APPLICATION_STORE=DE task q2",
            ]
        );
        assert!(h.supervisor.max_concurrent() <= 2);
        assert_eq!(report.termination, TerminationReason::TimeBudget);
        assert_eq!(report.stats.proc(PROC_NEW), 3);
        assert_eq!(report.stats.queue("q1"), 2);
        assert!(report.stats.skips(SkipReason::NoSlot) > 0);
        assert_eq!(report.success_rate, 100);
    }

    fn set_limit(limit_per_queue: u32) -> Arc<dyn DynamicSettingsUpdater> {
        Arc::new(move |mut settings: DynamicSettings, _: &[QueueMetrics]| {
            settings.limit_per_queue = limit_per_queue;
            settings
        })
    }

    fn hot_queue_scans() -> Vec<Vec<QueueMetrics>> {
        vec![vec![QueueMetrics::new("q1", None, None, 50, 10)]; 50]
    }

    #[tokio::test]
    async fn lowered_limit_caps_concurrent_processes() {
        let strategy = dynamic_strategy(hot_queue_scans(), 2).with_updaters(vec![set_limit(1)]);
        let mut h = harness_with_strategy(
            worker_config(3),
            FakeSupervisor::new(u32::MAX),
            strategy,
            1000,
            vec![100],
            ShutdownSignal::never(),
        );

        let report = h.worker.start("task", WorkerOptions::default()).await.unwrap();

        assert_eq!(h.supervisor.spawned(), vec!["task q1"]);
        assert_eq!(h.supervisor.max_concurrent(), 1);
        assert!(report.stats.skips(SkipReason::QueueLimit) > 0);
    }

    #[tokio::test]
    async fn raised_limit_lets_the_hot_queue_fill_every_slot() {
        let strategy = dynamic_strategy(hot_queue_scans(), 2).with_updaters(vec![set_limit(3)]);
        let mut h = harness_with_strategy(
            worker_config(3),
            FakeSupervisor::new(u32::MAX),
            strategy,
            1000,
            vec![100],
            ShutdownSignal::never(),
        );

        let report = h.worker.start("task", WorkerOptions::default()).await.unwrap();

        assert_eq!(h.supervisor.spawned().len(), 3);
        assert_eq!(h.supervisor.max_concurrent(), 3);
        assert_eq!(report.stats.skips(SkipReason::QueueLimit), 0);
    }

    #[tokio::test]
    async fn zero_limit_still_allows_one_process_per_queue() {
        let mut h = harness_with_strategy(
            worker_config(3),
            FakeSupervisor::new(u32::MAX),
            dynamic_strategy(hot_queue_scans(), 0),
            1000,
            vec![100],
            ShutdownSignal::never(),
        );

        h.worker.start("task", WorkerOptions::default()).await.unwrap();

        assert_eq!(h.supervisor.spawned(), vec!["task q1"]);
        assert_eq!(h.supervisor.max_concurrent(), 1);
    }

    #[tokio::test]
    async fn spawn_failures_count_as_skipped_cycles() {
        let mut h = harness(
            worker_config(2),
            FakeSupervisor::new(1).failing_spawns(),
            vec![vec![QueueMetrics::new("q1", None, None, 10, 10)]],
            1000,
            vec![100],
            ShutdownSignal::never(),
        );

        let report = h.worker.start("task", WorkerOptions::default()).await.unwrap();

        assert_eq!(report.stats.skips(SkipReason::SpawnError), 1);
        assert_eq!(report.stats.error("spawn"), 1);
        assert_eq!(report.stats.skips(SkipReason::Empty), report.stats.cycles() - 1);
        assert_eq!(report.cycle_efficiency.get("efficiency"), Some(&0.0));
    }

    #[tokio::test]
    async fn run_and_done_lines_read_process_memory() {
        let probe = Arc::new(ScriptedProcessMemory::new().with_readings(1000, &[8 * 1024 * 1024]));
        let h = harness(
            worker_config(1),
            FakeSupervisor::new(2),
            vec![vec![QueueMetrics::new("q1", None, None, 10, 10)]],
            1000,
            vec![100],
            ShutdownSignal::never(),
        );
        let mut worker = h
            .worker
            .with_memory_tracker(ProcessMemoryTracker::new(probe.clone()));

        worker.start("task", WorkerOptions::default()).await.unwrap();

        // one reading at RUN, one when the slot is reaped
        assert_eq!(probe.queried(), vec![1000, 1000]);
    }

    #[tokio::test]
    async fn low_memory_skips_every_cycle() {
        let mut h = harness(
            worker_config(2),
            FakeSupervisor::new(5),
            vec![vec![QueueMetrics::new("q1", None, None, 20, 10)]],
            50,
            vec![100],
            ShutdownSignal::never(),
        );

        let report = h.worker.start("task", WorkerOptions::default()).await.unwrap();

        assert!(h.supervisor.spawned().is_empty());
        assert_eq!(report.stats.skips(SkipReason::NoMemory), report.stats.cycles());
    }

    #[tokio::test]
    async fn undetected_memory_aborts_the_run() {
        let mut h = harness(
            worker_config(2),
            FakeSupervisor::new(5),
            vec![],
            0,
            vec![100],
            ShutdownSignal::never(),
        );

        let result = h.worker.start("task", WorkerOptions::default()).await;

        assert!(matches!(result, Err(WorkerError::FreeMemoryUndetected)));
    }

    #[tokio::test]
    async fn interval_throttles_dispatches() {
        let config = WorkerConfig {
            interval_ms: 100,
            ..worker_config(5)
        };
        let mut h = harness(
            config,
            FakeSupervisor::new(1000),
            vec![vec![
                QueueMetrics::new("q1", None, None, 10, 10),
                QueueMetrics::new("q2", None, None, 10, 10),
            ]],
            1000,
            vec![100],
            ShutdownSignal::never(),
        );

        let report = h.worker.start("task", WorkerOptions::default()).await.unwrap();

        assert_eq!(h.supervisor.spawned().len(), 2);
        assert!(report.stats.skips(SkipReason::Cooldown) >= 9);
    }

    #[tokio::test]
    async fn memory_growth_stops_the_loop() {
        let mut h = harness(
            worker_config(2),
            FakeSupervisor::new(1),
            vec![],
            1000,
            vec![100, 100, 200],
            ShutdownSignal::never(),
        );

        let report = h.worker.start("task", WorkerOptions::default()).await.unwrap();

        assert_eq!(report.termination, TerminationReason::MemoryGrowth);
        assert_eq!(report.stats.metric("mem-growth"), Some(100));
        assert_eq!(report.stats.cycles(), 3);
    }

    #[tokio::test]
    async fn failed_processes_lower_the_success_rate() {
        let mut h = harness(
            worker_config(2),
            FakeSupervisor::new(2).with_exit_code(1),
            vec![vec![
                QueueMetrics::new("q1", None, None, 10, 10),
                QueueMetrics::new("q2", None, None, 10, 10),
            ]],
            1000,
            vec![100],
            ShutdownSignal::never(),
        );

        let report = h.worker.start("task", WorkerOptions::default()).await.unwrap();

        assert_eq!(report.stats.proc(PROC_NEW), 2);
        assert_eq!(report.stats.proc(PROC_FAILED), 2);
        assert_eq!(report.stats.error("General error"), 2);
        assert_eq!(report.success_rate, 0);
    }

    #[tokio::test]
    async fn stop_when_empty_ends_once_everything_finished() {
        let mut h = harness(
            worker_config(2),
            FakeSupervisor::new(2),
            vec![vec![QueueMetrics::new("q1", None, None, 10, 10)]],
            1000,
            vec![100],
            ShutdownSignal::never(),
        );

        let report = h
            .worker
            .start("task", WorkerOptions { stop_when_empty: true })
            .await
            .unwrap();

        assert_eq!(report.termination, TerminationReason::QueuesEmpty);
        assert_eq!(h.supervisor.spawned().len(), 1);
        assert_eq!(h.supervisor.running(), 0);
    }

    #[tokio::test]
    async fn requested_shutdown_stops_before_the_first_cycle() {
        let (trigger, signal) = shutdown_channel();
        let mut h = harness(
            worker_config(2),
            FakeSupervisor::new(3),
            vec![],
            1000,
            vec![100],
            signal,
        );
        trigger.request();

        let report = h.worker.start("task", WorkerOptions::default()).await.unwrap();

        assert_eq!(report.termination, TerminationReason::Shutdown);
        assert_eq!(report.stats.cycles(), 0);
    }

    #[tokio::test]
    async fn drain_gives_up_after_timeout() {
        let config = WorkerConfig {
            waiting_processes_complete_timeout_secs: 1,
            ..worker_config(1)
        };
        let mut h = harness(
            config,
            FakeSupervisor::new(u32::MAX),
            vec![vec![QueueMetrics::new("q1", None, None, 10, 10)]],
            1000,
            vec![100],
            ShutdownSignal::never(),
        );

        let report = h.worker.start("task", WorkerOptions::default()).await.unwrap();

        assert_eq!(report.termination, TerminationReason::TimeBudget);
        assert_eq!(h.supervisor.running(), 1);
    }
}
