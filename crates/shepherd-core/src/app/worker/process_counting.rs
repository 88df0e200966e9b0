//! ProcessCountingWorker - キューごとのプロセス数を上限まで埋めるだけの worker
//!
//! メッセージ数もメモリも見ない。ProcessStore に記録された生存プロセス数と
//! `max_workers_by_queue` の差分だけ起動する（全体は `max_processes` で頭打ち）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::app::context::WorkerContext;
use crate::app::process_manager::ProcessManager;
use crate::app::scanner::QueueScan;
use crate::app::shutdown::ShutdownSignal;
use crate::app::worker::{
    ProcessMemoryTracker, QueueWorker, RunningSlot, SlotTable, TerminationReason, WorkerOptions,
    WorkerReport, drain, record_finished, render_command,
};
use crate::config::{QueuesConfig, WorkerConfig};
use crate::domain::stats::{PROC_FAILED, PROC_NEW, SkipReason};
use crate::domain::{Result, WorkerRunId, WorkerStats};
use crate::ports::elapsed_since;

const NO_LOCATION: &str = "-";
const SPAWN_ERROR: &str = "spawn";

pub struct ProcessCountingWorker {
    ctx: Arc<WorkerContext>,
    config: WorkerConfig,
    queues: QueuesConfig,
    process_manager: Arc<ProcessManager>,
    shutdown: ShutdownSignal,
    empty_check: Option<(Box<dyn QueueScan>, Vec<String>)>,
    slots: SlotTable,
    memory_tracker: ProcessMemoryTracker,
    stats: WorkerStats,
}

impl ProcessCountingWorker {
    pub fn new(
        ctx: Arc<WorkerContext>,
        config: WorkerConfig,
        queues: QueuesConfig,
        process_manager: Arc<ProcessManager>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let slots = SlotTable::new(config.max_processes);
        Self {
            ctx,
            config,
            queues,
            process_manager,
            shutdown,
            empty_check: None,
            slots,
            memory_tracker: ProcessMemoryTracker::disabled(),
            stats: WorkerStats::new(),
        }
    }

    pub fn with_memory_tracker(mut self, memory_tracker: ProcessMemoryTracker) -> Self {
        self.memory_tracker = memory_tracker;
        self
    }

    /// Scanner consulted by `stop_when_empty`. Without one the option has no effect.
    pub fn with_empty_check(mut self, scanner: Box<dyn QueueScan>, store_names: Vec<String>) -> Self {
        self.empty_check = Some((scanner, store_names));
        self
    }

    async fn run(&mut self, run_id: WorkerRunId, command: &str, options: WorkerOptions) -> Result<WorkerReport> {
        self.stats = WorkerStats::new();
        self.memory_tracker.reset();
        let started_at = self.ctx.clock().now();

        match self.process_manager.flush_idle_processes().await {
            Ok(0) => {}
            Ok(flushed) => info!(flushed, "removed stale process entries"),
            Err(err) => warn!(error = %err, "could not flush stale process entries"),
        }
        info!(
            slots = self.slots.capacity(),
            queues = self.queues.names.len(),
            "WORKER started"
        );

        let termination = loop {
            if elapsed_since(self.ctx.clock(), started_at) >= self.config.max_threshold() {
                break TerminationReason::TimeBudget;
            }
            if self.shutdown.is_requested() {
                info!("shutdown requested, stopping after this round");
                break TerminationReason::Shutdown;
            }

            self.stats.add_cycle();
            for finished in self.slots.reap() {
                let memory = self.memory_tracker.memory_info(finished.pid);
                record_finished(&mut self.stats, &finished, None, &memory);
            }

            if options.stop_when_empty && self.slots.running() == 0 && self.queues_are_empty().await {
                break TerminationReason::QueuesEmpty;
            }

            let spawn_errors = self.stats.error(SPAWN_ERROR);
            let started = self.top_up_queues(command).await;
            if started == 0 {
                let reason = if self.stats.error(SPAWN_ERROR) > spawn_errors {
                    SkipReason::SpawnError
                } else if self.slots.first_free().is_none() {
                    SkipReason::NoSlot
                } else {
                    SkipReason::QueueLimit
                };
                self.stats.add_skip(reason);
            }
            self.stats.record_running(self.slots.running() as u64);

            self.ctx.clock().sleep(self.config.worker_interval()).await;
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

    async fn queues_are_empty(&mut self) -> bool {
        let Some((scanner, store_names)) = self.empty_check.as_mut() else {
            return false;
        };
        scanner.scan_queues(store_names, Duration::ZERO).await.is_empty()
    }

    /// Starts the missing processes of every queue; returns how many were started.
    async fn top_up_queues(&mut self, command: &str) -> usize {
        let mut started = 0;
        let queue_names = self.queues.names.clone();

        for queue_name in &queue_names {
            if self.shutdown.is_requested() {
                break;
            }
            let busy = match self.process_manager.get_busy_process_number(queue_name).await {
                Ok(busy) => busy,
                Err(err) => {
                    warn!(error = %err, queue = %queue_name, "could not count running processes");
                    self.stats.add_error("process-store");
                    continue;
                }
            };
            let wanted = (self.queues.max_workers_by_queue(queue_name) as usize).saturating_sub(busy);
            let free = self.slots.capacity() - self.slots.running();
            let to_start = wanted.min(free);
            if to_start == 0 {
                continue;
            }
            debug!(queue = %queue_name, busy, to_start, "topping up queue");

            for _ in 0..to_start {
                if self.start_process(command, queue_name).await {
                    started += 1;
                }
                if !self.config.process_trigger_interval().is_zero() {
                    self.ctx.clock().sleep(self.config.process_trigger_interval()).await;
                }
            }
        }
        started
    }

    async fn start_process(&mut self, command: &str, queue_name: &str) -> bool {
        let Some(slot) = self.slots.first_free() else {
            return false;
        };
        let process_command = render_command(&self.config, command, queue_name, None);
        self.stats.add_proc(PROC_NEW, 1);
        self.stats.add_queue(queue_name);

        match self
            .process_manager
            .trigger_queue_process(&process_command, queue_name)
            .await
        {
            Ok(process) => {
                let memory = self.memory_tracker.memory_info(process.pid());
                info!(
                    queue = %queue_name,
                    pid = ?process.pid(),
                    memory = %memory,
                    "RUN [{} +1] {}",
                    self.slots.running(),
                    queue_name
                );
                self.slots.occupy(
                    slot,
                    RunningSlot {
                        process,
                        queue_name: queue_name.to_string(),
                        location: NO_LOCATION.to_string(),
                    },
                )
            }
            Err(err) => {
                warn!(error = %err, queue = %queue_name, command = %process_command, "could not start queue process");
                self.stats.add_proc(PROC_FAILED, 1);
                self.stats.add_error(SPAWN_ERROR);
                false
            }
        }
    }
}

#[async_trait]
impl QueueWorker for ProcessCountingWorker {
    async fn start(&mut self, command: &str, options: WorkerOptions) -> Result<WorkerReport> {
        let run_id = WorkerRunId::generate(self.ctx.clock());
        let span = info_span!(
            "process_counting_worker",
            run_id = %run_id,
            server_id = %self.process_manager.server_id()
        );
        self.run(run_id, command, options).instrument(span).await
    }
}
