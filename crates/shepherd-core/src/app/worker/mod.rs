//! Worker control loops.
//!
//! - `ResourceAwareQueueWorker`: strategy-driven, admission by free memory and free slots
//! - `ProcessCountingWorker`: tops every queue up to its configured worker count
//!
//! Both keep the spawned processes in a `SlotTable` and share the drain phase.

pub mod memory_tracker;
pub mod process_counting;
pub mod resource_aware;
pub mod slots;

use std::borrow::Cow;
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::app::context::WorkerContext;
use crate::app::shutdown::ShutdownSignal;
use crate::config::WorkerConfig;
use crate::domain::stats::PROC_FAILED;
use crate::domain::{QueueMetrics, Result, WorkerRunId, WorkerStats, exit_code_text};
use crate::ports::elapsed_since;

pub use self::memory_tracker::ProcessMemoryTracker;
pub use self::process_counting::ProcessCountingWorker;
pub use self::resource_aware::ResourceAwareQueueWorker;
pub use self::slots::{FinishedProcess, RunningSlot, SlotTable};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerOptions {
    /// End the run as soon as nothing is pending and nothing is running.
    pub stop_when_empty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    TimeBudget,
    MemoryGrowth,
    Shutdown,
    QueuesEmpty,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub run_id: WorkerRunId,
    pub termination: TerminationReason,
    pub success_rate: u64,
    pub cycle_efficiency: BTreeMap<String, f64>,
    pub stats: WorkerStats,
}

impl WorkerReport {
    pub(crate) fn new(run_id: WorkerRunId, termination: TerminationReason, stats: WorkerStats) -> Self {
        Self {
            run_id,
            termination,
            success_rate: stats.success_rate(),
            cycle_efficiency: stats.cycle_efficiency(),
            stats,
        }
    }

    pub(crate) fn log(&self) {
        info!(termination = ?self.termination, "WORKER DONE");
        match serde_json::to_string(&self.stats) {
            Ok(stats) => info!(stats = %stats, "WORKER STATS"),
            Err(err) => warn!(error = %err, "could not serialize worker stats"),
        }
        info!(success_rate = self.success_rate, "WORKER SUCCESS RATE: {}%", self.success_rate);
        info!(efficiency = ?self.cycle_efficiency, "WORKER CYCLE EFFICIENCY");
    }
}

#[async_trait]
pub trait QueueWorker: Send {
    async fn start(&mut self, command: &str, options: WorkerOptions) -> Result<WorkerReport>;
}

/// POSIX shell quoting for a value pasted into a `sh -c` line; plain words pass unchanged.
pub fn shell_quote(value: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(value))
}

/// Shell command for one queue process, scoped to the store when there is one.
/// Queue and store names are quoted; `command` is taken as a shell fragment.
pub fn build_process_command(config: &WorkerConfig, command: &str, metrics: &QueueMetrics) -> String {
    render_command(config, command, &metrics.queue_name, metrics.store_name.as_deref())
}

pub(crate) fn render_command(
    config: &WorkerConfig,
    command: &str,
    queue_name: &str,
    store_name: Option<&str>,
) -> String {
    let queue_name = shell_quote(queue_name);
    match store_name {
        Some(store) => config
            .store_command_pattern
            .replace("{store}", &shell_quote(store))
            .replace("{queue}", &queue_name)
            .replace("{command}", command),
        None => config
            .command_pattern
            .replace("{queue}", &queue_name)
            .replace("{command}", command),
    }
}

/// Books a reaped process into the stats; failures are logged with their output.
pub(crate) fn record_finished(
    stats: &mut WorkerStats,
    finished: &FinishedProcess,
    free_memory_mb: Option<u64>,
    memory: &str,
) {
    let text = exit_code_text(finished.exit_code);
    stats.add_error(text);

    if finished.exit_code == Some(0) {
        debug!(
            queue = %finished.queue_name,
            location = %finished.location,
            pid = ?finished.pid,
            memory = %memory,
            "DONE {}:{}",
            finished.location,
            finished.queue_name
        );
        return;
    }

    stats.add_proc(PROC_FAILED, 1);
    error!(
        queue = %finished.queue_name,
        location = %finished.location,
        pid = ?finished.pid,
        exit_code = ?finished.exit_code,
        exit_code_text = text,
        free_memory_mb = ?free_memory_mb,
        memory = %memory,
        command = %finished.command_line,
        stdout = %finished.output,
        stderr = %finished.error_output,
        "queue process failed"
    );
}

/// Waits for running processes until all are gone, the timeout passes, or a
/// second shutdown signal arrives. Stragglers are left to the OS.
pub(crate) async fn drain(
    ctx: &WorkerContext,
    config: &WorkerConfig,
    shutdown: &ShutdownSignal,
    slots: &mut SlotTable,
    stats: &mut WorkerStats,
    memory_tracker: &mut ProcessMemoryTracker,
) {
    let started_at = ctx.clock().now();
    let timeout = config.waiting_processes_complete_timeout();

    loop {
        for finished in slots.reap() {
            let memory = memory_tracker.memory_info(finished.pid);
            record_finished(stats, &finished, None, &memory);
        }
        let running = slots.running();
        if running == 0 {
            return;
        }
        if shutdown.is_forced() {
            warn!(running, "second shutdown signal, leaving running processes behind");
            return;
        }
        if elapsed_since(ctx.clock(), started_at) >= timeout {
            warn!(running, ?timeout, "processes still running after drain timeout");
            return;
        }
        debug!(running, "waiting for processes to complete");
        ctx.clock().sleep(config.check_processes_complete_interval()).await;
    }
}
