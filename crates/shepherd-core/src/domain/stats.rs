//! WorkerStats - worker run の集計
//!
//! 1 回の run の間だけ溜めるカウンタ。最後のレポートにだけ使い、
//! 制御判断（dispatch するかどうか）には使わない。

use std::collections::BTreeMap;

use serde::Serialize;

pub const PROC_NEW: &str = "new";
pub const PROC_FAILED: &str = "failed";
pub const PROC_MAX: &str = "max";

const CYCLES: &str = "cycles";
const SKIP_CYCLE: &str = "skip-cycle";

/// Why a cycle ended without a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    Empty,
    NoSlot,
    NoMemory,
    Cooldown,
    QueueLimit,
    QueueReadError,
    SpawnError,
}

impl SkipReason {
    pub fn key(self) -> &'static str {
        match self {
            SkipReason::Empty => "empty",
            SkipReason::NoSlot => "no_slot",
            SkipReason::NoMemory => "no_mem",
            SkipReason::Cooldown => "cooldown",
            SkipReason::QueueLimit => "queue_limit",
            SkipReason::QueueReadError => "queue_read_error",
            SkipReason::SpawnError => "spawn_error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    queues: BTreeMap<String, u64>,
    locations: BTreeMap<String, u64>,
    errors: BTreeMap<String, u64>,
    cycles: BTreeMap<String, u64>,
    proc: BTreeMap<String, u64>,
    metrics: BTreeMap<String, i64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cycle(&mut self) {
        *self.cycles.entry(CYCLES.to_string()).or_default() += 1;
    }

    pub fn add_skip(&mut self, reason: SkipReason) {
        *self.cycles.entry(SKIP_CYCLE.to_string()).or_default() += 1;
        *self.cycles.entry(reason.key().to_string()).or_default() += 1;
    }

    pub fn add_proc(&mut self, key: &str, quantity: u64) {
        *self.proc.entry(key.to_string()).or_default() += quantity;
    }

    /// Keeps the high-water mark of concurrently running processes.
    pub fn record_running(&mut self, running: u64) {
        let max = self.proc.entry(PROC_MAX.to_string()).or_default();
        *max = (*max).max(running);
    }

    pub fn add_queue(&mut self, queue: &str) {
        *self.queues.entry(queue.to_string()).or_default() += 1;
    }

    pub fn add_location(&mut self, location: &str) {
        *self.locations.entry(location.to_string()).or_default() += 1;
    }

    pub fn add_error(&mut self, error: &str) {
        *self.errors.entry(error.to_string()).or_default() += 1;
    }

    pub fn set_metric(&mut self, key: &str, value: i64) {
        self.metrics.insert(key.to_string(), value);
    }

    pub fn cycles(&self) -> u64 {
        self.cycle_count(CYCLES)
    }

    pub fn skipped_cycles(&self) -> u64 {
        self.cycle_count(SKIP_CYCLE)
    }

    pub fn skips(&self, reason: SkipReason) -> u64 {
        self.cycle_count(reason.key())
    }

    pub fn proc(&self, key: &str) -> u64 {
        self.proc.get(key).copied().unwrap_or(0)
    }

    pub fn queue(&self, queue: &str) -> u64 {
        self.queues.get(queue).copied().unwrap_or(0)
    }

    pub fn location(&self, location: &str) -> u64 {
        self.locations.get(location).copied().unwrap_or(0)
    }

    pub fn error(&self, error: &str) -> u64 {
        self.errors.get(error).copied().unwrap_or(0)
    }

    pub fn metric(&self, key: &str) -> Option<i64> {
        self.metrics.get(key).copied()
    }

    /// `(dispatched - failed) / dispatched` as a floored percentage.
    /// A run that dispatched nothing reports 100.
    pub fn success_rate(&self) -> u64 {
        let dispatched = self.proc.get(PROC_NEW).copied().filter(|n| *n > 0).unwrap_or(1);
        let failed = self.proc(PROC_FAILED).min(dispatched);
        (dispatched - failed) * 100 / dispatched
    }

    /// Share of productive cycles plus the share of every skip reason, in percent
    /// rounded to two decimals.
    pub fn cycle_efficiency(&self) -> BTreeMap<String, f64> {
        let mut efficiency = BTreeMap::new();
        let cycles = self.cycles();
        if cycles == 0 {
            return efficiency;
        }

        let percent = |count: u64| (count as f64 * 10_000.0 / cycles as f64).round() / 100.0;
        efficiency.insert(
            "efficiency".to_string(),
            percent(cycles.saturating_sub(self.skipped_cycles())),
        );
        for (key, count) in &self.cycles {
            if key == CYCLES {
                continue;
            }
            efficiency.insert(key.clone(), percent(*count));
        }
        efficiency
    }

    fn cycle_count(&self, key: &str) -> u64 {
        self.cycles.get(key).copied().unwrap_or(0)
    }
}
