//! Test doubles shared by the unit tests.
//!
//! Process lifetimes are counted in polls, time comes from `FixedClock`, so every
//! worker scenario runs deterministically and without sleeping.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use crate::app::scanner::QueueScan;
use crate::config::{AdapterConfig, QueuesConfig};
use crate::domain::{ProcessState, QueueMetrics, ReceivedMessage, Result, WorkerError};
use crate::ports::{
    FixedClock, FreeMemoryReader, MessageProcessor, MetricsReader, MetricsRequest, OwnMemoryProbe,
    ProcessMemoryProbe, ProcessProbe, ProcessSupervisor, QueueClient, SupervisedProcess,
};

pub(crate) fn fixed_clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ))
}

/// Queues in the given order, all served by the `test` adapter.
pub(crate) fn queues_config(queue_names: &[&str]) -> QueuesConfig {
    QueuesConfig {
        names: queue_names.iter().map(|name| name.to_string()).collect(),
        default_adapter: Some(AdapterConfig {
            adapter: "test".to_string(),
            max_workers: None,
        }),
        ..QueuesConfig::default()
    }
}

// ---------------------------------------------------------------------------
// processes
// ---------------------------------------------------------------------------

const KILLED_EXIT_CODE: i32 = 137;

#[derive(Debug)]
struct FakeProcessState {
    polls_left: u32,
    exit_code: i32,
    exited: bool,
    killed: bool,
}

impl FakeProcessState {
    fn is_alive(&self) -> bool {
        !self.exited && !self.killed
    }
}

type ProcessTable = Arc<Mutex<HashMap<u32, FakeProcessState>>>;

/// Every spawned process reports `Running` for `polls_before_exit` polls, then exits.
pub(crate) struct FakeSupervisor {
    polls_before_exit: u32,
    exit_code: i32,
    fail_spawns: bool,
    next_pid: AtomicU32,
    processes: ProcessTable,
    spawned: Mutex<Vec<String>>,
    max_concurrent: AtomicUsize,
}

impl FakeSupervisor {
    pub(crate) fn new(polls_before_exit: u32) -> Self {
        Self {
            polls_before_exit,
            exit_code: 0,
            fail_spawns: false,
            next_pid: AtomicU32::new(1000),
            processes: Arc::new(Mutex::new(HashMap::new())),
            spawned: Mutex::new(Vec::new()),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Every spawn fails as if the shell could not be executed.
    pub(crate) fn failing_spawns(mut self) -> Self {
        self.fail_spawns = true;
        self
    }

    pub(crate) fn kill(&self, pid: u32) {
        if let Some(process) = self.processes.lock().get_mut(&pid) {
            process.killed = true;
        }
    }

    /// Command lines in spawn order.
    pub(crate) fn spawned(&self) -> Vec<String> {
        self.spawned.lock().clone()
    }

    pub(crate) fn running(&self) -> usize {
        self.processes.lock().values().filter(|p| p.is_alive()).count()
    }

    /// Highest number of alive processes seen right after a spawn.
    pub(crate) fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

impl ProcessSupervisor for FakeSupervisor {
    fn spawn(&self, command: &str) -> Result<Box<dyn SupervisedProcess>> {
        if self.fail_spawns {
            return Err(WorkerError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "scripted spawn failure",
            )));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let alive = {
            let mut processes = self.processes.lock();
            processes.insert(
                pid,
                FakeProcessState {
                    polls_left: self.polls_before_exit,
                    exit_code: self.exit_code,
                    exited: false,
                    killed: false,
                },
            );
            processes.values().filter(|p| p.is_alive()).count()
        };
        self.max_concurrent.fetch_max(alive, Ordering::SeqCst);
        self.spawned.lock().push(command.to_string());

        Ok(Box::new(FakeProcess {
            pid,
            command_line: command.to_string(),
            processes: self.processes.clone(),
        }))
    }
}

impl ProcessProbe for FakeSupervisor {
    fn is_running(&self, pid: u32) -> bool {
        self.processes
            .lock()
            .get(&pid)
            .is_some_and(FakeProcessState::is_alive)
    }
}

struct FakeProcess {
    pid: u32,
    command_line: String,
    processes: ProcessTable,
}

impl SupervisedProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn command_line(&self) -> &str {
        &self.command_line
    }

    fn poll(&mut self) -> ProcessState {
        let mut processes = self.processes.lock();
        let Some(process) = processes.get_mut(&self.pid) else {
            return ProcessState::Exited(None);
        };
        if process.killed {
            return ProcessState::Exited(Some(KILLED_EXIT_CODE));
        }
        if process.exited {
            return ProcessState::Exited(Some(process.exit_code));
        }
        if process.polls_left > 0 {
            process.polls_left -= 1;
            return ProcessState::Running;
        }
        process.exited = true;
        ProcessState::Exited(Some(process.exit_code))
    }

    fn output(&self) -> String {
        format!("output of {}", self.command_line)
    }

    fn error_output(&self) -> String {
        String::new()
    }
}

// ---------------------------------------------------------------------------
// scanning
// ---------------------------------------------------------------------------

type PairKey = (String, Option<String>);

fn pair_key(queue_name: &str, store_name: Option<&str>) -> PairKey {
    (queue_name.to_string(), store_name.map(str::to_string))
}

/// Answers every adapter; unknown pairs read as 0 messages.
#[derive(Default)]
pub(crate) struct ScriptedMetricsReader {
    counts: HashMap<PairKey, u64>,
    failing: HashSet<PairKey>,
    calls: AtomicUsize,
}

impl ScriptedMetricsReader {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_count(mut self, queue_name: &str, store_name: Option<&str>, count: u64) -> Self {
        self.counts.insert(pair_key(queue_name, store_name), count);
        self
    }

    pub(crate) fn failing_for(mut self, queue_name: &str, store_name: Option<&str>) -> Self {
        self.failing.insert(pair_key(queue_name, store_name));
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsReader for ScriptedMetricsReader {
    fn is_applicable(&self, _adapter_name: &str) -> bool {
        true
    }

    async fn read(&self, request: &MetricsRequest) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = pair_key(&request.queue_name, request.store_name.as_deref());
        if self.failing.contains(&key) {
            return Err(WorkerError::QueueClient(format!(
                "scripted failure for {}",
                request.queue_name
            )));
        }
        Ok(self.counts.get(&key).copied().unwrap_or(0))
    }
}

/// Replays scans in order, then keeps returning empty scans.
pub(crate) struct ScriptedScan {
    script: VecDeque<Vec<QueueMetrics>>,
    scans: Arc<AtomicUsize>,
}

impl ScriptedScan {
    pub(crate) fn new(script: Vec<Vec<QueueMetrics>>) -> Self {
        Self {
            script: script.into(),
            scans: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of `scan_queues` calls that stays readable after the scan is boxed.
    pub(crate) fn scans(&self) -> Arc<AtomicUsize> {
        self.scans.clone()
    }
}

#[async_trait]
impl QueueScan for ScriptedScan {
    async fn scan_queues(
        &mut self,
        _store_names: &[String],
        _empty_scan_cooldown: Duration,
    ) -> Vec<QueueMetrics> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.script.pop_front().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// memory
// ---------------------------------------------------------------------------

pub(crate) struct StaticFreeMemory {
    free_mb: Option<u64>,
}

impl StaticFreeMemory {
    pub(crate) fn new(free_mb: u64) -> Self {
        Self {
            free_mb: Some(free_mb),
        }
    }

    pub(crate) fn failing() -> Self {
        Self { free_mb: None }
    }
}

#[async_trait]
impl FreeMemoryReader for StaticFreeMemory {
    async fn free_memory_mb(&self, _timeout: Duration) -> Result<u64> {
        self.free_mb
            .ok_or_else(|| WorkerError::MemoryRead("scripted failure".to_string()))
    }
}

/// Returns the scripted peaks in order and repeats the last one.
pub(crate) struct ScriptedPeakMemory {
    peaks: Vec<u64>,
    next: AtomicUsize,
}

impl ScriptedPeakMemory {
    pub(crate) fn new(peaks: Vec<u64>) -> Self {
        Self {
            peaks,
            next: AtomicUsize::new(0),
        }
    }
}

impl OwnMemoryProbe for ScriptedPeakMemory {
    fn peak_memory_bytes(&self) -> u64 {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        self.peaks
            .get(index)
            .or(self.peaks.last())
            .copied()
            .unwrap_or(0)
    }
}

/// Per-pid RSS readings in bytes, replayed in order; unknown or used-up pids read 0.
#[derive(Default)]
pub(crate) struct ScriptedProcessMemory {
    readings: Mutex<HashMap<u32, VecDeque<u64>>>,
    queried: Mutex<Vec<u32>>,
}

impl ScriptedProcessMemory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_readings(self, pid: u32, readings: &[u64]) -> Self {
        self.readings.lock().insert(pid, readings.iter().copied().collect());
        self
    }

    /// Pids in query order.
    pub(crate) fn queried(&self) -> Vec<u32> {
        self.queried.lock().clone()
    }
}

impl ProcessMemoryProbe for ScriptedProcessMemory {
    fn process_memory_bytes(&self, pid: u32) -> u64 {
        self.queried.lock().push(pid);
        self.readings
            .lock()
            .get_mut(&pid)
            .and_then(VecDeque::pop_front)
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// task side
// ---------------------------------------------------------------------------

type ReceiveCall = (String, usize, serde_json::Value);

#[derive(Default)]
struct RecordedTraffic {
    pending: HashMap<String, VecDeque<ReceivedMessage>>,
    receive_calls: Vec<ReceiveCall>,
    acknowledged: Vec<String>,
    rejected: Vec<String>,
    errored: Vec<String>,
}

/// In-memory broker that records what the task manager tells it, by message body.
#[derive(Default)]
pub(crate) struct RecordingQueueClient {
    traffic: Mutex<RecordedTraffic>,
}

impl RecordingQueueClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_bodies(&self, queue_name: &str, bodies: &[&str]) {
        let mut traffic = self.traffic.lock();
        let queue = traffic.pending.entry(queue_name.to_string()).or_default();
        for body in bodies {
            queue.push_back(ReceivedMessage::new(queue_name, *body));
        }
    }

    pub(crate) fn pending(&self, queue_name: &str) -> usize {
        self.traffic
            .lock()
            .pending
            .get(queue_name)
            .map_or(0, VecDeque::len)
    }

    pub(crate) fn receive_calls(&self) -> Vec<ReceiveCall> {
        self.traffic.lock().receive_calls.clone()
    }

    pub(crate) fn acknowledged(&self) -> Vec<String> {
        self.traffic.lock().acknowledged.clone()
    }

    pub(crate) fn rejected(&self) -> Vec<String> {
        self.traffic.lock().rejected.clone()
    }

    pub(crate) fn errored(&self) -> Vec<String> {
        self.traffic.lock().errored.clone()
    }
}

#[async_trait]
impl QueueClient for RecordingQueueClient {
    async fn receive_messages(
        &self,
        queue_name: &str,
        chunk_size: usize,
        options: &serde_json::Value,
    ) -> Result<Vec<ReceivedMessage>> {
        let mut traffic = self.traffic.lock();
        traffic
            .receive_calls
            .push((queue_name.to_string(), chunk_size, options.clone()));
        let Some(queue) = traffic.pending.get_mut(queue_name) else {
            return Ok(Vec::new());
        };
        let take = chunk_size.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    async fn acknowledge(&self, message: &ReceivedMessage) -> Result<()> {
        self.traffic.lock().acknowledged.push(message.body.clone());
        Ok(())
    }

    async fn reject(&self, message: &ReceivedMessage) -> Result<()> {
        self.traffic.lock().rejected.push(message.body.clone());
        Ok(())
    }

    async fn handle_error(&self, message: &ReceivedMessage) -> Result<()> {
        self.traffic.lock().errored.push(message.body.clone());
        Ok(())
    }
}

/// Acknowledges everything and remembers the retry flag of each message.
pub(crate) struct AckAllProcessor {
    chunk_size: usize,
    seen_retry_flags: Mutex<Vec<bool>>,
}

impl AckAllProcessor {
    pub(crate) fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            seen_retry_flags: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn seen_retry_flags(&self) -> Vec<bool> {
        self.seen_retry_flags.lock().clone()
    }
}

#[async_trait]
impl MessageProcessor for AckAllProcessor {
    async fn process_messages(&self, messages: Vec<ReceivedMessage>) -> Vec<ReceivedMessage> {
        self.seen_retry_flags
            .lock()
            .extend(messages.iter().map(|m| m.retry_queue_exists));
        messages.into_iter().map(ReceivedMessage::acknowledged).collect()
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

/// Processes nothing.
pub(crate) struct IgnoreAllProcessor;

#[async_trait]
impl MessageProcessor for IgnoreAllProcessor {
    async fn process_messages(&self, _messages: Vec<ReceivedMessage>) -> Vec<ReceivedMessage> {
        Vec::new()
    }

    fn chunk_size(&self) -> usize {
        10
    }
}

/// `ok` is acknowledged, `reject` rejected, bodies with `errorMessage` fail, the rest is skipped.
pub(crate) struct SortingProcessor {
    chunk_size: usize,
}

impl SortingProcessor {
    pub(crate) fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }
}

#[async_trait]
impl MessageProcessor for SortingProcessor {
    async fn process_messages(&self, messages: Vec<ReceivedMessage>) -> Vec<ReceivedMessage> {
        messages
            .into_iter()
            .filter_map(|message| {
                if message.body == "ok" {
                    Some(message.acknowledged())
                } else if message.body == "reject" {
                    Some(message.rejected())
                } else if message.body.contains("errorMessage") {
                    Some(message.failed())
                } else {
                    None
                }
            })
            .collect()
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}
