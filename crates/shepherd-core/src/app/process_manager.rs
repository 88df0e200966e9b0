//! ProcessManager - キュープロセスの起動と追跡
//!
//! 追跡テーブル（ProcessStore）は server_id ごとに区切られ、この worker の分だけを触る。
//! OS レベルの生存確認は失敗しない。曖昧なものは「動いていない」に倒す
//! （スロットを漏らすより掃除する側に倒す）。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::app::context::WorkerContext;
use crate::domain::{ProcessRecord, ProcessState, Result, exit_code_text};
use crate::ports::{ProcessProbe, ProcessStore, ProcessSupervisor, SupervisedProcess};

const FAILED_START_LOG_INTERVAL: Duration = Duration::from_secs(30);

pub struct ProcessManager {
    ctx: Arc<WorkerContext>,
    server_id: String,
    supervisor: Arc<dyn ProcessSupervisor>,
    probe: Arc<dyn ProcessProbe>,
    store: Arc<dyn ProcessStore>,
    persist: bool,
}

impl ProcessManager {
    pub fn new(
        ctx: Arc<WorkerContext>,
        server_id: impl Into<String>,
        supervisor: Arc<dyn ProcessSupervisor>,
        probe: Arc<dyn ProcessProbe>,
        store: Arc<dyn ProcessStore>,
    ) -> Self {
        Self {
            ctx,
            server_id: server_id.into(),
            supervisor,
            probe,
            store,
            persist: true,
        }
    }

    /// Whether started processes are written to the store. The resource-aware
    /// worker keeps its own slot table and turns this off.
    pub fn with_persistence(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Starts `command` for `queue_name`.
    ///
    /// A process that is already gone right after the start is logged (rate
    /// limited) and still returned; the caller reaps it like any other.
    pub async fn trigger_queue_process(
        &self,
        command: &str,
        queue_name: &str,
    ) -> Result<Box<dyn SupervisedProcess>> {
        let mut process = self.supervisor.spawn(command)?;

        match process.poll() {
            ProcessState::Running => {
                if self.persist
                    && let Some(pid) = process.pid()
                {
                    let record = ProcessRecord {
                        server_id: self.server_id.clone(),
                        queue_name: queue_name.to_string(),
                        process_pid: pid,
                        worker_pid: std::process::id(),
                    };
                    if let Err(err) = self.store.save(record).await {
                        warn!(error = %err, queue = queue_name, pid, "could not track started process");
                    }
                }
            }
            ProcessState::Exited(Some(0)) => {
                debug!(queue = queue_name, command, "queue process finished right after start");
            }
            ProcessState::Exited(code) => self.log_failed_start(queue_name, code, process.as_ref()),
        }

        Ok(process)
    }

    fn log_failed_start(&self, queue_name: &str, code: Option<i32>, process: &dyn SupervisedProcess) {
        let message = format!(
            "Queue process failed to start or exited immediately: {}",
            process.command_line()
        );
        if !self.ctx.should_log(&message, FAILED_START_LOG_INTERVAL) {
            return;
        }
        error!(
            queue = queue_name,
            exit_code = ?code,
            exit_code_text = exit_code_text(code),
            stdout = %process.output(),
            stderr = %process.error_output(),
            "{message}"
        );
    }

    /// Alive tracked processes for `queue_name`; dead entries found on the way are removed.
    pub async fn get_busy_process_number(&self, queue_name: &str) -> Result<usize> {
        let pids = self.store.find_pids(&self.server_id, Some(queue_name)).await?;
        self.release_idle_processes(pids).await
    }

    pub async fn get_running_process_pids(&self, queue_name: &str) -> Result<Vec<u32>> {
        let pids = self.store.find_pids(&self.server_id, Some(queue_name)).await?;
        Ok(pids.into_iter().filter(|pid| self.probe.is_running(*pid)).collect())
    }

    /// Drops every dead entry of this server. Returns the number removed.
    pub async fn flush_idle_processes(&self) -> Result<usize> {
        let pids = self.store.find_pids(&self.server_id, None).await?;
        let dead: Vec<u32> = pids
            .into_iter()
            .filter(|pid| !self.probe.is_running(*pid))
            .collect();
        if dead.is_empty() {
            return Ok(0);
        }
        self.store.delete(&self.server_id, &dead).await
    }

    /// Drops every entry of this server, alive or not.
    pub async fn flush_all_worker_processes(&self) -> Result<usize> {
        let pids = self.store.find_pids(&self.server_id, None).await?;
        if pids.is_empty() {
            return Ok(0);
        }
        self.store.delete(&self.server_id, &pids).await
    }

    pub fn is_process_running(&self, pid: Option<u32>) -> bool {
        pid.is_some_and(|pid| self.probe.is_running(pid))
    }

    async fn release_idle_processes(&self, pids: Vec<u32>) -> Result<usize> {
        let (running, dead): (Vec<u32>, Vec<u32>) =
            pids.into_iter().partition(|pid| self.probe.is_running(*pid));
        if !dead.is_empty() {
            self.store.delete(&self.server_id, &dead).await?;
        }
        Ok(running.len())
    }
}
