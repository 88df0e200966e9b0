//! OS process supervision via `tokio::process` and a `sysinfo` liveness probe.
//!
//! stdout/stderr are drained by background tasks from the moment of spawn,
//! so a chatty child never blocks on a full pipe. Only the last
//! `OUTPUT_TAIL_BYTES` of each stream are kept.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::warn;

use crate::domain::{ProcessState, Result};
use crate::ports::{ProcessProbe, ProcessSupervisor, SupervisedProcess};

const READ_CHUNK: usize = 4096;
pub const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

/// Runs every command through `sh -c`.
#[derive(Debug, Clone)]
pub struct TokioProcessSupervisor {
    shell: String,
}

impl TokioProcessSupervisor {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl Default for TokioProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor for TokioProcessSupervisor {
    fn spawn(&self, command: &str) -> Result<Box<dyn SupervisedProcess>> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let output = capture(child.stdout.take());
        let error_output = capture(child.stderr.take());
        Ok(Box::new(OsProcess {
            pid: child.id(),
            command_line: command.to_string(),
            child,
            exit: None,
            output,
            error_output,
        }))
    }
}

/// Raw bytes of one output stream, bounded to its most recent `limit` bytes.
#[derive(Debug)]
struct OutputTail {
    bytes: Vec<u8>,
    limit: usize,
}

impl OutputTail {
    fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > self.limit {
            let overflow = self.bytes.len() - self.limit;
            self.bytes.drain(..overflow);
        }
    }

    /// Decoded once, so multi-byte characters split across reads survive.
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

fn capture<R>(stream: Option<R>) -> Arc<Mutex<OutputTail>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = Arc::new(Mutex::new(OutputTail::new(OUTPUT_TAIL_BYTES)));
    if let Some(mut stream) = stream {
        let sink = buffer.clone();
        tokio::spawn(async move {
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => sink.lock().push(&chunk[..read]),
                }
            }
        });
    }
    buffer
}

struct OsProcess {
    pid: Option<u32>,
    command_line: String,
    child: Child,
    exit: Option<Option<i32>>,
    output: Arc<Mutex<OutputTail>>,
    error_output: Arc<Mutex<OutputTail>>,
}

impl SupervisedProcess for OsProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn command_line(&self) -> &str {
        &self.command_line
    }

    fn poll(&mut self) -> ProcessState {
        if let Some(code) = self.exit {
            return ProcessState::Exited(code);
        }
        match self.child.try_wait() {
            Ok(None) => ProcessState::Running,
            Ok(Some(status)) => {
                let code = exit_code(status);
                self.exit = Some(code);
                ProcessState::Exited(code)
            }
            Err(err) => {
                warn!(error = %err, pid = ?self.pid, "could not poll process, treating it as gone");
                self.exit = Some(None);
                ProcessState::Exited(None)
            }
        }
    }

    fn output(&self) -> String {
        self.output.lock().text()
    }

    fn error_output(&self) -> String {
        self.error_output.lock().text()
    }
}

/// Exit code, or `128 + signal` for a process killed by a signal (shell convention).
fn exit_code(status: ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().or_else(|| status.signal().map(|signal| 128 + signal))
    }
    #[cfg(not(unix))]
    {
        status.code()
    }
}

/// Liveness from the `sysinfo` process table; zombies count as dead.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessProbe;

impl ProcessProbe for OsProcessProbe {
    fn is_running(&self, pid: u32) -> bool {
        if pid == 0 || i32::try_from(pid).is_err() {
            return false;
        }
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), ProcessRefreshKind::new());
        system
            .process(pid)
            .is_some_and(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }
}
