//! Memory readers: system free memory, the own process peak and child process trees.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::domain::{Result, WorkerError};
use crate::ports::{FreeMemoryReader, OwnMemoryProbe, ProcessMemoryProbe};

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;

/// `/proc/meminfo` on Linux, `sysinfo` elsewhere.
pub fn default_free_memory_reader() -> Arc<dyn FreeMemoryReader> {
    if cfg!(target_os = "linux") {
        Arc::new(LinuxFreeMemoryReader::new())
    } else {
        Arc::new(SysinfoFreeMemoryReader)
    }
}

/// Reads `/proc/meminfo`; reports the larger of `MemFree` and `MemAvailable`.
#[derive(Debug, Clone)]
pub struct LinuxFreeMemoryReader {
    path: PathBuf,
}

impl LinuxFreeMemoryReader {
    pub fn new() -> Self {
        Self::with_path("/proc/meminfo")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for LinuxFreeMemoryReader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FreeMemoryReader for LinuxFreeMemoryReader {
    async fn free_memory_mb(&self, timeout: Duration) -> Result<u64> {
        let content = tokio::time::timeout(timeout, tokio::fs::read_to_string(&self.path))
            .await
            .map_err(|_| WorkerError::MemoryReadTimeout(timeout))?
            .map_err(|err| WorkerError::MemoryRead(format!("{}: {err}", self.path.display())))?;

        parse_meminfo(&content).ok_or_else(|| {
            WorkerError::MemoryRead(format!(
                "no MemFree/MemAvailable in {}",
                self.path.display()
            ))
        })
    }
}

/// `max(MemFree, MemAvailable)` in MB, or `None` when neither line is present.
pub fn parse_meminfo(content: &str) -> Option<u64> {
    let mut free_kb = None;
    let mut available_kb = None;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let slot = match key.trim() {
            "MemFree" => &mut free_kb,
            "MemAvailable" => &mut available_kb,
            _ => continue,
        };
        *slot = value
            .split_whitespace()
            .next()
            .and_then(|number| number.parse::<u64>().ok());
    }

    match (free_kb, available_kb) {
        (None, None) => None,
        (free, available) => Some(free.unwrap_or(0).max(available.unwrap_or(0)) / KB),
    }
}

/// Cross-platform reader backed by `sysinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoFreeMemoryReader;

#[async_trait]
impl FreeMemoryReader for SysinfoFreeMemoryReader {
    async fn free_memory_mb(&self, timeout: Duration) -> Result<u64> {
        let read = tokio::task::spawn_blocking(|| {
            let mut system = System::new();
            system.refresh_memory();
            system.available_memory().max(system.free_memory()) / MB
        });
        tokio::time::timeout(timeout, read)
            .await
            .map_err(|_| WorkerError::MemoryReadTimeout(timeout))?
            .map_err(|err| WorkerError::MemoryRead(err.to_string()))
    }
}

/// Peak resident set (`VmHWM`) of the current process from `/proc/self/status`.
/// Reports 0 where that file does not exist.
#[derive(Debug, Clone)]
pub struct ProcStatusPeakMemory {
    path: PathBuf,
}

impl ProcStatusPeakMemory {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/proc/self/status"),
        }
    }
}

impl Default for ProcStatusPeakMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnMemoryProbe for ProcStatusPeakMemory {
    fn peak_memory_bytes(&self) -> u64 {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|status| parse_status_kb(&status, "VmHWM"))
            .map_or(0, |kb| kb * KB)
    }
}

fn parse_status_kb(status: &str, key: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key)?.strip_prefix(':'))
        .and_then(|value| value.split_whitespace().next())
        .and_then(|number| number.parse().ok())
}

/// RSS of a process and its direct children from one `sysinfo` process table refresh.
pub struct SysinfoProcessMemory {
    system: Mutex<System>,
}

impl SysinfoProcessMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMemoryProbe for SysinfoProcessMemory {
    fn process_memory_bytes(&self, pid: u32) -> u64 {
        let mut system = self.system.lock();
        system.refresh_processes_specifics(ProcessesToUpdate::All, ProcessRefreshKind::new().with_memory());
        // threads show up as entries of their own on Linux
        let table = system
            .processes()
            .values()
            .filter(|process| process.thread_kind().is_none())
            .map(|process| (process.pid().as_u32(), process.parent().map(Pid::as_u32), process.memory()));
        tree_memory(table, pid)
    }
}

/// `pid`'s own memory plus its direct children's; 0 when `pid` is not in the table.
fn tree_memory(table: impl Iterator<Item = (u32, Option<u32>, u64)>, pid: u32) -> u64 {
    let mut own = None;
    let mut children = 0;
    for (entry_pid, parent, memory) in table {
        if entry_pid == pid {
            own = Some(memory);
        } else if parent == Some(pid) {
            children += memory;
        }
    }
    match own {
        Some(0) | None => 0,
        Some(own) => own + children,
    }
}
