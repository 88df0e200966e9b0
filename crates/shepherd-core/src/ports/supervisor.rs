//! Process supervisor port - OS プロセスの起動・監視
//!
//! スケジューリングのロジックは spawn / poll / reap しか使わない。
//! テストでは fake supervisor がプロセス寿命を poll 回数で決定的に再現する。

use crate::domain::{ProcessState, Result};

pub trait SupervisedProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    fn command_line(&self) -> &str;

    /// Non-blocking liveness check; reaps the process once it has exited.
    fn poll(&mut self) -> ProcessState;

    /// Captured stdout so far.
    fn output(&self) -> String;

    /// Captured stderr so far.
    fn error_output(&self) -> String;
}

pub trait ProcessSupervisor: Send + Sync {
    fn spawn(&self, command: &str) -> Result<Box<dyn SupervisedProcess>>;
}

/// OS process table lookup. Never fails: anything ambiguous is "not running".
pub trait ProcessProbe: Send + Sync {
    fn is_running(&self, pid: u32) -> bool;
}
