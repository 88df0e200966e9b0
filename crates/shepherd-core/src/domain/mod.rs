//! Domain model (queue metrics, read modes, messages, process records, run stats).
//!
//! ここにある型は I/O を持たない値オブジェクトだけ。
//! 外部とのやり取りは `ports` の trait を経由する。

pub mod errors;
pub mod ids;
pub mod message;
pub mod metrics;
pub mod process;
pub mod read_mode;
pub mod stats;

pub use self::errors::{Result, WorkerError};
pub use self::ids::WorkerRunId;
pub use self::message::{ReceivedMessage, TaskOptions, TaskResult};
pub use self::metrics::QueueMetrics;
pub use self::process::{ProcessRecord, ProcessState, exit_code_text};
pub use self::read_mode::{DynamicSettings, ReadMode, ReadModeFlag};
pub use self::stats::WorkerStats;
