//! App - アプリケーション層
//!
//! ports を組み合わせて worker 側とタスク側のロジックを実装する。
//!
//! # 主要コンポーネント
//! - **QueueScanner**: キューごとの件数スナップショット
//! - **Strategy**: 次に処理するキューの決定（ordered / dynamic）
//! - **Worker**: サブプロセスを起動し続ける制御ループ
//! - **ProcessManager**: 起動済みプロセスの追跡
//! - **SystemResourcesManager**: free memory / 自プロセスのメモリ伸び率
//! - **TaskManager**: サブプロセス内での 1 バッチ処理
//! - **ShepherdBuilder**: 設定とポート実装のワイヤリング

pub mod builder;
pub mod context;
pub mod logger;
pub mod memory_checker;
pub mod process_manager;
pub mod registry;
pub mod resources;
pub mod scanner;
pub mod shutdown;
pub mod strategy;
pub mod task_manager;
pub mod worker;

pub use self::builder::{App, BuildError, ShepherdBuilder};
pub use self::context::WorkerContext;
pub use self::logger::{QueueErrorLogger, WorkerLogger};
pub use self::memory_checker::{MemoryWarning, TaskMemoryUsageChecker};
pub use self::process_manager::ProcessManager;
pub use self::registry::{ProcessorRegistry, RegistryError};
pub use self::resources::SystemResourcesManager;
pub use self::scanner::{QueueScan, QueueScanner};
pub use self::shutdown::{ShutdownSignal, ShutdownTrigger, install_signal_handlers, shutdown_channel};
pub use self::strategy::QueueProcessingStrategy;
pub use self::task_manager::TaskManager;
pub use self::worker::{QueueWorker, TerminationReason, WorkerOptions, WorkerReport, shell_quote};
