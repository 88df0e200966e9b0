//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **TokioProcessSupervisor / OsProcessProbe**: `sh -c` でのサブプロセス起動と生存確認
//! - **LinuxFreeMemoryReader / SysinfoFreeMemoryReader**: free memory
//! - **ProcStatusPeakMemory**: 自プロセスの peak RSS
//! - **SysinfoProcessMemory**: サブプロセス（と直接の子）の RSS
//! - **InMemoryProcessStore**: プロセス追跡テーブル
//! - **StaticStoreProvider**: 設定から来る固定のストア一覧
//! - **SpoolQueueClient**: ディレクトリベースのローカルキュー（QueueClient + MetricsReader）
//!
//! ブローカー固有の実装（RabbitMQ など）はこの crate の外に置く。

pub mod inmem_process_store;
pub mod memory;
pub mod os_process;
pub mod spool;
pub mod store_provider;

pub use self::inmem_process_store::InMemoryProcessStore;
pub use self::memory::{
    LinuxFreeMemoryReader, ProcStatusPeakMemory, SysinfoFreeMemoryReader, SysinfoProcessMemory,
    default_free_memory_reader, parse_meminfo,
};
pub use self::os_process::{OsProcessProbe, TokioProcessSupervisor};
pub use self::spool::{SPOOL_ADAPTER, SpoolQueueClient};
pub use self::store_provider::StaticStoreProvider;
