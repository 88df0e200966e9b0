//! Ports - 抽象化レイヤー
//!
//! Worker のスケジューリング本体は、ブローカー・OS プロセス・メモリ計測・永続化に
//! 直接触らない。すべてここの trait 越しに扱う。
//!
//! # 設計原則
//! - 外部システムごとに trait を 1 つ
//! - テストでは fake 実装に差し替えられる（時刻・プロセス寿命も含めて決定的）
//! - 実装は `impls` に置く

pub mod clock;
pub mod memory;
pub mod message_processor;
pub mod metrics_reader;
pub mod process_store;
pub mod queue_client;
pub mod settings_updater;
pub mod store_provider;
pub mod supervisor;

pub use self::clock::{Clock, FixedClock, SystemClock, elapsed_since};
pub use self::memory::{FreeMemoryReader, OwnMemoryProbe, ProcessMemoryProbe};
pub use self::message_processor::MessageProcessor;
pub use self::metrics_reader::{MetricsReader, MetricsRequest};
pub use self::process_store::ProcessStore;
pub use self::queue_client::QueueClient;
pub use self::settings_updater::DynamicSettingsUpdater;
pub use self::store_provider::StoreProvider;
pub use self::supervisor::{ProcessProbe, ProcessSupervisor, SupervisedProcess};
