//! ProcessStore port - 起動済みキュープロセスの追跡テーブル
//!
//! すべての操作は server_id で区切られる。
//! 別サーバーの worker が他人のエントリを消してはいけない。

use async_trait::async_trait;

use crate::domain::{ProcessRecord, Result};

#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn save(&self, record: ProcessRecord) -> Result<()>;

    /// Pids tracked for `server_id`, narrowed to one queue when given.
    async fn find_pids(&self, server_id: &str, queue_name: Option<&str>) -> Result<Vec<u32>>;

    /// Returns the number of removed entries.
    async fn delete(&self, server_id: &str, pids: &[u32]) -> Result<usize>;
}
