//! InMemoryProcessStore - プロセス追跡テーブルのメモリ実装
//!
//! server_id ごとに pid → ProcessRecord を持つ。
//! worker が 1 プロセスで完結する場合（ローカル実行・テスト）はこれで十分。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{ProcessRecord, Result};
use crate::ports::ProcessStore;

#[derive(Debug, Default)]
pub struct InMemoryProcessStore {
    /// server_id → pid → record. BTreeMap で pid 順を安定させる。
    servers: Mutex<HashMap<String, BTreeMap<u32, ProcessRecord>>>,
}

impl InMemoryProcessStore {
    pub fn new() -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ProcessStore for InMemoryProcessStore {
    async fn save(&self, record: ProcessRecord) -> Result<()> {
        self.servers
            .lock()
            .entry(record.server_id.clone())
            .or_default()
            .insert(record.process_pid, record);
        Ok(())
    }

    async fn find_pids(&self, server_id: &str, queue_name: Option<&str>) -> Result<Vec<u32>> {
        let servers = self.servers.lock();
        let Some(records) = servers.get(server_id) else {
            return Ok(Vec::new());
        };
        Ok(records
            .values()
            .filter(|record| queue_name.is_none_or(|queue| record.queue_name == queue))
            .map(|record| record.process_pid)
            .collect())
    }

    async fn delete(&self, server_id: &str, pids: &[u32]) -> Result<usize> {
        let mut servers = self.servers.lock();
        let Some(records) = servers.get_mut(server_id) else {
            return Ok(0);
        };
        Ok(pids
            .iter()
            .filter(|pid| records.remove(*pid).is_some())
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(server_id: &str, queue_name: &str, pid: u32) -> ProcessRecord {
        ProcessRecord {
            server_id: server_id.to_string(),
            queue_name: queue_name.to_string(),
            process_pid: pid,
            worker_pid: 1,
        }
    }

    #[tokio::test]
    async fn find_filters_by_server_and_queue() {
        let store = InMemoryProcessStore::new();
        store.save(record("a", "event", 12)).await.unwrap();
        store.save(record("a", "product", 11)).await.unwrap();
        store.save(record("b", "event", 13)).await.unwrap();

        assert_eq!(store.find_pids("a", None).await.unwrap(), vec![11, 12]);
        assert_eq!(store.find_pids("a", Some("event")).await.unwrap(), vec![12]);
        assert!(store.find_pids("c", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_counts_only_removed_entries() {
        let store = InMemoryProcessStore::new();
        store.save(record("a", "event", 12)).await.unwrap();
        store.save(record("b", "event", 12)).await.unwrap();

        assert_eq!(store.delete("a", &[12, 99]).await.unwrap(), 1);
        assert_eq!(store.delete("a", &[12]).await.unwrap(), 0);
        assert_eq!(store.find_pids("b", None).await.unwrap(), vec![12]);
    }
}
