//! ProcessMemoryTracker - RUN / DONE ログに付けるサブプロセスのメモリ表示
//!
//! 最初の計測は現在値だけ、2 回目以降は前回との差分も付ける。
//! プロセスが消えていたら最後に測った値を "finished" として出す。

use std::collections::HashMap;
use std::sync::Arc;

use crate::ports::ProcessMemoryProbe;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub struct ProcessMemoryTracker {
    probe: Option<Arc<dyn ProcessMemoryProbe>>,
    last_bytes: HashMap<u32, u64>,
}

impl ProcessMemoryTracker {
    pub fn new(probe: Arc<dyn ProcessMemoryProbe>) -> Self {
        Self {
            probe: Some(probe),
            last_bytes: HashMap::new(),
        }
    }

    /// Reports nothing.
    pub fn disabled() -> Self {
        Self {
            probe: None,
            last_bytes: HashMap::new(),
        }
    }

    /// Text for the log line of `pid`; empty when disabled or without a pid.
    pub fn memory_info(&mut self, pid: Option<u32>) -> String {
        let (Some(probe), Some(pid)) = (self.probe.as_ref(), pid) else {
            return String::new();
        };

        let current = probe.process_memory_bytes(pid);
        if current == 0 {
            return match self.last_bytes.remove(&pid) {
                Some(last) => format!("Memory: {:.2} MB (finished)", to_mb(last as f64)),
                None => "Memory: starting...".to_string(),
            };
        }

        match self.last_bytes.insert(pid, current) {
            None => format!("Memory: {:.2} MB", to_mb(current as f64)),
            Some(last) => {
                let diff = current as f64 - last as f64;
                let sign = if diff >= 0.0 { "+" } else { "" };
                format!(
                    "Memory: {:.2} MB ({sign}{:.2} MB)",
                    to_mb(current as f64),
                    to_mb(diff)
                )
            }
        }
    }

    /// Forgets every reading; called at the start of each run.
    pub fn reset(&mut self) {
        self.last_bytes.clear();
    }
}

fn to_mb(bytes: f64) -> f64 {
    bytes / BYTES_PER_MB
}
