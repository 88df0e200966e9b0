//! Configuration, deserializable from TOML.
//!
//! Every section falls back to its `Default`, so an empty file is a valid config.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::domain::{DynamicSettings, ReadMode};

/// Max workers per queue when neither the queue's adapter nor the default adapter says otherwise.
pub const DEFAULT_MAX_QUEUE_WORKER: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShepherdConfig {
    pub worker: WorkerConfig,
    pub resources: ResourcesConfig,
    pub scanner: ScannerConfig,
    pub dynamic: DynamicConfig,
    pub queues: QueuesConfig,
    pub task: TaskConfig,
    pub spool: SpoolConfig,
}

impl ShepherdConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ShepherdConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.max_processes == 0 {
            return Err(ConfigError::Invalid(
                "worker.max_processes must be at least 1".to_string(),
            ));
        }
        if !self.worker.command_pattern.contains("{queue}") {
            return Err(ConfigError::Invalid(
                "worker.command_pattern must contain {queue}".to_string(),
            ));
        }
        if !self.worker.store_command_pattern.contains("{store}")
            || !self.worker.store_command_pattern.contains("{queue}")
        {
            return Err(ConfigError::Invalid(
                "worker.store_command_pattern must contain {store} and {queue}".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for name in &self.queues.names {
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "queue {name} is listed twice in queues.names"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Ordered,
    #[default]
    Dynamic,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Partition key of the process tracking table. Defaults to the host name.
    pub server_id: Option<String>,
    pub max_processes: usize,
    /// Minimum delay between two dispatches.
    pub interval_ms: u64,
    /// Wall-clock budget of one worker run.
    pub max_threshold_secs: u64,
    pub cycle_pause_ms: u64,
    pub waiting_processes_complete_timeout_secs: u64,
    pub check_processes_complete_interval_ms: u64,
    pub process_trigger_interval_ms: u64,
    pub worker_interval_ms: u64,
    pub resource_aware: bool,
    pub strategy: StrategyKind,
    pub graceful_shutdown_signals: Vec<String>,
    pub max_allowed_memory_growth_percent: u64,
    pub command_pattern: String,
    pub store_command_pattern: String,
    pub log_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_id: None,
            max_processes: 5,
            interval_ms: 1000,
            max_threshold_secs: 59,
            cycle_pause_ms: 10,
            waiting_processes_complete_timeout_secs: 10,
            check_processes_complete_interval_ms: 100,
            process_trigger_interval_ms: 0,
            worker_interval_ms: 1000,
            resource_aware: true,
            strategy: StrategyKind::Dynamic,
            graceful_shutdown_signals: vec![
                "SIGINT".to_string(),
                "SIGTERM".to_string(),
                "SIGQUIT".to_string(),
            ],
            max_allowed_memory_growth_percent: 50,
            command_pattern: "{command} {queue}".to_string(),
            store_command_pattern: "APPLICATION_STORE={store} {command} {queue}".to_string(),
            log_interval_ms: 1000,
        }
    }
}

impl WorkerConfig {
    pub fn server_id(&self) -> String {
        self.server_id.clone().unwrap_or_else(default_server_id)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_threshold(&self) -> Duration {
        Duration::from_secs(self.max_threshold_secs)
    }

    pub fn cycle_pause(&self) -> Duration {
        Duration::from_millis(self.cycle_pause_ms)
    }

    pub fn waiting_processes_complete_timeout(&self) -> Duration {
        Duration::from_secs(self.waiting_processes_complete_timeout_secs)
    }

    pub fn check_processes_complete_interval(&self) -> Duration {
        Duration::from_millis(self.check_processes_complete_interval_ms)
    }

    pub fn process_trigger_interval(&self) -> Duration {
        Duration::from_millis(self.process_trigger_interval_ms)
    }

    pub fn worker_interval(&self) -> Duration {
        Duration::from_millis(self.worker_interval_ms)
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_millis(self.log_interval_ms)
    }
}

fn default_server_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    pub free_memory_buffer_mb: u64,
    pub ignore_zero_memory_read: bool,
    pub memory_read_timeout_secs: u64,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            free_memory_buffer_mb: 750,
            ignore_zero_memory_read: false,
            memory_read_timeout_secs: 5,
        }
    }
}

impl ResourcesConfig {
    pub fn memory_read_timeout(&self) -> Duration {
        Duration::from_secs(self.memory_read_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub empty_scan_cooldown_secs: u64,
    /// Stores to scan; empty means every store the StoreProvider knows.
    pub store_names: Vec<String>,
    /// Scan once per queue for the whole region instead of per store.
    pub dynamic_store_enabled: bool,
    pub current_region: Option<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            empty_scan_cooldown_secs: 5,
            store_names: Vec::new(),
            dynamic_store_enabled: false,
            current_region: None,
        }
    }
}

impl ScannerConfig {
    pub fn empty_scan_cooldown(&self) -> Duration {
        Duration::from_secs(self.empty_scan_cooldown_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DynamicConfig {
    pub mode: u32,
    pub big_queue_threshold_batches: u64,
    /// Cap on consecutive dispatches to one queue, and on its concurrent processes. 0 disables the cap.
    pub limit_per_queue: u32,
    pub publish_prefix: String,
    pub sync_prefix: String,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            mode: 0,
            big_queue_threshold_batches: 10,
            limit_per_queue: 2,
            publish_prefix: "publish".to_string(),
            sync_prefix: "sync".to_string(),
        }
    }
}

impl DynamicConfig {
    pub fn settings(&self) -> DynamicSettings {
        DynamicSettings {
            mode: ReadMode::from_bits(self.mode),
            big_queue_threshold_batches: self.big_queue_threshold_batches,
            limit_per_queue: self.limit_per_queue,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AdapterConfig {
    pub adapter: String,
    pub max_workers: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    /// Queues in declaration order.
    pub names: Vec<String>,
    pub chunk_size: HashMap<String, usize>,
    pub receiver_options: HashMap<String, serde_json::Value>,
    pub default_receiver_options: serde_json::Value,
    pub adapters: HashMap<String, AdapterConfig>,
    pub default_adapter: Option<AdapterConfig>,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            chunk_size: HashMap::new(),
            receiver_options: HashMap::new(),
            default_receiver_options: serde_json::Value::Object(serde_json::Map::new()),
            adapters: HashMap::new(),
            default_adapter: None,
        }
    }
}

impl QueuesConfig {
    fn adapter_config(&self, queue_name: &str) -> Option<&AdapterConfig> {
        self.adapters
            .get(queue_name)
            .or(self.default_adapter.as_ref())
    }

    pub fn queue_adapter(&self, queue_name: &str) -> Option<&str> {
        self.adapter_config(queue_name)
            .map(|config| config.adapter.as_str())
    }

    pub fn max_workers_by_queue(&self, queue_name: &str) -> u32 {
        self.adapters
            .get(queue_name)
            .and_then(|config| config.max_workers)
            .or_else(|| {
                self.default_adapter
                    .as_ref()
                    .and_then(|config| config.max_workers)
            })
            .unwrap_or(DEFAULT_MAX_QUEUE_WORKER)
    }

    pub fn chunk_size_override(&self, queue_name: &str) -> Option<usize> {
        self.chunk_size.get(queue_name).copied()
    }

    pub fn receiver_options(&self, queue_name: &str) -> &serde_json::Value {
        self.receiver_options
            .get(queue_name)
            .unwrap_or(&self.default_receiver_options)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub max_memory_chunk_size_kb: Option<u64>,
    pub max_memory_size_mb: Option<u64>,
    pub error_log_enabled: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_memory_chunk_size_kb: None,
            max_memory_size_mb: None,
            error_log_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub root: PathBuf,
    /// In-flight messages older than this go back to pending.
    pub visibility_timeout_secs: u64,
}

impl SpoolConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("var/spool"),
            visibility_timeout_secs: 300,
        }
    }
}
