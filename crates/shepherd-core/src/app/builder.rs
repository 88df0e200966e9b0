//! ShepherdBuilder - 設定とポート実装から worker / task manager を組み立てる
//!
//! # Fail-fast
//! - `expect_queues()` を呼ぶと、設定された全キューに processor があるかを `build()` で検査する
//! - 足りなければ不足分をすべて列挙した `BuildError::MissingProcessors` を返す
//!
//! ポート実装を指定しなかったものは OS 実装（`impls`）にフォールバックする。

use std::sync::Arc;
use std::time::Duration;

use crate::app::context::WorkerContext;
use crate::app::logger::QueueErrorLogger;
use crate::app::memory_checker::TaskMemoryUsageChecker;
use crate::app::process_manager::ProcessManager;
use crate::app::registry::{ProcessorRegistry, RegistryError};
use crate::app::resources::SystemResourcesManager;
use crate::app::scanner::{QueueScan, QueueScanner};
use crate::app::shutdown::ShutdownSignal;
use crate::app::strategy::{
    DynamicOrderQueueProcessingStrategy, OrderedQueueProcessingStrategy, QueuePrefixes,
    QueueProcessingStrategy,
};
use crate::app::task_manager::TaskManager;
use crate::app::worker::{
    ProcessCountingWorker, ProcessMemoryTracker, QueueWorker, ResourceAwareQueueWorker,
};
use crate::config::{ShepherdConfig, StrategyKind};
use crate::domain::QueueMetrics;
use crate::impls::{
    InMemoryProcessStore, OsProcessProbe, ProcStatusPeakMemory, StaticStoreProvider,
    SysinfoProcessMemory, TokioProcessSupervisor, default_free_memory_reader,
};
use crate::ports::{
    Clock, DynamicSettingsUpdater, FreeMemoryReader, MessageProcessor, MetricsReader, OwnMemoryProbe,
    ProcessMemoryProbe, ProcessProbe, ProcessStore, ProcessSupervisor, QueueClient, StoreProvider,
    SystemClock,
};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing message processors for queues: {0:?}. These queues are configured but nothing processes them.")]
    MissingProcessors(Vec<String>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("no queue client configured, a task manager needs one")]
    MissingQueueClient,
}

pub struct ShepherdBuilder {
    config: ShepherdConfig,
    registry: ProcessorRegistry,
    expect_queues: bool,
    metrics_readers: Vec<Arc<dyn MetricsReader>>,
    settings_updaters: Vec<Arc<dyn DynamicSettingsUpdater>>,
    queue_client: Option<Arc<dyn QueueClient>>,
    store_provider: Option<Arc<dyn StoreProvider>>,
    supervisor: Option<(Arc<dyn ProcessSupervisor>, Arc<dyn ProcessProbe>)>,
    process_store: Option<Arc<dyn ProcessStore>>,
    free_memory: Option<Arc<dyn FreeMemoryReader>>,
    own_memory: Option<Arc<dyn OwnMemoryProbe>>,
    process_memory: Option<Arc<dyn ProcessMemoryProbe>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ShepherdBuilder {
    pub fn new(config: ShepherdConfig) -> Self {
        Self {
            config,
            registry: ProcessorRegistry::new(),
            expect_queues: false,
            metrics_readers: Vec::new(),
            settings_updaters: Vec::new(),
            queue_client: None,
            store_provider: None,
            supervisor: None,
            process_store: None,
            free_memory: None,
            own_memory: None,
            process_memory: None,
            clock: None,
        }
    }

    pub fn register(
        mut self,
        queue_name: impl Into<String>,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<Self, BuildError> {
        self.registry.register(queue_name, processor)?;
        Ok(self)
    }

    /// Every queue in `[queues].names` must have a processor at `build()`.
    pub fn expect_queues(mut self) -> Self {
        self.expect_queues = true;
        self
    }

    /// Readers are consulted in the order they were added.
    pub fn metrics_reader(mut self, reader: Arc<dyn MetricsReader>) -> Self {
        self.metrics_readers.push(reader);
        self
    }

    pub fn settings_updater(mut self, updater: Arc<dyn DynamicSettingsUpdater>) -> Self {
        self.settings_updaters.push(updater);
        self
    }

    pub fn queue_client(mut self, client: Arc<dyn QueueClient>) -> Self {
        self.queue_client = Some(client);
        self
    }

    pub fn store_provider(mut self, provider: Arc<dyn StoreProvider>) -> Self {
        self.store_provider = Some(provider);
        self
    }

    pub fn supervisor(mut self, supervisor: Arc<dyn ProcessSupervisor>, probe: Arc<dyn ProcessProbe>) -> Self {
        self.supervisor = Some((supervisor, probe));
        self
    }

    pub fn process_store(mut self, store: Arc<dyn ProcessStore>) -> Self {
        self.process_store = Some(store);
        self
    }

    pub fn memory(mut self, free_memory: Arc<dyn FreeMemoryReader>, own_memory: Arc<dyn OwnMemoryProbe>) -> Self {
        self.free_memory = Some(free_memory);
        self.own_memory = Some(own_memory);
        self
    }

    /// Memory readings of spawned processes for the RUN / DONE log lines.
    pub fn process_memory(mut self, probe: Arc<dyn ProcessMemoryProbe>) -> Self {
        self.process_memory = Some(probe);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        if self.expect_queues {
            let missing: Vec<String> = self
                .config
                .queues
                .names
                .iter()
                .filter(|queue_name| !self.registry.contains(queue_name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingProcessors(missing));
            }
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store_provider = self.store_provider.unwrap_or_else(|| {
            Arc::new(StaticStoreProvider::new(self.config.scanner.store_names.clone()))
        });
        let (supervisor, probe) = self.supervisor.unwrap_or_else(|| {
            (
                Arc::new(TokioProcessSupervisor::new()) as Arc<dyn ProcessSupervisor>,
                Arc::new(OsProcessProbe) as Arc<dyn ProcessProbe>,
            )
        });

        Ok(App {
            ctx: Arc::new(WorkerContext::new(clock)),
            registry: Arc::new(self.registry),
            metrics_readers: self.metrics_readers,
            settings_updaters: self.settings_updaters,
            queue_client: self.queue_client,
            store_provider,
            supervisor,
            probe,
            process_store: self
                .process_store
                .unwrap_or_else(|| Arc::new(InMemoryProcessStore::new())),
            free_memory: self.free_memory.unwrap_or_else(default_free_memory_reader),
            own_memory: self
                .own_memory
                .unwrap_or_else(|| Arc::new(ProcStatusPeakMemory::new())),
            process_memory: self
                .process_memory
                .unwrap_or_else(|| Arc::new(SysinfoProcessMemory::new())),
            config: self.config,
        })
    }
}

/// Fully wired components; every call hands out a fresh instance.
pub struct App {
    config: ShepherdConfig,
    ctx: Arc<WorkerContext>,
    registry: Arc<ProcessorRegistry>,
    metrics_readers: Vec<Arc<dyn MetricsReader>>,
    settings_updaters: Vec<Arc<dyn DynamicSettingsUpdater>>,
    queue_client: Option<Arc<dyn QueueClient>>,
    store_provider: Arc<dyn StoreProvider>,
    supervisor: Arc<dyn ProcessSupervisor>,
    probe: Arc<dyn ProcessProbe>,
    process_store: Arc<dyn ProcessStore>,
    free_memory: Arc<dyn FreeMemoryReader>,
    own_memory: Arc<dyn OwnMemoryProbe>,
    process_memory: Arc<dyn ProcessMemoryProbe>,
}

impl App {
    pub fn config(&self) -> &ShepherdConfig {
        &self.config
    }

    pub fn context(&self) -> Arc<WorkerContext> {
        self.ctx.clone()
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    pub fn process_manager(&self) -> ProcessManager {
        ProcessManager::new(
            self.ctx.clone(),
            self.config.worker.server_id(),
            self.supervisor.clone(),
            self.probe.clone(),
            self.process_store.clone(),
        )
        .with_persistence(!self.config.worker.resource_aware)
    }

    pub fn scanner(&self) -> QueueScanner {
        QueueScanner::new(
            self.ctx.clone(),
            self.config.queues.clone(),
            self.registry.chunk_sizes(&self.config.queues),
            self.store_provider.clone(),
        )
        .with_metrics_readers(self.metrics_readers.clone())
        .with_scanner_config(&self.config.scanner)
    }

    pub fn strategy(&self) -> Box<dyn QueueProcessingStrategy> {
        let scanner = Box::new(self.scanner());
        let store_names = self.config.scanner.store_names.clone();
        let cooldown = self.config.scanner.empty_scan_cooldown();

        match self.config.worker.strategy {
            StrategyKind::Ordered => Box::new(OrderedQueueProcessingStrategy::new(
                scanner,
                store_names,
                cooldown,
            )),
            StrategyKind::Dynamic => {
                let dynamic = &self.config.dynamic;
                Box::new(
                    DynamicOrderQueueProcessingStrategy::new(
                        scanner,
                        store_names,
                        cooldown,
                        dynamic.settings(),
                    )
                    .with_updaters(self.settings_updaters.clone())
                    .with_prefixes(QueuePrefixes {
                        publish: dynamic.publish_prefix.clone(),
                        sync: dynamic.sync_prefix.clone(),
                    }),
                )
            }
        }
    }

    /// The resource-aware worker, or the process-counting one when `resource_aware = false`.
    pub fn worker(&self, shutdown: ShutdownSignal) -> Box<dyn QueueWorker> {
        let worker_config = self.config.worker.clone();
        let process_manager = Arc::new(self.process_manager());

        if !worker_config.resource_aware {
            return Box::new(
                ProcessCountingWorker::new(
                    self.ctx.clone(),
                    worker_config,
                    self.config.queues.clone(),
                    process_manager,
                    shutdown,
                )
                .with_empty_check(Box::new(self.scanner()), self.config.scanner.store_names.clone())
                .with_memory_tracker(self.memory_tracker()),
            );
        }

        let resources = SystemResourcesManager::new(
            self.free_memory.clone(),
            self.own_memory.clone(),
            self.config.resources.clone(),
        );
        Box::new(ResourceAwareQueueWorker::new(
            self.ctx.clone(),
            worker_config,
            self.config.resources.ignore_zero_memory_read,
            self.config.dynamic.limit_per_queue,
            process_manager,
            self.strategy(),
            resources,
            shutdown,
        )
        .with_memory_tracker(self.memory_tracker()))
    }

    fn memory_tracker(&self) -> ProcessMemoryTracker {
        ProcessMemoryTracker::new(self.process_memory.clone())
    }

    pub fn task_manager(&self) -> Result<TaskManager, BuildError> {
        let client = self
            .queue_client
            .clone()
            .ok_or(BuildError::MissingQueueClient)?;
        Ok(TaskManager::new(
            client,
            self.config.queues.clone(),
            self.registry.clone(),
            TaskMemoryUsageChecker::new(&self.config.task, self.own_memory.clone()),
            QueueErrorLogger::new(self.config.task.error_log_enabled),
        ))
    }

    /// One uncached scan of every configured queue.
    pub async fn scan(&self) -> Vec<QueueMetrics> {
        self.scanner()
            .scan_queues(&self.config.scanner.store_names, Duration::ZERO)
            .await
    }
}
