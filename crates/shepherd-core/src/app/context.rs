//! WorkerContext - プロセス単位の共有状態
//!
//! static なキャッシュ（ストア名、ログ間引き用タイマー）を持たず、
//! ここに明示的に置いてコンストラクタで渡す。テストごとに独立した context を作れる。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::app::logger::LogThrottle;
use crate::domain::Result;
use crate::ports::{Clock, StoreProvider, SystemClock};

pub struct WorkerContext {
    clock: Arc<dyn Clock>,
    throttle: Mutex<LogThrottle>,
    store_names: OnceCell<Vec<String>>,
}

impl WorkerContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            throttle: Mutex::new(LogThrottle::default()),
            store_names: OnceCell::new(),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// `true` if the timer named `key` has not fired within `interval`; arms it when it returns `true`.
    pub fn should_log(&self, key: &str, interval: Duration) -> bool {
        let now = self.clock.now();
        self.throttle.lock().should_log(key, now, interval)
    }

    /// Store names, fetched from `provider` on first use and kept for the process lifetime.
    /// A failed fetch is not cached.
    pub async fn store_names(&self, provider: &dyn StoreProvider) -> Result<Vec<String>> {
        self.store_names
            .get_or_try_init(|| provider.store_names())
            .await
            .cloned()
    }
}
