use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::domain::Result;
use crate::ports::StoreProvider;

/// Fixed store list, typically `[scanner].store_names` from the config.
#[derive(Debug, Default)]
pub struct StaticStoreProvider {
    store_names: Vec<String>,
    calls: AtomicUsize,
}

impl StaticStoreProvider {
    pub fn new(store_names: Vec<String>) -> Self {
        Self {
            store_names,
            calls: AtomicUsize::new(0),
        }
    }

    /// How often the list was asked for.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreProvider for StaticStoreProvider {
    async fn store_names(&self) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.store_names.clone())
    }
}
