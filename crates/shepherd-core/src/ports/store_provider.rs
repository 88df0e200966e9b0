use async_trait::async_trait;

use crate::domain::Result;

#[async_trait]
pub trait StoreProvider: Send + Sync {
    async fn store_names(&self) -> Result<Vec<String>>;
}
