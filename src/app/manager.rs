use async_trait::async_trait;

use super::config::App;
use crate::error::Result;

/// Lookup surface for registered applications. The in-memory
/// implementation is the only one shipped; the trait keeps the door open
/// for database-backed registries without touching the callers.
#[async_trait]
pub trait AppManager: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn get_apps(&self) -> Result<Vec<App>>;

    async fn find_by_key(&self, key: &str) -> Result<Option<App>>;

    async fn find_by_id(&self, id: &str) -> Result<Option<App>>;

    async fn count(&self) -> Result<usize>;
}
