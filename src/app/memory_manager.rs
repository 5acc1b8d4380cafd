use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

use super::config::App;
use super::manager::AppManager;
use crate::error::Result;

/// In-memory app registry, populated once from the config file.
pub struct MemoryAppManager {
    by_key: DashMap<String, App, ahash::RandomState>,
}

impl MemoryAppManager {
    pub fn new(apps: Vec<App>) -> Self {
        let by_key = DashMap::with_hasher(ahash::RandomState::new());
        for app in apps {
            if app.key.is_empty() || app.secret.is_empty() {
                warn!(app_id = %app.id, "skipping app with empty key or secret");
                continue;
            }
            if by_key.insert(app.key.clone(), app).is_some() {
                warn!("duplicate app key in configuration, keeping the last entry");
            }
        }
        Self { by_key }
    }
}

#[async_trait]
impl AppManager for MemoryAppManager {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn get_apps(&self) -> Result<Vec<App>> {
        Ok(self.by_key.iter().map(|e| e.value().clone()).collect())
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<App>> {
        Ok(self.by_key.get(key).map(|e| e.value().clone()))
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<App>> {
        Ok(self
            .by_key
            .iter()
            .find(|e| e.value().id == id)
            .map(|e| e.value().clone()))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.by_key.len())
    }
}
