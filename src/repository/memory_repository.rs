use super::repository::SessionRepository;
use crate::repository::models::SessionRecord;
use crate::DownloadError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default, Clone)]
pub struct MemoryRepository {
    records: Arc<RwLock<Vec<SessionRecord>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for MemoryRepository {
    async fn load(&self) -> Result<Vec<SessionRecord>, DownloadError> {
        Ok(self.records.read().await.clone())
    }

    async fn save(&self, records: &[SessionRecord]) -> Result<(), DownloadError> {
        *self.records.write().await = records.to_vec();
        Ok(())
    }
}
