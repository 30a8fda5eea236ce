use crate::error::DownloadError;
use crate::repository::models::SessionRecord;
use async_trait::async_trait;

/// Storage backend for the session. `save` replaces the whole session.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn load(&self) -> Result<Vec<SessionRecord>, DownloadError>;
    async fn save(&self, records: &[SessionRecord]) -> Result<(), DownloadError>;
}
