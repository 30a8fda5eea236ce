use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::events::DownloadEvent;
use crate::job::{DownloadJob, JobId};
use crate::manager::DownloadManager;
use crate::pool::WorkerPool;
use crate::request::DownloadRequest;
use crate::session::{RestoreContext, SessionStore};
use crate::status::DownloadStatus;
use crate::transport::{HttpTransport, Transport};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Owns every job of a front end together with the resources they share:
/// the worker pool, the transport and the event channel.
pub struct DownloadRegistry {
    config: Arc<DownloadConfig>,
    transport: Arc<dyn Transport>,
    pool: WorkerPool,
    jobs: DashMap<JobId, Arc<DownloadManager>>,
    order: Mutex<Vec<JobId>>,
    events: broadcast::Sender<DownloadEvent>,
    session: SessionStore,
}

impl DownloadRegistry {
    pub fn new(config: DownloadConfig) -> Result<Self, DownloadError> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(&config)?);
        Ok(Self::with_transport(config, transport))
    }

    pub fn with_transport(config: DownloadConfig, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let session = SessionStore::new(&config);
        let pool = WorkerPool::new(config.pool_size);
        info!(
            "[Registry] Ready with a pool of {} worker(s), {} thread(s) per job by default",
            pool.capacity(),
            config.default_threads
        );

        Self {
            config: Arc::new(config),
            transport,
            pool,
            jobs: DashMap::new(),
            order: Mutex::new(Vec::new()),
            events,
            session,
        }
    }

    /// Replaces the session backend selected by the configuration.
    pub fn with_session(mut self, session: SessionStore) -> Self {
        self.session = session;
        self
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Registers a PENDING job. Ids must be unique within the registry.
    pub async fn add(&self, request: DownloadRequest) -> Result<Arc<DownloadManager>, DownloadError> {
        let manager = DownloadManager::new(
            request,
            Arc::clone(&self.config),
            Arc::clone(&self.transport),
            self.pool.clone(),
            self.events.clone(),
        );
        let manager = self.insert(manager).await?;
        info!("[Registry] Added job {}: {}", manager.id(), manager.url());
        Ok(manager)
    }

    async fn insert(&self, manager: DownloadManager) -> Result<Arc<DownloadManager>, DownloadError> {
        let mut order = self.order.lock().await;
        let manager = match self.jobs.entry(manager.id().to_string()) {
            Entry::Occupied(entry) => return Err(DownloadError::DuplicateJob(entry.key().clone())),
            Entry::Vacant(entry) => Arc::clone(entry.insert(Arc::new(manager)).value()),
        };
        order.push(manager.id().to_string());
        Ok(manager)
    }

    pub fn get(&self, id: &str) -> Option<Arc<DownloadManager>> {
        self.jobs.get(id).map(|m| Arc::clone(m.value()))
    }

    fn require(&self, id: &str) -> Result<Arc<DownloadManager>, DownloadError> {
        self.get(id)
            .ok_or_else(|| DownloadError::JobNotFound(id.to_string()))
    }

    /// Every job, in the order it was added.
    pub async fn jobs(&self) -> Vec<Arc<DownloadManager>> {
        let order = self.order.lock().await;
        order.iter().filter_map(|id| self.get(id)).collect()
    }

    pub async fn snapshots(&self) -> Vec<DownloadJob> {
        let mut snapshots = Vec::new();
        for manager in self.jobs().await {
            snapshots.push(manager.job().await);
        }
        snapshots
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    //---------------------------------------------------------------------------------

    pub async fn start(&self, id: &str) -> Result<(), DownloadError> {
        self.require(id)?.start().await
    }

    pub async fn pause(&self, id: &str) -> Result<(), DownloadError> {
        self.require(id)?.pause().await
    }

    pub async fn resume(&self, id: &str) -> Result<(), DownloadError> {
        self.require(id)?.resume().await
    }

    pub async fn stop(&self, id: &str) -> Result<(), DownloadError> {
        self.require(id)?.stop().await
    }

    pub async fn retry(&self, id: &str) -> Result<(), DownloadError> {
        self.require(id)?.retry().await
    }

    /// Starts every PENDING job. Returns how many were started.
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for manager in self.jobs().await {
            if manager.status().await == DownloadStatus::Pending && manager.start().await.is_ok() {
                started += 1;
            }
        }
        started
    }

    /// Resolves once no job has a run in flight.
    pub async fn settled(&self) {
        for manager in self.jobs().await {
            manager.settled().await;
        }
    }

    //---------------------------------------------------------------------------------

    /// Drops a job from the registry, stopping it first if it is running.
    /// Bytes already written stay on disk.
    pub async fn remove(&self, id: &str) -> Result<DownloadJob, DownloadError> {
        let manager = self.require(id)?;
        halt(&manager).await;

        let mut order = self.order.lock().await;
        order.retain(|other| other != id);
        self.jobs.remove(id);
        drop(order);

        info!("[Registry] Removed job {}", id);
        Ok(manager.job().await)
    }

    /// Removes COMPLETED, STOPPED and ERROR jobs. Returns how many went.
    pub async fn clear_finished(&self) -> usize {
        self.clear_where(|status| status.is_finished()).await
    }

    /// Removes ERROR jobs only.
    pub async fn clear_failed(&self) -> usize {
        self.clear_where(|status| status == DownloadStatus::Error)
            .await
    }

    /// Stops whatever is running and empties the registry.
    pub async fn clear_all(&self) -> usize {
        for manager in self.jobs().await {
            halt(&manager).await;
        }
        self.clear_where(|_| true).await
    }

    async fn clear_where(&self, matches: impl Fn(DownloadStatus) -> bool) -> usize {
        let mut doomed = Vec::new();
        for manager in self.jobs().await {
            if matches(manager.status().await) {
                doomed.push(manager.id().to_string());
            }
        }

        let mut order = self.order.lock().await;
        order.retain(|id| !doomed.contains(id));
        for id in &doomed {
            self.jobs.remove(id);
        }
        debug!("[Registry] Cleared {} job(s)", doomed.len());
        doomed.len()
    }

    //---------------------------------------------------------------------------------

    /// Writes the durable part of every job, in registry order.
    pub async fn save_session(&self) -> Result<usize, DownloadError> {
        let snapshots = self.snapshots().await;
        self.session.save(&snapshots).await
    }

    /// Restores the saved jobs without starting any of them. Jobs whose id is
    /// already registered are skipped. Returns how many were restored.
    pub async fn load_session(&self) -> Result<usize, DownloadError> {
        let records = self.session.load().await?;
        let ctx = RestoreContext {
            config: Arc::clone(&self.config),
            transport: Arc::clone(&self.transport),
            pool: self.pool.clone(),
            events: self.events.clone(),
        };

        let mut restored = 0;
        for record in records {
            if self.jobs.contains_key(&record.id) {
                warn!("[Registry] Skipping saved job {}: already registered", record.id);
                continue;
            }
            let manager = self.session.restore(record, &ctx).await?;
            self.insert(manager).await?;
            restored += 1;
        }
        info!("[Registry] Restored {} job(s) from the session", restored);
        Ok(restored)
    }
}

/// Stops a running or paused job and waits for its run to retire.
async fn halt(manager: &DownloadManager) {
    if manager.status().await.is_active() {
        if let Err(err) = manager.stop().await {
            debug!("[Registry] Job {}: {}", manager.id(), err);
        }
    }
    manager.settled().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DownloadConfigBuilder, RetryConfig};
    use crate::repository::MemoryRepository;
    use crate::session::PersistenceType;
    use crate::transport::mock::{payload, MockTransport};
    use std::time::Duration;

    fn registry(transport: Arc<MockTransport>) -> DownloadRegistry {
        let config = DownloadConfigBuilder::new()
            .persistence_type(PersistenceType::Memory)
            .retry(RetryConfig {
                max_retries: 1,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                backoff_factor: 2.0,
            })
            .build()
            .unwrap();
        DownloadRegistry::with_transport(config, transport)
    }

    fn request(dir: &tempfile::TempDir, id: &str) -> DownloadRequest {
        DownloadRequest::builder(format!("http://mock/{id}"), dir.path().join(id))
            .id(id)
            .num_threads(2)
            .build()
    }

    #[tokio::test]
    async fn lists_jobs_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(MockTransport::new(payload(10)).shared());
        for id in ["c", "a", "b"] {
            registry.add(request(&dir, id)).await.unwrap();
        }

        let ids: Vec<String> = registry
            .jobs()
            .await
            .iter()
            .map(|m| m.id().to_string())
            .collect();
        assert_eq!(ids, ["c", "a", "b"]);

        let duplicate = registry.add(request(&dir, "a")).await.unwrap_err();
        assert_eq!(duplicate, DownloadError::DuplicateJob("a".into()));
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let registry = registry(MockTransport::new(payload(10)).shared());
        assert_eq!(
            registry.pause("ghost").await.unwrap_err(),
            DownloadError::JobNotFound("ghost".into())
        );
        assert!(registry.remove("ghost").await.is_err());
    }

    #[tokio::test]
    async fn clears_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new(payload(2048)).shared();
        let registry = registry(transport);

        registry.add(request(&dir, "done")).await.unwrap();
        let bad = DownloadRequest::builder("http://mock/bad", dir.path().join("bad"))
            .id("bad")
            .checksum("0000")
            .build();
        registry.add(bad).await.unwrap();
        registry.add(request(&dir, "waiting")).await.unwrap();

        registry.start("done").await.unwrap();
        registry.start("bad").await.unwrap();
        registry.settled().await;

        assert_eq!(registry.get("done").unwrap().status().await, DownloadStatus::Completed);
        assert_eq!(registry.get("bad").unwrap().status().await, DownloadStatus::Error);

        assert_eq!(registry.clear_failed().await, 1);
        assert!(registry.get("bad").is_none());
        assert_eq!(registry.clear_finished().await, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("waiting").is_some());
    }

    #[tokio::test]
    async fn remove_stops_a_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new(payload(256 * 1024))
            .piece_size(1024)
            .delay(Duration::from_millis(5))
            .shared();
        let registry = registry(transport);
        registry.add(request(&dir, "slow")).await.unwrap();
        registry.start("slow").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let removed = registry.remove("slow").await.unwrap();
        assert_eq!(removed.status, DownloadStatus::Stopped);
        assert!(removed.downloaded_size < 256 * 1024);
        assert!(registry.is_empty());
        assert_eq!(registry.pool().available(), registry.pool().capacity());
    }

    #[tokio::test]
    async fn session_round_trip_restores_without_starting() {
        let dir = tempfile::tempdir().unwrap();
        let repository = Arc::new(MemoryRepository::new());
        let transport = MockTransport::new(payload(4096)).shared();

        let first = registry(Arc::clone(&transport))
            .with_session(SessionStore::with_repository(repository.clone(), true));
        first.add(request(&dir, "one")).await.unwrap();
        first.add(request(&dir, "two")).await.unwrap();
        first.start("one").await.unwrap();
        first.settled().await;
        assert_eq!(first.save_session().await.unwrap(), 2);

        let second = registry(transport)
            .with_session(SessionStore::with_repository(repository, true));
        assert_eq!(second.load_session().await.unwrap(), 2);
        assert_eq!(second.load_session().await.unwrap(), 0);

        let jobs = second.snapshots().await;
        assert_eq!(jobs[0].id, "one");
        assert_eq!(jobs[0].status, DownloadStatus::Completed);
        assert_eq!(jobs[0].downloaded_size, 4096);
        assert_eq!(jobs[1].status, DownloadStatus::Pending);

        second.start("two").await.unwrap();
        second.settled().await;
        assert_eq!(second.get("two").unwrap().status().await, DownloadStatus::Completed);
    }

    #[tokio::test]
    async fn clear_all_halts_everything() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new(payload(128 * 1024))
            .piece_size(512)
            .delay(Duration::from_millis(5))
            .shared();
        let registry = registry(transport);
        registry.add(request(&dir, "x")).await.unwrap();
        registry.add(request(&dir, "y")).await.unwrap();
        assert_eq!(registry.start_all().await, 2);

        assert_eq!(registry.clear_all().await, 2);
        assert!(registry.is_empty());
        assert_eq!(registry.pool().available(), registry.pool().capacity());
    }
}
