use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::events::DownloadEvent;
use crate::job::{ChunkTable, DownloadJob};
use crate::manager::{DownloadManager, RestoredState};
use crate::pool::WorkerPool;
use crate::repository::{JsonFileRepository, MemoryRepository, SessionRecord, SessionRepository};
use crate::request::DownloadRequest;
use crate::status::DownloadStatus;
use crate::transport::Transport;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PersistenceType {
    Memory,
    JsonFile(PathBuf),
}

/// Everything a restored job needs besides its record.
pub struct RestoreContext {
    pub config: Arc<DownloadConfig>,
    pub transport: Arc<dyn Transport>,
    pub pool: WorkerPool,
    pub events: broadcast::Sender<DownloadEvent>,
}

/// Saves and restores the durable part of every job.
pub struct SessionStore {
    repository: Arc<dyn SessionRepository>,
    persist_paused: bool,
}

impl SessionStore {
    pub fn new(config: &DownloadConfig) -> Self {
        let repository: Arc<dyn SessionRepository> = match &config.persistence_type {
            PersistenceType::Memory => Arc::new(MemoryRepository::new()),
            PersistenceType::JsonFile(path) => Arc::new(JsonFileRepository::new(path)),
        };
        Self::with_repository(repository, config.persist_paused)
    }

    pub fn with_repository(repository: Arc<dyn SessionRepository>, persist_paused: bool) -> Self {
        Self {
            repository,
            persist_paused,
        }
    }

    /// The record written for `job`, or `None` when the job is not persisted.
    ///
    /// DOWNLOADING jobs are never written. PAUSED jobs carry their chunk
    /// table when `persist_paused` is set and are skipped otherwise. STOPPED
    /// and ERROR jobs keep their table so a later `retry()` resumes from the
    /// bytes on disk.
    pub fn record_for(&self, job: &DownloadJob) -> Option<SessionRecord> {
        let with_chunks = match job.status {
            DownloadStatus::Downloading => return None,
            DownloadStatus::Paused if !self.persist_paused => return None,
            DownloadStatus::Paused | DownloadStatus::Stopped | DownloadStatus::Error => true,
            DownloadStatus::Pending | DownloadStatus::Completed => false,
        };

        Some(SessionRecord {
            id: job.id.clone(),
            url: job.url.clone(),
            save_path: job.save_path.clone(),
            checksum: job.checksum.clone(),
            num_threads: job.num_threads,
            content_type: job.content_type.clone(),
            status: job.status,
            checksum_algorithm: Some(job.checksum_algorithm),
            max_retries: Some(job.max_retries),
            total_size: (with_chunks && job.total_size > 0).then_some(job.total_size),
            chunks: if with_chunks {
                job.chunks.clone()
            } else {
                Vec::new()
            },
        })
    }

    /// Writes the given jobs in order. Returns how many were persisted.
    pub async fn save(&self, jobs: &[DownloadJob]) -> Result<usize, DownloadError> {
        let records: Vec<SessionRecord> = jobs.iter().filter_map(|j| self.record_for(j)).collect();
        self.repository.save(&records).await?;
        info!(
            "[Session] Saved {} of {} job(s)",
            records.len(),
            jobs.len()
        );
        Ok(records.len())
    }

    pub async fn load(&self) -> Result<Vec<SessionRecord>, DownloadError> {
        let records = self.repository.load().await?;
        debug!("[Session] Loaded {} record(s)", records.len());
        Ok(records)
    }

    /// Rebuilds a job from its record without starting it.
    pub async fn restore(
        &self,
        record: SessionRecord,
        ctx: &RestoreContext,
    ) -> Result<DownloadManager, DownloadError> {
        let mut builder = DownloadRequest::builder(record.url.clone(), record.save_path.clone())
            .id(record.id.clone())
            .content_type(record.content_type.clone())
            .num_threads(record.num_threads);
        if let Some(checksum) = record.checksum.clone() {
            builder = builder.checksum(checksum);
        }
        if let Some(algorithm) = record.checksum_algorithm {
            builder = builder.checksum_algorithm(algorithm);
        }
        if let Some(retries) = record.max_retries {
            builder = builder.max_retries(retries);
        }
        let request = builder.build();

        let restored = restored_state(&record).await.map_err(|reason| {
            DownloadError::Session(format!("job {}: {}", record.id, reason))
        })?;
        if restored.file_missing {
            warn!(
                "[Session] Job {}: completed file {:?} is missing",
                record.id, record.save_path
            );
        }

        Ok(DownloadManager::restore(
            request,
            Arc::clone(&ctx.config),
            Arc::clone(&ctx.transport),
            ctx.pool.clone(),
            ctx.events.clone(),
            restored,
        ))
    }
}

async fn restored_state(record: &SessionRecord) -> Result<RestoredState, String> {
    let resumable = |status| -> Result<RestoredState, String> {
        let table = ChunkTable::from_snapshots(&record.chunks)?;
        Ok(RestoredState {
            status,
            total_size: record.total_size.or(table.total_size()).unwrap_or(0),
            table,
            file_missing: false,
        })
    };
    let plain = |status| RestoredState {
        status,
        table: ChunkTable::default(),
        total_size: 0,
        file_missing: false,
    };

    match record.status {
        DownloadStatus::Completed => match tokio::fs::metadata(&record.save_path).await {
            Ok(meta) if meta.is_file() => Ok(RestoredState {
                status: DownloadStatus::Completed,
                table: ChunkTable::completed(meta.len()),
                total_size: meta.len(),
                file_missing: false,
            }),
            _ => Ok(RestoredState {
                file_missing: true,
                ..plain(DownloadStatus::Completed)
            }),
        },
        DownloadStatus::Paused | DownloadStatus::Downloading if !record.chunks.is_empty() => {
            resumable(DownloadStatus::Paused)
        }
        DownloadStatus::Stopped | DownloadStatus::Error if !record.chunks.is_empty() => {
            resumable(record.status)
        }
        // Nothing to resume from without chunks.
        DownloadStatus::Downloading | DownloadStatus::Paused => Ok(plain(DownloadStatus::Stopped)),
        other => Ok(plain(other)),
    }
}
