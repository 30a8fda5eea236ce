use crate::config::RetryConfig;
use crate::control::RunControl;
use crate::error::DownloadError;
use crate::job::{Chunk, ChunkTable, JobId};
use crate::pool::WorkerPool;
use crate::progress::ProgressAggregator;
use crate::transport::{ByteRange, Transport};
use futures_util::StreamExt;
use log::{debug, warn};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::OwnedSemaphorePermit;

/// How a worker left its chunk when it returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    Halted,
}

/// Downloads one chunk of a job into the target file at its own offset.
pub struct ChunkWorker {
    pub job_id: JobId,
    pub index: usize,
    pub url: Arc<str>,
    pub file_path: Arc<PathBuf>,
    pub table: Arc<ChunkTable>,
    pub transport: Arc<dyn Transport>,
    pub pool: WorkerPool,
    pub control: RunControl,
    pub retry: RetryConfig,
    pub max_retries: u32,
    pub buffer_size: usize,
    pub progress: Arc<ProgressAggregator>,
}

impl ChunkWorker {
    fn chunk(&self) -> Result<&Chunk, DownloadError> {
        self.table
            .get(self.index)
            .ok_or(DownloadError::ChunkMissing(self.index))
    }

    /// Waits for a pool permit. `None` when the run is halted first.
    async fn slot(&self) -> Result<Option<OwnedSemaphorePermit>, DownloadError> {
        tokio::select! {
            biased;
            _ = self.control.cancelled() => Ok(None),
            permit = self.pool.acquire() => permit.map(Some),
        }
    }

    pub async fn run(self) -> Result<WorkerOutcome, DownloadError> {
        let chunk = self.chunk()?;
        if chunk.is_complete() {
            return Ok(WorkerOutcome::Completed);
        }

        let Some(permit) = self.slot().await? else {
            debug!("[Job {} Chunk {}] Halted while waiting for a worker slot", self.job_id, self.index);
            return Ok(WorkerOutcome::Halted);
        };

        debug!(
            "[Job {} Chunk {}] Starting at offset {} (end {:?}, attempt {})",
            self.job_id,
            self.index,
            chunk.resume_offset(),
            chunk.end_offset(),
            chunk.attempt_count()
        );

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.file_path.as_path())
            .await?;

        let result = self.run_with_retries(chunk, &mut file, permit).await;
        let flushed = file.flush().await;

        match (result, flushed) {
            (Ok(outcome), Ok(())) => {
                debug!("[Job {} Chunk {}] Exiting: {:?}", self.job_id, self.index, outcome);
                Ok(outcome)
            }
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), _) => Err(e),
        }
    }

    async fn run_with_retries(
        &self,
        chunk: &Chunk,
        file: &mut File,
        mut permit: OwnedSemaphorePermit,
    ) -> Result<WorkerOutcome, DownloadError> {
        loop {
            if self.control.is_halted() {
                return Ok(WorkerOutcome::Halted);
            }

            let err = match self.transfer(chunk, file).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_transient() => err,
                Err(err) => {
                    debug!("[Job {} Chunk {}] Fatal: {}", self.job_id, self.index, err);
                    return Err(err);
                }
            };

            let spent = chunk.attempt_count();
            if spent >= self.max_retries {
                return Err(DownloadError::RetriesExhausted {
                    chunk: self.index,
                    attempts: spent,
                    last: err.to_string(),
                });
            }

            let attempt = chunk.next_attempt();
            self.progress.record_retry();
            let delay = self.retry.delay_for(attempt);
            warn!(
                "[Job {} Chunk {}] {} (retry {}/{} in {:?})",
                self.job_id, self.index, err, attempt, self.max_retries, delay
            );

            // The slot goes back to the pool while this chunk backs off.
            drop(permit);
            tokio::select! {
                _ = self.control.cancelled() => return Ok(WorkerOutcome::Halted),
                _ = tokio::time::sleep(delay) => {}
            }
            permit = match self.slot().await? {
                Some(permit) => permit,
                None => return Ok(WorkerOutcome::Halted),
            };
        }
    }

    /// One request: from the chunk's resume offset until it is full, the body
    /// ends or the run is halted.
    async fn transfer(
        &self,
        chunk: &Chunk,
        file: &mut File,
    ) -> Result<WorkerOutcome, DownloadError> {
        let single = self.table.is_single_stream();
        let offset = chunk.resume_offset();
        let range = (!single || offset > 0).then(|| ByteRange {
            start: offset,
            end: chunk.end_offset(),
        });

        let response = tokio::select! {
            _ = self.control.cancelled() => return Ok(WorkerOutcome::Halted),
            response = self.transport.fetch(&self.url, range) => response?,
        };

        if range.is_some() && !response.is_partial() {
            if !single {
                return Err(DownloadError::RangeUnsupported(format!(
                    "status {} for bytes from offset {}",
                    response.status, offset
                )));
            }
            warn!(
                "[Job {} Chunk {}] Server ignored range at offset {}, restarting from 0",
                self.job_id, self.index, offset
            );
            chunk.reset_progress();
        }

        file.seek(SeekFrom::Start(chunk.resume_offset())).await?;

        let mut body = response.body;
        loop {
            let next = tokio::select! {
                _ = self.control.cancelled() => return Ok(WorkerOutcome::Halted),
                next = body.next() => next,
            };
            let Some(piece) = next else { break };
            let piece = piece?;

            for buffer in piece.chunks(self.buffer_size.max(1)) {
                let take = match chunk.remaining() {
                    Some(remaining) => remaining.min(buffer.len() as u64) as usize,
                    None => buffer.len(),
                };
                if take == 0 {
                    break;
                }

                file.write_all(&buffer[..take]).await?;
                chunk.record_written(take as u64);
                self.progress.advance(&self.table);

                if self.control.is_halted() {
                    return Ok(WorkerOutcome::Halted);
                }
            }

            if chunk.is_complete() {
                return Ok(WorkerOutcome::Completed);
            }
        }

        match chunk.end_offset() {
            None => {
                chunk.close_at_written();
                Ok(WorkerOutcome::Completed)
            }
            Some(_) if chunk.is_complete() => Ok(WorkerOutcome::Completed),
            Some(end) => Err(DownloadError::Network(format!(
                "body ended at offset {} before chunk end {}",
                chunk.resume_offset(),
                end
            ))),
        }
    }
}

impl fmt::Debug for ChunkWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkWorker")
            .field("job_id", &self.job_id)
            .field("index", &self.index)
            .field("url", &self.url)
            .field("file_path", &self.file_path)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}
