use crate::checksum::{ChecksumAlgorithm, ChecksumVerifier};
use crate::config::DownloadConfig;
use crate::control::{Halt, RunControl};
use crate::error::DownloadError;
use crate::events::DownloadEvent;
use crate::job::{ChunkTable, DownloadJob, JobId};
use crate::pool::WorkerPool;
use crate::progress::ProgressAggregator;
use crate::request::{DownloadRequest, UNKNOWN_CONTENT_TYPE};
use crate::status::DownloadStatus;
use crate::transport::{ProbeResult, Transport};
use crate::worker::ChunkWorker;
use log::{debug, error, info, warn};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// State a job is rebuilt into from a session record.
#[derive(Debug)]
pub(crate) struct RestoredState {
    pub status: DownloadStatus,
    pub table: ChunkTable,
    pub total_size: u64,
    pub file_missing: bool,
}

struct JobState {
    status: DownloadStatus,
    total_size: u64,
    table: Arc<ChunkTable>,
    traceback_info: Option<String>,
    content_type: String,
    content_type_locked: bool,
    file_missing: bool,
    run: Option<RunControl>,
}

struct Inner {
    id: JobId,
    url: Arc<str>,
    save_path: Arc<PathBuf>,
    checksum: Option<String>,
    checksum_algorithm: ChecksumAlgorithm,
    num_threads: usize,
    max_retries: u32,
    config: Arc<DownloadConfig>,
    transport: Arc<dyn Transport>,
    pool: WorkerPool,
    events: broadcast::Sender<DownloadEvent>,
    progress: Arc<ProgressAggregator>,
    state: Mutex<JobState>,
    idle: watch::Sender<bool>,
    lifetime: CancellationToken,
}

enum RunEnd {
    Finished,
    Halted(Halt),
    Failed(DownloadError),
}

/// Owns one job: its state machine, its chunk table and the workers of the
/// current run.
///
/// Every operation validates, signals and returns; `settled()` waits for the
/// run to retire. Dropping the manager cancels whatever is still running.
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn new(
        request: DownloadRequest,
        config: Arc<DownloadConfig>,
        transport: Arc<dyn Transport>,
        pool: WorkerPool,
        events: broadcast::Sender<DownloadEvent>,
    ) -> Self {
        let restored = RestoredState {
            status: DownloadStatus::Pending,
            table: ChunkTable::default(),
            total_size: 0,
            file_missing: false,
        };
        Self::restore(request, config, transport, pool, events, restored)
    }

    pub(crate) fn restore(
        request: DownloadRequest,
        config: Arc<DownloadConfig>,
        transport: Arc<dyn Transport>,
        pool: WorkerPool,
        events: broadcast::Sender<DownloadEvent>,
        restored: RestoredState,
    ) -> Self {
        let id = request
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let progress = Arc::new(ProgressAggregator::new(
            id.clone(),
            events.clone(),
            &config.progress_throttle,
        ));
        let (idle, _) = watch::channel(true);

        debug!(
            "[Job {}] Created for {} -> {:?} ({})",
            id, request.url, request.save_path, restored.status
        );

        let state = JobState {
            status: restored.status,
            total_size: restored
                .table
                .total_size()
                .unwrap_or(restored.total_size),
            table: Arc::new(restored.table),
            traceback_info: None,
            content_type_locked: restored.status != DownloadStatus::Pending,
            content_type: request.content_type.clone(),
            file_missing: restored.file_missing,
            run: None,
        };

        Self {
            inner: Arc::new(Inner {
                url: Arc::from(request.url.as_str()),
                save_path: Arc::new(request.save_path.clone()),
                checksum: request.normalized_checksum(),
                checksum_algorithm: request.effective_algorithm(&config),
                num_threads: request.effective_threads(&config),
                max_retries: request.effective_retries(&config),
                id,
                config,
                transport,
                pool,
                events,
                progress,
                state: Mutex::new(state),
                idle,
                lifetime: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn save_path(&self) -> &Path {
        self.inner.save_path.as_path()
    }

    pub async fn status(&self) -> DownloadStatus {
        self.inner.state.lock().await.status
    }

    pub async fn downloaded_size(&self) -> u64 {
        self.inner.state.lock().await.table.downloaded()
    }

    pub async fn total_size(&self) -> u64 {
        self.inner.state.lock().await.total_size
    }

    /// Smoothed transfer rate in bytes per second; 0 between runs.
    pub fn rate(&self) -> f64 {
        self.inner.progress.rate()
    }

    /// Snapshot of the whole job.
    pub async fn job(&self) -> DownloadJob {
        let state = self.inner.state.lock().await;
        DownloadJob {
            id: self.inner.id.clone(),
            url: self.inner.url.to_string(),
            save_path: self.inner.save_path.as_ref().clone(),
            content_type: state.content_type.clone(),
            checksum: self.inner.checksum.clone(),
            checksum_algorithm: self.inner.checksum_algorithm,
            num_threads: self.inner.num_threads,
            max_retries: self.inner.max_retries,
            status: state.status,
            total_size: state.total_size,
            downloaded_size: state.table.downloaded(),
            chunks: state.table.snapshots(),
            traceback_info: state.traceback_info.clone(),
            file_missing: state.file_missing,
        }
    }

    /// Resolves once no run is in flight.
    pub async fn settled(&self) {
        let mut idle = self.inner.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    //---------------------------------------------------------------------------------

    pub async fn start(&self) -> Result<(), DownloadError> {
        let mut state = self.inner.state.lock().await;
        if state.status != DownloadStatus::Pending || state.run.is_some() {
            return Err(invalid("start", &state));
        }
        info!("[Job {}] Starting download: {}", self.inner.id, self.inner.url);
        self.launch(&mut state);
        Ok(())
    }

    /// Asks every worker to stop after its current buffer. The job turns
    /// PAUSED once they have all exited.
    pub async fn pause(&self) -> Result<(), DownloadError> {
        let state = self.inner.state.lock().await;
        match (state.status, &state.run) {
            (DownloadStatus::Downloading, Some(run)) => {
                debug!("[Job {}] Pause requested", self.inner.id);
                run.signal(Halt::Pause);
                Ok(())
            }
            _ => Err(invalid("pause", &state)),
        }
    }

    pub async fn resume(&self) -> Result<(), DownloadError> {
        let mut state = self.inner.state.lock().await;
        if state.status != DownloadStatus::Paused || state.run.is_some() {
            return Err(invalid("resume", &state));
        }
        debug!(
            "[Job {}] Resuming at {} of {} bytes",
            self.inner.id,
            state.table.downloaded(),
            state.total_size
        );
        self.launch(&mut state);
        Ok(())
    }

    /// Immediate from PAUSED; from DOWNLOADING the job turns STOPPED once the
    /// workers have exited. Bytes already on disk are kept.
    pub async fn stop(&self) -> Result<(), DownloadError> {
        let mut state = self.inner.state.lock().await;
        match (state.status, state.run.clone()) {
            (DownloadStatus::Downloading, Some(run)) => {
                debug!("[Job {}] Stop requested", self.inner.id);
                run.signal(Halt::Stop);
                Ok(())
            }
            (DownloadStatus::Paused, None) => {
                debug!("[Job {}] Stopped while paused", self.inner.id);
                state.status = DownloadStatus::Stopped;
                self.inner
                    .progress
                    .transition(&state.table, DownloadStatus::Stopped);
                Ok(())
            }
            _ => Err(invalid("stop", &state)),
        }
    }

    /// Restarts a STOPPED or failed job from the bytes already written. Also
    /// accepted for a COMPLETED job whose file has gone missing.
    pub async fn retry(&self) -> Result<(), DownloadError> {
        let mut state = self.inner.state.lock().await;
        if state.run.is_some() {
            return Err(invalid("retry", &state));
        }

        match state.status {
            DownloadStatus::Stopped => {}
            DownloadStatus::Error => {
                state.table.reset_attempts();
                if state.table.is_complete() {
                    // Every chunk is full, so the bad bytes could be anywhere.
                    debug!(
                        "[Job {}] Verification failed earlier, fetching everything again",
                        self.inner.id
                    );
                    self.discard_progress(&mut state);
                }
            }
            DownloadStatus::Completed if state.file_missing => {
                debug!("[Job {}] File missing, downloading again", self.inner.id);
                self.discard_progress(&mut state);
                state.file_missing = false;
            }
            _ => return Err(invalid("retry", &state)),
        }

        info!("[Job {}] Retrying download: {}", self.inner.id, self.inner.url);
        self.launch(&mut state);
        Ok(())
    }

    /// Overrides the content type. Only allowed before the job first starts.
    pub async fn set_content_type(
        &self,
        content_type: impl Into<String>,
    ) -> Result<(), DownloadError> {
        let mut state = self.inner.state.lock().await;
        if state.status != DownloadStatus::Pending || state.content_type_locked {
            return Err(invalid("set the content type of", &state));
        }
        state.content_type = content_type.into();
        state.content_type_locked = true;
        Ok(())
    }

    //---------------------------------------------------------------------------------

    fn discard_progress(&self, state: &mut JobState) {
        state.table = Arc::new(ChunkTable::default());
        state.total_size = 0;
    }

    fn launch(&self, state: &mut JobState) {
        let run = RunControl::new(&self.inner.lifetime);
        state.run = Some(run.clone());
        state.status = DownloadStatus::Downloading;
        state.traceback_info = None;
        self.inner.idle.send_replace(false);
        self.inner
            .progress
            .transition(&state.table, DownloadStatus::Downloading);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.drive(run).await });
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.inner.lifetime.cancel();
    }
}

impl fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadManager")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url)
            .field("save_path", &self.inner.save_path)
            .field("num_threads", &self.inner.num_threads)
            .finish()
    }
}

fn invalid(action: &'static str, state: &JobState) -> DownloadError {
    DownloadError::InvalidTransition {
        action,
        status: state.status,
    }
}

impl Inner {
    async fn drive(self: Arc<Self>, run: RunControl) {
        let end = match self.execute(&run).await {
            Err(err) => RunEnd::Failed(err),
            Ok(()) => match run.halt() {
                Some(halt) => RunEnd::Halted(halt),
                None => match self.verify().await {
                    Ok(()) => RunEnd::Finished,
                    Err(err) => RunEnd::Failed(err),
                },
            },
        };
        self.settle(end).await;
    }

    async fn execute(&self, run: &RunControl) -> Result<(), DownloadError> {
        let Some(table) = self.prepare(run).await? else {
            return Ok(());
        };
        if run.is_halted() {
            return Ok(());
        }

        let mut workers = JoinSet::new();
        for chunk in table.incomplete() {
            let worker = ChunkWorker {
                job_id: self.id.clone(),
                index: chunk.index,
                url: Arc::clone(&self.url),
                file_path: Arc::clone(&self.save_path),
                table: Arc::clone(&table),
                transport: Arc::clone(&self.transport),
                pool: self.pool.clone(),
                control: run.clone(),
                retry: self.config.retry.clone(),
                max_retries: self.max_retries,
                buffer_size: self.config.buffer_size,
                progress: Arc::clone(&self.progress),
            };
            workers.spawn(worker.run());
        }
        debug!(
            "[Job {}] Submitted {} of {} chunks to the pool",
            self.id,
            workers.len(),
            table.len()
        );

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.map_err(DownloadError::from).and_then(|r| r);
            let Err(err) = result else { continue };
            if first_error.is_none() {
                error!("[Job {}] Worker failed, aborting run: {}", self.id, err);
                run.signal(Halt::Abort);
                first_error = Some(err);
            } else {
                debug!("[Job {}] Suppressed follow-up failure: {}", self.id, err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Probes and plans when there is no chunk table yet, then lays out the
    /// target file. `None` when the run was halted during the probe.
    async fn prepare(&self, run: &RunControl) -> Result<Option<Arc<ChunkTable>>, DownloadError> {
        let current = Arc::clone(&self.state.lock().await.table);

        let table = if current.is_empty() {
            let Some(probe) = self.probe_with_retry(run).await? else {
                return Ok(None);
            };
            let parts = if probe.accepts_ranges { self.num_threads } else { 1 };
            let table = Arc::new(ChunkTable::plan(probe.total_size, parts));
            debug!(
                "[Job {}] Probe: size={:?} ranges={} -> {} chunk(s)",
                self.id,
                probe.total_size,
                probe.accepts_ranges,
                table.len()
            );

            let mut state = self.state.lock().await;
            state.total_size = probe.total_size.unwrap_or(0);
            state.table = Arc::clone(&table);
            if !state.content_type_locked && state.content_type == UNKNOWN_CONTENT_TYPE {
                if let Some(content_type) = probe.content_type {
                    state.content_type = content_type;
                }
            }
            state.content_type_locked = true;
            self.progress.transition(&table, DownloadStatus::Downloading);
            table
        } else {
            current
        };

        self.layout_file(&table).await?;
        Ok(Some(table))
    }

    async fn probe_with_retry(&self, run: &RunControl) -> Result<Option<ProbeResult>, DownloadError> {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                _ = run.cancelled() => return Ok(None),
                result = self.transport.probe(&self.url) => result,
            };

            match result {
                Ok(probe) => return Ok(Some(probe)),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.config.retry.delay_for(attempt);
                    warn!(
                        "[Job {}] Probe failed: {} (retry {}/{} in {:?})",
                        self.id, err, attempt, self.max_retries, delay
                    );
                    tokio::select! {
                        _ = run.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Creates the target without truncating it and sizes it up front, so
    /// offset writes never have to extend the file.
    async fn layout_file(&self, table: &ChunkTable) -> Result<(), DownloadError> {
        if let Some(parent) = self.save_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.save_path.as_path())
            .await?;

        match table.total_size() {
            Some(total) => file.set_len(total).await?,
            None if table.downloaded() == 0 => file.set_len(0).await?,
            None => {}
        }
        Ok(())
    }

    async fn verify(&self) -> Result<(), DownloadError> {
        let (table, total_size) = {
            let state = self.state.lock().await;
            (Arc::clone(&state.table), state.total_size)
        };

        let expected = table.total_size().unwrap_or(total_size);
        let downloaded = table.downloaded();
        if !table.is_complete() || downloaded != expected {
            return Err(DownloadError::SizeMismatch {
                expected,
                actual: downloaded,
            });
        }

        let Some(checksum) = self.checksum.clone() else {
            debug!("[Job {}] No checksum configured, skipping verification", self.id);
            return Ok(());
        };

        debug!("[Job {}] Verifying {} checksum", self.id, self.checksum_algorithm);
        let verifier = ChecksumVerifier::new(self.checksum_algorithm);
        let path = Arc::clone(&self.save_path);
        let verdict =
            tokio::task::spawn_blocking(move || verifier.verify(&path, expected, &checksum))
                .await??;
        verdict.into_result(self.checksum_algorithm)
    }

    async fn settle(&self, end: RunEnd) {
        let mut state = self.state.lock().await;
        state.run = None;
        if let Some(total) = state.table.total_size() {
            state.total_size = total;
        }
        let table = Arc::clone(&state.table);
        let downloaded = table.downloaded();

        match end {
            RunEnd::Finished => {
                info!("[Job {}] Download completed: {:?}", self.id, self.save_path);
                state.status = DownloadStatus::Completed;
                self.progress.transition(&table, DownloadStatus::Completed);
                let _ = self.events.send(DownloadEvent::Completed {
                    job_id: self.id.clone(),
                    filename: file_name(&self.save_path),
                });
            }
            RunEnd::Halted(Halt::Pause) => {
                debug!("[Job {}] Paused at {} bytes", self.id, downloaded);
                state.status = DownloadStatus::Paused;
                self.progress.transition(&table, DownloadStatus::Paused);
            }
            RunEnd::Halted(halt) => {
                debug!("[Job {}] Stopped ({:?}) at {} bytes", self.id, halt, downloaded);
                state.status = DownloadStatus::Stopped;
                self.progress.transition(&table, DownloadStatus::Stopped);
            }
            RunEnd::Failed(err) => {
                error!("[Job {}] Download failed: {}", self.id, err);
                state.status = DownloadStatus::Error;
                state.traceback_info = Some(format!(
                    "{}\njob: {}\nurl: {}\nprogress: {}/{} bytes",
                    err, self.id, self.url, downloaded, state.total_size
                ));
                self.progress.transition(&table, DownloadStatus::Error);
                let _ = self.events.send(DownloadEvent::Error {
                    job_id: self.id.clone(),
                    message: err.to_string(),
                });
            }
        }

        self.progress.reset(downloaded);
        drop(state);
        self.idle.send_replace(true);
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
