use crate::config::ProgressThrottleConfig;
use crate::events::{DownloadEvent, ProgressEvent};
use crate::job::{ChunkTable, JobId};
use crate::status::DownloadStatus;
use bytesize::ByteSize;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Samples closer together than this keep the previous rate.
const MIN_SAMPLE_GAP: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct RateWindow {
    last_emit: Option<Instant>,
    last_sample: Option<(Instant, u64)>,
    started_at: Option<Instant>,
    rate: f64,
}

impl RateWindow {
    fn sample(&mut self, now: Instant, downloaded: u64, smoothing: f64) {
        self.started_at.get_or_insert(now);

        let Some((at, bytes)) = self.last_sample else {
            self.last_sample = Some((now, downloaded));
            return;
        };

        if downloaded < bytes {
            // Counter restarted (single-stream fallback to offset 0).
            self.last_sample = Some((now, downloaded));
            self.rate = 0.0;
            return;
        }

        let elapsed = now.saturating_duration_since(at);
        if elapsed < MIN_SAMPLE_GAP {
            return;
        }

        let instant = (downloaded - bytes) as f64 / elapsed.as_secs_f64();
        self.rate = smoothing * instant + (1.0 - smoothing) * self.rate;
        self.last_sample = Some((now, downloaded));
    }
}

/// Folds the chunk counters of one job into throttled progress events.
#[derive(Debug)]
pub struct ProgressAggregator {
    job_id: JobId,
    events: broadcast::Sender<DownloadEvent>,
    interval: Duration,
    smoothing: f64,
    window: Mutex<RateWindow>,
    retries: AtomicU64,
}

impl ProgressAggregator {
    pub fn new(
        job_id: JobId,
        events: broadcast::Sender<DownloadEvent>,
        throttle: &ProgressThrottleConfig,
    ) -> Self {
        Self {
            job_id,
            events,
            interval: throttle.interval(),
            smoothing: throttle.smoothing,
            window: Mutex::new(RateWindow::default()),
            retries: AtomicU64::new(0),
        }
    }

    fn window(&self) -> MutexGuard<'_, RateWindow> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Throttled: emits at most once per interval. Returns whether it emitted.
    ///
    /// Counters are read and the event is sent under the window lock, so
    /// concurrent workers never publish a total lower than one already sent.
    pub fn advance(&self, table: &ChunkTable) -> bool {
        let now = Instant::now();
        let mut window = self.window();
        let downloaded = table.downloaded();
        window.sample(now, downloaded, self.smoothing);
        if let Some(last) = window.last_emit {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        window.last_emit = Some(now);
        self.emit(table, downloaded, window.rate, DownloadStatus::Downloading);
        true
    }

    /// Forced: emits regardless of the throttle.
    pub fn transition(&self, table: &ChunkTable, status: DownloadStatus) {
        let now = Instant::now();
        let mut window = self.window();
        let downloaded = table.downloaded();
        window.sample(now, downloaded, self.smoothing);
        window.last_emit = Some(now);
        let rate = if status == DownloadStatus::Downloading {
            window.rate
        } else {
            0.0
        };
        self.emit(table, downloaded, rate, status);
    }

    /// Smoothed bytes per second.
    pub fn rate(&self) -> f64 {
        self.window().rate
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Logs a run summary and clears the rate window.
    pub fn reset(&self, downloaded: u64) {
        let mut window = self.window();
        let elapsed = window
            .started_at
            .map(|t| t.elapsed())
            .unwrap_or_default();
        debug!(
            "[Job {}] Run summary: downloaded={} elapsed={} retries={}",
            self.job_id,
            ByteSize::b(downloaded),
            humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64)),
            self.retries.swap(0, Ordering::Relaxed)
        );
        *window = RateWindow::default();
    }

    fn emit(&self, table: &ChunkTable, downloaded: u64, rate: f64, status: DownloadStatus) {
        // No subscribers is not an error.
        let _ = self.events.send(DownloadEvent::Progress(ProgressEvent {
            job_id: self.job_id.clone(),
            downloaded,
            total: table.total_size().unwrap_or(0),
            rate,
            status,
        }));
    }
}
