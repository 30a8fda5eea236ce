use crate::events::{DownloadEvent, ProgressEvent};
use crate::job::JobId;
use crate::status::DownloadStatus;
use bytesize::ByteSize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// One terminal bar per job.
struct JobBar {
    name: String,
    bar: ProgressBar,
    started: Instant,
}

impl JobBar {
    fn new(name: String, multi: &MultiProgress) -> Self {
        let bar = multi.add(ProgressBar::new(0));
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            name,
            bar,
            started: Instant::now(),
        }
    }

    fn update(&self, event: &ProgressEvent) {
        if event.total > 0 {
            self.bar.set_length(event.total);
        }
        self.bar.set_position(event.downloaded);

        let total = if event.total > 0 {
            ByteSize(event.total).to_string()
        } else {
            "?".to_string()
        };
        let rate = if event.status == DownloadStatus::Downloading {
            format!(" | {}/s", ByteSize(event.rate as u64))
        } else {
            String::new()
        };
        self.bar.set_message(format!(
            "{} | {} | {}/{}{}",
            self.name,
            event.status_label(),
            ByteSize(event.downloaded),
            total,
            rate
        ));

        if matches!(event.status, DownloadStatus::Stopped | DownloadStatus::Paused) {
            self.bar.disable_steady_tick();
        } else if event.status == DownloadStatus::Downloading {
            self.bar.enable_steady_tick(Duration::from_millis(100));
        }
    }

    fn finish(&self, filename: &str) {
        self.bar.finish_with_message(format!(
            "{} ✅ {} in {}",
            self.name,
            filename,
            humantime::format_duration(round_secs(self.started.elapsed()))
        ));
    }

    fn fail(&self, message: &str) {
        self.bar
            .abandon_with_message(format!("{} ❌ {}", self.name, message));
    }
}

fn round_secs(elapsed: Duration) -> Duration {
    Duration::from_secs(elapsed.as_secs())
}

/// Renders the registry's event stream as indicatif multi-bars.
pub struct ProgressDisplay {
    multi: MultiProgress,
    bars: Mutex<HashMap<JobId, JobBar>>,
    names: Mutex<HashMap<JobId, String>>,
}

impl Default for ProgressDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressDisplay {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
        }
    }

    /// Label shown for `job_id` instead of the raw id.
    pub fn register(&self, job_id: &str, name: impl Into<String>) {
        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.to_string(), name.into());
    }

    /// Prints a line above the bars without tearing them.
    pub fn println(&self, line: impl AsRef<str>) {
        if self.multi.println(line.as_ref()).is_err() {
            println!("{}", line.as_ref());
        }
    }

    pub fn handle(&self, event: &DownloadEvent) {
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        let bar = bars
            .entry(event.job_id().to_string())
            .or_insert_with(|| JobBar::new(self.name_of(event.job_id()), &self.multi));

        match event {
            DownloadEvent::Progress(progress) => bar.update(progress),
            DownloadEvent::Completed { filename, .. } => bar.finish(filename),
            DownloadEvent::Error { message, .. } => bar.fail(message),
        }
    }

    fn name_of(&self, job_id: &str) -> String {
        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
            .unwrap_or_else(|| short_id(job_id).to_string())
    }
}

/// First segment of a UUID, or the whole id when it is short.
pub fn short_id(id: &str) -> &str {
    id.split('-').next().filter(|s| !s.is_empty()).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indicatif::ProgressDrawTarget;

    fn hidden() -> ProgressDisplay {
        let display = ProgressDisplay::new();
        display.multi.set_draw_target(ProgressDrawTarget::hidden());
        display
    }

    #[test]
    fn shortens_uuids_only() {
        assert_eq!(short_id("3f2a9c1e-0000-4000-8000-000000000000"), "3f2a9c1e");
        assert_eq!(short_id("plain"), "plain");
    }

    #[test]
    fn tracks_one_bar_per_job() {
        let display = hidden();
        display.register("a", "movie.mkv");
        for downloaded in [10, 20] {
            display.handle(&DownloadEvent::Progress(ProgressEvent {
                job_id: "a".into(),
                downloaded,
                total: 100,
                rate: 1024.0,
                status: DownloadStatus::Downloading,
            }));
        }
        display.handle(&DownloadEvent::Error {
            job_id: "b".into(),
            message: "server rejected request (status 404)".into(),
        });

        let bars = display.bars.lock().unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars["a"].name, "movie.mkv");
        assert_eq!(bars["a"].bar.position(), 20);
        assert_eq!(bars["a"].bar.length(), Some(100));
        assert!(bars["b"].bar.is_finished());
    }
}
