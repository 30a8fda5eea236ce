use crate::job::JobId;
use crate::status::DownloadStatus;

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub downloaded: u64,
    /// 0 while the size is unknown.
    pub total: u64,
    /// Smoothed bytes per second.
    pub rate: f64,
    pub status: DownloadStatus,
}

impl ProgressEvent {
    pub fn status_label(&self) -> &'static str {
        self.status.label()
    }
}

#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Progress(ProgressEvent),
    Completed { job_id: JobId, filename: String },
    Error { job_id: JobId, message: String },
}

impl DownloadEvent {
    pub fn job_id(&self) -> &str {
        match self {
            DownloadEvent::Progress(p) => &p.job_id,
            DownloadEvent::Completed { job_id, .. } => job_id,
            DownloadEvent::Error { job_id, .. } => job_id,
        }
    }
}
