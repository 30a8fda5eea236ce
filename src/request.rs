use crate::checksum::ChecksumAlgorithm;
use crate::config::{DownloadConfig, MAX_THREADS_PER_JOB};
use crate::job::JobId;
use std::path::PathBuf;

pub const UNKNOWN_CONTENT_TYPE: &str = "unknown";

/// Everything a caller supplies to create a job.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub id: Option<JobId>,
    pub url: String,
    pub save_path: PathBuf,
    pub content_type: String,
    pub checksum: Option<String>,
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
    pub num_threads: Option<usize>,
    pub max_retries: Option<u32>,
}

impl DownloadRequest {
    /// URL and destination are mandatory
    pub fn builder(url: impl Into<String>, save_path: impl Into<PathBuf>) -> DownloadRequestBuilder {
        DownloadRequestBuilder {
            inner: DownloadRequest {
                id: None,
                url: url.into(),
                save_path: save_path.into(),
                content_type: UNKNOWN_CONTENT_TYPE.to_string(),
                checksum: None,
                checksum_algorithm: None,
                num_threads: None,
                max_retries: None,
            },
        }
    }

    /// Requested concurrency with config defaults applied, clamped to `1..=16`.
    pub fn effective_threads(&self, config: &DownloadConfig) -> usize {
        self.num_threads
            .unwrap_or(config.default_threads)
            .clamp(1, MAX_THREADS_PER_JOB)
    }

    pub fn effective_retries(&self, config: &DownloadConfig) -> u32 {
        self.max_retries.unwrap_or(config.retry.max_retries)
    }

    pub fn effective_algorithm(&self, config: &DownloadConfig) -> ChecksumAlgorithm {
        self.checksum_algorithm.unwrap_or(config.checksum_algorithm)
    }

    /// Blank checksums count as absent.
    pub fn normalized_checksum(&self) -> Option<String> {
        self.checksum
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
    }
}

pub struct DownloadRequestBuilder {
    inner: DownloadRequest,
}

impl DownloadRequestBuilder {
    pub fn id(mut self, id: impl Into<JobId>) -> Self {
        self.inner.id = Some(id.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.inner.content_type = content_type.into();
        self
    }

    pub fn checksum(mut self, checksum: impl Into<String>) -> Self {
        self.inner.checksum = Some(checksum.into());
        self
    }

    pub fn checksum_algorithm(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.inner.checksum_algorithm = Some(algorithm);
        self
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.inner.num_threads = Some(n);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.inner.max_retries = Some(n);
        self
    }

    pub fn build(self) -> DownloadRequest {
        self.inner
    }
}
