use crate::checksum::ChecksumAlgorithm;
use crate::job::{ChunkSnapshot, JobId};
use crate::status::DownloadStatus;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One job as written to the session file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: JobId,
    pub url: String,
    pub save_path: PathBuf,
    pub checksum: Option<String>,
    pub num_threads: usize,
    pub content_type: String,
    pub status: DownloadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<ChunkSnapshot>,
}
