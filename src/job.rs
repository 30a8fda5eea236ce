use crate::checksum::ChecksumAlgorithm;
use crate::status::DownloadStatus;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub type JobId = String;

const OPEN_END: u64 = u64::MAX;

/// Serializable view of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSnapshot {
    pub index: usize,
    pub start_offset: u64,
    /// Exclusive; `None` while the resource size is unknown.
    pub end_offset: Option<u64>,
    pub bytes_written: u64,
    pub attempt_count: u32,
}

/// One contiguous byte range of the target, with counters shared between the
/// manager and the single worker that owns it during a run.
#[derive(Debug)]
pub struct Chunk {
    pub index: usize,
    pub start_offset: u64,
    end_offset: AtomicU64,
    bytes_written: AtomicU64,
    attempt_count: AtomicU32,
}

impl Chunk {
    fn new(index: usize, start_offset: u64, end_offset: Option<u64>) -> Self {
        Self {
            index,
            start_offset,
            end_offset: AtomicU64::new(end_offset.unwrap_or(OPEN_END)),
            bytes_written: AtomicU64::new(0),
            attempt_count: AtomicU32::new(0),
        }
    }

    pub fn end_offset(&self) -> Option<u64> {
        match self.end_offset.load(Ordering::Acquire) {
            OPEN_END => None,
            end => Some(end),
        }
    }

    pub fn len(&self) -> Option<u64> {
        self.end_offset()
            .map(|end| end.saturating_sub(self.start_offset))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::Acquire)
    }

    /// Absolute file offset the next request must start from.
    pub fn resume_offset(&self) -> u64 {
        self.start_offset + self.bytes_written()
    }

    /// Bytes still owed, or `None` for an open-ended chunk.
    pub fn remaining(&self) -> Option<u64> {
        self.len().map(|len| len.saturating_sub(self.bytes_written()))
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == Some(0)
    }

    pub(crate) fn record_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn next_attempt(&self) -> u32 {
        self.attempt_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn reset_progress(&self) {
        self.bytes_written.store(0, Ordering::Release);
    }

    pub(crate) fn reset_attempts(&self) {
        self.attempt_count.store(0, Ordering::Release);
    }

    /// Fixes the end of an open-ended chunk once the stream is exhausted.
    pub(crate) fn close_at_written(&self) {
        let end = self.start_offset + self.bytes_written();
        let _ = self.end_offset.compare_exchange(
            OPEN_END,
            end,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn snapshot(&self) -> ChunkSnapshot {
        ChunkSnapshot {
            index: self.index,
            start_offset: self.start_offset,
            end_offset: self.end_offset(),
            bytes_written: self.bytes_written(),
            attempt_count: self.attempt_count(),
        }
    }
}

/// Ordered, disjoint chunks covering the whole resource.
#[derive(Debug, Default)]
pub struct ChunkTable {
    chunks: Vec<Chunk>,
}

impl ChunkTable {
    /// Splits `[0, total)` into `parts` near-equal contiguous chunks; the last
    /// one absorbs the remainder. An unknown size yields one open-ended chunk.
    pub fn plan(total_size: Option<u64>, parts: usize) -> Self {
        let Some(total) = total_size else {
            return Self {
                chunks: vec![Chunk::new(0, 0, None)],
            };
        };

        let parts = (parts.max(1) as u64).min(total.max(1));
        let chunk_size = total / parts;
        let chunks = (0..parts)
            .map(|i| {
                let start = i * chunk_size;
                let end = if i == parts - 1 {
                    total
                } else {
                    start + chunk_size
                };
                Chunk::new(i as usize, start, Some(end))
            })
            .collect();

        Self { chunks }
    }

    /// Rebuilds a table from persisted snapshots, clamping counters to their ranges.
    ///
    /// The snapshots must tile `[0, total)` in order; only the last chunk may be
    /// open-ended.
    pub fn from_snapshots(snapshots: &[ChunkSnapshot]) -> Result<Self, String> {
        let mut expected_start = 0;
        for (index, s) in snapshots.iter().enumerate() {
            if s.start_offset != expected_start {
                return Err(format!(
                    "chunk {} starts at {}, expected {}",
                    index, s.start_offset, expected_start
                ));
            }
            match s.end_offset {
                Some(end) if end < s.start_offset => {
                    return Err(format!(
                        "chunk {} ends at {} before its start {}",
                        index, end, s.start_offset
                    ));
                }
                Some(end) => expected_start = end,
                None if index + 1 != snapshots.len() => {
                    return Err(format!("chunk {} is open-ended but not last", index));
                }
                None => {}
            }
        }

        let chunks = snapshots
            .iter()
            .enumerate()
            .map(|(index, s)| {
                let chunk = Chunk::new(index, s.start_offset, s.end_offset);
                let written = match chunk.len() {
                    Some(len) => s.bytes_written.min(len),
                    None => s.bytes_written,
                };
                chunk.record_written(written);
                chunk
                    .attempt_count
                    .store(s.attempt_count, Ordering::Release);
                chunk
            })
            .collect();
        Ok(Self { chunks })
    }

    /// A single chunk that is already complete, for files found on disk.
    pub fn completed(total: u64) -> Self {
        let chunk = Chunk::new(0, 0, Some(total));
        chunk.record_written(total);
        Self {
            chunks: vec![chunk],
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    pub fn is_single_stream(&self) -> bool {
        self.chunks.len() == 1
    }

    /// Σ bytes_written over every chunk.
    pub fn downloaded(&self) -> u64 {
        self.chunks.iter().map(Chunk::bytes_written).sum()
    }

    pub fn is_complete(&self) -> bool {
        !self.chunks.is_empty() && self.chunks.iter().all(Chunk::is_complete)
    }

    pub fn incomplete(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter().filter(|c| !c.is_complete())
    }

    /// Known total, i.e. the last chunk's end.
    pub fn total_size(&self) -> Option<u64> {
        self.chunks.last().and_then(Chunk::end_offset)
    }

    pub(crate) fn reset_attempts(&self) {
        self.chunks.iter().for_each(Chunk::reset_attempts);
    }

    pub(crate) fn reset_progress(&self) {
        for chunk in &self.chunks {
            chunk.reset_progress();
            chunk.reset_attempts();
        }
    }

    pub fn snapshots(&self) -> Vec<ChunkSnapshot> {
        self.chunks.iter().map(Chunk::snapshot).collect()
    }
}

/// Point-in-time view of a job, as exposed to front ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: JobId,
    pub url: String,
    pub save_path: PathBuf,
    pub content_type: String,
    pub checksum: Option<String>,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub num_threads: usize,
    pub max_retries: u32,
    pub status: DownloadStatus,
    pub total_size: u64,
    pub downloaded_size: u64,
    pub chunks: Vec<ChunkSnapshot>,
    pub traceback_info: Option<String>,
    pub file_missing: bool,
}

impl DownloadJob {
    /// File name shown to users, falling back to the full path.
    pub fn file_name(&self) -> String {
        self.save_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.save_path.display().to_string())
    }

    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            0.0
        } else {
            self.downloaded_size as f64 / self.total_size as f64
        }
    }
}
