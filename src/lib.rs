pub mod checksum;
pub mod cli;
pub mod config;
pub mod control;
pub mod display;
pub mod error;
pub mod events;
pub mod job;
pub mod manager;
pub mod pool;
pub mod progress;
pub mod registry;
pub mod repository;
pub mod request;
pub mod session;
pub mod status;
pub mod transport;
pub mod worker;

pub use checksum::{ChecksumAlgorithm, ChecksumVerifier};
pub use config::{DownloadConfig, DownloadConfigBuilder};
pub use error::DownloadError;
pub use status::DownloadStatus;

pub use events::{DownloadEvent, ProgressEvent};
pub use job::{ChunkSnapshot, ChunkTable, DownloadJob, JobId};
pub use manager::DownloadManager;
pub use registry::DownloadRegistry;
pub use request::DownloadRequest;
pub use session::{PersistenceType, SessionStore};
pub use transport::{HttpTransport, Transport};
