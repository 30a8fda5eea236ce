use crate::config::DownloadConfigError;
use crate::status::DownloadStatus;
use std::io;
use thiserror::Error;
use tokio::sync::AcquireError;
use tokio::task::JoinError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(String),

    #[error("{}", http_message(*status))]
    Http { status: u16 },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("server does not honor byte ranges: {0}")]
    RangeUnsupported(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error(
        "network failure exceeded retry budget on chunk {chunk} after {attempts} retries: {last}"
    )]
    RetriesExhausted {
        chunk: usize,
        attempts: u32,
        last: String,
    },

    #[error("file size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("checksum mismatch ({algorithm}): expected {expected}, got {actual}")]
    ChecksumMismatch {
        algorithm: String,
        expected: String,
        actual: String,
    },

    #[error("cannot {action} a job in state {status}")]
    InvalidTransition {
        action: &'static str,
        status: DownloadStatus,
    },

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("job {0} already exists")]
    DuplicateJob(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("chunk {0} is not part of the job")]
    ChunkMissing(usize),

    #[error("worker join error: {0}")]
    Join(String),

    #[error("worker pool closed: {0}")]
    PoolClosed(String),
}

fn http_message(status: u16) -> String {
    if status >= 500 {
        format!("server error (status {})", status)
    } else {
        format!("server rejected request (status {})", status)
    }
}

impl DownloadError {
    /// Whether a chunk worker may spend retry budget on this failure.
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadError::Network(_) => true,
            DownloadError::Http { status } => *status >= 500,
            _ => false,
        }
    }
}

impl From<io::Error> for DownloadError {
    fn from(err: io::Error) -> Self {
        DownloadError::Filesystem(err.to_string())
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => DownloadError::Http {
                status: status.as_u16(),
            },
            None => DownloadError::Network(err.to_string()),
        }
    }
}

impl From<url::ParseError> for DownloadError {
    fn from(err: url::ParseError) -> Self {
        DownloadError::InvalidUrl(err.to_string())
    }
}

impl From<JoinError> for DownloadError {
    fn from(err: JoinError) -> Self {
        DownloadError::Join(err.to_string())
    }
}

impl From<AcquireError> for DownloadError {
    fn from(err: AcquireError) -> Self {
        DownloadError::PoolClosed(err.to_string())
    }
}

impl From<DownloadConfigError> for DownloadError {
    fn from(err: DownloadConfigError) -> Self {
        DownloadError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for DownloadError {
    fn from(err: toml::de::Error) -> Self {
        DownloadError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(err: serde_json::Error) -> Self {
        DownloadError::Session(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_failures() {
        assert!(DownloadError::Network("reset".into()).is_transient());
        assert!(DownloadError::Http { status: 503 }.is_transient());
        assert!(!DownloadError::Http { status: 404 }.is_transient());
        assert!(!DownloadError::Filesystem("denied".into()).is_transient());
        assert!(!DownloadError::RangeUnsupported("200 OK".into()).is_transient());
    }

    #[test]
    fn user_facing_messages_are_distinct() {
        let exhausted = DownloadError::RetriesExhausted {
            chunk: 2,
            attempts: 3,
            last: "connection reset".into(),
        };
        assert!(exhausted
            .to_string()
            .contains("network failure exceeded retry budget"));
        assert_eq!(
            DownloadError::Http { status: 404 }.to_string(),
            "server rejected request (status 404)"
        );
        assert!(DownloadError::SizeMismatch {
            expected: 10,
            actual: 9
        }
        .to_string()
        .starts_with("file size mismatch"));
        assert!(DownloadError::ChecksumMismatch {
            algorithm: "MD5".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        }
        .to_string()
        .starts_with("checksum mismatch"));
    }

    #[test]
    fn io_errors_become_filesystem_errors() {
        let err: DownloadError = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(err, DownloadError::Filesystem(_)));
    }
}
