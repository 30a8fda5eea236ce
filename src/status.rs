use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a single download job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl DownloadStatus {
    /// Human-facing label carried by progress events.
    pub fn label(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "Pending",
            DownloadStatus::Downloading => "Downloading",
            DownloadStatus::Paused => "Paused",
            DownloadStatus::Stopped => "Stopped",
            DownloadStatus::Completed => "Completed",
            DownloadStatus::Error => "Error",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, DownloadStatus::Downloading | DownloadStatus::Paused)
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Stopped | DownloadStatus::Error
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadStatus::Pending => "PENDING",
            DownloadStatus::Downloading => "DOWNLOADING",
            DownloadStatus::Paused => "PAUSED",
            DownloadStatus::Stopped => "STOPPED",
            DownloadStatus::Completed => "COMPLETED",
            DownloadStatus::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(DownloadStatus::Pending),
            "DOWNLOADING" => Ok(DownloadStatus::Downloading),
            "PAUSED" => Ok(DownloadStatus::Paused),
            "STOPPED" => Ok(DownloadStatus::Stopped),
            "COMPLETED" => Ok(DownloadStatus::Completed),
            "ERROR" => Ok(DownloadStatus::Error),
            other => Err(format!("unknown download status: {}", other)),
        }
    }
}
