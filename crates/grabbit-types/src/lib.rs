//! Shared types for Grabbit
//!
//! This crate contains the data structures exchanged between the download
//! engine and whatever renders its state (CLI, web front end, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// Download Types
// ============================================================================

/// Represents a single download task and its live progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    /// Sanitized storage filename, unique among active tasks
    pub id: String,
    pub url: String,
    pub display_name: String,
    /// Optional public alias for the stored file
    pub alias: Option<String>,
    pub status: DownloadStatus,
    /// Percentage in `0.0..=100.0`
    pub progress: f64,
    pub total_size: Option<u64>,
    pub downloaded: u64,
    /// Bytes per second, averaged since the transfer started
    pub speed: u64,
    /// Seconds remaining; `None` while the speed is still zero
    pub eta: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DownloadTask {
    pub fn new(id: String, url: String, alias: Option<String>) -> Self {
        let display_name = alias.clone().unwrap_or_else(|| id.clone());

        Self {
            id,
            url,
            display_name,
            alias,
            status: DownloadStatus::Starting,
            progress: 0.0,
            total_size: None,
            downloaded: 0,
            speed: 0,
            eta: None,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Status of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Starting,
    Downloading,
    Completed,
    Failed,
    Cancelled,
    Duplicate,
}

impl DownloadStatus {
    /// Terminal statuses are absorbing
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed
                | DownloadStatus::Failed
                | DownloadStatus::Cancelled
                | DownloadStatus::Duplicate
        )
    }

    /// Whether `self -> next` is a legal forward transition
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        matches!(
            (self, next),
            (Starting, Downloading)
                | (Starting, Failed)
                | (Starting, Cancelled)
                | (Downloading, Completed)
                | (Downloading, Failed)
                | (Downloading, Cancelled)
                | (Downloading, Duplicate)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Starting => "starting",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
            DownloadStatus::Duplicate => "duplicate",
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write-once record of a terminal outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub display_name: String,
    pub status: DownloadStatus,
    pub finished_at: DateTime<Utc>,
    pub url: String,
    pub bytes: u64,
}

impl HistoryEntry {
    pub fn from_task(task: &DownloadTask) -> Self {
        Self {
            id: task.id.clone(),
            display_name: task.display_name.clone(),
            status: task.status,
            finished_at: task.completed_at.unwrap_or_else(Utc::now),
            url: task.url.clone(),
            bytes: task.downloaded,
        }
    }
}

/// A completed file sitting in the storage directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFile {
    pub name: String,
    pub alias: Option<String>,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

// ============================================================================
// Settings Types
// ============================================================================

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage_dir: PathBuf,
    pub max_concurrent_downloads: u32,
    /// Streaming block size in bytes
    pub block_size: usize,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Persisted content-hash index used by duplicate detection
    pub hash_index_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_dir: dirs::download_dir()
                .map(|p| p.join("grabbit"))
                .unwrap_or_else(|| PathBuf::from("downloads")),
            max_concurrent_downloads: 4,
            block_size: 8 * 1024,
            user_agent: concat!("grabbit/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            hash_index_path: None,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the engine; the registry stays the source of truth
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    TaskAdded {
        task: DownloadTask,
    },
    TaskProgress {
        id: String,
        downloaded: u64,
        total: Option<u64>,
        speed: u64,
        eta: Option<u64>,
    },
    TaskFinished {
        id: String,
        status: DownloadStatus,
        error: Option<String>,
    },
    TaskRenamed {
        from: String,
        to: String,
    },
    TaskRemoved {
        id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_accept_no_transition() {
        use DownloadStatus::*;
        let all = [Starting, Downloading, Completed, Failed, Cancelled, Duplicate];
        for from in all.into_iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn duplicate_only_follows_downloading() {
        assert!(DownloadStatus::Downloading.can_transition_to(DownloadStatus::Duplicate));
        assert!(!DownloadStatus::Starting.can_transition_to(DownloadStatus::Duplicate));
        assert!(!DownloadStatus::Starting.can_transition_to(DownloadStatus::Completed));
    }

    #[test]
    fn new_task_displays_alias_when_given() {
        let task = DownloadTask::new(
            "report.pdf".into(),
            "https://example.com/report.pdf".into(),
            Some("q3".into()),
        );
        assert_eq!(task.display_name, "q3");
        assert_eq!(task.status, DownloadStatus::Starting);
        assert_eq!(task.eta, None);
    }

    #[test]
    fn settings_fill_missing_fields_from_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "max_concurrent_downloads": 9 }"#).unwrap();
        assert_eq!(settings.max_concurrent_downloads, 9);
        assert_eq!(settings.block_size, 8192);
        assert!(settings.hash_index_path.is_none());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&DownloadStatus::Duplicate).unwrap();
        assert_eq!(json, "\"duplicate\"");
    }
}
