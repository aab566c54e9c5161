//! Download record and status definitions.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a tracked download.
///
/// Non-terminal states only move forward (`Pending` → `Started` →
/// `InProgress`); `Completed` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Tracking created, command not yet sent to the agent.
    Pending,
    /// Command sent to the agent.
    Started,
    /// A transfer has been observed.
    InProgress,
    /// File resolved on disk.
    Completed,
    /// Gave up; see the record's error.
    Failed,
}

impl DownloadStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Started => 1,
            Self::InProgress => 2,
            Self::Completed | Self::Failed => 3,
        }
    }

    /// Whether moving from `self` to `next` respects the lifecycle.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tracked state for one requested book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub id: String,
    pub title: String,
    pub author: String,
    /// Command string sent to the agent.
    pub book_command: String,
    pub status: DownloadStatus,
    /// 0-100.
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadRecord {
    pub(crate) fn new(id: String, title: String, author: String, book_command: String) -> Self {
        Self {
            id,
            title,
            author,
            book_command,
            status: DownloadStatus::Pending,
            progress: 0,
            file_path: None,
            file_name: None,
            start_time: Utc::now(),
            end_time: None,
            error: None,
        }
    }

    /// Whether a file has been bound to this record.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.file_path.is_some()
    }

    /// Applies a status change if the lifecycle allows it.
    ///
    /// Returns `false` (and leaves the record alone) for illegal moves.
    pub(crate) fn transition(&mut self, next: DownloadStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        true
    }

    pub(crate) fn bind_file(&mut self, path: PathBuf) {
        self.file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        self.file_path = Some(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DownloadRecord {
        DownloadRecord::new(
            "id-1".to_string(),
            "Dune".to_string(),
            "Frank Herbert".to_string(),
            "!Bot Dune.epub".to_string(),
        )
    }

    #[test]
    fn test_new_record_is_pending() {
        let r = record();
        assert_eq!(r.status, DownloadStatus::Pending);
        assert_eq!(r.progress, 0);
        assert!(!r.is_resolved());
        assert!(r.end_time.is_none());
    }

    #[test]
    fn test_forward_transitions_allowed() {
        let mut r = record();
        assert!(r.transition(DownloadStatus::Started));
        assert!(r.transition(DownloadStatus::InProgress));
        assert!(r.transition(DownloadStatus::InProgress));
        assert!(r.transition(DownloadStatus::Completed));
        assert!(r.end_time.is_some());
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut r = record();
        assert!(r.transition(DownloadStatus::InProgress));
        assert!(!r.transition(DownloadStatus::Started));
        assert_eq!(r.status, DownloadStatus::InProgress);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut r = record();
        assert!(r.transition(DownloadStatus::Failed));
        assert!(!r.transition(DownloadStatus::Completed));
        assert!(!r.transition(DownloadStatus::InProgress));
        assert_eq!(r.status, DownloadStatus::Failed);

        let mut r = record();
        assert!(r.transition(DownloadStatus::Completed));
        assert!(!r.transition(DownloadStatus::Failed));
    }

    #[test]
    fn test_pending_can_fail_directly() {
        assert!(DownloadStatus::Pending.can_transition_to(DownloadStatus::Failed));
    }

    #[test]
    fn test_bind_file_sets_name() {
        let mut r = record();
        r.bind_file(PathBuf::from("/books/Dune.epub"));
        assert_eq!(r.file_name.as_deref(), Some("Dune.epub"));
        assert!(r.is_resolved());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&DownloadStatus::InProgress).ok().as_deref(),
            Some("\"in_progress\"")
        );
    }
}
