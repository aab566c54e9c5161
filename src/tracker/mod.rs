//! Download tracking and heuristic file discovery.
//!
//! The agent gives no completion signal and picks its own filenames, so the
//! tracker keeps one [`DownloadRecord`] per requested book and tries to bind
//! each record to a file in the books directory:
//!
//! 1. Probe every name from [`filename::candidate_names`] for an exact hit.
//! 2. Otherwise take the most recently modified non-temporary file written
//!    after the record started.
//!
//! A file is only bound through [`DownloadTracker::claim_file`], which keeps
//! concurrent downloads from taking each other's books. If nothing can be
//! claimed the record stays unresolved until the next trigger. The record map
//! lock is never held while the filesystem is checked.

pub mod filename;
mod record;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::probe::FileProbe;

pub use record::{DownloadRecord, DownloadStatus};

/// How long records are kept before [`DownloadTracker::sweep_expired`] drops them.
pub const RECORD_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// How often the server runs the sweep.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Owner of every [`DownloadRecord`]; the only component that mutates them.
pub struct DownloadTracker {
    records: RwLock<HashMap<String, DownloadRecord>>,
    books_dir: PathBuf,
    probe: Arc<dyn FileProbe>,
}

impl std::fmt::Debug for DownloadTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTracker")
            .field("books_dir", &self.books_dir)
            .finish_non_exhaustive()
    }
}

impl DownloadTracker {
    /// Creates a tracker watching `books_dir`.
    #[must_use]
    pub fn new(books_dir: impl Into<PathBuf>, probe: Arc<dyn FileProbe>) -> Self {
        let books_dir = books_dir.into();
        debug!(books_dir = %books_dir.display(), "download tracker initialized");
        Self {
            records: RwLock::new(HashMap::new()),
            books_dir,
            probe,
        }
    }

    #[must_use]
    pub fn books_dir(&self) -> &Path {
        &self.books_dir
    }

    /// Starts tracking a download. A blank `id` gets a generated UUID.
    ///
    /// Re-using an id replaces the previous record.
    #[instrument(skip(self, command), fields(download_id))]
    pub async fn start_tracking(
        &self,
        id: &str,
        title: &str,
        author: &str,
        command: &str,
    ) -> DownloadRecord {
        let id = if id.trim().is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            id.to_string()
        };
        tracing::Span::current().record("download_id", id.as_str());

        let record = DownloadRecord::new(
            id.clone(),
            title.to_string(),
            author.to_string(),
            command.to_string(),
        );
        self.records.write().await.insert(id, record.clone());
        info!("download tracking started");
        record
    }

    /// Marks the agent command as sent.
    pub async fn mark_started(&self, id: &str) -> bool {
        self.transition(id, DownloadStatus::Started).await
    }

    /// Records transfer progress (clamped to 100).
    ///
    /// Reaching 100 completes the record and runs file discovery. Updates to
    /// terminal or unknown records are ignored.
    #[instrument(skip(self))]
    pub async fn update_progress(&self, id: &str, percent: u8) {
        let percent = percent.min(100);
        let completed = {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(id) else {
                debug!("progress for unknown download ignored");
                return;
            };
            if record.status.is_terminal() {
                debug!(status = %record.status, "progress for finished download ignored");
                return;
            }
            record.progress = record.progress.max(percent);
            if percent >= 100 {
                record.transition(DownloadStatus::Completed)
            } else {
                record.transition(DownloadStatus::InProgress);
                false
            }
        };

        if completed {
            self.trigger_file_detection(id).await;
        }
    }

    /// Completes a record with a file the caller already located.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn mark_completed(&self, id: &str, path: &Path) -> bool {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            return false;
        };
        if !record.transition(DownloadStatus::Completed) {
            return false;
        }
        record.progress = 100;
        record.bind_file(path.to_path_buf());
        info!("download completed");
        true
    }

    /// Fails a record with a reason. Terminal records are left untouched.
    #[instrument(skip(self))]
    pub async fn mark_failed(&self, id: &str, reason: &str) -> bool {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            return false;
        };
        if !record.transition(DownloadStatus::Failed) {
            return false;
        }
        record.error = Some(reason.to_string());
        warn!("download failed");
        true
    }

    /// Returns a copy of one record.
    pub async fn get(&self, id: &str) -> Option<DownloadRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// Returns copies of all records, oldest first.
    pub async fn get_all(&self) -> Vec<DownloadRecord> {
        let mut all: Vec<_> = self.records.read().await.values().cloned().collect();
        all.sort_by_key(|r| r.start_time);
        all
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Drops every record that started more than `max_age` ago.
    ///
    /// Not self-scheduling; the server calls it on a timer.
    #[instrument(skip(self), fields(max_age_secs = max_age.as_secs()))]
    pub async fn sweep_expired(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.start_time >= cutoff);
        let removed = before - records.len();
        if removed > 0 {
            info!(removed, "expired download records swept");
        }
        removed
    }

    /// Binds `path` to record `id` unless another request has the better claim.
    ///
    /// Check and bind happen under one write lock, so two in-flight requests
    /// can never both take the same file. A file carrying one of this record's
    /// candidate names is refused only while another unfinished record holds
    /// it. Any other file is refused if any record holds it, or if its name is
    /// a candidate name of another unfinished record.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn claim_file(&self, id: &str, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut records = self.records.write().await;
        let Some(own) = records.get(id) else {
            return false;
        };
        if own.file_path.as_deref() == Some(path) {
            return true;
        }
        if own.status == DownloadStatus::Failed {
            return false;
        }
        let expected = filename::candidate_names(&own.title, &own.author).contains(&name);

        let holder = records.values().filter(|r| r.id != id).find(|other| {
            let holds = other.file_path.as_deref() == Some(path);
            if expected {
                holds && !other.status.is_terminal()
            } else {
                holds
                    || (!other.status.is_terminal()
                        && filename::candidate_names(&other.title, &other.author).contains(&name))
            }
        });
        if let Some(other) = holder {
            debug!(other = %other.id, "file belongs to another download");
            return false;
        }

        let Some(record) = records.get_mut(id) else {
            return false;
        };
        record.bind_file(path.to_path_buf());
        info!("bound downloaded file");
        true
    }

    /// Runs file discovery for one record and binds the result.
    ///
    /// Returns the resolved path, or `None` when nothing matched, everything
    /// that matched belongs to another download, or the record is unknown.
    #[instrument(skip(self))]
    pub async fn trigger_file_detection(&self, id: &str) -> Option<PathBuf> {
        let (title, author, started) = {
            let records = self.records.read().await;
            let record = records.get(id)?;
            if let Some(path) = &record.file_path {
                return Some(path.clone());
            }
            (record.title.clone(), record.author.clone(), record.start_time)
        };

        for path in self.find_downloaded_files(&title, &author, started).await {
            if self.claim_file(id, &path).await {
                return Some(path);
            }
        }
        debug!("no downloaded file found yet");
        None
    }

    /// Candidate files for one record, best first: exact name matches, then
    /// non-temporary files written after `started`, newest first.
    async fn find_downloaded_files(
        &self,
        title: &str,
        author: &str,
        started: DateTime<Utc>,
    ) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for name in filename::candidate_names(title, author) {
            let path = self.books_dir.join(&name);
            if self.probe.exists(&path).await {
                debug!(name, "found file by name match");
                found.push(path);
            }
        }

        let mut fresh = match self.probe.list_files(&self.books_dir).await {
            Ok(files) => files
                .into_iter()
                .filter(|f| !filename::is_temporary_name(&f.name))
                .filter(|f| DateTime::<Utc>::from(f.modified) > started)
                .filter(|f| !found.contains(&f.path))
                .collect(),
            Err(e) => {
                warn!(error = %e, books_dir = %self.books_dir.display(), "cannot list books directory");
                Vec::new()
            }
        };
        fresh.sort_by(|a, b| b.modified.cmp(&a.modified));
        found.extend(fresh.into_iter().map(|f| f.path));
        found
    }

    async fn transition(&self, id: &str, next: DownloadStatus) -> bool {
        self.records
            .write()
            .await
            .get_mut(id)
            .is_some_and(|r| r.transition(next))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::probe::FsProbe;
    use tempfile::TempDir;

    fn tracker(dir: &TempDir) -> DownloadTracker {
        DownloadTracker::new(dir.path(), Arc::new(FsProbe))
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(time).unwrap();
    }

    #[tokio::test]
    async fn test_start_tracking_generates_id_when_blank() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);

        let record = tracker.start_tracking("", "Dune", "Frank Herbert", "!Bot Dune").await;
        assert!(uuid::Uuid::parse_str(&record.id).is_ok());
        assert_eq!(record.status, DownloadStatus::Pending);
        assert_eq!(tracker.get(&record.id).await.unwrap().title, "Dune");
    }

    #[tokio::test]
    async fn test_progress_moves_to_in_progress() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        tracker.start_tracking("a", "Dune", "Frank Herbert", "cmd").await;
        assert!(tracker.mark_started("a").await);

        tracker.update_progress("a", 40).await;
        let record = tracker.get("a").await.unwrap();
        assert_eq!(record.status, DownloadStatus::InProgress);
        assert_eq!(record.progress, 40);
    }

    #[tokio::test]
    async fn test_progress_100_completes_and_discovers_file() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        tracker.start_tracking("a", "Dune", "Frank Herbert", "cmd").await;
        std::fs::write(dir.path().join("Dune - Frank Herbert.epub"), b"book").unwrap();

        tracker.update_progress("a", 150).await;
        let record = tracker.get("a").await.unwrap();
        assert_eq!(record.status, DownloadStatus::Completed);
        assert_eq!(record.progress, 100);
        assert_eq!(record.file_name.as_deref(), Some("Dune - Frank Herbert.epub"));
        assert!(record.end_time.is_some());
    }

    #[tokio::test]
    async fn test_progress_after_failure_ignored() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        tracker.start_tracking("a", "Dune", "Frank Herbert", "cmd").await;
        assert!(tracker.mark_failed("a", "timeout").await);

        tracker.update_progress("a", 100).await;
        let record = tracker.get("a").await.unwrap();
        assert_eq!(record.status, DownloadStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("timeout"));
        assert!(!tracker.mark_completed("a", Path::new("/x.epub")).await);
    }

    #[tokio::test]
    async fn test_mark_failed_unknown_id() {
        let dir = TempDir::new().unwrap();
        assert!(!tracker(&dir).mark_failed("missing", "x").await);
    }

    #[tokio::test]
    async fn test_mark_completed_binds_file_once() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        tracker.start_tracking("a", "Dune", "Frank Herbert", "cmd").await;
        let path = dir.path().join("dune.epub");

        assert!(tracker.mark_completed("a", &path).await);
        let record = tracker.get("a").await.unwrap();
        assert_eq!(record.status, DownloadStatus::Completed);
        assert_eq!(record.progress, 100);
        assert_eq!(record.file_name.as_deref(), Some("dune.epub"));
        assert!(record.end_time.is_some());

        assert!(!tracker.mark_completed("a", &path).await);
        assert!(!tracker.mark_failed("a", "late").await);
        assert!(!tracker.mark_completed("missing", &path).await);
    }

    #[tokio::test]
    async fn test_claim_refuses_file_named_for_another_download() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        tracker.start_tracking("dune", "Dune", "Frank Herbert", "cmd").await;
        tracker.start_tracking("emma", "Emma", "Jane Austen", "cmd").await;
        let emma = dir.path().join("Emma - Jane Austen.epub");

        assert!(!tracker.claim_file("dune", &emma).await);
        assert!(tracker.claim_file("emma", &emma).await);
        assert!(!tracker.get("dune").await.unwrap().is_resolved());
        assert_eq!(tracker.get("emma").await.unwrap().file_path, Some(emma));
    }

    #[tokio::test]
    async fn test_claim_refuses_file_held_by_another_download() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        tracker.start_tracking("a", "Dune", "Frank Herbert", "cmd").await;
        tracker.start_tracking("b", "Emma", "Jane Austen", "cmd").await;
        let unnamed = dir.path().join("book-4411.epub");

        assert!(tracker.claim_file("a", &unnamed).await);
        assert!(tracker.claim_file("a", &unnamed).await);
        assert!(!tracker.claim_file("b", &unnamed).await);

        // A delivered file stays off limits to fallback matching.
        assert!(tracker.mark_completed("a", &unnamed).await);
        assert!(!tracker.claim_file("b", &unnamed).await);
    }

    #[tokio::test]
    async fn test_claim_allows_expected_name_once_holder_finished() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        let dune = dir.path().join("Dune - Frank Herbert.epub");
        tracker.start_tracking("first", "Dune", "Frank Herbert", "cmd").await;
        tracker.start_tracking("retry", "Dune", "Frank Herbert", "cmd").await;

        assert!(tracker.claim_file("first", &dune).await);
        assert!(!tracker.claim_file("retry", &dune).await);

        tracker.mark_failed("first", "mail rejected").await;
        assert!(tracker.claim_file("retry", &dune).await);
        assert!(!tracker.claim_file("first", &dune).await);
    }

    #[tokio::test]
    async fn test_discovery_skips_file_claimed_by_another_download() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        tracker.start_tracking("dune", "Dune", "Frank Herbert", "cmd").await;
        tracker.start_tracking("emma", "Emma", "Jane Austen", "cmd").await;
        let emma = dir.path().join("Emma - Jane Austen.epub");
        std::fs::write(&emma, b"emma").unwrap();
        set_mtime(&emma, SystemTime::now() + Duration::from_secs(5));

        assert_eq!(tracker.trigger_file_detection("dune").await, None);
        assert_eq!(tracker.trigger_file_detection("emma").await, Some(emma));
    }

    #[tokio::test]
    async fn test_discovery_exact_name_match() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        let expected = dir.path().join("Dune - Frank Herbert.epub");
        std::fs::write(&expected, b"epub").unwrap();
        // A newer unrelated file must not win over the exact match.
        std::fs::write(dir.path().join("other.pdf"), b"pdf").unwrap();

        tracker.start_tracking("a", "Dune", "Frank Herbert", "cmd").await;
        assert_eq!(tracker.trigger_file_detection("a").await, Some(expected.clone()));
        assert_eq!(tracker.get("a").await.unwrap().file_path, Some(expected));
    }

    #[tokio::test]
    async fn test_discovery_falls_back_to_newest_file() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        tracker.start_tracking("a", "Dune", "Frank Herbert", "cmd").await;

        let now = SystemTime::now();
        let older = dir.path().join("herbert_dune_v1.epub");
        let newer = dir.path().join("herbert_dune_v2.epub");
        let temp = dir.path().join("herbert_dune_v3.epub.temp");
        for p in [&older, &newer, &temp] {
            std::fs::write(p, b"data").unwrap();
        }
        set_mtime(&older, now + Duration::from_secs(5));
        set_mtime(&newer, now + Duration::from_secs(10));
        set_mtime(&temp, now + Duration::from_secs(20));

        assert_eq!(tracker.trigger_file_detection("a").await, Some(newer));
    }

    #[tokio::test]
    async fn test_discovery_ignores_files_older_than_record() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        let stale = dir.path().join("stale.epub");
        std::fs::write(&stale, b"data").unwrap();
        set_mtime(&stale, SystemTime::now() - Duration::from_secs(3600));

        tracker.start_tracking("a", "Dune", "Frank Herbert", "cmd").await;
        assert_eq!(tracker.trigger_file_detection("a").await, None);
        assert!(!tracker.get("a").await.unwrap().is_resolved());
    }

    #[tokio::test]
    async fn test_sweep_expired_drops_only_old_records() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        tracker.start_tracking("old", "Old", "A", "cmd").await;
        tracker.start_tracking("recent", "Recent", "B", "cmd").await;
        {
            let mut records = tracker.records.write().await;
            records.get_mut("old").unwrap().start_time = Utc::now() - chrono::Duration::hours(25);
            records.get_mut("recent").unwrap().start_time = Utc::now() - chrono::Duration::hours(1);
        }

        assert_eq!(tracker.sweep_expired(RECORD_RETENTION).await, 1);
        assert!(tracker.get("old").await.is_none());
        assert!(tracker.get("recent").await.is_some());
        assert_eq!(tracker.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_all_returns_copies_oldest_first() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker(&dir);
        tracker.start_tracking("b", "B", "B", "cmd").await;
        tracker.start_tracking("a", "A", "A", "cmd").await;
        {
            let mut records = tracker.records.write().await;
            records.get_mut("a").unwrap().start_time = Utc::now() - chrono::Duration::minutes(5);
        }

        let mut all = tracker.get_all().await;
        assert_eq!(all[0].id, "a");
        all[0].title = "mutated".to_string();
        assert_eq!(tracker.get("a").await.unwrap().title, "A");
    }
}
