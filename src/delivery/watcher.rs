//! Bounded polling for a finished download.
//!
//! The agent never says when a transfer is done, so completion is inferred:
//! poll the books directory, and accept a fresh file whose size holds still
//! across a short settle period. Files carrying an expected name are tried
//! first; any other file is a fallback, newest first.

use std::cmp::Reverse;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::probe::{FileProbe, FileStat};
use crate::tracker::filename::is_temporary_name;

/// Tunables for [`CompletionWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    /// Pause between polls.
    pub poll_interval: Duration,
    /// Hard ceiling on the whole wait.
    pub timeout: Duration,
    /// How far before the request start a file's mtime may be.
    pub mtime_buffer: Duration,
    /// Gap between the two stats of the stability check.
    pub settle: Duration,
    /// A stable file must be strictly larger than this many bytes.
    pub min_size: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(5 * 60),
            mtime_buffer: Duration::from_secs(60),
            settle: Duration::from_secs(1),
            min_size: 1000,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("no completed download appeared within {}s", waited.as_secs())]
    Timeout { waited: Duration },

    #[error("download wait was cancelled")]
    Cancelled,
}

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Files that passed the stability check, best first: expected names in
    /// the order given, then everything else newest first.
    Stable(Vec<FileStat>),
    /// At least one candidate is still changing size.
    Growing,
    /// No fresh, non-temporary, plausibly sized file.
    Nothing,
}

/// Watches one directory for a completed download.
#[derive(Clone)]
pub struct CompletionWatcher {
    books_dir: PathBuf,
    probe: Arc<dyn FileProbe>,
    settings: WatchSettings,
}

impl std::fmt::Debug for CompletionWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionWatcher")
            .field("books_dir", &self.books_dir)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CompletionWatcher {
    #[must_use]
    pub fn new(
        books_dir: impl Into<PathBuf>,
        probe: Arc<dyn FileProbe>,
        settings: WatchSettings,
    ) -> Self {
        Self {
            books_dir: books_dir.into(),
            probe,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> WatchSettings {
        self.settings
    }

    /// Runs one poll: list, filter, settle, re-stat.
    ///
    /// Files named in `expected` rank first. While one of them is still
    /// growing, no other file is offered.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Cancelled`] if `cancel` fires during the settle.
    pub async fn poll_once(
        &self,
        since: SystemTime,
        expected: &[String],
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, WatchError> {
        let cutoff = since
            .checked_sub(self.settings.mtime_buffer)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut candidates: Vec<FileStat> = match self.probe.list_files(&self.books_dir).await {
            Ok(files) => files
                .into_iter()
                .filter(|f| !is_temporary_name(&f.name))
                .filter(|f| f.modified > cutoff)
                .collect(),
            Err(e) => {
                warn!(error = %e, books_dir = %self.books_dir.display(), "cannot list books directory");
                return Ok(PollOutcome::Nothing);
            }
        };
        if candidates.is_empty() {
            return Ok(PollOutcome::Nothing);
        }
        let rank = |f: &FileStat| expected.iter().position(|n| *n == f.name);
        candidates.sort_by_key(|f| (rank(f).unwrap_or(usize::MAX), Reverse(f.modified)));

        tokio::select! {
            () = cancel.cancelled() => return Err(WatchError::Cancelled),
            () = tokio::time::sleep(self.settings.settle) => {}
        }

        let mut stable = Vec::new();
        let mut growing = false;
        let mut expected_growing = false;
        for before in candidates {
            let Ok(after) = self.probe.stat(&before.path).await else {
                continue;
            };
            if after.len != before.len {
                debug!(name = %after.name, from = before.len, to = after.len, "candidate still growing");
                growing = true;
                expected_growing |= rank(&after).is_some();
                continue;
            }
            if after.len <= self.settings.min_size {
                debug!(name = %after.name, len = after.len, "candidate too small");
                continue;
            }
            if expected_growing && rank(&after).is_none() {
                continue;
            }
            stable.push(after);
        }

        Ok(if stable.is_empty() && growing {
            PollOutcome::Growing
        } else if stable.is_empty() {
            PollOutcome::Nothing
        } else {
            PollOutcome::Stable(stable)
        })
    }

    /// Polls until a stable file is claimed, the timeout passes, or `cancel` fires.
    ///
    /// Stable files are offered to `claim` best first; the first one it
    /// accepts is returned. A refused file stays a candidate for later polls,
    /// so `claim` is asked again if nothing better turns up.
    ///
    /// `on_progress` receives an estimate (elapsed share of the timeout, capped
    /// at 99) whenever a candidate is seen growing.
    ///
    /// # Errors
    ///
    /// [`WatchError::Timeout`] or [`WatchError::Cancelled`].
    #[instrument(skip_all, fields(books_dir = %self.books_dir.display()))]
    pub async fn wait_for_file<F, Fut, C, CFut>(
        &self,
        since: SystemTime,
        expected: &[String],
        cancel: &CancellationToken,
        mut on_progress: F,
        mut claim: C,
    ) -> Result<FileStat, WatchError>
    where
        F: FnMut(u8) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
        C: FnMut(PathBuf) -> CFut + Send,
        CFut: Future<Output = bool> + Send,
    {
        let started = Instant::now();
        let mut cycle = 0_u32;

        loop {
            if cancel.is_cancelled() {
                return Err(WatchError::Cancelled);
            }
            cycle += 1;

            match self.poll_once(since, expected, cancel).await? {
                PollOutcome::Stable(files) => {
                    for file in files {
                        if claim(file.path.clone()).await {
                            debug!(cycle, name = %file.name, len = file.len, "download settled");
                            return Ok(file);
                        }
                        debug!(cycle, name = %file.name, "stable file belongs to another request");
                    }
                }
                PollOutcome::Growing => on_progress(self.estimate(started.elapsed())).await,
                PollOutcome::Nothing => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= self.settings.timeout {
                return Err(WatchError::Timeout { waited: elapsed });
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(WatchError::Cancelled),
                () = tokio::time::sleep(self.settings.poll_interval) => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= self.settings.timeout {
                return Err(WatchError::Timeout { waited: elapsed });
            }
        }
    }

    fn estimate(&self, elapsed: Duration) -> u8 {
        let total = self.settings.timeout.as_millis().max(1);
        let pct = elapsed.as_millis() * 100 / total;
        u8::try_from(pct.min(99)).unwrap_or(99)
    }
}
