//! Send-to-Kindle pipeline.
//!
//! One [`KindleDelivery::run`] call per request, each in its own task:
//! ask the agent for the book, wait for it to land in the books directory,
//! then mail it and report every step to the session.

mod watcher;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{info, instrument, warn};

pub use watcher::{CompletionWatcher, PollOutcome, WatchError, WatchSettings};

use crate::email::EmailDispatcher;
use crate::probe::FileProbe;
use crate::protocol::{Response, SendToKindleRequest};
use crate::session::SessionHandle;
use crate::tracker::DownloadTracker;
use crate::tracker::filename::{candidate_names, resolve_title_author};

/// How a delivery run ended. Mostly useful to tests and logs; the user is
/// told through the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { path: PathBuf },
    AgentFailed,
    TimedOut,
    Cancelled,
    ReadFailed,
    MailFailed,
}

/// Wires the tracker, watcher, and mailer together.
#[derive(Clone)]
pub struct KindleDelivery {
    tracker: Arc<DownloadTracker>,
    watcher: CompletionWatcher,
    mailer: EmailDispatcher,
    probe: Arc<dyn FileProbe>,
    persist: bool,
}

impl std::fmt::Debug for KindleDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindleDelivery")
            .field("watcher", &self.watcher)
            .field("mailer", &self.mailer)
            .field("persist", &self.persist)
            .finish_non_exhaustive()
    }
}

impl KindleDelivery {
    #[must_use]
    pub fn new(
        tracker: Arc<DownloadTracker>,
        watcher: CompletionWatcher,
        mailer: EmailDispatcher,
        probe: Arc<dyn FileProbe>,
        persist: bool,
    ) -> Self {
        Self {
            tracker,
            watcher,
            mailer,
            probe,
            persist,
        }
    }

    #[must_use]
    pub fn mail_enabled(&self) -> bool {
        self.mailer.is_enabled()
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<DownloadTracker> {
        &self.tracker
    }

    /// Runs the whole pipeline for one request.
    ///
    /// Stops quietly when the session's done signal fires; nothing is sent to
    /// a closed session.
    #[instrument(skip(self, request, session), fields(session_id = %session.id(), book = %request.book))]
    pub async fn run(&self, request: SendToKindleRequest, session: &SessionHandle) -> DeliveryOutcome {
        let (title, author) = resolve_title_author(
            &request.book,
            request.title.as_deref(),
            request.author.as_deref(),
        );
        let record = self
            .tracker
            .start_tracking(&uuid::Uuid::new_v4().to_string(), &title, &author, &request.book)
            .await;
        let id = record.id.as_str();
        let since = SystemTime::from(record.start_time);
        let expected = candidate_names(&title, &author);

        if let Err(e) = session.agent().download(&request.book).await {
            warn!(error = %e, "agent download failed");
            self.tracker.mark_failed(id, &e.to_string()).await;
            session
                .send(Response::danger("Download request failed.").with_detail(e.to_string()))
                .await;
            return DeliveryOutcome::AgentFailed;
        }
        self.tracker.mark_started(id).await;
        session
            .send(Response::notify(
                "Download request sent. Waiting for book to download...",
            ))
            .await;

        let tracker = &self.tracker;
        let found = self
            .watcher
            .wait_for_file(
                since,
                &expected,
                session.done(),
                |pct| tracker.update_progress(id, pct),
                |path| async move { tracker.claim_file(id, &path).await },
            )
            .await;
        let file = match found {
            Ok(file) => file,
            Err(WatchError::Cancelled) => {
                self.tracker.mark_failed(id, "cancelled").await;
                info!("delivery cancelled");
                return DeliveryOutcome::Cancelled;
            }
            Err(e @ WatchError::Timeout { .. }) => {
                self.tracker.mark_failed(id, &e.to_string()).await;
                session
                    .send(
                        Response::danger(
                            "Download timed out or failed. The book may not be available.",
                        )
                        .with_detail(e.to_string()),
                    )
                    .await;
                return DeliveryOutcome::TimedOut;
            }
        };

        self.tracker.mark_completed(id, &file.path).await;
        session
            .send(Response::notify(format!(
                "Book downloaded! Sending to {}...",
                request.email
            )))
            .await;

        // Buffer the whole file first so a read failure never leaves a partial send.
        let bytes = match self.probe.read(&file.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, path = %file.path.display(), "cannot read downloaded book");
                session
                    .send(
                        Response::danger(format!("Failed to send email: {e}"))
                            .with_detail(e.to_string()),
                    )
                    .await;
                return DeliveryOutcome::ReadFailed;
            }
        };

        if let Err(e) = self
            .mailer
            .send(&request.email, &title, &author, &bytes, &file.name)
            .await
        {
            warn!(error = %e, "mail delivery failed");
            session
                .send(
                    Response::danger(format!("Failed to send email: {e}"))
                        .with_detail(e.to_string()),
                )
                .await;
            return DeliveryOutcome::MailFailed;
        }

        session
            .send(Response::success("Book sent to your email successfully!"))
            .await;

        if !self.persist {
            if let Err(e) = self.probe.remove(&file.path).await {
                warn!(error = %e, path = %file.path.display(), "cannot remove delivered book");
            }
        }

        DeliveryOutcome::Delivered { path: file.path }
    }
}
