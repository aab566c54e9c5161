//! Producer-side view of a registered session.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::DownloadAgent;
use crate::protocol::Response;

/// Capacity of each session's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 128;

/// Cloneable handle to one session.
///
/// Every producer (router, delivery tasks) sends through [`SessionHandle::send`],
/// which selects on the session's done signal so a send never lands on a
/// queue that is being torn down.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    agent: Arc<dyn DownloadAgent>,
    outbound: mpsc::Sender<Response>,
    done: CancellationToken,
    created_at: DateTime<Utc>,
    remote_addr: Option<SocketAddr>,
    handlers_installed: AtomicBool,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("username", &self.inner.agent.username())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Creates a session and the receiving end of its outbound queue.
    ///
    /// `done` is normally a child of the hub's shutdown token.
    pub(crate) fn new(
        id: Uuid,
        agent: Arc<dyn DownloadAgent>,
        done: CancellationToken,
        remote_addr: Option<SocketAddr>,
    ) -> (Self, mpsc::Receiver<Response>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let handle = Self {
            inner: Arc::new(Inner {
                id,
                agent,
                outbound,
                done,
                created_at: Utc::now(),
                remote_addr,
                handlers_installed: AtomicBool::new(false),
            }),
        };
        (handle, rx)
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The agent connection owned by this session.
    #[must_use]
    pub fn agent(&self) -> &Arc<dyn DownloadAgent> {
        &self.inner.agent
    }

    #[must_use]
    pub fn username(&self) -> &str {
        self.inner.agent.username()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Done signal; cancelled when the session is unregistered or the hub
    /// shuts down.
    #[must_use]
    pub fn done(&self) -> &CancellationToken {
        &self.inner.done
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Queues an envelope for the browser, preserving enqueue order.
    ///
    /// Returns `false` without sending when the session has been closed, or
    /// closes while the queue is full.
    pub async fn send(&self, response: Response) -> bool {
        if self.inner.done.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            () = self.inner.done.cancelled() => false,
            sent = self.inner.outbound.send(response) => sent.is_ok(),
        }
    }

    /// Returns `true` exactly once per session: for the caller that should
    /// register the agent's event handlers.
    pub fn take_handler_install(&self) -> bool {
        !self.inner.handlers_installed.swap(true, Ordering::SeqCst)
    }

    /// Signals every producer to stop. Idempotent.
    pub(crate) fn close(&self) {
        self.inner.done.cancel();
    }
}
