//! Single-session registry run as a message-passing actor.
//!
//! One task owns the session table; everything else talks to it over a
//! command channel. That makes "is anyone registered? then insert" a single
//! step, so two handshakes racing each other can never both win.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::error::SessionError;
use super::handle::SessionHandle;
use crate::agent::DownloadAgent;
use crate::protocol::Response;

/// Public view of a registered session (served on `/stats`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub uuid: String,
    pub name: String,
    pub ip: String,
    pub connected_at: DateTime<Utc>,
}

enum HubCommand {
    Register {
        session: SessionHandle,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Unregister {
        id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
}

/// Handle to the session registry actor. Cheap to clone.
#[derive(Clone)]
pub struct SessionHub {
    commands: mpsc::Sender<HubCommand>,
    shutdown: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for SessionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHub")
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl SessionHub {
    /// Spawns the registry task on the current runtime.
    #[must_use]
    pub fn spawn() -> Self {
        let (commands, rx) = mpsc::channel(32);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_hub(rx, shutdown.clone()));
        Self {
            commands,
            shutdown,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Registers a session for `token`.
    ///
    /// On success returns the producer handle and the receiving end of the
    /// outbound queue (owned by the transport's write loop).
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidToken`] if `token` is not a UUID
    /// - [`SessionError::Occupied`] if any session is already registered
    /// - [`SessionError::HubClosed`] after [`SessionHub::shutdown`]
    #[instrument(skip(self, agent), fields(username = agent.username()))]
    pub async fn register(
        &self,
        token: &str,
        agent: Arc<dyn DownloadAgent>,
        remote_addr: Option<SocketAddr>,
    ) -> Result<(SessionHandle, mpsc::Receiver<Response>), SessionError> {
        let id = Uuid::parse_str(token.trim()).map_err(|_| SessionError::InvalidToken {
            token: token.to_string(),
        })?;
        if self.shutdown.is_cancelled() {
            return Err(SessionError::HubClosed);
        }

        let (session, outbound) =
            SessionHandle::new(id, agent, self.shutdown.child_token(), remote_addr);
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HubCommand::Register {
                session: session.clone(),
                reply,
            })
            .await
            .map_err(|_| SessionError::HubClosed)?;
        response.await.map_err(|_| SessionError::HubClosed)??;

        Ok((session, outbound))
    }

    /// Removes a session, closing its queue and releasing its agent.
    ///
    /// Idempotent: returns `false` if `id` was not registered.
    pub async fn unregister(&self, id: Uuid) -> bool {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(HubCommand::Unregister { id, reply })
            .await
            .is_err()
        {
            return false;
        }
        response.await.unwrap_or(false)
    }

    /// Whether a session is currently registered.
    pub async fn is_occupied(&self) -> bool {
        !self.sessions().await.is_empty()
    }

    /// Snapshot of registered sessions.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(HubCommand::Snapshot { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// Unregisters every session and stops the registry task.
    ///
    /// Cancelling the hub token also cancels every session's done signal, so
    /// in-flight delivery tasks observe it before touching a closed queue.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "session hub task ended abnormally");
            }
        }
    }
}

async fn run_hub(mut commands: mpsc::Receiver<HubCommand>, shutdown: CancellationToken) {
    let mut sessions: HashMap<Uuid, SessionHandle> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    HubCommand::Register { session, reply } => {
                        let result = match sessions.keys().next() {
                            Some(active) => {
                                debug!(active = %active, rejected = %session.id(), "session rejected, hub occupied");
                                Err(SessionError::Occupied { active: *active })
                            }
                            None => {
                                info!(session_id = %session.id(), username = session.username(), "session registered");
                                sessions.insert(session.id(), session);
                                Ok(())
                            }
                        };
                        let _ = reply.send(result);
                    }
                    HubCommand::Unregister { id, reply } => {
                        let removed = sessions.remove(&id);
                        let was_present = removed.is_some();
                        if let Some(session) = removed {
                            release(session);
                        }
                        let _ = reply.send(was_present);
                    }
                    HubCommand::Snapshot { reply } => {
                        let _ = reply.send(sessions.values().map(info_for).collect());
                    }
                }
            }
        }
    }

    for (_, session) in sessions.drain() {
        release(session);
    }
    commands.close();
    info!("session hub stopped");
}

fn release(session: SessionHandle) {
    session.close();
    info!(session_id = %session.id(), "session unregistered");
    // Disconnecting is network I/O; keep it off the registry loop.
    tokio::spawn(async move {
        session.agent().disconnect().await;
    });
}

fn info_for(session: &SessionHandle) -> SessionInfo {
    SessionInfo {
        uuid: session.id().to_string(),
        name: session.username().to_string(),
        ip: session
            .remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_default(),
        connected_at: session.created_at(),
    }
}
