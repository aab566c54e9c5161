//! Minimal plaintext IRC line client.
//!
//! Registers a nick, joins the ebook channel once the server welcomes us,
//! answers `PING` and CTCP `VERSION`, and forwards every received line to the
//! `Message` handlers. DCC transfers are handled by whatever writes into the
//! books directory, not by this client.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{AgentError, AgentEventKind, AgentFactory, DownloadAgent, EventHandler};

/// Channel where search and download commands are posted.
pub const EBOOK_CHANNEL: &str = "#ebooks";

type Handlers = Arc<RwLock<HashMap<AgentEventKind, Vec<EventHandler>>>>;
type Writer = Arc<Mutex<Option<OwnedWriteHalf>>>;

/// IRC-backed [`DownloadAgent`].
pub struct IrcAgent {
    username: String,
    user_agent: String,
    writer: Writer,
    handlers: Handlers,
    reader_cancel: std::sync::Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for IrcAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrcAgent")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl IrcAgent {
    #[must_use]
    pub fn new(username: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            user_agent: user_agent.into(),
            writer: Arc::new(Mutex::new(None)),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            reader_cancel: std::sync::Mutex::new(None),
        }
    }

    async fn send_line(&self, command: &'static str, line: &str) -> Result<(), AgentError> {
        write_line(&self.writer, command, line).await
    }
}

async fn write_line(writer: &Writer, command: &'static str, line: &str) -> Result<(), AgentError> {
    if line.contains(['\r', '\n']) {
        return Err(AgentError::LineBreak { command });
    }
    let mut guard = writer.lock().await;
    let stream = guard.as_mut().ok_or(AgentError::NotConnected)?;
    stream
        .write_all(format!("{line}\r\n").as_bytes())
        .await
        .map_err(|source| AgentError::Send { command, source })
}

fn emit(handlers: &Handlers, kind: AgentEventKind, text: &str) {
    let handlers = handlers.read().unwrap_or_else(PoisonError::into_inner);
    if let Some(list) = handlers.get(&kind) {
        for handler in list {
            handler(text);
        }
    }
}

#[async_trait]
impl DownloadAgent for IrcAgent {
    fn username(&self) -> &str {
        &self.username
    }

    #[instrument(skip(self), fields(username = %self.username))]
    async fn connect(&self, address: &str, tls: bool) -> Result<(), AgentError> {
        if tls {
            return Err(AgentError::TlsUnsupported {
                address: address.to_string(),
            });
        }

        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| AgentError::Connect {
                address: address.to_string(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);

        self.send_line("NICK", &format!("NICK {}", self.username))
            .await?;
        self.send_line(
            "USER",
            &format!("USER {0} 0 * :{0}", self.username),
        )
        .await?;

        let cancel = CancellationToken::new();
        if let Some(previous) = self
            .reader_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(cancel.clone())
        {
            previous.cancel();
        }

        let writer = Arc::clone(&self.writer);
        let handlers = Arc::clone(&self.handlers);
        let username = self.username.clone();
        let user_agent = self.user_agent.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                let line = tokio::select! {
                    () = cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!(%username, "agent server closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(%username, error = %e, "agent read failed");
                        break;
                    }
                };

                emit(&handlers, AgentEventKind::Message, &line);

                if let Some(token) = line.strip_prefix("PING ") {
                    let _ = write_line(&writer, "PONG", &format!("PONG {token}")).await;
                } else if line.split(' ').nth(1) == Some("001") {
                    debug!(%username, "registered with server, joining channel");
                    let _ = write_line(&writer, "JOIN", &format!("JOIN {EBOOK_CHANNEL}")).await;
                } else if line.contains("\u{1}VERSION\u{1}") {
                    if let Some(sender) = line
                        .strip_prefix(':')
                        .and_then(|l| l.split('!').next())
                    {
                        let reply = format!("NOTICE {sender} :\u{1}VERSION {user_agent}\u{1}");
                        let _ = write_line(&writer, "NOTICE", &reply).await;
                    }
                }
            }
        });

        info!(address, "agent connected");
        Ok(())
    }

    async fn search(&self, bot: &str, query: &str) -> Result<(), AgentError> {
        self.send_line(
            "PRIVMSG",
            &format!("PRIVMSG {EBOOK_CHANNEL} :@{bot} {query}"),
        )
        .await
    }

    async fn download(&self, book: &str) -> Result<(), AgentError> {
        self.send_line("PRIVMSG", &format!("PRIVMSG {EBOOK_CHANNEL} :{book}"))
            .await
    }

    fn on_event(&self, kind: AgentEventKind, handler: EventHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(handler);
    }

    async fn disconnect(&self) {
        if let Some(cancel) = self
            .reader_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }
        let mut guard = self.writer.lock().await;
        if let Some(mut stream) = guard.take() {
            let _ = stream.write_all(b"QUIT :bye\r\n").await;
            let _ = stream.shutdown().await;
            debug!(username = %self.username, "agent disconnected");
        }
    }
}

/// Builds an [`IrcAgent`] per session.
#[derive(Debug, Clone)]
pub struct IrcAgentFactory {
    user_agent: String,
}

impl IrcAgentFactory {
    #[must_use]
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

impl AgentFactory for IrcAgentFactory {
    fn create(&self, username: &str) -> Arc<dyn DownloadAgent> {
        Arc::new(IrcAgent::new(username, self.user_agent.clone()))
    }
}
