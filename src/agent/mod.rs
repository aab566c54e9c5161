//! Boundary to the external search/download agent.
//!
//! The relay never speaks the bot protocol directly; it drives an agent
//! through [`DownloadAgent`] and receives its chatter through event handlers.
//! Each browser session gets its own agent from an [`AgentFactory`].

mod irc;

use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

pub use irc::{IrcAgent, IrcAgentFactory};

/// Kinds of events an agent emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentEventKind {
    /// Every raw line received from the server; used for logging.
    Message,
}

/// Callback invoked with the event text.
pub type EventHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Errors reported by an agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Could not reach the agent server.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    /// TLS was requested but this agent only speaks plaintext.
    #[error("TLS connections to {address} are not supported by this agent")]
    TlsUnsupported { address: String },

    /// A command was issued before `connect` succeeded.
    #[error("agent is not connected")]
    NotConnected,

    /// An argument would have split into several protocol lines.
    #[error("refusing to send {command} command: line break in argument")]
    LineBreak { command: &'static str },

    /// Writing a command to the server failed.
    #[error("failed to send {command} command: {source}")]
    Send {
        command: &'static str,
        #[source]
        source: io::Error,
    },
}

/// An external search/download engine bound to one session.
#[async_trait]
pub trait DownloadAgent: Send + Sync {
    /// Nickname the agent uses on the server.
    fn username(&self) -> &str;

    /// Connects to `address` (`host:port`).
    async fn connect(&self, address: &str, tls: bool) -> Result<(), AgentError>;

    /// Sends `query` to the search bot.
    async fn search(&self, bot: &str, query: &str) -> Result<(), AgentError>;

    /// Requests a book by its server-side reference.
    async fn download(&self, book: &str) -> Result<(), AgentError>;

    /// Registers a handler for an event kind.
    fn on_event(&self, kind: AgentEventKind, handler: EventHandler);

    /// Leaves the server and stops background readers. Idempotent.
    async fn disconnect(&self);
}

/// Creates one agent per session.
pub trait AgentFactory: Send + Sync {
    fn create(&self, username: &str) -> Arc<dyn DownloadAgent>;
}

const ADJECTIVES: &[&str] = &[
    "happy", "clever", "swift", "bright", "quiet", "bold", "calm", "wise", "kind", "cool",
    "brave", "eager", "fierce", "gentle", "humble", "jolly", "keen", "lively", "merry", "noble",
    "proud", "quick", "radiant", "serene", "trusty", "vibrant", "witty", "zealous", "agile",
    "daring",
];

const NOUNS: &[&str] = &[
    "falcon", "tiger", "eagle", "wolf", "bear", "lion", "fox", "hawk", "shark", "panther",
    "dragon", "phoenix", "raven", "owl", "deer", "rabbit", "dolphin", "whale", "otter", "lynx",
    "mountain", "river", "ocean", "forest", "meadow", "comet", "meteor", "galaxy", "nebula",
    "planet",
];

/// Builds a nickname like `<base>calmfalcon48213`.
pub fn generate_username<R: Rng>(base: &str, rng: &mut R) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(rng).copied().unwrap_or("reader");
    let number: u32 = rng.gen_range(10_000..100_000);
    format!("{}{adjective}{noun}{number}", base.trim())
}

/// Opens (appending) a per-user log file and returns a handler that queues
/// each event line for it.
///
/// Handlers run inside the agent's reader, so they only enqueue; a spawned
/// task owns the file and does the writing. The task ends once every clone of
/// the handler is dropped. Must be called inside a tokio runtime.
///
/// # Errors
///
/// Returns the IO error if the directory or file cannot be created.
pub async fn log_sink(path: &Path) -> io::Result<EventHandler> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;

    let (lines, mut queued) = mpsc::unbounded_channel::<String>();
    let log_path = path.to_path_buf();
    tokio::spawn(async move {
        while let Some(mut line) = queued.recv().await {
            line.push('\n');
            let written = match file.write_all(line.as_bytes()).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!(error = %e, path = %log_path.display(), "failed to write agent log line");
            }
        }
    });

    Ok(Arc::new(move |line: &str| {
        // A closed queue means the writer already gave up; nothing to do.
        let _ = lines.send(line.to_string());
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::TempDir;

    #[test]
    fn test_generate_username_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        let name = generate_username("relay", &mut rng);
        assert!(name.starts_with("relay"));
        let digits: String = name.chars().rev().take_while(char::is_ascii_digit).collect();
        assert_eq!(digits.len(), 5);
        assert!(!name.contains('_'));
        assert_eq!(name, name.to_lowercase());
    }

    #[test]
    fn test_generate_username_without_base() {
        let mut rng = StdRng::seed_from_u64(1);
        let name = generate_username("", &mut rng);
        assert!(ADJECTIVES.iter().any(|a| name.starts_with(a)), "got {name}");
    }

    /// Reads `path` until it holds `lines` lines; the sink writes in the background.
    async fn wait_for_lines(path: &Path, lines: usize) -> String {
        for _ in 0..200 {
            let contents = tokio::fs::read_to_string(path).await.unwrap_or_default();
            if contents.lines().count() >= lines {
                return contents;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("{} never reached {lines} lines", path.display());
    }

    #[tokio::test]
    async fn test_log_sink_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("user.log");

        let sink = log_sink(&path).await.unwrap();
        sink(":server 001 user :Welcome");
        sink(":server NOTICE user :hello");

        let contents = wait_for_lines(&path, 2).await;
        assert_eq!(
            contents.lines().collect::<Vec<_>>(),
            vec![":server 001 user :Welcome", ":server NOTICE user :hello"]
        );
    }

    #[tokio::test]
    async fn test_log_sink_appends_to_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("user.log");
        std::fs::write(&path, "earlier\n").unwrap();

        let sink = log_sink(&path).await.unwrap();
        sink("later");

        let contents = wait_for_lines(&path, 2).await;
        assert_eq!(contents, "earlier\nlater\n");
    }
}
