//! Shared fakes for integration tests: a scriptable agent, an in-memory
//! books directory, and a mail transport that records instead of sending.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::mpsc;

use bookrelay::agent::{AgentError, AgentEventKind, AgentFactory, DownloadAgent, EventHandler};
use bookrelay::email::{MailTransport, SmtpAuth, TransportError};
use bookrelay::probe::{FileProbe, FileStat};
use bookrelay::protocol::Response;

// ==================== Agent ====================

#[derive(Default)]
pub struct MockAgent {
    pub username: String,
    pub calls: Mutex<Vec<String>>,
    pub fail_connect: AtomicBool,
    pub fail_search: AtomicBool,
    pub fail_download: AtomicBool,
    pub handlers: Mutex<Vec<(AgentEventKind, EventHandler)>>,
}

impl MockAgent {
    pub fn new(username: &str) -> Arc<Self> {
        Arc::new(Self {
            username: username.to_string(),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn send_error(command: &'static str) -> AgentError {
    AgentError::Send {
        command,
        source: io::Error::new(io::ErrorKind::BrokenPipe, "scripted failure"),
    }
}

#[async_trait]
impl DownloadAgent for MockAgent {
    fn username(&self) -> &str {
        &self.username
    }

    async fn connect(&self, address: &str, _tls: bool) -> Result<(), AgentError> {
        self.record(format!("connect {address}"));
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(AgentError::Connect {
                address: address.to_string(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
            });
        }
        Ok(())
    }

    async fn search(&self, bot: &str, query: &str) -> Result<(), AgentError> {
        self.record(format!("search @{bot} {query}"));
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(send_error("PRIVMSG"));
        }
        Ok(())
    }

    async fn download(&self, book: &str) -> Result<(), AgentError> {
        self.record(format!("download {book}"));
        if self.fail_download.load(Ordering::SeqCst) {
            return Err(send_error("PRIVMSG"));
        }
        Ok(())
    }

    fn on_event(&self, kind: AgentEventKind, handler: EventHandler) {
        self.handlers.lock().unwrap().push((kind, handler));
    }

    async fn disconnect(&self) {
        self.record("disconnect".to_string());
    }
}

/// Hands out a pre-built agent, whatever username is asked for.
pub struct FixedAgentFactory(pub Arc<MockAgent>);

impl AgentFactory for FixedAgentFactory {
    fn create(&self, _username: &str) -> Arc<dyn DownloadAgent> {
        self.0.clone()
    }
}

// ==================== Filesystem ====================

#[derive(Default)]
pub struct MemoryProbe {
    files: Mutex<HashMap<PathBuf, (Vec<u8>, SystemTime)>>,
}

impl MemoryProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, path: impl Into<PathBuf>, bytes: Vec<u8>) {
        self.files
            .lock()
            .unwrap()
            .insert(path.into(), (bytes, SystemTime::now()));
    }

    pub fn insert_modified(&self, path: impl Into<PathBuf>, bytes: Vec<u8>, modified: SystemTime) {
        self.files
            .lock()
            .unwrap()
            .insert(path.into(), (bytes, modified));
    }

    pub fn append(&self, path: &Path, bytes: &[u8]) {
        let mut files = self.files.lock().unwrap();
        let entry = files
            .entry(path.to_path_buf())
            .or_insert_with(|| (Vec::new(), SystemTime::now()));
        entry.0.extend_from_slice(bytes);
        entry.1 = SystemTime::now();
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn stat_of(path: &Path, bytes: &[u8], modified: SystemTime) -> FileStat {
        FileStat {
            path: path.to_path_buf(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            len: bytes.len() as u64,
            modified,
        }
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, path.display().to_string())
}

#[async_trait]
impl FileProbe for MemoryProbe {
    async fn exists(&self, path: &Path) -> bool {
        self.contains(path)
    }

    async fn list_files(&self, dir: &Path) -> io::Result<Vec<FileStat>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.parent() == Some(dir))
            .map(|(path, (bytes, modified))| Self::stat_of(path, bytes, *modified))
            .collect())
    }

    async fn stat(&self, path: &Path) -> io::Result<FileStat> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|(bytes, modified)| Self::stat_of(path, bytes, *modified))
            .ok_or_else(|| not_found(path))
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| not_found(path))
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        self.files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }
}

// ==================== Mail ====================

#[derive(Debug, Clone)]
pub struct SentMail {
    pub server_addr: String,
    pub from: String,
    pub to: Vec<String>,
    pub message: String,
}

#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<SentMail>>,
    pub fail: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send_mail(
        &self,
        server_addr: &str,
        _auth: &SmtpAuth,
        from: &str,
        to: &[String],
        message: &[u8],
    ) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected {
                command: "RCPT TO",
                code: 550,
                message: "mailbox unavailable".to_string(),
            });
        }
        self.sent.lock().unwrap().push(SentMail {
            server_addr: server_addr.to_string(),
            from: from.to_string(),
            to: to.to_vec(),
            message: String::from_utf8_lossy(message).into_owned(),
        });
        Ok(())
    }
}

// ==================== Session ====================

/// Drains whatever is queued without waiting.
pub fn drain(rx: &mut mpsc::Receiver<Response>) -> Vec<Response> {
    let mut out = Vec::new();
    while let Ok(response) = rx.try_recv() {
        out.push(response);
    }
    out
}

pub fn titles(responses: &[Response]) -> Vec<&str> {
    responses.iter().map(|r| r.title.as_str()).collect()
}
