//! BookRelay Core Library
//!
//! Mediates between one browser session and an IRC ebook bot. The bot gives
//! no completion signal for downloads, so finished books are discovered by
//! watching the download directory and can then be mailed to a Kindle.
//!
//! # Architecture
//!
//! - [`session`] - single-session registry and outbound queues
//! - [`router`] - decodes inbound frames and drives the agent
//! - [`rate_limiter`] - global spacing between accepted searches
//! - [`tracker`] - download records, lifecycle and file discovery
//! - [`delivery`] - completion polling and the Send-to-Kindle pipeline
//! - [`email`] - MIME envelope construction and SMTP transport
//! - [`agent`] - the external search/download agent seam
//! - [`server`] - axum HTTP and websocket surface

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod config;
pub mod delivery;
pub mod email;
pub mod probe;
pub mod protocol;
pub mod rate_limiter;
pub mod router;
pub mod server;
pub mod session;
pub mod tracker;

// Re-export commonly used types
pub use agent::{AgentError, AgentFactory, DownloadAgent};
pub use config::{ServerConfig, SmtpConfig};
pub use delivery::{CompletionWatcher, DeliveryOutcome, KindleDelivery, WatchSettings};
pub use email::{EmailDispatcher, EmailError, MailTransport};
pub use probe::{FileProbe, FsProbe};
pub use protocol::{MessageType, NotificationType, Request, Response};
pub use rate_limiter::{RateDecision, SearchRateLimiter};
pub use router::RequestRouter;
pub use session::{SessionError, SessionHandle, SessionHub};
pub use tracker::{DownloadRecord, DownloadStatus, DownloadTracker};
