//! Runtime configuration shared by the server, router, and delivery pipeline.
//!
//! Values are resolved once at startup (CLI flags and environment) and then
//! passed around behind an `Arc`. Nothing here reads the environment itself.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Floor for the interval between accepted searches.
///
/// Lower values from the CLI are clamped up to this at configuration time;
/// the limiter itself enforces whatever interval it is handed.
pub const MIN_SEARCH_INTERVAL: Duration = Duration::from_secs(10);

/// Default SMTP submission port.
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// Name of the directory under the download root that holds finished books.
pub const BOOKS_DIR_NAME: &str = "books";

/// Errors raised while validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// SMTP is enabled but a required field is empty.
    #[error("SMTP is enabled but {field} is not set")]
    MissingSmtpField {
        /// Name of the missing field (`host`, `from`).
        field: &'static str,
    },
}

/// SMTP settings for send-to-Kindle delivery.
#[derive(Clone, Default)]
pub struct SmtpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("from", &self.from)
            .finish()
    }
}

impl SmtpConfig {
    /// Returns `host:port` for the transport call.
    #[must_use]
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checks that an enabled configuration has what the transport needs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSmtpField`] when SMTP is enabled without
    /// a host or sender address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingSmtpField { field: "host" });
        }
        if self.from.trim().is_empty() {
            return Err(ConfigError::MissingSmtpField { field: "from" });
        }
        Ok(())
    }
}

/// Server-wide settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port the HTTP server listens on.
    pub port: u16,
    /// Path prefix the app is mounted under, always `/`-delimited on both ends.
    pub base_path: String,
    /// Keep books on disk after they are delivered.
    pub persist: bool,
    /// Root directory; books land in `<download_dir>/books`.
    pub download_dir: PathBuf,
    /// Write agent chatter to a per-user log file.
    pub log_agent: bool,
    /// Prefix for generated IRC nicknames.
    pub user_name: String,
    /// Version string the agent reports, when asked.
    pub user_agent: String,
    /// Agent server address (`host:port`).
    pub server_address: String,
    /// Request TLS for the agent connection.
    pub enable_tls: bool,
    /// Bot that receives search commands.
    pub search_bot: String,
    /// Minimum spacing between accepted searches.
    pub search_interval: Duration,
    pub smtp: SmtpConfig,
}

impl ServerConfig {
    /// Directory the agent drops finished books into.
    #[must_use]
    pub fn books_dir(&self) -> PathBuf {
        self.download_dir.join(BOOKS_DIR_NAME)
    }

    /// Directory for per-user agent logs.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.download_dir.join("logs")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5228,
            base_path: "/".to_string(),
            persist: false,
            download_dir: std::env::temp_dir().join("bookrelay"),
            log_agent: false,
            user_name: String::new(),
            user_agent: concat!("bookrelay ", env!("CARGO_PKG_VERSION")).to_string(),
            server_address: "irc.irchighway.net:6667".to_string(),
            enable_tls: false,
            search_bot: "search".to_string(),
            search_interval: MIN_SEARCH_INTERVAL,
            smtp: SmtpConfig {
                port: DEFAULT_SMTP_PORT,
                ..SmtpConfig::default()
            },
        }
    }
}

/// Converts the CLI rate-limit value into an interval, clamped to the floor.
#[must_use]
pub fn search_interval_from_secs(secs: u64) -> Duration {
    Duration::from_secs(secs).max(MIN_SEARCH_INTERVAL)
}

/// Normalizes a base path so it starts and ends with `/`.
///
/// ```
/// use bookrelay::config::sanitize_base_path;
///
/// assert_eq!(sanitize_base_path(""), "/");
/// assert_eq!(sanitize_base_path("books"), "/books/");
/// assert_eq!(sanitize_base_path("/books/"), "/books/");
/// ```
#[must_use]
pub fn sanitize_base_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}
