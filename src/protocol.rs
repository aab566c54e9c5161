//! Wire envelopes exchanged with the browser session.
//!
//! Inbound frames are `{"messageType": ..., "payload": {...}}`. The payload is
//! kept as raw JSON until [`Request::decode`] interprets it for the given
//! message type. Outbound frames are flat status envelopes ([`Response`]).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Discriminant carried by every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Status,
    Connect,
    Search,
    Download,
    #[serde(rename = "RATELIMIT")]
    RateLimit,
    SendToKindle,
}

impl MessageType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "STATUS",
            Self::Connect => "CONNECT",
            Self::Search => "SEARCH",
            Self::Download => "DOWNLOAD",
            Self::RateLimit => "RATELIMIT",
            Self::SendToKindle => "SEND_TO_KINDLE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity shown by the browser for a status envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Notify,
    Success,
    Warning,
    Danger,
}

/// Raw inbound frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Payload of a `SEARCH` request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SearchRequest {
    pub query: String,
}

/// Payload of a `DOWNLOAD` request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DownloadRequest {
    pub book: String,
}

/// Payload of a `SEND_TO_KINDLE` request.
///
/// `title`/`author` are optional; when present they win over anything parsed
/// out of `book`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SendToKindleRequest {
    pub book: String,
    pub email: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
}

/// A decoded, validated inbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Search(SearchRequest),
    Download(DownloadRequest),
    SendToKindle(SendToKindleRequest),
}

/// Failure to interpret an inbound frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload did not match the shape for its message type.
    #[error("invalid {message_type} payload: {source}")]
    Payload {
        message_type: MessageType,
        #[source]
        source: serde_json::Error,
    },

    /// Payload parsed but a required field was blank.
    #[error("invalid {message_type} payload: {field} must not be empty")]
    EmptyField {
        message_type: MessageType,
        field: &'static str,
    },

    /// A field holds something that cannot be passed on safely.
    #[error("invalid {message_type} payload: {field} {reason}")]
    InvalidField {
        message_type: MessageType,
        field: &'static str,
        reason: &'static str,
    },

    /// The message type is only ever sent by the server.
    #[error("{message_type} is not a client request")]
    Unsupported { message_type: MessageType },
}

impl Request {
    /// Parses a text frame into a request envelope.
    ///
    /// # Errors
    ///
    /// Returns the JSON error when the frame is not a valid envelope.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Interprets the payload according to the message type.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the payload is malformed, a required field
    /// is blank, or the message type is server-only.
    pub fn decode(self) -> Result<Command, DecodeError> {
        let message_type = self.message_type;
        match message_type {
            MessageType::Connect => Ok(Command::Connect),
            MessageType::Search => {
                let req: SearchRequest = parse_payload(message_type, self.payload)?;
                require(message_type, "query", &req.query)?;
                single_line(message_type, "query", &req.query)?;
                Ok(Command::Search(req))
            }
            MessageType::Download => {
                let req: DownloadRequest = parse_payload(message_type, self.payload)?;
                require(message_type, "book", &req.book)?;
                single_line(message_type, "book", &req.book)?;
                Ok(Command::Download(req))
            }
            MessageType::SendToKindle => {
                let req: SendToKindleRequest = parse_payload(message_type, self.payload)?;
                require(message_type, "book", &req.book)?;
                require(message_type, "email", &req.email)?;
                single_line(message_type, "book", &req.book)?;
                for (field, value) in [("title", &req.title), ("author", &req.author)] {
                    if let Some(value) = value {
                        single_line(message_type, field, value)?;
                    }
                }
                if !is_mailbox(&req.email) {
                    return Err(DecodeError::InvalidField {
                        message_type,
                        field: "email",
                        reason: "is not a single email address",
                    });
                }
                Ok(Command::SendToKindle(req))
            }
            MessageType::Status | MessageType::RateLimit => {
                Err(DecodeError::Unsupported { message_type })
            }
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    message_type: MessageType,
    payload: serde_json::Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(payload).map_err(|source| DecodeError::Payload {
        message_type,
        source,
    })
}

fn require(
    message_type: MessageType,
    field: &'static str,
    value: &str,
) -> Result<(), DecodeError> {
    if value.trim().is_empty() {
        return Err(DecodeError::EmptyField {
            message_type,
            field,
        });
    }
    Ok(())
}

/// Values forwarded to the agent or the mail server travel on one protocol
/// line, so control characters are refused outright.
fn single_line(
    message_type: MessageType,
    field: &'static str,
    value: &str,
) -> Result<(), DecodeError> {
    if value.chars().any(char::is_control) {
        return Err(DecodeError::InvalidField {
            message_type,
            field,
            reason: "must not contain control characters",
        });
    }
    Ok(())
}

/// A bare `local@domain` address: no display name, no list, no whitespace.
fn is_mailbox(value: &str) -> bool {
    const FORBIDDEN: &[char] = &['<', '>', ',', ';', ':', '(', ')', '[', ']', '"', '\\'];

    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.contains('@')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || FORBIDDEN.contains(&c))
}

/// Outbound status envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub message_type: MessageType,
    pub notification_type: NotificationType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Agent username, only set on `CONNECT` responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Response {
    /// Plain `STATUS` envelope.
    #[must_use]
    pub fn status(notification_type: NotificationType, title: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Status,
            notification_type,
            title: title.into(),
            detail: None,
            name: None,
        }
    }

    #[must_use]
    pub fn notify(title: impl Into<String>) -> Self {
        Self::status(NotificationType::Notify, title)
    }

    #[must_use]
    pub fn success(title: impl Into<String>) -> Self {
        Self::status(NotificationType::Success, title)
    }

    #[must_use]
    pub fn warning(title: impl Into<String>) -> Self {
        Self::status(NotificationType::Warning, title)
    }

    #[must_use]
    pub fn danger(title: impl Into<String>) -> Self {
        Self::status(NotificationType::Danger, title)
    }

    /// Attaches a detail line.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// `CONNECT` success carrying the agent username.
    #[must_use]
    pub fn connected(username: &str) -> Self {
        Self {
            message_type: MessageType::Connect,
            notification_type: NotificationType::Success,
            title: "Welcome, connection established.".to_string(),
            detail: Some(format!("IRC username {username}")),
            name: Some(username.to_string()),
        }
    }

    /// `RATELIMIT` warning telling the user how long to wait.
    ///
    /// The wait is rounded up to whole seconds so the user never retries early.
    #[must_use]
    pub fn rate_limited(wait: Duration) -> Self {
        let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        Self {
            message_type: MessageType::RateLimit,
            notification_type: NotificationType::Warning,
            title: "The following request was rate limited.".to_string(),
            detail: Some(format!("Please wait {secs} seconds and try again.")),
            name: None,
        }
    }
}
