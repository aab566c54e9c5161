//! Send-to-Kindle mail dispatch.
//!
//! [`EmailDispatcher`] turns a downloaded book into a [`MailEnvelope`] and
//! hands the raw bytes to a [`MailTransport`]. Transport errors are passed
//! through untouched.

mod mime;
mod smtp;

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument};

pub use mime::{BASE64_LINE_WIDTH, MIME_BOUNDARY, MailEnvelope};
pub use smtp::{MailTransport, SmtpAuth, SmtpTransport, TransportError, dot_stuff};

use crate::config::SmtpConfig;

/// Errors from [`EmailDispatcher::send`].
#[derive(Debug, Error)]
pub enum EmailError {
    #[error("SMTP is not enabled")]
    Disabled,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Builds and sends book attachments using the configured SMTP settings.
#[derive(Clone)]
pub struct EmailDispatcher {
    config: SmtpConfig,
    transport: Arc<dyn MailTransport>,
}

impl std::fmt::Debug for EmailDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailDispatcher")
            .field("enabled", &self.config.enabled)
            .field("server", &self.config.server_addr())
            .finish_non_exhaustive()
    }
}

impl EmailDispatcher {
    #[must_use]
    pub fn new(config: SmtpConfig, transport: Arc<dyn MailTransport>) -> Self {
        Self { config, transport }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Sends `attachment` to `to` as `filename`.
    ///
    /// # Errors
    ///
    /// - [`EmailError::Disabled`] when SMTP is turned off; nothing is built or sent
    /// - [`EmailError::Transport`] with the transport's own error
    #[instrument(skip(self, attachment), fields(bytes = attachment.len()))]
    pub async fn send(
        &self,
        to: &str,
        title: &str,
        author: &str,
        attachment: &[u8],
        filename: &str,
    ) -> Result<(), EmailError> {
        if !self.config.enabled {
            return Err(EmailError::Disabled);
        }

        let envelope = MailEnvelope {
            to,
            from: &self.config.from,
            title,
            author,
            attachment,
            filename,
        };
        let message = envelope.to_message();
        let auth = SmtpAuth {
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        };

        self.transport
            .send_mail(
                &self.config.server_addr(),
                &auth,
                &self.config.from,
                &[to.to_string()],
                message.as_bytes(),
            )
            .await?;

        info!(to, filename, "book mailed");
        Ok(())
    }
}
