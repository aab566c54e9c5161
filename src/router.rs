//! Dispatch of inbound session frames.
//!
//! The router is stateless apart from the shared search limiter: it decodes a
//! frame, talks to the session's agent, and queues status envelopes on the
//! session. Send-to-Kindle is the only command that outlives the call; it is
//! spawned onto its own task and the handle returned.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentEventKind, log_sink};
use crate::config::ServerConfig;
use crate::delivery::{DeliveryOutcome, KindleDelivery};
use crate::protocol::{
    Command, DownloadRequest, Request, Response, SearchRequest, SendToKindleRequest,
};
use crate::rate_limiter::{RateDecision, SearchRateLimiter};
use crate::session::SessionHandle;

const UNKNOWN_PAYLOAD: &str = "Unknown request payload.";

#[derive(Debug, Clone)]
pub struct RequestRouter {
    config: Arc<ServerConfig>,
    limiter: Arc<SearchRateLimiter>,
    delivery: Arc<KindleDelivery>,
}

impl RequestRouter {
    #[must_use]
    pub fn new(
        config: Arc<ServerConfig>,
        limiter: Arc<SearchRateLimiter>,
        delivery: Arc<KindleDelivery>,
    ) -> Self {
        Self {
            config,
            limiter,
            delivery,
        }
    }

    /// Routes a raw text frame.
    pub async fn route_text(
        &self,
        text: &str,
        session: &SessionHandle,
    ) -> Option<JoinHandle<DeliveryOutcome>> {
        match Request::from_json(text) {
            Ok(request) => self.route(request, session).await,
            Err(e) => {
                debug!(error = %e, "unparseable frame");
                session
                    .send(Response::danger(UNKNOWN_PAYLOAD).with_detail(e.to_string()))
                    .await;
                None
            }
        }
    }

    /// Routes one request envelope.
    ///
    /// Returns the background task handle for `SEND_TO_KINDLE`, `None` for
    /// everything else.
    #[instrument(skip(self, request, session), fields(session_id = %session.id(), message_type = %request.message_type))]
    pub async fn route(
        &self,
        request: Request,
        session: &SessionHandle,
    ) -> Option<JoinHandle<DeliveryOutcome>> {
        let command = match request.decode() {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "rejected request payload");
                session
                    .send(Response::danger(UNKNOWN_PAYLOAD).with_detail(e.to_string()))
                    .await;
                return None;
            }
        };

        match command {
            Command::Connect => {
                self.connect(session).await;
                None
            }
            Command::Search(req) => {
                self.search(req, session).await;
                None
            }
            Command::Download(req) => {
                self.download(req, session).await;
                None
            }
            Command::SendToKindle(req) => self.send_to_kindle(req, session).await,
        }
    }

    async fn connect(&self, session: &SessionHandle) {
        let agent = session.agent();
        let username = session.username().to_string();

        // A retried CONNECT reuses the handlers from the first attempt.
        if session.take_handler_install() {
            let trace_name = username.clone();
            agent.on_event(
                AgentEventKind::Message,
                Arc::new(move |line: &str| debug!(username = %trace_name, line, "agent message")),
            );
            if self.config.log_agent {
                let path = self.config.logs_dir().join(format!("{username}.log"));
                match log_sink(&path).await {
                    Ok(handler) => agent.on_event(AgentEventKind::Message, handler),
                    Err(e) => warn!(error = %e, "cannot open agent log file"),
                }
            }
        }

        match agent
            .connect(&self.config.server_address, self.config.enable_tls)
            .await
        {
            Ok(()) => {
                info!(%username, server = %self.config.server_address, "agent connected");
                session.send(Response::connected(&username)).await;
            }
            Err(e) => {
                warn!(error = %e, "agent connect failed");
                session
                    .send(Response::danger("Unable to connect to IRC server.").with_detail(e.to_string()))
                    .await;
            }
        }
    }

    async fn search(&self, req: SearchRequest, session: &SessionHandle) {
        if let RateDecision::Rejected { retry_after } = self.limiter.try_acquire() {
            debug!(retry_after_ms = retry_after.as_millis(), "search rate limited");
            session.send(Response::rate_limited(retry_after)).await;
            return;
        }

        match session
            .agent()
            .search(&self.config.search_bot, &req.query)
            .await
        {
            Ok(()) => {
                session.send(Response::notify("Search request sent.")).await;
            }
            Err(e) => {
                warn!(error = %e, "agent search failed");
                session
                    .send(Response::danger("Search request failed.").with_detail(e.to_string()))
                    .await;
            }
        }
    }

    async fn download(&self, req: DownloadRequest, session: &SessionHandle) {
        match session.agent().download(&req.book).await {
            Ok(()) => {
                session
                    .send(Response::notify("Download request received."))
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "agent download failed");
                session
                    .send(Response::danger("Download request failed.").with_detail(e.to_string()))
                    .await;
            }
        }
    }

    async fn send_to_kindle(
        &self,
        req: SendToKindleRequest,
        session: &SessionHandle,
    ) -> Option<JoinHandle<DeliveryOutcome>> {
        if !self.delivery.mail_enabled() {
            session
                .send(Response::warning(
                    "Email functionality is not configured. Please check SMTP settings.",
                ))
                .await;
            return None;
        }

        session
            .send(Response::notify("Send to Kindle request received."))
            .await;

        let delivery = Arc::clone(&self.delivery);
        let session = session.clone();
        Some(tokio::spawn(async move { delivery.run(req, &session).await }))
    }
}
