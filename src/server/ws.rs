//! `/ws`: session handshake and the per-session read/write pumps.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AppState;
use crate::agent::generate_username;
use crate::protocol::Response as Envelope;
use crate::session::SessionHandle;

/// Cookie that carries the browser's session token.
pub const SESSION_COOKIE: &str = "BookRelay";

const COOKIE_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;

/// Reads the session cookie from request headers.
#[must_use]
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
}

fn set_cookie_value(token: &str) -> String {
    format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age={COOKIE_MAX_AGE_SECS}")
}

/// Registers a session and upgrades. Rejects with 400 when the token is bad or
/// another session is active; no agent connection is made in that case.
pub(super) async fn serve_ws(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let (token, minted) = match session_cookie(&headers) {
        Some(token) => (token, false),
        None => (Uuid::new_v4().to_string(), true),
    };
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);

    let username = generate_username(&state.config.user_name, &mut rand::thread_rng());
    let agent = state.agents.create(&username);

    let (session, outbound) = match state.hub.register(&token, agent, remote_addr).await {
        Ok(registered) => registered,
        Err(e) => {
            info!(error = %e, remote = ?remote_addr, "websocket handshake rejected");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    info!(session_id = %session.id(), %username, remote = ?remote_addr, "client connected");

    let failed_hub = state.hub.clone();
    let failed_id = session.id();
    let response = upgrade
        .on_failed_upgrade(move |e| {
            warn!(error = %e, "websocket upgrade failed");
            tokio::spawn(async move {
                failed_hub.unregister(failed_id).await;
            });
        })
        .on_upgrade(move |socket| run_session(state, socket, session, outbound));

    if minted {
        ([(header::SET_COOKIE, set_cookie_value(&token))], response).into_response()
    } else {
        response
    }
}

async fn run_session(
    state: AppState,
    socket: WebSocket,
    session: SessionHandle,
    outbound: mpsc::Receiver<Envelope>,
) {
    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, outbound, session.done().clone()));

    read_pump(stream, &state, &session).await;

    state.hub.unregister(session.id()).await;
    if let Err(e) = writer.await {
        warn!(error = %e, "write pump ended abnormally");
    }
    info!(session_id = %session.id(), "client disconnected");
}

/// Routes frames until the browser goes away or the session is closed.
async fn read_pump(mut stream: SplitStream<WebSocket>, state: &AppState, session: &SessionHandle) {
    loop {
        let frame = tokio::select! {
            () = session.done().cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                // Send-to-Kindle runs detached; its handle is not needed here.
                let _ = state.router.route_text(&text, session).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
        }
    }
}

/// Drains the outbound queue onto the socket, in order.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Envelope>,
    done: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            () = done.cancelled() => break,
            envelope = outbound.recv() => envelope,
        };
        let Some(envelope) = envelope else { break };

        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "cannot encode status envelope");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            debug!(error = %e, "websocket write failed");
            break;
        }
    }
    outbound.close();
    let _ = sink.send(Message::Close(None)).await;
}
