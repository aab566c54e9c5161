//! HTTP surface: the websocket session endpoint plus a few JSON views.

mod library;
mod ws;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router, middleware};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

pub use ws::{SESSION_COOKIE, session_cookie};

use crate::agent::AgentFactory;
use crate::config::{MIN_SEARCH_INTERVAL, ServerConfig};
use crate::delivery::{CompletionWatcher, KindleDelivery, WatchSettings};
use crate::email::{EmailDispatcher, MailTransport};
use crate::probe::FileProbe;
use crate::rate_limiter::SearchRateLimiter;
use crate::router::RequestRouter;
use crate::session::SessionHub;
use crate::tracker::{DownloadStatus, DownloadTracker, RECORD_RETENTION, SWEEP_PERIOD};

/// Everything a handler needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub hub: SessionHub,
    pub router: RequestRouter,
    pub tracker: Arc<DownloadTracker>,
    pub agents: Arc<dyn AgentFactory>,
    pub probe: Arc<dyn FileProbe>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("hub", &self.hub)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Builds the state and spawns the session hub. Must run inside a tokio runtime.
    #[must_use]
    pub fn new(
        config: ServerConfig,
        agents: Arc<dyn AgentFactory>,
        transport: Arc<dyn MailTransport>,
        probe: Arc<dyn FileProbe>,
    ) -> Self {
        Self::with_watch_settings(config, agents, transport, probe, WatchSettings::default())
    }

    #[must_use]
    pub fn with_watch_settings(
        config: ServerConfig,
        agents: Arc<dyn AgentFactory>,
        transport: Arc<dyn MailTransport>,
        probe: Arc<dyn FileProbe>,
        settings: WatchSettings,
    ) -> Self {
        let config = Arc::new(config);
        let books_dir = config.books_dir();

        let tracker = Arc::new(DownloadTracker::new(&books_dir, Arc::clone(&probe)));
        let delivery = KindleDelivery::new(
            Arc::clone(&tracker),
            CompletionWatcher::new(&books_dir, Arc::clone(&probe), settings),
            EmailDispatcher::new(config.smtp.clone(), transport),
            Arc::clone(&probe),
            config.persist,
        );
        let interval = config.search_interval.max(MIN_SEARCH_INTERVAL);
        let router = RequestRouter::new(
            Arc::clone(&config),
            Arc::new(SearchRateLimiter::new(interval)),
            Arc::new(delivery),
        );

        Self {
            config,
            hub: SessionHub::spawn(),
            router,
            tracker,
            agents,
            probe,
        }
    }
}

/// Builds the axum app, mounted under the configured base path.
pub fn build_router(state: AppState) -> Router {
    let library = Router::new()
        .route("/library", get(library::list_books))
        .route(
            "/library/:file",
            get(library::get_book).delete(library::delete_book),
        )
        .route_layer(middleware::from_fn(library::require_user));

    let app = Router::new()
        .route("/ws", get(ws::serve_ws))
        .route("/stats", get(stats))
        .route("/downloads", get(list_downloads))
        .route("/downloads/:id", get(get_download))
        .merge(library)
        .with_state(state.clone());

    let base = state.config.base_path.trim_end_matches('/');
    let app = if base.is_empty() {
        app
    } else {
        Router::new().nest(base, app)
    };

    app.layer(TraceLayer::new_for_http())
}

/// Binds `0.0.0.0:<port>` and serves until `shutdown` resolves.
///
/// # Errors
///
/// Returns the bind or accept-loop I/O error.
pub async fn serve<F>(state: AppState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, state, shutdown).await
}

/// Serves on an already-bound listener.
///
/// Runs the record sweeper alongside the server. Once `shutdown` resolves and
/// in-flight requests finish, every session is closed through the hub.
///
/// # Errors
///
/// Returns the accept-loop I/O error.
#[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
pub async fn serve_on<F>(listener: TcpListener, state: AppState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let stop_sweeper = CancellationToken::new();
    let sweeper = tokio::spawn(sweep_records(
        Arc::clone(&state.tracker),
        stop_sweeper.clone(),
    ));

    let hub = state.hub.clone();
    let app = build_router(state);
    info!("listening");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;

    info!("shutting down sessions");
    stop_sweeper.cancel();
    hub.shutdown().await;
    let _ = sweeper.await;
    served
}

async fn sweep_records(tracker: Arc<DownloadTracker>, stop: CancellationToken) {
    let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + SWEEP_PERIOD, SWEEP_PERIOD);
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticks.tick() => {
                tracker.sweep_expired(RECORD_RETENTION).await;
            }
        }
    }
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.sessions().await)
}

async fn list_downloads(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.tracker.get_all().await)
}

/// One record. A completed record with no bound file gets another discovery
/// attempt first.
async fn get_download(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(record) = state.tracker.get(&id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if record.status == DownloadStatus::Completed && !record.is_resolved() {
        state.tracker.trigger_file_detection(&id).await;
    }
    match state.tracker.get(&id).await {
        Some(record) => Json(record).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
