//! Server entry point for bookrelay.

use std::sync::Arc;

use anyhow::{Context, Result};
use bookrelay::agent::IrcAgentFactory;
use bookrelay::email::SmtpTransport;
use bookrelay::probe::FsProbe;
use bookrelay::server::{self, AppState};
use clap::Parser;
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.into_config();
    config.smtp.validate()?;

    let books_dir = config.books_dir();
    std::fs::create_dir_all(&books_dir)
        .with_context(|| format!("cannot create books directory {}", books_dir.display()))?;

    debug!(?config, "configuration resolved");
    info!(
        port = config.port,
        base_path = %config.base_path,
        books_dir = %books_dir.display(),
        persist = config.persist,
        irc_server = %config.server_address,
        search_interval_secs = config.search_interval.as_secs(),
        smtp = config.smtp.enabled,
        "bookrelay starting"
    );
    if !config.smtp.enabled {
        warn!("SMTP is disabled; Send to Kindle requests will be refused");
    }

    let agents = Arc::new(IrcAgentFactory::new(config.user_agent.clone()));
    let state = AppState::new(config, agents, Arc::new(SmtpTransport), Arc::new(FsProbe));

    server::serve(state, shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("bookrelay stopped");
    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
