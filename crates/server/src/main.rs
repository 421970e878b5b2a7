//! toolrelay server
//!
//! Routes tool calls from server-side model turns to each user's local
//! agent, and RPCs from browser tabs to the user's local cli.

mod agent_proxy;
mod agent_turn;
mod auth;
mod chat_store;
mod config;
mod connection;
mod correlation;
mod dispatch;
mod error;
mod gateway_token;
mod jwks;
mod logging;
mod paths;
mod rate_limit;
mod router;
mod secret;
mod session;
mod session_actor;
mod session_command;
mod state;
mod stream_store;
mod undo;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::agent_turn::EchoModel;
use crate::auth::Authenticator;
use crate::chat_store::InMemoryChatStore;
use crate::config::{Cli, Command, ServerConfig, StartArgs};
use crate::jwks::JwksVerifier;
use crate::logging::LogSettings;
use crate::rate_limit::RateLimiter;
use crate::router::build_router;
use crate::state::{AppState, SessionRegistry};
use crate::stream_store::StreamStore;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    paths::init_data_dir(cli.data_dir.as_deref()).context("resolving data dir")?;
    paths::ensure_dirs().context("creating data dir")?;

    match cli.command {
        Command::Start(args) => start(args).await,
        Command::GenerateToken {
            user,
            agent,
            ttl_hours,
        } => {
            let secret = secret::load_or_create(&paths::gateway_key_path())?;
            let auth = Authenticator::new(&secret, None);
            let token = auth.issue_gateway_token(&user, agent, ttl_hours.saturating_mul(3600))?;
            println!("{token}");
            Ok(())
        }
    }
}

async fn start(args: StartArgs) -> anyhow::Result<()> {
    let logging = logging::init_logging(&LogSettings::from_env(&paths::log_dir()))?;
    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %paths::data_dir().display(),
        bind = %args.bind,
        "Starting toolrelay server"
    );

    let secret = secret::load_or_create(&paths::gateway_key_path())?;
    let jwks = args.jwks_url.clone().map(|url| {
        JwksVerifier::new(url, args.jwt_issuer.clone(), args.jwt_audience.clone())
    });
    if jwks.is_none() {
        info!(
            component = "server",
            event = "server.jwks_disabled",
            "No JWKS URL configured; only gateway tokens are accepted"
        );
    }

    let config = ServerConfig::from(&args);
    let state = AppState {
        sessions: Arc::new(SessionRegistry::new()),
        auth: Arc::new(Authenticator::new(&secret, jwks)),
        chats: Arc::new(InMemoryChatStore::new()),
        streams: Arc::new(StreamStore::new()),
        model: Arc::new(EchoModel),
        limiter: Arc::new(RateLimiter::per_minute(config.rate_limit_per_minute)),
        config: Arc::new(config),
    };

    tokio::spawn(housekeeping(state.clone()));

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!(
        component = "server",
        event = "server.listening",
        addr = %args.bind,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(component = "server", event = "server.stopped", "Server stopped");
    Ok(())
}

/// Recycle idle sessions and expire finished streams.
async fn housekeeping(state: AppState) {
    let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let reaped = state.sessions.reap_idle();
        let swept = state.streams.sweep();
        state.limiter.prune();
        if reaped > 0 || swept > 0 {
            info!(
                component = "server",
                event = "server.housekeeping",
                sessions_reaped = reaped,
                sessions_live = state.sessions.len(),
                streams_swept = swept,
                streams_live = state.streams.len(),
            );
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(
            component = "server",
            event = "server.signal_failed",
            error = %e,
            "Failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
    info!(
        component = "server",
        event = "server.shutdown_requested",
        "Shutdown requested"
    );
}
