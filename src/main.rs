//! Stackfall server binary: the WebSocket match server and the run API in
//! one process.
//!
//! # Usage
//!
//! ```bash
//! # In-memory runs (development)
//! RUN_TOKEN_SECRET=dev stackfall-server
//!
//! # Durable runs, custom ports
//! stackfall-server --run-token-secret "$SECRET" \
//!     --ws-bind 0.0.0.0:9000 --http-bind 0.0.0.0:9001 --store-path runs.redb
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use stackfall_server::config::{
    ServerConfig, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_HTTP_BIND, DEFAULT_WS_BIND,
};
use stackfall_server::connection::DEFAULT_OUTBOUND_CAPACITY;
use stackfall_server::http::{self, TrustedHeaderIdentity};
use stackfall_server::verifier::DEFAULT_MAX_STATE_BYTES;
use stackfall_server::{
    MatchCoordinator, MatchServer, MemoryRunStore, RedbRunStore, RunStore, RunTokenSigner,
    RunVerifier,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Stackfall match coordinator and run verifier
#[derive(Parser, Debug)]
#[command(name = "stackfall-server")]
#[command(about = "Match coordinator and run integrity verifier for Stackfall")]
#[command(version)]
struct Args {
    /// Address of the WebSocket match server
    #[arg(long, default_value_t = DEFAULT_WS_BIND)]
    ws_bind: SocketAddr,

    /// Address of the run API
    #[arg(long, default_value_t = DEFAULT_HTTP_BIND)]
    http_bind: SocketAddr,

    /// HMAC secret for run tokens
    #[arg(long, env = "RUN_TOKEN_SECRET", hide_env_values = true)]
    run_token_secret: String,

    /// Per-connection outbound queue capacity
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    outbound_queue_capacity: usize,

    /// WebSocket handshake timeout in seconds
    #[arg(long, default_value_t = DEFAULT_HANDSHAKE_TIMEOUT.as_secs())]
    handshake_timeout_secs: u64,

    /// Maximum serialized size of a run's initial state, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_STATE_BYTES)]
    max_state_bytes: usize,

    /// redb database file for runs (in-memory when omitted)
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Header carrying the verified user id
    #[arg(long, default_value = http::USER_ID_HEADER)]
    user_id_header: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(self.run_token_secret.clone())
            .with_ws_bind(self.ws_bind)
            .with_http_bind(self.http_bind)
            .with_outbound_queue_capacity(self.outbound_queue_capacity)
            .with_handshake_timeout(Duration::from_secs(self.handshake_timeout_secs))
            .with_max_state_bytes(self.max_state_bytes);
        if let Some(path) = &self.store_path {
            config = config.with_store_path(path);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = args.config();
    config.validate()?;
    tracing::info!(?config, "Stackfall server starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown = move || {
        let mut rx = shutdown_rx.clone();
        async move {
            let _ = rx.wait_for(|stop| *stop).await;
        }
    };

    let match_server = MatchServer::bind(
        config.ws_bind,
        MatchCoordinator::new(),
        config.session_settings(),
    )
    .await?;
    tracing::info!("Match server bound to {}", match_server.local_addr()?);
    let matches = tokio::spawn(match_server.run_until(shutdown()));

    let signer = RunTokenSigner::new(config.run_token_secret.clone());
    let identity = TrustedHeaderIdentity::new(args.user_id_header);
    let listener = TcpListener::bind(config.http_bind).await?;
    let runs = match &config.store_path {
        Some(path) => {
            let store = RedbRunStore::open(path).await?;
            tokio::spawn(serve_runs(listener, store, signer, &config, identity, shutdown()))
        }
        None => {
            tracing::warn!("No --store-path given - runs are kept in memory only");
            tokio::spawn(serve_runs(
                listener,
                MemoryRunStore::new(),
                signer,
                &config,
                identity,
                shutdown(),
            ))
        }
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    matches.await?;
    runs.await??;
    Ok(())
}

fn serve_runs<S: RunStore>(
    listener: TcpListener,
    store: S,
    signer: RunTokenSigner,
    config: &ServerConfig,
    identity: TrustedHeaderIdentity,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> impl std::future::Future<Output = std::io::Result<()>> + Send + 'static {
    let verifier = RunVerifier::new(store, signer).with_max_state_bytes(config.max_state_bytes);
    let router = http::router(verifier, identity);
    http::serve(listener, router, shutdown)
}
