//! lxcterm - browser terminals for LXC containers
//!
//! Serves a small control-plane API for `lxc-*` commands. Attaching a
//! container spawns `lxc-attach` under a pty and exposes it on a dedicated
//! port, where any number of WebSocket viewers share the same terminal.

use clap::Parser as ClapParser;
use lxcterm::{
    api,
    config::{parse_port_range, Config, ConfigError},
    lxc::Lxc,
    reaper::Reaper,
    registry::SessionRegistry,
    server,
    tls::{self, TlsError},
};
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// lxcterm - browser terminals for LXC containers
#[derive(ClapParser, Debug)]
#[command(name = "lxcterm", version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/lxcterm/config.toml)
    #[arg(long, env = "LXCTERM_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the control-plane API
    #[arg(long, env = "LXCTERM_BIND")]
    bind: Option<SocketAddr>,

    /// Session port range, e.g. 8001-8999
    #[arg(long, env = "LXCTERM_PORT_RANGE", value_parser = parse_port_range)]
    port_range: Option<RangeInclusive<u16>>,

    /// TLS certificate chain (PEM)
    #[arg(long, env = "LXCTERM_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "LXCTERM_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Require client certificates signed by this CA bundle (PEM)
    #[arg(long, env = "LXCTERM_TLS_CLIENT_CA")]
    tls_client_ca: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum LxctermError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("tls error: {0}")]
    Tls(#[from] TlsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), LxctermError> {
    init_tracing();
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    run(config).await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "lxcterm=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the config file (if any) and apply command-line overrides.
fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let path = cli.config.clone().or_else(Config::default_path);
    let mut config = match path.as_deref().map(Config::load).transpose()?.flatten() {
        Some(config) => {
            if let Some(path) = &path {
                tracing::info!(path = %path.display(), "loaded config");
            }
            config
        }
        None => {
            if let Some(path) = &cli.config {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
            }
            Config::default()
        }
    };

    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(range) = &cli.port_range {
        config.sessions.port_start = *range.start();
        config.sessions.port_end = *range.end();
    }
    if let Some(cert) = &cli.tls_cert {
        config.tls.cert = Some(cert.clone());
    }
    if let Some(key) = &cli.tls_key {
        config.tls.key = Some(key.clone());
    }
    if let Some(ca) = &cli.tls_client_ca {
        config.tls.client_ca = Some(ca.clone());
    }

    config.validate()?;
    Ok(config)
}

async fn run(config: Config) -> Result<(), LxctermError> {
    tracing::info!("lxcterm starting");

    let sessions = SessionRegistry::new(
        config.session_options(),
        config.port_range(),
        Reaper::from_strategy(config.reaper.strategy),
    );
    let state = api::AppState {
        sessions: sessions.clone(),
        lxc: Arc::new(Lxc::new(config.lxc.bin_dir.clone())),
    };
    let app = api::router(state);

    let acceptor = match (&config.tls.cert, &config.tls.key) {
        (Some(cert), Some(key)) => {
            let acceptor =
                tls::load_tls_config(cert, key, config.tls.client_ca.as_deref())?;
            tracing::info!(
                client_auth = config.tls.client_ca.is_some(),
                "TLS enabled"
            );
            Some(acceptor)
        }
        _ => None,
    };

    let listener = tokio::net::TcpListener::bind(config.server.bind).await?;
    tracing::info!(
        addr = %config.server.bind,
        ports = ?config.port_range(),
        "control-plane API listening"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    let result = server::serve(listener, app, acceptor, shutdown).await;

    sessions.drain().await;
    tracing::info!("lxcterm stopped");
    result.map_err(LxctermError::from)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
