//! iRobot server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use irobot_core::config::AppConfig;
use irobot_precache::Precache;
use irobot_precache::upstream::FilesystemUpstream;
use irobot_server::auth::AuthChain;
use irobot_server::{AppState, create_router};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// iRobot - data-object brokerage between an upstream store and HTTP clients
#[derive(Parser, Debug)]
#[command(name = "irobotd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "IROBOT_CONFIG", default_value = "irobot.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("iRobot v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration (file is optional, env vars can provide/override everything)
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::debug!("no config file found at {}", args.config);
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("IROBOT_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    if let Err(error) = config.validate() {
        anyhow::bail!("invalid configuration: {error}");
    }

    // Upstream gateway (filesystem reference backend)
    let upstream = Arc::new(FilesystemUpstream::new(&config.upstream.location));

    // Precache: opens and repairs the tracking index, reconciles the disk
    let precache = Precache::start(
        config.precache.clone(),
        upstream,
        config.upstream.max_connections,
    )
    .await
    .context("failed to start precache")?;
    tracing::info!("precache ready");

    let auth = AuthChain::from_config(&config.httpd).context("failed to build auth chain")?;
    if auth.is_enabled() {
        tracing::info!(handlers = ?config.httpd.authentication, "authentication enabled");
    } else {
        tracing::warn!("no authentication configured, open access");
    }

    let bind = format!("{}:{}", config.httpd.bind_address, config.httpd.listen);
    let state = AppState::new(config, precache.clone(), auth);
    let router = create_router(state);

    let addr: SocketAddr = bind.parse().context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(precache))
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal(precache: Precache) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutting down");
    precache.shutdown().await;
}
