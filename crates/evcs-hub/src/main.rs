mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use evcs_api::{AppState, create_app};
use evcs_engine::{Engine, StaticPriceSignal};
use evcs_link::StationServer;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::HubConfig;

/// Command line arguments for the charging hub
#[derive(Parser, Debug)]
#[command(name = "evcs-hub")]
#[command(about = "Load-sharing hub for EV charging stations")]
struct Args {
    /// Path to the hub configuration JSON file
    #[arg(short, long)]
    config: PathBuf,

    /// Port the stations connect to, overrides the config file
    #[arg(long)]
    station_port: Option<u16>,

    /// Port of the HTTP API, overrides the config file
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut config = HubConfig::load(&args.config).await?;
    if let Some(port) = args.station_port {
        config.station_port = port;
    }
    if let Some(port) = args.port {
        config.api_port = port;
    }
    info!(
        config = %args.config.display(),
        chargers = config.ev.chargers.len(),
        power_connections = config.ev.power_connections.len(),
        "Loaded hub config"
    );

    let price = Arc::new(StaticPriceSignal::new(config.price_acceptable));
    let engine = Arc::new(Engine::new(config.ev.clone(), price.clone())?);
    let shutdown = CancellationToken::new();

    let stations = StationServer::bind(
        ("0.0.0.0", config.station_port),
        engine.clone(),
        config.link_settings(),
    )
    .await
    .with_context(|| format!("Failed to bind station port {}", config.station_port))?;
    let station_task = tokio::spawn(stations.run(shutdown.clone()));

    tokio::spawn(reload_on_hangup(args.config.clone(), engine.clone()));

    let app = create_app(AppState { engine, price });
    let bind_addr = format!("0.0.0.0:{}", config.api_port);
    info!("Starting API server on {}", bind_addr);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await;
    shutdown.cancel();
    if let Err(error) = &served {
        error!(%error, "API server failed");
    }

    match station_task.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => error!(%error, "Station server failed"),
        Err(error) => error!(%error, "Station server task panicked"),
    }
    served.context("API server error")?;
    Ok(())
}

/// Re-read the config file on SIGHUP and swap in its EV settings.
#[cfg(unix)]
async fn reload_on_hangup(path: PathBuf, engine: Arc<Engine>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(error) => {
            warn!(%error, "Failed to install SIGHUP handler, settings reload disabled");
            return;
        }
    };
    while hangup.recv().await.is_some() {
        if let Err(error) = reload(&path, &engine).await {
            warn!(error = format!("{error:#}"), "Settings reload failed, keeping current settings");
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_path: PathBuf, _engine: Arc<Engine>) {}

async fn reload(path: &Path, engine: &Engine) -> anyhow::Result<()> {
    let config = HubConfig::load(path).await?;
    engine.replace_settings(config.ev)?;
    info!(config = %path.display(), "Settings reloaded");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
            _ = shutdown.cancelled() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = shutdown.cancelled() => {},
        }
    }
    info!("Shutting down");
    shutdown.cancel();
}

async fn ctrl_c() {
    if let Err(error) = signal::ctrl_c().await {
        warn!(%error, "Failed to install Ctrl+C handler");
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(error) => warn!(%error, "Failed to install SIGTERM handler"),
    }
}
