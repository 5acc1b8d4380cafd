use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wavehub::app::manager::AppManager;
use wavehub::app::memory_manager::MemoryAppManager;
use wavehub::handler::ConnectionHandler;
use wavehub::http_handler::build_router;
use wavehub::hub::Hub;
use wavehub::metrics::Metrics;
use wavehub::options::ServerOptions;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "wavehub", version, about)]
struct Args {
    /// Path to the JSON config file (default: config.json)
    #[arg(long)]
    config: Option<String>,

    /// Listen host, overrides the config file
    #[arg(long)]
    host: Option<String>,

    /// Listen port, overrides the config file
    #[arg(long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .or_else(|| std::env::var("WAVEHUB_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());

    // Logging is not up yet (the debug flag may come from the file), so
    // remember the outcome and report it below.
    let (mut options, config_error) = match ServerOptions::from_file(&config_path) {
        Ok(options) => (options, None),
        Err(e) => (ServerOptions::default(), Some(e.to_string())),
    };

    if let Some(host) = args.host {
        options.host = host;
    }
    let port_override = args
        .port
        .or_else(|| std::env::var("WAVEHUB_PORT").ok().and_then(|p| p.parse().ok()));
    if let Some(port) = port_override {
        options.port = port;
    }
    if args.debug {
        options.debug = true;
    }

    let default_filter = if options.debug {
        "wavehub=debug,info"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match &config_error {
        None => info!(config = %config_path, "configuration loaded"),
        Some(e) => warn!(config = %config_path, "config not loaded ({e}), using defaults"),
    }

    let metrics = match Metrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            error!("failed to initialize metrics: {e}");
            std::process::exit(1);
        }
    };

    let app_manager = Arc::new(MemoryAppManager::new(options.apps.clone()));
    let app_count = app_manager.count().await.unwrap_or(0);
    if app_count == 0 {
        warn!("no applications configured, every connection will be refused");
    }
    metrics.apps_loaded.set(app_count as i64);
    info!(apps = app_count, "applications loaded");

    let hub = Arc::new(Hub::new(options.max_connections, metrics.clone()));
    let grace = Duration::from_secs(options.shutdown_grace_period);
    let handler = Arc::new(ConnectionHandler::new(
        app_manager,
        hub.clone(),
        metrics,
        options.clone(),
    ));
    let router = build_router(handler);

    let addr = format!("{}:{}", options.host, options.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, "failed to bind listener: {e}");
            std::process::exit(1);
        }
    };
    info!(%addr, "wavehub listening");

    let server = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!("server error: {e}");
    }

    info!("shutting down connections");
    hub.shutdown(grace).await;
    info!("server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
