// Vaulthalla daemon entry point

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use vaulthalla_config::{default_config_path, Config, TEST_MODE_ENV};
use vaulthalla_core::service::ServiceHandle;
use vaulthalla_daemon::ctl::CtlServer;
use vaulthalla_daemon::{ws, Runtime};
use vaulthalla_store::MemoryStore;

fn config_path_from_args() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        }
    }
    default_config_path()
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format.as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = config_path_from_args();
    let config = Config::load(&config_path)
        .with_context(|| format!("loading configuration from {config_path:?}"))?;
    init_tracing(&config);
    tracing::info!(config = ?config_path, "vaulthalla starting");

    let test_mode = std::env::var(TEST_MODE_ENV).map(|v| v == "1").unwrap_or(false);
    let runtime = if test_mode {
        tracing::warn!("TEST_MODE: state relocated to a sandbox, using the in-memory store");
        Runtime::build_with_store(config.clone(), Arc::new(MemoryStore::new())).await?
    } else {
        Runtime::build(config.clone()).await?
    };

    runtime.start_services().await;
    runtime
        .register_service(ServiceHandle::start(Arc::new(CtlServer::new(Arc::clone(&runtime)))))
        .await;

    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    tracing::info!(listen = %config.server.listen, "front end listening");

    let app = ws::router(Arc::clone(&runtime));
    tokio::select! {
        served = axum::serve(listener, app) => {
            if let Err(e) = served {
                tracing::error!(error = %e, "front end server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    runtime.shutdown().await;
    Ok(())
}
