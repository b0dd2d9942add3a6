//! quarryd binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use quarry_core::config::AppConfig;
use quarry_server::maintenance::{shutdown, spawn_background_tasks};
use quarry_server::{build_state, create_router};
use std::net::SocketAddr;
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// quarry - distributed build artifact cache node
#[derive(Parser, Debug)]
#[command(name = "quarryd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "QUARRY_CONFIG",
        default_value = "config/quarryd.toml"
    )]
    config: String,
}

/// Load configuration from an optional TOML file overlaid with `QUARRY_`
/// environment variables (`__` separates nested keys).
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::info!(config_path = %path, "No config file found, using defaults and environment");
    }

    figment
        .merge(Env::prefixed("QUARRY_").split("__").ignore(&["config"]))
        .extract()
        .context("failed to load configuration")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
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

    tracing::info!("quarryd v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    quarry_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    let state = build_state(config).await?;
    let tasks = spawn_background_tasks(&state);
    tracing::info!(tasks = tasks.len(), "maintenance loops spawned");

    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown(&state, tasks).await.context("shutdown failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::config::LocationBackendConfig;

    #[test]
    fn test_load_config_from_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("quarryd.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind = "0.0.0.0:9000"
advertised_location = "node-3:9000"
cluster_epoch = "2024-06"

[location_store]
garbage_collection_interval_secs = 60

[location_store.backend]
type = "memory"

[copy]
max_client_count = 8
"#,
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.server.advertised_location, "node-3:9000");
        assert_eq!(config.location_store.garbage_collection_interval_secs, 60);
        assert!(matches!(
            config.location_store.backend,
            LocationBackendConfig::Memory
        ));
        assert_eq!(config.copy.max_client_count, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("absent.toml");
        let config = load_config(path.to_str().unwrap()).unwrap();
        assert!(config.server.metrics_enabled);
        assert!(config.validate().is_ok());
    }
}
