use anyhow::{Context, Result};
use fabspace_bom::config::Config;
use fabspace_bom::{
    start_api_server, AppState, BomCheckerClient, BomService, MetricsRefresher, PgBomStore,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        checker = %config.checker.base_url,
        "Starting Fabspace BOM Service"
    );

    init_metrics(config.service.metrics_port)?;

    let store = Arc::new(
        PgBomStore::new(&config.database)
            .await
            .context("Failed to initialize BOM store")?,
    );

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let checker =
        BomCheckerClient::new(&config.checker).context("Failed to initialize BOM checker client")?;

    let (refresher, refresh_task) = MetricsRefresher::spawn(store.clone());

    let service = Arc::new(BomService::new(
        store,
        checker,
        refresher,
        config.checker.stream_idle(),
    ));

    let api_state = AppState { service };

    info!("BOM service started successfully");

    let served = start_api_server(api_state, &config.api, shutdown_signal()).await;
    refresh_task.abort();

    if let Err(e) = served {
        error!(error = %e, "API server error");
        return Err(e);
    }

    info!("BOM service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }

    info!("Shutting down BOM service");
}
