use anyhow::{Context, Result};
use fabspace_ingestion::config::Config;
use fabspace_ingestion::service::ServiceSettings;
use fabspace_ingestion::worker::WorkerSettings;
use fabspace_ingestion::{
    start_api_server, AppState, IngestionService, IngestionWorker, PgJobStore, PgQuickQuotes,
    S3ObjectStore,
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
        bucket = %config.s3.bucket,
        "Starting Fabspace Ingestion Service"
    );

    init_metrics(config.service.metrics_port)?;

    let job_store = Arc::new(
        PgJobStore::new(&config.database)
            .await
            .context("Failed to initialize job store")?,
    );

    if config.database.run_migrations {
        job_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let object_store = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize S3 object store")?,
    );

    let quick_quotes = Arc::new(PgQuickQuotes::new(job_store.pool().clone()));

    let worker = Arc::new(
        IngestionWorker::new(
            job_store.clone(),
            object_store.clone(),
            quick_quotes,
            WorkerSettings {
                kms_key_id: config.s3.kms_key_id.clone(),
                partner_api_token: config.ingestion.partner_api_token.clone(),
                download_timeout: config.ingestion.download_timeout(),
            },
        )
        .context("Failed to initialize ingestion worker")?,
    );

    let service = Arc::new(IngestionService::new(
        job_store,
        object_store,
        worker,
        ServiceSettings {
            kms_key_id: config.s3.kms_key_id.clone(),
            signed_url_ttl: config.signed_url_ttl(),
            max_stage_mb: config.ingestion.max_stage_mb,
        },
    ));

    let api_state = AppState { service };

    info!("Ingestion service started successfully");

    if let Err(e) = start_api_server(api_state, &config.api, shutdown_signal()).await {
        error!(error = %e, "API server error");
        return Err(e);
    }

    info!("Ingestion service stopped");

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

    info!("Shutting down ingestion service");
}
