use std::fmt::Display;
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{error, Instrument};

/// Run a side effect in the background. Failures are logged, never returned.
pub fn spawn_detached<F, E>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let span = tracing::info_span!("detached", task = name);
    tokio::spawn(
        async move {
            if let Err(e) = future.await {
                error!(task = name, error = %e, "Background task failed");
                metrics::counter!("ingestion.detached.failed", "task" => name).increment(1);
            }
        }
        .instrument(span),
    )
}
