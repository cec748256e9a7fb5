use std::fmt::Display;
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{error, Instrument};

/// Spawn work that must finish even if the caller goes away. Errors are logged.
pub fn spawn_detached<F, E>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(
        async move {
            if let Err(e) = future.await {
                error!(task = name, error = %e, "Detached task failed");
                metrics::counter!("bom.detached.failed", "task" => name).increment(1);
            }
        }
        .instrument(tracing::info_span!("detached", task = name)),
    )
}
