//! Single-flight refresh of the supplier metrics view.
//!
//! Every applied lookup asks for a refresh, so a busy stream produces far
//! more requests than the database should see. Requests made while a refresh
//! is running collapse into one follow-up refresh.

use crate::error::Result;
use crate::store::BomStore;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct MetricsRefresher {
    store: Arc<dyn BomStore>,
    pending: Notify,
    running: Mutex<()>,
}

impl MetricsRefresher {
    /// Create the refresher and start its background loop
    pub fn spawn(store: Arc<dyn BomStore>) -> (Arc<Self>, JoinHandle<()>) {
        let refresher = Arc::new(Self {
            store,
            pending: Notify::new(),
            running: Mutex::new(()),
        });

        let worker = Arc::clone(&refresher);
        let handle = tokio::spawn(async move {
            loop {
                worker.pending.notified().await;
                if let Err(e) = worker.refresh_now().await {
                    warn!(error = %e, "Supplier metrics refresh failed");
                }
            }
        });

        (refresher, handle)
    }

    /// Ask for a refresh without waiting for it
    pub fn request(&self) {
        // At most one stored permit, so bursts coalesce
        self.pending.notify_one();
    }

    /// Refresh and wait, serialised with background refreshes
    pub async fn refresh_now(&self) -> Result<()> {
        let _running = self.running.lock().await;

        self.store.refresh_metrics().await?;

        metrics::counter!("bom.view.refreshes").increment(1);
        debug!("Supplier metrics view refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBomStore;
    use std::time::Duration;

    async fn wait_for_refreshes(store: &MemoryBomStore, at_least: usize) {
        for _ in 0..200 {
            if store.refresh_count() >= at_least {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("refresh never ran");
    }

    #[tokio::test]
    async fn test_requests_coalesce() {
        let store = Arc::new(MemoryBomStore::new());
        let (refresher, handle) = MetricsRefresher::spawn(store.clone());

        for _ in 0..50 {
            refresher.request();
        }
        wait_for_refreshes(&store, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.refresh_count() <= 2, "got {}", store.refresh_count());

        let before = store.refresh_count();
        refresher.request();
        wait_for_refreshes(&store, before + 1).await;

        handle.abort();
    }

    #[tokio::test]
    async fn test_refresh_now_waits() {
        let store = Arc::new(MemoryBomStore::new());
        let (refresher, handle) = MetricsRefresher::spawn(store.clone());

        tokio_test::assert_ok!(refresher.refresh_now().await);
        assert_eq!(store.refresh_count(), 1);

        handle.abort();
    }
}
