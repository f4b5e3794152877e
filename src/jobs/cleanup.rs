//! Periodically prunes traces older than the configured retention window
//! (spec §4.4, "Retention"). Runs on a fixed interval for the lifetime of
//! the process; failures are logged and retried on the next tick rather than
//! aborting the task.

use std::sync::Arc;
use std::time::Duration;

use crate::trace_store::TraceStore;

pub fn spawn(store: Arc<TraceStore>, retention_days: i64, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match store.prune_older_than(retention_days).await {
                Ok(count) if count > 0 => {
                    tracing::info!(count, retention_days, "pruned expired traces");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "trace retention sweep failed");
                }
            }
        }
    });
}
