//! Periodic retention sweep.
//!
//! Runs outside the hot path as its own supervised `tokio::task`, the way
//! the other background loops (health, adjuster) are spawned and owned by
//! the façade. Purges are bounded-batch and idempotent, delegated entirely
//! to [`Persistence::purge_retention`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RetentionConfig;
use crate::store::Persistence;

/// Spawn the retention sweep loop. Ticks every `interval_ms`, purging rows
/// older than `retention`'s configured windows in batches of `batch_size`.
pub fn spawn_retention_loop(
    persistence: Arc<Persistence>,
    retention: RetentionConfig,
    interval_ms: u64,
    batch_size: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        loop {
            ticker.tick().await;
            match persistence
                .purge_retention(
                    retention.completed_tasks_days,
                    retention.heartbeat_days,
                    retention.metrics_days,
                    batch_size,
                )
                .await
            {
                Ok(removed) if removed > 0 => {
                    info!(removed, "retention sweep purged rows");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "retention sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SchemaManager;
    use sqlx::SqlitePool;

    #[tokio::test]
    async fn retention_loop_runs_without_error_on_empty_store() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let schema = SchemaManager::from_pool(pool.clone());
        schema.initialize_schema().await.unwrap();
        let persistence = Arc::new(Persistence::new(pool));

        let handle = spawn_retention_loop(persistence, RetentionConfig::default(), 10, 50);
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }
}
