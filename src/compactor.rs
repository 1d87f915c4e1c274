use std::sync::Weak;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::store::Store;

pub const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a business's WAL once `threshold` appends
/// have accumulated since the last compaction. Exits when the store is gone.
pub async fn run_compactor(store: Weak<Store>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(store) = store.upgrade() else {
            return;
        };
        compact_if_needed(&store, threshold).await;
    }
}

/// Returns true if a compaction ran and succeeded.
pub async fn compact_if_needed(store: &Store, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    let started = std::time::Instant::now();
    match store.compact_wal().await {
        Ok(()) => {
            info!(
                business = %store.business_id(),
                appends,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "WAL compacted"
            );
            true
        }
        Err(e) => {
            error!(business = %store.business_id(), "WAL compaction failed: {e}");
            debug!(appends, threshold, "compaction will be retried next tick");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("chatbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let b = business("salon");
        let store = Store::open(b.id.clone(), path).unwrap();

        let first = booking(&b, date(2026, 3, 2), hm(9, 0), 30);
        store.insert_booking(first.clone()).await.unwrap();
        assert!(!compact_if_needed(&store, 3).await);

        for hour in [10, 11] {
            store
                .move_booking(first.id, date(2026, 3, 2), hm(hour, 0))
                .await
                .unwrap();
        }
        assert!(compact_if_needed(&store, 3).await);
        assert_eq!(store.wal_appends_since_compact().await, 0);
    }

    #[tokio::test]
    async fn exits_when_store_dropped() {
        let path = test_wal_path("exits.wal");
        let store = Arc::new(Store::open(business("salon").id, path).unwrap());
        let weak = Arc::downgrade(&store);
        drop(store);

        let handle = tokio::spawn(run_compactor(weak, 1, Duration::from_millis(10)));
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("compactor should stop")
            .unwrap();
    }
}
