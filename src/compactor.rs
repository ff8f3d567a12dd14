use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::store::MemoryStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once `threshold` appends have piled up.
pub async fn run_compactor(store: Arc<MemoryStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// One compactor pass. Returns whether the WAL was rewritten.
pub async fn compact_if_due(store: &MemoryStore, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact_wal().await {
        Ok(()) => {
            info!("compaction after {appends} appends");
            true
        }
        Err(e) => {
            warn!("compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("vaxslot_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn site(name: &str) -> Site {
        Site {
            id: Ulid::new(),
            name: name.into(),
            active: true,
            enabled_for_reschedule: false,
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = MemoryStore::open(path.clone()).unwrap();

        let s = site("Centro");
        let site_id = s.id;
        store.create_site(s).await.unwrap();
        let base = 1_788_480_000_000;
        for i in 0..4 {
            let start = base + i * 10 * MINUTE;
            store
                .create_slot(Ulid::new(), site_id, Span::new(start, start + 10 * MINUTE), false)
                .await
                .unwrap();
        }
        assert_eq!(store.wal_appends_since_compact().await, 5);

        assert!(!compact_if_due(&store, 10).await);
        assert!(compact_if_due(&store, 5).await);
        assert_eq!(store.wal_appends_since_compact().await, 0);

        drop(store);
        let reopened = MemoryStore::open(path).unwrap();
        assert_eq!(reopened.list_slots(site_id).await.len(), 4);
    }
}
