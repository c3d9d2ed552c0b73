use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a tenant's WAL once it has grown by
/// `threshold` appends since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if compact_if_due(&engine, threshold).await {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        }
    }
}

/// One compactor step. Returns whether a compaction ran and succeeded.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use ulid::Ulid;

    use crate::model::NewReservation;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("staybook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let engine = Engine::new(test_wal_path("threshold.wal")).unwrap();
        let pid = Ulid::new();
        engine.create_property(pid, None, None).await.unwrap();

        assert!(!compact_if_due(&engine, 3).await);

        for day in [1, 5] {
            let id = Ulid::new();
            engine
                .request_reservation(NewReservation {
                    id,
                    property_id: pid,
                    check_in: NaiveDate::from_ymd_opt(2024, 8, day).unwrap(),
                    check_out: NaiveDate::from_ymd_opt(2024, 8, day + 2).unwrap(),
                    guest_count: 1,
                    email: "guest@example.com".into(),
                    total_price: 10_000,
                    special_requests: None,
                })
                .await
                .unwrap();
            engine.delete_reservation(id).await.unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact().await, 5);

        assert!(compact_if_due(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.list_properties().await.len(), 1);
        assert!(engine.list_reservations(Some(pid), None).await.is_empty());
    }
}
