use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};

const CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Background task that rewrites a tenant's WAL once enough appends have
/// piled up since the last compaction. A threshold of 0 disables it.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    if threshold == 0 {
        debug!("WAL compaction disabled");
        return;
    }
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

/// Compact when the append count reached `threshold`. Returns whether it ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!(appends, "compacted WAL");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("availd_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone()).unwrap();

        let rid = Ulid::new();
        engine
            .create_resource(rid, Some("Stage deck".into()), TrackType::Bulk, 10)
            .await
            .unwrap();
        assert!(!compact_if_due(&engine, 5).await.unwrap());

        let event = Ulid::new();
        for _ in 0..3 {
            engine.delete_reservations_for_event(event).await.unwrap();
            engine
                .insert_reservation(crate::engine::NewReservation {
                    id: Ulid::new(),
                    event_id: event,
                    resource_id: rid,
                    quantity: 2,
                    window: DateWindow::new(
                        "2024-05-01".parse().unwrap(),
                        "2024-05-03".parse().unwrap(),
                    ),
                })
                .await
                .unwrap();
        }
        assert!(engine.wal_appends_since_compact().await >= 5);

        assert!(compact_if_due(&engine, 5).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // Only the surviving state is left in the log.
        let replayed = crate::wal::Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
    }
}
