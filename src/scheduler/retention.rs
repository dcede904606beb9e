//! Retention manager for cleaning up old telemetry.

use crate::db::TelemetryStore;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Deletes telemetry that has aged past the retention period.
pub struct RetentionManager {
    store: TelemetryStore,
    retention: Duration,
}

impl RetentionManager {
    pub fn new(store: TelemetryStore, retention: Duration) -> Self {
        Self { store, retention }
    }

    /// Start the retention manager background task.
    pub fn start(self: Arc<Self>, mut stop_rx: broadcast::Receiver<()>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        let manager = self.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || manager.process_retention()).await {
                            tracing::error!("RetentionManager: task panicked: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Run one retention pass. Returns the number of rows removed.
    pub fn process_retention(&self) -> usize {
        let retention = ChronoDuration::from_std(self.retention).unwrap_or(ChronoDuration::days(30));
        let cutoff = Utc::now() - retention;

        match self.store.delete_before(cutoff) {
            Ok(0) => 0,
            Ok(removed) => {
                tracing::info!("RetentionManager: removed {} telemetry rows older than {}", removed, cutoff);
                removed
            }
            Err(e) => {
                tracing::error!("RetentionManager: Failed to delete telemetry before {}: {}", cutoff, e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{EntityRef, TelemetryFact, TrafficSample};
    use tempfile::NamedTempFile;

    #[test]
    fn test_old_samples_are_removed() {
        let tmp = NamedTempFile::new().unwrap();
        let store = TelemetryStore::open(tmp.path()).unwrap();
        let now = Utc::now();
        let sample = |age: ChronoDuration| {
            TelemetryFact::Traffic(TrafficSample {
                entity: EntityRef::mapping(1),
                timestamp: now - age,
                bytes_in: 1,
                bytes_out: 1,
            })
        };
        store
            .append_batch(&[
                sample(ChronoDuration::days(40)),
                sample(ChronoDuration::days(31)),
                sample(ChronoDuration::days(2)),
            ])
            .unwrap();

        let manager = RetentionManager::new(store.clone(), Duration::from_secs(30 * 86400));
        assert_eq!(manager.process_retention(), 2);
        assert_eq!(manager.process_retention(), 0);

        let (bytes_in, _) = store
            .traffic_total(crate::db::EntityKind::Mapping, now - ChronoDuration::days(365))
            .unwrap();
        assert_eq!(bytes_in, 1);
    }
}
