//! Marks nodes offline when the engine stops reporting them.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::db::{AuditRecord, Store};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct PresenceMonitor {
    store: Arc<Store>,
    stale_after: Duration,
}

impl PresenceMonitor {
    pub fn new(store: Arc<Store>, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    /// Start the sweep background task.
    pub fn start(self: Arc<Self>, mut stop_rx: broadcast::Receiver<()>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL.min(self.stale_after));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        let monitor = self.clone();
                        match tokio::task::spawn_blocking(move || monitor.sweep()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => tracing::error!("PresenceMonitor: sweep failed: {}", e),
                            Err(e) => tracing::error!("PresenceMonitor: sweep task panicked: {}", e),
                        }
                    }
                }
            }
        });
    }

    /// Mark stale nodes offline. Returns the names that changed.
    pub fn sweep(&self) -> crate::error::Result<Vec<String>> {
        let stale = ChronoDuration::from_std(self.stale_after).unwrap_or(ChronoDuration::minutes(5));
        let secs = self.stale_after.as_secs();
        let names = self.store.mark_stale_nodes(Utc::now() - stale, |name| {
            AuditRecord::info(
                "nodes",
                "system",
                "offline",
                format!("node '{}' marked offline after {}s without a report", name, secs),
            )
        })?;
        for name in &names {
            tracing::info!("PresenceMonitor: node {} went offline (no report for {:?})", name, self.stale_after);
        }
        Ok(names)
    }
}
