//! Background tasks: engine event pump, node presence sweep and telemetry
//! retention.

mod events;
mod presence;
mod retention;

pub use events::*;
pub use presence::*;
pub use retention::*;

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::engine::{Capabilities, Engine};

/// Intervals the scheduler runs on.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Engine poll period when no subscription is available.
    pub poll_interval: Duration,
    /// Nodes without a report for this long are marked offline.
    pub node_stale: Duration,
    /// Telemetry older than this is deleted.
    pub retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            node_stale: Duration::from_secs(300),
            retention: Duration::from_secs(30 * 86400),
        }
    }
}

pub struct Scheduler {
    engine: Arc<dyn Engine>,
    dispatcher: EventDispatcher,
    presence: Arc<PresenceMonitor>,
    retention: Arc<RetentionManager>,
    config: SchedulerConfig,
    stop: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<dyn Engine>,
        dispatcher: EventDispatcher,
        presence: PresenceMonitor,
        retention: RetentionManager,
        config: SchedulerConfig,
    ) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            engine,
            dispatcher,
            presence: Arc::new(presence),
            retention: Arc::new(retention),
            config,
            stop,
        }
    }

    /// Spawn the background tasks.
    pub fn start(&self) {
        tracing::info!(
            "Starting scheduler (poll {:?}, stale after {:?}, retention {:?})",
            self.config.poll_interval,
            self.config.node_stale,
            self.config.retention
        );

        tokio::spawn(run_event_pump(
            self.engine.clone(),
            self.dispatcher.clone(),
            self.config.poll_interval,
            self.stop.subscribe(),
        ));
        self.presence.clone().start(self.stop.subscribe());
        self.retention.clone().start(self.stop.subscribe());
    }

    /// Stop every background task.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }
}

/// Feed engine events to the dispatcher until stopped.
///
/// Prefers the engine's push subscription; falls back to polling when the
/// engine has none or the subscription closes.
async fn run_event_pump(
    engine: Arc<dyn Engine>,
    dispatcher: EventDispatcher,
    poll_interval: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    if engine.capabilities() == Capabilities::default() {
        tracing::info!("Scheduler: no engine attached, event pump idle");
        return;
    }

    if let Some(mut events) = engine.subscribe() {
        tracing::info!("Scheduler: subscribed to engine events");
        loop {
            tokio::select! {
                _ = stop_rx.recv() => return,
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = dispatcher.dispatch(event).await {
                            tracing::warn!("Scheduler: dropped engine event: {}", e);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Scheduler: event subscription lagged, {} events lost", missed);
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("Scheduler: engine subscription closed, falling back to polling");
                        break;
                    }
                },
            }
        }
    }

    // Jitter the first poll so restarts don't hit the engine in lockstep
    let jitter_ms = rand::thread_rng().gen_range(0..=poll_interval.as_millis().max(1) as u64 / 10);
    tokio::select! {
        _ = stop_rx.recv() => return,
        _ = tokio::time::sleep(Duration::from_millis(jitter_ms)) => {}
    }

    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => return,
            _ = interval.tick() => {
                match engine.poll().await {
                    Ok(events) if events.is_empty() => {}
                    Ok(events) => {
                        let summary = dispatcher.dispatch_all(events).await;
                        tracing::debug!(
                            "Scheduler: polled {} events ({} rejected)",
                            summary.accepted + summary.rejected,
                            summary.rejected
                        );
                    }
                    Err(e) => tracing::warn!("Scheduler: engine poll failed: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        AdvancedMappingSpec, EntityRef, Hop, NodeReport, NodeSpec, NodeStatus, Protocol, RunState, Store,
        TelemetryStore,
    };
    use crate::engine::{EngineEvent, FakeEngine, TunnelState};
    use crate::lifecycle::{Controller, LifecycleConfig};
    use crate::registry::MappingRegistry;
    use crate::telemetry::Aggregator;
    use chrono::Utc;
    use tempfile::NamedTempFile;

    struct Harness {
        _tmp: NamedTempFile,
        store: Arc<Store>,
        engine: Arc<FakeEngine>,
        controller: Controller,
        scheduler: Scheduler,
    }

    fn harness(engine: FakeEngine) -> Harness {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let node = NodeSpec {
            name: "n1".to_string(),
            token: "secret".to_string(),
            ..Default::default()
        }
        .into_node(Utc::now());
        store.insert_node(&node, "admin").unwrap();

        let telemetry = TelemetryStore::open(tmp.path()).unwrap();
        let aggregator = Aggregator::new(telemetry.clone());
        let engine = Arc::new(engine);
        let controller = Controller::new(store.clone(), engine.clone(), LifecycleConfig::default());
        let dispatcher = EventDispatcher::new(
            store.clone(),
            MappingRegistry::new(store.clone()),
            controller.clone(),
            aggregator,
        );
        let config = SchedulerConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let scheduler = Scheduler::new(
            engine.clone(),
            dispatcher,
            PresenceMonitor::new(store.clone(), config.node_stale),
            RetentionManager::new(telemetry, config.retention),
            config,
        );
        Harness {
            _tmp: tmp,
            store,
            engine,
            controller,
            scheduler,
        }
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn report() -> EngineEvent {
        EngineEvent::NodeStatus(NodeReport {
            node: "n1".to_string(),
            status: NodeStatus::Online,
            latency_ms: 12,
            bandwidth: 0,
            ip: None,
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_pump_applies_pushed_events() {
        let h = harness(FakeEngine::new());
        h.scheduler.start();
        // Give the pump a moment to subscribe
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.engine.emit(report());
        let store = h.store.clone();
        assert!(eventually(|| store.get_node("n1").unwrap().status == NodeStatus::Online).await);
        h.scheduler.stop();
    }

    #[tokio::test]
    async fn test_pump_polls_without_subscription() {
        let h = harness(FakeEngine::new().without_push());
        let mapping = h
            .store
            .insert_advanced(
                &AdvancedMappingSpec {
                    name: "db".to_string(),
                    protocol: Protocol::Tcp,
                    entry_port: 15432,
                    target_host: "127.0.0.1".to_string(),
                    target_port: 5432,
                    description: String::new(),
                    hops: vec![Hop {
                        node: "n1".to_string(),
                        relay_port: None,
                    }],
                },
                "admin",
            )
            .unwrap();
        h.controller.start(mapping.id, "admin").await.unwrap();

        h.engine.queue(report());
        h.engine.queue(EngineEvent::TunnelState {
            entity: EntityRef::advanced(mapping.id),
            state: TunnelState::Failed,
            error: Some("relay lost".to_string()),
        });
        h.scheduler.start();

        let store = h.store.clone();
        let id = mapping.id;
        assert!(eventually(|| store.get_advanced(id).unwrap().run_state == RunState::Error).await);
        assert_eq!(store.get_node("n1").unwrap().status, NodeStatus::Online);
        h.scheduler.stop();
    }
}
