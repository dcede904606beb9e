//! Routing of engine events to the components that own the facts.

use std::sync::Arc;

use crate::db::{EntityKind, EntityRef, MappingState, Store};
use crate::engine::{EngineEvent, TunnelState};
use crate::error::{Error, Result};
use crate::lifecycle::Controller;
use crate::registry::MappingRegistry;
use crate::telemetry::Aggregator;

/// Outcome of a batch of events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchSummary {
    pub accepted: usize,
    pub rejected: usize,
}

#[derive(Clone)]
pub struct EventDispatcher {
    store: Arc<Store>,
    mappings: MappingRegistry,
    controller: Controller,
    aggregator: Aggregator,
}

impl EventDispatcher {
    pub fn new(store: Arc<Store>, mappings: MappingRegistry, controller: Controller, aggregator: Aggregator) -> Self {
        Self {
            store,
            mappings,
            controller,
            aggregator,
        }
    }

    pub async fn dispatch(&self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::NodeStatus(report) => {
                if !self.store.apply_node_report(&report)? {
                    tracing::debug!("Events: status report for unknown node {}", report.node);
                    return Ok(());
                }
                self.aggregator.ingest_node_report(report).await
            }
            EngineEvent::Traffic(sample) => self.aggregator.ingest(sample).await,
            EngineEvent::Connection(record) => self.aggregator.ingest_connection(record).await,
            EngineEvent::TunnelState { entity, state, error } => match entity.kind {
                EntityKind::Mapping => {
                    let run_state = match state {
                        TunnelState::Up => MappingState::Running,
                        TunnelState::Down => MappingState::Stopped,
                        TunnelState::Failed => MappingState::Error,
                    };
                    self.mappings.apply_engine_state(numeric_id(&entity)?, run_state)
                }
                EntityKind::AdvancedMapping => {
                    self.controller
                        .on_tunnel_state(numeric_id(&entity)?, state, error.as_deref())
                }
                EntityKind::Node => Err(Error::Validation(format!(
                    "tunnel state reported for node '{}'",
                    entity.id
                ))),
            },
        }
    }

    /// Dispatch a batch, logging and counting rejected events.
    pub async fn dispatch_all(&self, events: Vec<EngineEvent>) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        for event in events {
            match self.dispatch(event).await {
                Ok(()) => summary.accepted += 1,
                Err(e) => {
                    tracing::warn!("Events: dropped engine event: {}", e);
                    summary.rejected += 1;
                }
            }
        }
        summary
    }
}

fn numeric_id(entity: &EntityRef) -> Result<i64> {
    entity
        .id
        .parse()
        .map_err(|_| Error::Validation(format!("invalid {} id '{}'", entity.kind, entity.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MappingSpec, NodeReport, NodeSpec, NodeStatus, Protocol, TelemetryStore, TrafficSample};
    use crate::engine::FakeEngine;
    use crate::lifecycle::LifecycleConfig;
    use chrono::Utc;
    use tempfile::NamedTempFile;

    fn setup() -> (NamedTempFile, Arc<Store>, EventDispatcher) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let node = NodeSpec {
            name: "n1".to_string(),
            token: "secret".to_string(),
            ..Default::default()
        }
        .into_node(Utc::now());
        store.insert_node(&node, "admin").unwrap();

        let aggregator = Aggregator::new(TelemetryStore::open(tmp.path()).unwrap());
        let controller = Controller::new(store.clone(), Arc::new(FakeEngine::new()), LifecycleConfig::default());
        let dispatcher = EventDispatcher::new(store.clone(), MappingRegistry::new(store.clone()), controller, aggregator);
        (tmp, store, dispatcher)
    }

    #[tokio::test]
    async fn test_node_status_updates_presence() {
        let (_tmp, store, dispatcher) = setup();
        dispatcher
            .dispatch(EngineEvent::NodeStatus(NodeReport {
                node: "n1".to_string(),
                status: NodeStatus::Online,
                latency_ms: 18,
                bandwidth: 2048,
                ip: Some("203.0.113.9".to_string()),
                timestamp: Utc::now(),
            }))
            .await
            .unwrap();

        let node = store.get_node("n1").unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.latency_ms, 18);
        assert!(node.last_seen.is_some());
    }

    #[tokio::test]
    async fn test_tunnel_state_drives_mapping_state() {
        let (_tmp, store, dispatcher) = setup();
        let mapping = store
            .insert_mapping(
                &MappingSpec {
                    node: "n1".to_string(),
                    local_port: 8080,
                    remote_host: "10.0.0.5".to_string(),
                    remote_port: 80,
                    protocol: Protocol::Tcp,
                    description: String::new(),
                },
                "admin",
            )
            .unwrap();

        dispatcher
            .dispatch(EngineEvent::TunnelState {
                entity: EntityRef::mapping(mapping.id),
                state: TunnelState::Up,
                error: None,
            })
            .await
            .unwrap();
        assert_eq!(store.get_mapping(mapping.id).unwrap().run_state, MappingState::Running);
    }

    #[tokio::test]
    async fn test_batch_counts_rejections() {
        let (_tmp, _store, dispatcher) = setup();
        let summary = dispatcher
            .dispatch_all(vec![
                EngineEvent::Traffic(TrafficSample {
                    entity: EntityRef::node("n1"),
                    timestamp: Utc::now(),
                    bytes_in: 5,
                    bytes_out: 5,
                }),
                EngineEvent::Traffic(TrafficSample {
                    entity: EntityRef::node("n1"),
                    timestamp: Utc::now(),
                    bytes_in: -5,
                    bytes_out: 5,
                }),
                EngineEvent::TunnelState {
                    entity: EntityRef::mapping(1),
                    state: TunnelState::Up,
                    error: None,
                },
                EngineEvent::TunnelState {
                    entity: EntityRef {
                        kind: EntityKind::AdvancedMapping,
                        id: "abc".to_string(),
                    },
                    state: TunnelState::Failed,
                    error: None,
                },
            ])
            .await;
        // Unknown mapping ids are ignored, malformed ones rejected
        assert_eq!(summary, DispatchSummary { accepted: 2, rejected: 2 });
    }
}
