//! External P2P engine collaborator.
//!
//! The engine establishes tunnels and reports node status, traffic counters
//! and connections. It is opaque to the rest of the crate: everything goes
//! through the [`Engine`] trait.

mod detached;
#[cfg(test)]
mod fake;
mod http;

pub use detached::*;
#[cfg(test)]
pub use fake::*;
pub use http::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::db::{
    AdvancedMapping, ConnectionRecord, EntityKind, EntityRef, Hop, Mapping, NodeReport, Protocol, TrafficSample,
};

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("engine unreachable: {0}")]
    Unreachable(String),
    #[error("engine rejected request: {0}")]
    Rejected(String),
    #[error("no engine attached")]
    NotAttached,
}

/// What an engine can actually provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Tunnels can be started and stopped.
    pub tunnels: bool,
    /// Node status, latency and connection facts are reported.
    pub node_telemetry: bool,
}

/// Everything the engine needs to build one tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSpec {
    /// `mapping` or `advancedMapping`; ids are only unique per kind.
    pub kind: EntityKind,
    pub id: i64,
    pub protocol: Protocol,
    pub entry_port: u16,
    pub hops: Vec<Hop>,
    pub target_host: String,
    pub target_port: u16,
}

impl From<&AdvancedMapping> for TunnelSpec {
    fn from(mapping: &AdvancedMapping) -> Self {
        Self {
            kind: EntityKind::AdvancedMapping,
            id: mapping.id,
            protocol: mapping.protocol,
            entry_port: mapping.entry_port,
            hops: mapping.hops.clone(),
            target_host: mapping.target_host.clone(),
            target_port: mapping.target_port,
        }
    }
}

/// A simple mapping is a one-hop tunnel through its node.
impl From<&Mapping> for TunnelSpec {
    fn from(mapping: &Mapping) -> Self {
        Self {
            kind: EntityKind::Mapping,
            id: mapping.id,
            protocol: mapping.protocol,
            entry_port: mapping.local_port,
            hops: vec![Hop {
                node: mapping.node.clone(),
                relay_port: None,
            }],
            target_host: mapping.remote_host.clone(),
            target_port: mapping.remote_port,
        }
    }
}

/// Tunnel state as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TunnelState {
    Up,
    Down,
    Failed,
}

/// A fact pushed or polled from the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    NodeStatus(NodeReport),
    Traffic(TrafficSample),
    Connection(ConnectionRecord),
    TunnelState {
        entity: EntityRef,
        state: TunnelState,
        #[serde(default)]
        error: Option<String>,
    },
}

#[async_trait]
pub trait Engine: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    async fn start_tunnel(&self, spec: &TunnelSpec) -> Result<(), EngineError>;

    async fn stop_tunnel(&self, spec: &TunnelSpec) -> Result<(), EngineError>;

    /// Probe the hop chain end to end. Returns the round trip in milliseconds.
    async fn probe(&self, spec: &TunnelSpec) -> Result<u64, EngineError>;

    /// In-process event stream, if the engine can push.
    fn subscribe(&self) -> Option<broadcast::Receiver<EngineEvent>> {
        None
    }

    /// Fetch events accumulated since the previous poll.
    async fn poll(&self) -> Result<Vec<EngineEvent>, EngineError>;
}
