//! Stand-in used when no engine URL is configured.

use async_trait::async_trait;

use super::{Capabilities, Engine, EngineError, EngineEvent, TunnelSpec};

/// Fails every tunnel operation and reports no telemetry capability.
#[derive(Debug, Default, Clone)]
pub struct DetachedEngine;

#[async_trait]
impl Engine for DetachedEngine {
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn start_tunnel(&self, _spec: &TunnelSpec) -> Result<(), EngineError> {
        Err(EngineError::NotAttached)
    }

    async fn stop_tunnel(&self, _spec: &TunnelSpec) -> Result<(), EngineError> {
        Err(EngineError::NotAttached)
    }

    async fn probe(&self, _spec: &TunnelSpec) -> Result<u64, EngineError> {
        Err(EngineError::NotAttached)
    }

    async fn poll(&self) -> Result<Vec<EngineEvent>, EngineError> {
        Ok(Vec::new())
    }
}
