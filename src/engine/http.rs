//! Engine reached over its JSON control API.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{Capabilities, Engine, EngineError, EngineEvent, TunnelSpec};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProbeReply {
    latency_ms: u64,
}

/// Client for the engine's control URL.
///
/// The control API has no push channel, so the scheduler polls `/events`.
#[derive(Clone)]
pub struct HttpEngine {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpEngine {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, EngineError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(EngineError::Rejected(format!("{} {}", status, body.trim())))
    }
}

#[async_trait]
impl Engine for HttpEngine {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            tunnels: true,
            node_telemetry: true,
        }
    }

    async fn start_tunnel(&self, spec: &TunnelSpec) -> Result<(), EngineError> {
        self.send(self.client.post(self.url("/tunnels")).json(spec)).await?;
        Ok(())
    }

    async fn stop_tunnel(&self, spec: &TunnelSpec) -> Result<(), EngineError> {
        self.send(self.client.delete(self.url(&format!("/tunnels/{}/{}", spec.kind, spec.id))))
            .await?;
        Ok(())
    }

    async fn probe(&self, spec: &TunnelSpec) -> Result<u64, EngineError> {
        let response = self.send(self.client.post(self.url("/probe")).json(spec)).await?;
        let reply: ProbeReply = response
            .json()
            .await
            .map_err(|e| EngineError::Rejected(format!("malformed probe reply: {}", e)))?;
        Ok(reply.latency_ms)
    }

    async fn poll(&self) -> Result<Vec<EngineEvent>, EngineError> {
        let response = self.send(self.client.get(self.url("/events"))).await?;
        response
            .json()
            .await
            .map_err(|e| EngineError::Rejected(format!("malformed event batch: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{EntityKind, Protocol};

    fn spec() -> TunnelSpec {
        TunnelSpec {
            kind: EntityKind::AdvancedMapping,
            id: 1,
            protocol: Protocol::Tcp,
            entry_port: 9000,
            hops: Vec::new(),
            target_host: "127.0.0.1".to_string(),
            target_port: 22,
        }
    }

    #[test]
    fn test_base_url_normalized() {
        let engine = HttpEngine::new("http://engine.local:7000/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(engine.url("/tunnels"), "http://engine.local:7000/tunnels");
    }

    #[tokio::test]
    async fn test_unreachable_engine() {
        let engine = HttpEngine::new("http://256.256.256.256", None, Duration::from_millis(100)).unwrap();
        let result = engine.start_tunnel(&spec()).await;
        assert!(matches!(result, Err(EngineError::Unreachable(_))));
    }
}
