//! Database model types.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Implements string conversions and SQLite column mapping for a unit enum.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("invalid {} '{}'", stringify!($name), other)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

/// Role of a node in the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    Client,
    Private,
    Proxy,
}

text_enum!(NodeType { Client => "client", Private => "private", Proxy => "proxy" });

/// Last status reported by the engine for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeStatus {
    Online,
    Offline,
    Error,
}

text_enum!(NodeStatus { Online => "online", Offline => "offline", Error => "error" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Protocol {
    Tcp,
    Udp,
}

text_enum!(Protocol { Tcp => "tcp", Udp => "udp" });

/// Run state of a simple port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MappingState {
    Stopped,
    Running,
    Error,
}

text_enum!(MappingState { Stopped => "stopped", Running => "running", Error => "error" });

/// Run state of an advanced (multi-hop) mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

text_enum!(RunState {
    Stopped => "stopped",
    Starting => "starting",
    Running => "running",
    Stopping => "stopping",
    Error => "error",
});

impl RunState {
    /// States during which the hop chain must not be edited.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

/// Kind of entity a telemetry fact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Node,
    Mapping,
    AdvancedMapping,
}

text_enum!(EntityKind {
    Node => "node",
    Mapping => "mapping",
    AdvancedMapping => "advancedMapping",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

text_enum!(LogLevel { Info => "info", Warning => "warning", Error => "error" });

// ============================================================================
// Registry records
// ============================================================================

/// A registered peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub name: String,
    pub ip: Option<String>,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub token: String,
    /// Bytes per second, `None` for unlimited.
    pub bandwidth_limit: Option<i64>,
    pub private_ip: Option<String>,
    #[serde(rename = "proxyNodeId")]
    pub proxy_node: Option<String>,
    pub status: NodeStatus,
    pub latency_ms: i64,
    pub bandwidth_used: i64,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Placeholder written to the audit log in place of a node token.
pub const REDACTED: &str = "********";

impl Node {
    /// Copy safe to persist in the audit log: the token is masked.
    pub fn redacted(&self) -> Node {
        Node {
            token: REDACTED.to_string(),
            ..self.clone()
        }
    }
}

/// Fields an administrator supplies when registering a node.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub name: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(rename = "type", default)]
    pub node_type: Option<NodeType>,
    pub token: String,
    #[serde(default)]
    pub bandwidth_limit: Option<i64>,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(rename = "proxyNodeId", default)]
    pub proxy_node: Option<String>,
}

impl NodeSpec {
    pub fn into_node(self, now: DateTime<Utc>) -> Node {
        Node {
            name: self.name,
            ip: self.ip,
            node_type: self.node_type.unwrap_or(NodeType::Client),
            token: self.token,
            bandwidth_limit: self.bandwidth_limit,
            private_ip: self.private_ip,
            proxy_node: self.proxy_node,
            status: NodeStatus::Offline,
            latency_ms: 0,
            bandwidth_used: 0,
            last_seen: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of a node. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(rename = "type", default)]
    pub node_type: Option<NodeType>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub bandwidth_limit: Option<i64>,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(rename = "proxyNodeId", default)]
    pub proxy_node: Option<String>,
}

impl NodePatch {
    pub fn apply(&self, node: &mut Node) {
        if let Some(ip) = &self.ip {
            node.ip = Some(ip.clone());
        }
        if let Some(node_type) = self.node_type {
            node.node_type = node_type;
        }
        if let Some(token) = &self.token {
            node.token = token.clone();
        }
        if let Some(limit) = self.bandwidth_limit {
            node.bandwidth_limit = Some(limit);
        }
        if let Some(private_ip) = &self.private_ip {
            node.private_ip = Some(private_ip.clone());
        }
        if let Some(proxy) = &self.proxy_node {
            node.proxy_node = Some(proxy.clone());
        }
        if node.node_type != NodeType::Private {
            node.private_ip = None;
            node.proxy_node = None;
        }
    }
}

/// A single local-to-remote forward bound to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub id: i64,
    pub node: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub description: String,
    pub run_state: MappingState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingSpec {
    pub node: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingPatch {
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub local_port: Option<u16>,
    #[serde(default)]
    pub remote_host: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub description: Option<String>,
}

impl MappingPatch {
    pub fn apply(&self, mapping: &mut Mapping) {
        if let Some(node) = &self.node {
            mapping.node = node.clone();
        }
        if let Some(port) = self.local_port {
            mapping.local_port = port;
        }
        if let Some(host) = &self.remote_host {
            mapping.remote_host = host.clone();
        }
        if let Some(port) = self.remote_port {
            mapping.remote_port = port;
        }
        if let Some(protocol) = self.protocol {
            mapping.protocol = protocol;
        }
        if let Some(description) = &self.description {
            mapping.description = description.clone();
        }
    }
}

fn default_protocol() -> Protocol {
    Protocol::Tcp
}

fn default_target_host() -> String {
    "127.0.0.1".to_string()
}

/// One relay step of an advanced mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hop {
    pub node: String,
    #[serde(default)]
    pub relay_port: Option<u16>,
}

/// Outcome of the last connectivity probe of an advanced mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub success: bool,
    pub tested_at: DateTime<Utc>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// A cascading forward across an ordered chain of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedMapping {
    pub id: i64,
    pub name: String,
    pub protocol: Protocol,
    pub entry_port: u16,
    pub hops: Vec<Hop>,
    pub target_host: String,
    pub target_port: u16,
    pub description: String,
    pub run_state: RunState,
    pub last_test_result: Option<TestResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedMappingSpec {
    pub name: String,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    pub entry_port: u16,
    pub hops: Vec<Hop>,
    #[serde(default = "default_target_host")]
    pub target_host: String,
    pub target_port: u16,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedMappingPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub entry_port: Option<u16>,
    #[serde(default)]
    pub hops: Option<Vec<Hop>>,
    #[serde(default)]
    pub target_host: Option<String>,
    #[serde(default)]
    pub target_port: Option<u16>,
    #[serde(default)]
    pub description: Option<String>,
}

impl AdvancedMappingPatch {
    pub fn apply(&self, mapping: &mut AdvancedMapping) {
        if let Some(name) = &self.name {
            mapping.name = name.clone();
        }
        if let Some(protocol) = self.protocol {
            mapping.protocol = protocol;
        }
        if let Some(port) = self.entry_port {
            mapping.entry_port = port;
        }
        if let Some(hops) = &self.hops {
            mapping.hops = hops.clone();
        }
        if let Some(host) = &self.target_host {
            mapping.target_host = host.clone();
        }
        if let Some(port) = self.target_port {
            mapping.target_port = port;
        }
        if let Some(description) = &self.description {
            mapping.description = description.clone();
        }
    }
}

// ============================================================================
// Telemetry facts
// ============================================================================

/// Identifies the owner of a telemetry fact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn node(name: &str) -> Self {
        Self { kind: EntityKind::Node, id: name.to_string() }
    }

    pub fn mapping(id: i64) -> Self {
        Self { kind: EntityKind::Mapping, id: id.to_string() }
    }

    pub fn advanced(id: i64) -> Self {
        Self { kind: EntityKind::AdvancedMapping, id: id.to_string() }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Raw traffic counters for one entity at one instant. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSample {
    pub entity: EntityRef,
    pub timestamp: DateTime<Utc>,
    pub bytes_in: i64,
    pub bytes_out: i64,
}

/// One finished connection observed by the engine. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub entity: EntityRef,
    pub timestamp: DateTime<Utc>,
    pub source_addr: String,
    pub dest_addr: String,
    pub protocol: Protocol,
    pub duration_ms: i64,
    pub bytes_total: i64,
}

/// A node status report pushed (or polled) from the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReport {
    #[serde(rename = "nodeId")]
    pub node: String,
    pub status: NodeStatus,
    pub latency_ms: i64,
    pub bandwidth: i64,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Stored status sample used for node performance series.
#[derive(Debug, Clone)]
pub struct NodeSample {
    pub time: DateTime<Utc>,
    pub status: NodeStatus,
    pub latency_ms: i64,
    pub bandwidth: i64,
}

// ============================================================================
// Audit log
// ============================================================================

/// A row of the audit log served by `/logs`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub module: String,
    pub actor: String,
    pub action: String,
    pub message: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
}

/// An audit record about to be written.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub level: LogLevel,
    pub module: &'static str,
    pub actor: String,
    pub action: &'static str,
    pub message: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl AuditRecord {
    pub fn info(module: &'static str, actor: &str, action: &'static str, message: String) -> Self {
        Self {
            level: LogLevel::Info,
            module,
            actor: actor.to_string(),
            action,
            message,
            before: None,
            after: None,
        }
    }

    pub fn warning(module: &'static str, actor: &str, action: &'static str, message: String) -> Self {
        Self {
            level: LogLevel::Warning,
            ..Self::info(module, actor, action, message)
        }
    }

    pub fn with_change<B: Serialize, A: Serialize>(mut self, before: Option<&B>, after: Option<&A>) -> Self {
        self.before = before.and_then(|b| serde_json::to_string(b).ok());
        self.after = after.and_then(|a| serde_json::to_string(a).ok());
        self
    }
}

/// Filter for audit log queries.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub level: Option<LogLevel>,
    pub module: Option<String>,
}

// ============================================================================
// Paging
// ============================================================================

/// One page of a list endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

/// A page of append-only history pinned to an insertion snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    /// Highest insertion sequence visible to this page.
    pub snapshot: i64,
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.page_size as i64
    }

    pub fn limit(&self) -> i64 {
        self.page_size as i64
    }
}

/// Milliseconds since the epoch, the on-disk time representation.
pub fn to_ms(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_enum_roundtrip() {
        assert_eq!("advancedMapping".parse::<EntityKind>(), Ok(EntityKind::AdvancedMapping));
        assert_eq!(RunState::Stopping.as_str(), "stopping");
        assert!("bogus".parse::<Protocol>().is_err());
        assert_eq!(
            serde_json::to_string(&EntityKind::AdvancedMapping).unwrap(),
            "\"advancedMapping\""
        );
    }

    #[test]
    fn test_patch_clears_private_fields_on_type_change() {
        let mut node = NodeSpec {
            name: "n1".to_string(),
            token: "t".to_string(),
            node_type: Some(NodeType::Private),
            private_ip: Some("192.168.1.2".to_string()),
            proxy_node: Some("p1".to_string()),
            ..Default::default()
        }
        .into_node(Utc::now());

        NodePatch {
            node_type: Some(NodeType::Client),
            ..Default::default()
        }
        .apply(&mut node);

        assert_eq!(node.node_type, NodeType::Client);
        assert!(node.private_ip.is_none());
        assert!(node.proxy_node.is_none());
    }

    #[test]
    fn test_redacted_node_masks_token() {
        let node = NodeSpec {
            name: "n1".to_string(),
            token: "s3cret-cred".to_string(),
            ..Default::default()
        }
        .into_node(Utc::now());

        let json = serde_json::to_string(&node.redacted()).unwrap();
        assert!(!json.contains("s3cret-cred"));
        assert!(json.contains(REDACTED));
        assert_eq!(node.token, "s3cret-cred");
    }

    #[test]
    fn test_page_request_clamps() {
        let req = PageRequest::new(0, 0);
        assert_eq!(req.page, 1);
        assert_eq!(req.page_size, 1);
        assert_eq!(PageRequest::new(3, 10).offset(), 20);
    }
}
