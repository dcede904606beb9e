//! Node registry.

use chrono::Utc;
use std::sync::Arc;

use super::{validate_ip, validate_name};
use crate::db::{Node, NodePatch, NodeSpec, Page, PageRequest, Store};
use crate::error::{Error, Result};

/// Owns node identity, role and credentials.
#[derive(Clone)]
pub struct NodeRegistry {
    store: Arc<Store>,
}

impl NodeRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Register a node. Private nodes need a private IP and an existing proxy.
    pub fn create(&self, spec: NodeSpec, actor: &str) -> Result<Node> {
        validate_name("node", &spec.name)?;
        if spec.token.trim().is_empty() {
            return Err(Error::Validation("token is required".to_string()));
        }
        if let Some(ip) = &spec.ip {
            validate_ip("ip", ip)?;
        }
        if let Some(private_ip) = &spec.private_ip {
            validate_ip("privateIp", private_ip)?;
        }
        check_bandwidth(spec.bandwidth_limit)?;

        let node = spec.into_node(Utc::now());
        self.store.insert_node(&node, actor)?;
        tracing::info!("Registry: created node {} ({})", node.name, node.node_type);
        Ok(node)
    }

    pub fn update(&self, name: &str, patch: NodePatch, actor: &str) -> Result<Node> {
        if let Some(token) = &patch.token {
            if token.trim().is_empty() {
                return Err(Error::Validation("token cannot be empty".to_string()));
            }
        }
        if let Some(ip) = &patch.ip {
            validate_ip("ip", ip)?;
        }
        if let Some(private_ip) = &patch.private_ip {
            validate_ip("privateIp", private_ip)?;
        }
        check_bandwidth(patch.bandwidth_limit)?;

        let node = self.store.update_node(name, &patch, actor)?;
        tracing::info!("Registry: updated node {}", name);
        Ok(node)
    }

    /// Delete a node. Fails while any mapping, hop or private node refers to it.
    pub fn delete(&self, name: &str, actor: &str) -> Result<()> {
        self.store.delete_node(name, actor)?;
        tracing::info!("Registry: deleted node {}", name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Node> {
        Ok(self.store.get_node(name)?)
    }

    pub fn list(&self, page: PageRequest) -> Result<Page<Node>> {
        Ok(self.store.list_nodes(page)?)
    }
}

fn check_bandwidth(limit: Option<i64>) -> Result<()> {
    match limit {
        Some(l) if l < 0 => Err(Error::Validation("bandwidthLimit cannot be negative".to_string())),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AuditFilter, MappingSpec, NodeType, Protocol};
    use tempfile::NamedTempFile;

    fn setup() -> (NamedTempFile, Arc<Store>, NodeRegistry) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let registry = NodeRegistry::new(store.clone());
        (tmp, store, registry)
    }

    fn spec(name: &str, node_type: NodeType) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            token: "secret".to_string(),
            node_type: Some(node_type),
            ..Default::default()
        }
    }

    #[test]
    fn test_duplicate_name_is_validation_error() {
        let (_tmp, _store, registry) = setup();
        registry.create(spec("n1", NodeType::Client), "admin").unwrap();
        let err = registry.create(spec("n1", NodeType::Client), "admin").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_private_node_requires_existing_proxy() {
        let (_tmp, _store, registry) = setup();

        // Missing fields
        let err = registry.create(spec("lan", NodeType::Private), "admin").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // Dangling proxy reference
        let mut private = spec("lan", NodeType::Private);
        private.private_ip = Some("192.168.1.10".to_string());
        private.proxy_node = Some("gw".to_string());
        let err = registry.create(private.clone(), "admin").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // Proxy of the wrong type
        let mut other = spec("other", NodeType::Private);
        other.private_ip = Some("192.168.1.11".to_string());
        registry.create(spec("gw2", NodeType::Proxy), "admin").unwrap();
        other.proxy_node = Some("gw2".to_string());
        registry.create(other, "admin").unwrap();
        let mut nested = spec("nested", NodeType::Private);
        nested.private_ip = Some("192.168.1.12".to_string());
        nested.proxy_node = Some("other".to_string());
        assert!(matches!(registry.create(nested, "admin"), Err(Error::Validation(_))));

        registry.create(spec("gw", NodeType::Proxy), "admin").unwrap();
        let node = registry.create(private, "admin").unwrap();
        assert_eq!(node.proxy_node.as_deref(), Some("gw"));
    }

    #[test]
    fn test_delete_fails_while_referenced() {
        let (_tmp, store, registry) = setup();
        registry.create(spec("n1", NodeType::Client), "admin").unwrap();
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

        assert!(matches!(registry.delete("n1", "admin"), Err(Error::Conflict(_))));

        store.delete_mapping(mapping.id, "admin").unwrap();
        registry.delete("n1", "admin").unwrap();
        assert!(matches!(registry.get("n1"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_type_change_rejected_once_mapped() {
        let (_tmp, store, registry) = setup();
        registry.create(spec("n1", NodeType::Client), "admin").unwrap();
        store
            .insert_mapping(
                &MappingSpec {
                    node: "n1".to_string(),
                    local_port: 2222,
                    remote_host: "10.0.0.9".to_string(),
                    remote_port: 22,
                    protocol: Protocol::Tcp,
                    description: String::new(),
                },
                "admin",
            )
            .unwrap();

        let patch = NodePatch {
            node_type: Some(NodeType::Proxy),
            ..Default::default()
        };
        assert!(matches!(registry.update("n1", patch, "admin"), Err(Error::Conflict(_))));

        // Non-type edits are still fine
        let patch = NodePatch {
            token: Some("rotated".to_string()),
            ..Default::default()
        };
        assert_eq!(registry.update("n1", patch, "admin").unwrap().token, "rotated");
    }

    #[test]
    fn test_mutations_are_audited() {
        let (_tmp, store, registry) = setup();
        registry.create(spec("n1", NodeType::Client), "alice").unwrap();
        registry
            .update(
                "n1",
                NodePatch {
                    bandwidth_limit: Some(2048),
                    ..Default::default()
                },
                "bob",
            )
            .unwrap();

        let logs = store.list_audit(&AuditFilter::default(), PageRequest::new(1, 10)).unwrap();
        assert_eq!(logs.total, 2);
        let update = &logs.items[0];
        assert_eq!(update.actor, "bob");
        assert_eq!(update.action, "update");
        assert_eq!(update.before.as_ref().unwrap()["bandwidthLimit"], serde_json::Value::Null);
        assert_eq!(update.after.as_ref().unwrap()["bandwidthLimit"], 2048);
    }
}
