//! Simple port mapping registry.

use std::sync::Arc;

use super::{validate_host, validate_port};
use crate::db::{Mapping, MappingPatch, MappingSpec, MappingState, Page, PageRequest, Store};
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct MappingRegistry {
    store: Arc<Store>,
}

impl MappingRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Create a mapping. The `(node, localPort, protocol)` binding is checked
    /// and written under the store's writer lock.
    pub fn create(&self, spec: MappingSpec, actor: &str) -> Result<Mapping> {
        if spec.node.is_empty() {
            return Err(Error::Validation("node is required".to_string()));
        }
        validate_port("localPort", spec.local_port)?;
        validate_port("remotePort", spec.remote_port)?;
        validate_host("remoteHost", &spec.remote_host)?;

        let mapping = self.store.insert_mapping(&spec, actor)?;
        tracing::info!(
            "Registry: created mapping {} ({}/{} on {})",
            mapping.id,
            mapping.protocol,
            mapping.local_port,
            mapping.node
        );
        Ok(mapping)
    }

    pub fn update(&self, id: i64, patch: MappingPatch, actor: &str) -> Result<Mapping> {
        if let Some(port) = patch.local_port {
            validate_port("localPort", port)?;
        }
        if let Some(port) = patch.remote_port {
            validate_port("remotePort", port)?;
        }
        if let Some(host) = &patch.remote_host {
            validate_host("remoteHost", host)?;
        }

        let mapping = self.store.update_mapping(id, &patch, actor)?;
        tracing::info!("Registry: updated mapping {}", id);
        Ok(mapping)
    }

    /// Delete a mapping. Only stopped mappings can be deleted.
    pub fn delete(&self, id: i64, actor: &str) -> Result<()> {
        self.store.delete_mapping(id, actor)?;
        tracing::info!("Registry: deleted mapping {}", id);
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Mapping> {
        Ok(self.store.get_mapping(id)?)
    }

    pub fn list(&self, page: PageRequest) -> Result<Page<Mapping>> {
        Ok(self.store.list_mappings(page)?)
    }

    /// Record a run state reported by the engine. Unknown ids are ignored.
    pub fn apply_engine_state(&self, id: i64, state: MappingState) -> Result<()> {
        if !self.store.set_mapping_state(id, state)? {
            tracing::debug!("Registry: engine reported state for unknown mapping {}", id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NodeSpec, Protocol};
    use chrono::Utc;
    use std::thread;
    use tempfile::NamedTempFile;

    fn setup() -> (NamedTempFile, MappingRegistry) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let node = NodeSpec {
            name: "n1".to_string(),
            token: "secret".to_string(),
            ..Default::default()
        }
        .into_node(Utc::now());
        store.insert_node(&node, "admin").unwrap();
        (tmp, MappingRegistry::new(store))
    }

    fn spec(local_port: u16, protocol: Protocol) -> MappingSpec {
        MappingSpec {
            node: "n1".to_string(),
            local_port,
            remote_host: "10.0.0.5".to_string(),
            remote_port: 80,
            protocol,
            description: "web".to_string(),
        }
    }

    #[test]
    fn test_duplicate_binding_conflicts() {
        let (_tmp, registry) = setup();
        registry.create(spec(8080, Protocol::Tcp), "admin").unwrap();

        let err = registry.create(spec(8080, Protocol::Tcp), "admin").unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(registry.list(PageRequest::new(1, 10)).unwrap().total, 1);

        // Same port over a different protocol is a different binding
        registry.create(spec(8080, Protocol::Udp), "admin").unwrap();
    }

    #[test]
    fn test_update_cannot_steal_binding() {
        let (_tmp, registry) = setup();
        registry.create(spec(8080, Protocol::Tcp), "admin").unwrap();
        let other = registry.create(spec(8081, Protocol::Tcp), "admin").unwrap();

        let patch = MappingPatch {
            local_port: Some(8080),
            ..Default::default()
        };
        assert!(matches!(registry.update(other.id, patch, "admin"), Err(Error::Conflict(_))));
        assert_eq!(registry.get(other.id).unwrap().local_port, 8081);
    }

    #[test]
    fn test_concurrent_creates_bind_once() {
        let (_tmp, registry) = setup();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.create(spec(9000, Protocol::Tcp), "admin"))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, Error::Conflict(_))));
    }

    #[test]
    fn test_delete_requires_stopped() {
        let (_tmp, registry) = setup();
        let mapping = registry.create(spec(8080, Protocol::Tcp), "admin").unwrap();

        registry.apply_engine_state(mapping.id, MappingState::Running).unwrap();
        assert!(matches!(registry.delete(mapping.id, "admin"), Err(Error::Precondition(_))));

        registry.apply_engine_state(mapping.id, MappingState::Stopped).unwrap();
        registry.delete(mapping.id, "admin").unwrap();
        assert!(matches!(registry.get(mapping.id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_validation() {
        let (_tmp, registry) = setup();
        assert!(matches!(registry.create(spec(0, Protocol::Tcp), "admin"), Err(Error::Validation(_))));

        let mut dangling = spec(8080, Protocol::Tcp);
        dangling.node = "ghost".to_string();
        assert!(matches!(registry.create(dangling, "admin"), Err(Error::Validation(_))));

        let mut bad_host = spec(8080, Protocol::Tcp);
        bad_host.remote_host = "not a host".to_string();
        assert!(matches!(registry.create(bad_host, "admin"), Err(Error::Validation(_))));
    }
}
