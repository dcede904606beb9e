//! Advanced (multi-hop) mapping registry.
//!
//! Only configuration lives here. Run state transitions belong to the
//! lifecycle controller.

use std::sync::Arc;

use super::{validate_host, validate_name, validate_port};
use crate::db::{AdvancedMapping, AdvancedMappingPatch, AdvancedMappingSpec, Hop, Page, PageRequest, Store};
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct AdvancedMappingRegistry {
    store: Arc<Store>,
}

impl AdvancedMappingRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn create(&self, spec: AdvancedMappingSpec, actor: &str) -> Result<AdvancedMapping> {
        validate_name("advanced mapping", &spec.name)?;
        validate_port("entryPort", spec.entry_port)?;
        validate_port("targetPort", spec.target_port)?;
        validate_host("targetHost", &spec.target_host)?;
        validate_hops(&spec.hops)?;

        let mapping = self.store.insert_advanced(&spec, actor)?;
        tracing::info!(
            "Registry: created advanced mapping {} '{}' over {} hop(s)",
            mapping.id,
            mapping.name,
            mapping.hops.len()
        );
        Ok(mapping)
    }

    /// Edit configuration. Fails with a conflict while the mapping is active.
    pub fn update(&self, id: i64, patch: AdvancedMappingPatch, actor: &str) -> Result<AdvancedMapping> {
        if let Some(name) = &patch.name {
            validate_name("advanced mapping", name)?;
        }
        if let Some(port) = patch.entry_port {
            validate_port("entryPort", port)?;
        }
        if let Some(port) = patch.target_port {
            validate_port("targetPort", port)?;
        }
        if let Some(host) = &patch.target_host {
            validate_host("targetHost", host)?;
        }
        if let Some(hops) = &patch.hops {
            validate_hops(hops)?;
        }

        let mapping = self.store.update_advanced(id, &patch, actor)?;
        tracing::info!("Registry: updated advanced mapping {}", id);
        Ok(mapping)
    }

    pub fn delete(&self, id: i64, actor: &str) -> Result<()> {
        self.store.delete_advanced(id, actor)?;
        tracing::info!("Registry: deleted advanced mapping {}", id);
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<AdvancedMapping> {
        Ok(self.store.get_advanced(id)?)
    }

    pub fn list(&self, page: PageRequest) -> Result<Page<AdvancedMapping>> {
        Ok(self.store.list_advanced(page)?)
    }
}

/// A chain needs at least one hop and never relays a node to itself.
fn validate_hops(hops: &[Hop]) -> Result<()> {
    if hops.is_empty() {
        return Err(Error::Validation("at least one hop is required".to_string()));
    }
    for hop in hops {
        if hop.node.is_empty() {
            return Err(Error::Validation("every hop needs a node".to_string()));
        }
        if let Some(port) = hop.relay_port {
            validate_port("relayPort", port)?;
        }
    }
    if let Some(pair) = hops.windows(2).find(|w| w[0].node == w[1].node) {
        return Err(Error::Validation(format!(
            "node '{}' appears twice in a row in the hop chain",
            pair[0].node
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NodeSpec, Protocol, RunState};
    use chrono::Utc;
    use tempfile::NamedTempFile;

    fn setup() -> (NamedTempFile, Arc<Store>, AdvancedMappingRegistry) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        for name in ["a", "b", "c"] {
            let node = NodeSpec {
                name: name.to_string(),
                token: "secret".to_string(),
                ..Default::default()
            }
            .into_node(Utc::now());
            store.insert_node(&node, "admin").unwrap();
        }
        let registry = AdvancedMappingRegistry::new(store.clone());
        (tmp, store, registry)
    }

    fn hop(node: &str) -> Hop {
        Hop {
            node: node.to_string(),
            relay_port: None,
        }
    }

    fn spec(name: &str, hops: Vec<Hop>) -> AdvancedMappingSpec {
        AdvancedMappingSpec {
            name: name.to_string(),
            protocol: Protocol::Tcp,
            entry_port: 9000,
            hops,
            target_host: "127.0.0.1".to_string(),
            target_port: 22,
            description: String::new(),
        }
    }

    #[test]
    fn test_create_keeps_hop_order() {
        let (_tmp, _store, registry) = setup();
        let created = registry
            .create(spec("chain", vec![hop("c"), hop("a"), hop("b")]), "admin")
            .unwrap();
        assert_eq!(created.run_state, RunState::Stopped);

        let fetched = registry.get(created.id).unwrap();
        let order: Vec<_> = fetched.hops.iter().map(|h| h.node.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_hop_validation() {
        let (_tmp, _store, registry) = setup();
        assert!(matches!(registry.create(spec("x", vec![]), "admin"), Err(Error::Validation(_))));
        assert!(matches!(
            registry.create(spec("x", vec![hop("a"), hop("a")]), "admin"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            registry.create(spec("x", vec![hop("a"), hop("ghost")]), "admin"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_duplicate_name_conflicts() {
        let (_tmp, _store, registry) = setup();
        registry.create(spec("chain", vec![hop("a")]), "admin").unwrap();
        assert!(matches!(
            registry.create(spec("chain", vec![hop("b")]), "admin"),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_edits_rejected_while_active() {
        let (_tmp, store, registry) = setup();
        let created = registry.create(spec("chain", vec![hop("a"), hop("b")]), "admin").unwrap();

        for state in [RunState::Starting, RunState::Running, RunState::Stopping] {
            store
                .swap_run_state(
                    created.id,
                    &[RunState::Stopped, RunState::Starting, RunState::Running],
                    state,
                )
                .unwrap();
            let patch = AdvancedMappingPatch {
                hops: Some(vec![hop("c")]),
                ..Default::default()
            };
            assert!(matches!(registry.update(created.id, patch, "admin"), Err(Error::Conflict(_))));
            assert!(matches!(registry.delete(created.id, "admin"), Err(Error::Conflict(_))));
        }

        store
            .swap_run_state(created.id, &[RunState::Stopping], RunState::Stopped)
            .unwrap();
        let patch = AdvancedMappingPatch {
            hops: Some(vec![hop("c")]),
            ..Default::default()
        };
        let updated = registry.update(created.id, patch, "admin").unwrap();
        assert_eq!(updated.hops, vec![hop("c")]);
    }

    #[test]
    fn test_hop_reference_blocks_node_delete() {
        let (_tmp, store, registry) = setup();
        let created = registry.create(spec("chain", vec![hop("a"), hop("b")]), "admin").unwrap();
        assert!(matches!(
            Error::from(store.delete_node("b", "admin").unwrap_err()),
            Error::Conflict(_)
        ));

        registry.delete(created.id, "admin").unwrap();
        store.delete_node("b", "admin").unwrap();
    }
}
