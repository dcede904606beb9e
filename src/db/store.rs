//! SQLite registry store: nodes, mappings and advanced mappings.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::audit::insert_audit;
use super::models::*;
use super::{migrate, open_connection, DbError};

const NODE_COLUMNS: &str = "name, ip, node_type, token, bandwidth_limit, private_ip, proxy_node, \
     status, latency_ms, bandwidth_used, last_seen_ms, created_ms, updated_ms";

const MAPPING_COLUMNS: &str = "id, node_name, local_port, remote_host, remote_port, protocol, \
     description, run_state, created_ms, updated_ms";

const ADVANCED_COLUMNS: &str = "id, name, protocol, entry_port, target_host, target_port, \
     description, run_state, last_test_result, created_ms, updated_ms";

/// Result of a compare-and-set on an advanced mapping's run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSwap {
    Applied { previous: RunState },
    Unchanged { current: RunState },
}

/// Aggregate node figures for the dashboard summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeSummary {
    pub online: i64,
    pub avg_latency_ms: f64,
}

/// Thread-safe registry store.
///
/// Writes go through a single writer connection so every check-then-write
/// runs inside one transaction under one lock. Reads use their own
/// connection and never wait on a writer.
#[derive(Clone)]
pub struct Store {
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let writer = open_connection(&path)?;
        migrate(&writer)?;
        let reader = open_connection(&path)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
        })
    }

    pub(super) fn writer(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.writer.lock().map_err(|_| DbError::Poisoned)
    }

    pub(super) fn reader(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.reader.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Nodes ---

    /// Register a node. Fails if the name is taken or its proxy link is dangling.
    pub fn insert_node(&self, node: &Node, actor: &str) -> Result<(), DbError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        if find_node(&tx, &node.name)?.is_some() {
            return Err(DbError::Invalid(format!("node '{}' already exists", node.name)));
        }
        check_private_link(&tx, node)?;

        tx.execute(
            &format!("INSERT INTO nodes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)", NODE_COLUMNS),
            params![
                node.name,
                node.ip,
                node.node_type,
                node.token,
                node.bandwidth_limit,
                node.private_ip,
                node.proxy_node,
                node.status,
                node.latency_ms,
                node.bandwidth_used,
                node.last_seen.map(to_ms),
                to_ms(node.created_at),
                to_ms(node.updated_at),
            ],
        )?;

        insert_audit(
            &tx,
            &AuditRecord::info("nodes", actor, "create", format!("created node '{}'", node.name))
                .with_change::<Node, Node>(None, Some(&node.redacted())),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Apply a patch to a node and return the updated record.
    pub fn update_node(&self, name: &str, patch: &NodePatch, actor: &str) -> Result<Node, DbError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let before = find_node(&tx, name)?.ok_or_else(|| DbError::NotFound(format!("node '{}'", name)))?;
        let mut after = before.clone();
        patch.apply(&mut after);
        after.updated_at = Utc::now();

        if after.node_type != before.node_type {
            let refs = mapping_refs(&tx, name)? + hop_refs(&tx, name)?;
            if refs > 0 {
                return Err(DbError::Conflict(format!(
                    "node '{}' is used by {} mapping(s); its type cannot change",
                    name, refs
                )));
            }
            if after.node_type == NodeType::Private && proxied_refs(&tx, name)? > 0 {
                return Err(DbError::Conflict(format!(
                    "node '{}' is the proxy of private nodes and cannot become private",
                    name
                )));
            }
        }
        check_private_link(&tx, &after)?;

        tx.execute(
            "UPDATE nodes SET ip=?1, node_type=?2, token=?3, bandwidth_limit=?4, private_ip=?5, proxy_node=?6, updated_ms=?7 WHERE name=?8",
            params![
                after.ip,
                after.node_type,
                after.token,
                after.bandwidth_limit,
                after.private_ip,
                after.proxy_node,
                to_ms(after.updated_at),
                name,
            ],
        )?;

        insert_audit(
            &tx,
            &AuditRecord::info("nodes", actor, "update", format!("updated node '{}'", name))
                .with_change(Some(&before.redacted()), Some(&after.redacted())),
        )?;
        tx.commit()?;
        Ok(after)
    }

    /// Delete a node that nothing references any more.
    pub fn delete_node(&self, name: &str, actor: &str) -> Result<(), DbError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let before = find_node(&tx, name)?.ok_or_else(|| DbError::NotFound(format!("node '{}'", name)))?;

        let mappings = mapping_refs(&tx, name)?;
        let hops = hop_refs(&tx, name)?;
        let proxied = proxied_refs(&tx, name)?;
        if mappings + hops + proxied > 0 {
            return Err(DbError::Conflict(format!(
                "node '{}' is still referenced by {} mapping(s), {} advanced mapping hop(s) and {} private node(s)",
                name, mappings, hops, proxied
            )));
        }

        tx.execute("DELETE FROM nodes WHERE name = ?1", params![name])?;
        insert_audit(
            &tx,
            &AuditRecord::info("nodes", actor, "delete", format!("deleted node '{}'", name))
                .with_change::<Node, Node>(Some(&before.redacted()), None),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Get a node by name.
    pub fn get_node(&self, name: &str) -> Result<Node, DbError> {
        let conn = self.reader()?;
        find_node(&conn, name)?.ok_or_else(|| DbError::NotFound(format!("node '{}'", name)))
    }

    /// List nodes ordered by name.
    pub fn list_nodes(&self, page: PageRequest) -> Result<Page<Node>, DbError> {
        let conn = self.reader()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM nodes ORDER BY name LIMIT ?1 OFFSET ?2",
            NODE_COLUMNS
        ))?;
        let items = stmt
            .query_map(params![page.limit(), page.offset()], node_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(Page {
            items,
            total,
            page: page.page,
            page_size: page.page_size,
        })
    }

    /// Apply an engine status report. Returns false for unknown nodes.
    pub fn apply_node_report(&self, report: &NodeReport) -> Result<bool, DbError> {
        let conn = self.writer()?;
        let changed = conn.execute(
            "UPDATE nodes SET status=?1, latency_ms=?2, bandwidth_used=?3, ip=COALESCE(?4, ip), last_seen_ms=?5 WHERE name=?6",
            params![
                report.status,
                report.latency_ms,
                report.bandwidth,
                report.ip,
                to_ms(report.timestamp),
                report.node,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Mark nodes offline whose last report is older than `cutoff`. Each
    /// change is audited with the record `audit` builds for the node name,
    /// in the same transaction.
    pub fn mark_stale_nodes<F>(&self, cutoff: DateTime<Utc>, audit: F) -> Result<Vec<String>, DbError>
    where
        F: Fn(&str) -> AuditRecord,
    {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let names = {
            let mut stmt = tx.prepare(
                "SELECT name FROM nodes WHERE status != 'offline' AND (last_seen_ms IS NULL OR last_seen_ms < ?1)",
            )?;
            let names = stmt
                .query_map(params![to_ms(cutoff)], |row| row.get::<_, String>(0))?
                .collect::<SqlResult<Vec<_>>>()?;
            names
        };

        for name in &names {
            tx.execute(
                "UPDATE nodes SET status = 'offline', latency_ms = 0, bandwidth_used = 0 WHERE name = ?1",
                params![name],
            )?;
            insert_audit(&tx, &audit(name))?;
        }
        tx.commit()?;
        Ok(names)
    }

    /// Online node count and their mean latency.
    pub fn node_summary(&self) -> Result<NodeSummary, DbError> {
        let conn = self.reader()?;
        let (online, avg): (i64, Option<f64>) = conn.query_row(
            "SELECT COUNT(*), AVG(latency_ms) FROM nodes WHERE status = 'online'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(NodeSummary {
            online,
            avg_latency_ms: avg.unwrap_or(0.0),
        })
    }

    /// Number of nodes per status. Every status is present, zero or not.
    pub fn node_status_counts(&self) -> Result<Vec<(NodeStatus, i64)>, DbError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM nodes GROUP BY status")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, NodeStatus>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok([NodeStatus::Online, NodeStatus::Offline, NodeStatus::Error]
            .into_iter()
            .map(|status| {
                let count = rows.iter().find(|(s, _)| *s == status).map_or(0, |(_, n)| *n);
                (status, count)
            })
            .collect())
    }

    // --- Mappings ---

    /// Create a mapping. The `(node, local_port, protocol)` binding must be free.
    pub fn insert_mapping(&self, spec: &MappingSpec, actor: &str) -> Result<Mapping, DbError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        require_node(&tx, &spec.node)?;
        check_binding(&tx, &spec.node, spec.local_port, spec.protocol, None)?;

        let now = to_ms(Utc::now());
        tx.execute(
            "INSERT INTO mappings (node_name, local_port, remote_host, remote_port, protocol, description, run_state, created_ms, updated_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                spec.node,
                spec.local_port,
                spec.remote_host,
                spec.remote_port,
                spec.protocol,
                spec.description,
                MappingState::Stopped,
                now,
            ],
        )
        .map_err(|e| constraint_to_conflict(e, "local port binding already in use"))?;

        let id = tx.last_insert_rowid();
        let mapping = find_mapping(&tx, id)?.ok_or_else(|| DbError::NotFound(format!("mapping {}", id)))?;

        insert_audit(
            &tx,
            &AuditRecord::info(
                "mappings",
                actor,
                "create",
                format!("created mapping {} on node '{}'", id, mapping.node),
            )
            .with_change::<Mapping, Mapping>(None, Some(&mapping)),
        )?;
        tx.commit()?;
        Ok(mapping)
    }

    /// Apply a patch to a mapping, re-checking the binding invariant.
    pub fn update_mapping(&self, id: i64, patch: &MappingPatch, actor: &str) -> Result<Mapping, DbError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let before = find_mapping(&tx, id)?.ok_or_else(|| DbError::NotFound(format!("mapping {}", id)))?;
        let mut after = before.clone();
        patch.apply(&mut after);
        after.updated_at = Utc::now();

        if after.node != before.node {
            require_node(&tx, &after.node)?;
        }
        check_binding(&tx, &after.node, after.local_port, after.protocol, Some(id))?;

        tx.execute(
            "UPDATE mappings SET node_name=?1, local_port=?2, remote_host=?3, remote_port=?4, protocol=?5, description=?6, updated_ms=?7 WHERE id=?8",
            params![
                after.node,
                after.local_port,
                after.remote_host,
                after.remote_port,
                after.protocol,
                after.description,
                to_ms(after.updated_at),
                id,
            ],
        )
        .map_err(|e| constraint_to_conflict(e, "local port binding already in use"))?;

        insert_audit(
            &tx,
            &AuditRecord::info("mappings", actor, "update", format!("updated mapping {}", id))
                .with_change(Some(&before), Some(&after)),
        )?;
        tx.commit()?;
        Ok(after)
    }

    /// Delete a stopped mapping.
    pub fn delete_mapping(&self, id: i64, actor: &str) -> Result<(), DbError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let before = find_mapping(&tx, id)?.ok_or_else(|| DbError::NotFound(format!("mapping {}", id)))?;
        if before.run_state != MappingState::Stopped {
            return Err(DbError::Precondition(format!(
                "mapping {} is {}; stop it before deleting",
                id, before.run_state
            )));
        }

        tx.execute("DELETE FROM mappings WHERE id = ?1", params![id])?;
        insert_audit(
            &tx,
            &AuditRecord::info("mappings", actor, "delete", format!("deleted mapping {}", id))
                .with_change::<Mapping, Mapping>(Some(&before), None),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_mapping(&self, id: i64) -> Result<Mapping, DbError> {
        let conn = self.reader()?;
        find_mapping(&conn, id)?.ok_or_else(|| DbError::NotFound(format!("mapping {}", id)))
    }

    pub fn list_mappings(&self, page: PageRequest) -> Result<Page<Mapping>, DbError> {
        let conn = self.reader()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM mappings", [], |r| r.get(0))?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM mappings ORDER BY id LIMIT ?1 OFFSET ?2",
            MAPPING_COLUMNS
        ))?;
        let items = stmt
            .query_map(params![page.limit(), page.offset()], mapping_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(Page {
            items,
            total,
            page: page.page,
            page_size: page.page_size,
        })
    }

    /// Record the run state the engine reported for a mapping.
    pub fn set_mapping_state(&self, id: i64, state: MappingState) -> Result<bool, DbError> {
        let conn = self.writer()?;
        let changed = conn.execute(
            "UPDATE mappings SET run_state = ?1, updated_ms = ?2 WHERE id = ?3",
            params![state, to_ms(Utc::now()), id],
        )?;
        Ok(changed > 0)
    }

    /// Record a lifecycle outcome for a mapping together with its audit row.
    /// Returns false for unknown ids.
    pub fn record_mapping_state(&self, id: i64, state: MappingState, record: &AuditRecord) -> Result<bool, DbError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE mappings SET run_state = ?1, updated_ms = ?2 WHERE id = ?3",
            params![state, to_ms(Utc::now()), id],
        )?;
        if changed > 0 {
            insert_audit(&tx, record)?;
        }
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Number of running mappings and running advanced mappings.
    pub fn running_counts(&self) -> Result<(i64, i64), DbError> {
        let conn = self.reader()?;
        let simple: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mappings WHERE run_state = 'running'",
            [],
            |r| r.get(0),
        )?;
        let advanced: i64 = conn.query_row(
            "SELECT COUNT(*) FROM advanced_mappings WHERE run_state = 'running'",
            [],
            |r| r.get(0),
        )?;
        Ok((simple, advanced))
    }

    // --- Advanced mappings ---

    /// Create an advanced mapping in the `stopped` state.
    pub fn insert_advanced(&self, spec: &AdvancedMappingSpec, actor: &str) -> Result<AdvancedMapping, DbError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        check_advanced_name(&tx, &spec.name, None)?;
        for hop in &spec.hops {
            require_node(&tx, &hop.node)?;
        }

        let now = to_ms(Utc::now());
        tx.execute(
            "INSERT INTO advanced_mappings (name, protocol, entry_port, target_host, target_port, description, run_state, created_ms, updated_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                spec.name,
                spec.protocol,
                spec.entry_port,
                spec.target_host,
                spec.target_port,
                spec.description,
                RunState::Stopped,
                now,
            ],
        )
        .map_err(|e| constraint_to_conflict(e, "advanced mapping name already exists"))?;

        let id = tx.last_insert_rowid();
        write_hops(&tx, id, &spec.hops)?;
        let mapping = find_advanced(&tx, id)?
            .ok_or_else(|| DbError::NotFound(format!("advanced mapping {}", id)))?;

        insert_audit(
            &tx,
            &AuditRecord::info(
                "advanced-mappings",
                actor,
                "create",
                format!("created advanced mapping {} '{}'", id, mapping.name),
            )
            .with_change::<AdvancedMapping, AdvancedMapping>(None, Some(&mapping)),
        )?;
        tx.commit()?;
        Ok(mapping)
    }

    /// Edit an advanced mapping. Rejected while it is starting, running or stopping.
    pub fn update_advanced(
        &self,
        id: i64,
        patch: &AdvancedMappingPatch,
        actor: &str,
    ) -> Result<AdvancedMapping, DbError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let before = find_advanced(&tx, id)?
            .ok_or_else(|| DbError::NotFound(format!("advanced mapping {}", id)))?;
        if before.run_state.is_active() {
            return Err(DbError::Conflict(format!(
                "advanced mapping {} is {}; stop it before editing",
                id, before.run_state
            )));
        }

        let mut after = before.clone();
        patch.apply(&mut after);
        after.updated_at = Utc::now();

        if after.name != before.name {
            check_advanced_name(&tx, &after.name, Some(id))?;
        }
        if after.hops != before.hops {
            for hop in &after.hops {
                require_node(&tx, &hop.node)?;
            }
            write_hops(&tx, id, &after.hops)?;
        }

        tx.execute(
            "UPDATE advanced_mappings SET name=?1, protocol=?2, entry_port=?3, target_host=?4, target_port=?5, description=?6, updated_ms=?7 WHERE id=?8",
            params![
                after.name,
                after.protocol,
                after.entry_port,
                after.target_host,
                after.target_port,
                after.description,
                to_ms(after.updated_at),
                id,
            ],
        )
        .map_err(|e| constraint_to_conflict(e, "advanced mapping name already exists"))?;

        insert_audit(
            &tx,
            &AuditRecord::info("advanced-mappings", actor, "update", format!("updated advanced mapping {}", id))
                .with_change(Some(&before), Some(&after)),
        )?;
        tx.commit()?;
        Ok(after)
    }

    /// Delete an advanced mapping that is not active.
    pub fn delete_advanced(&self, id: i64, actor: &str) -> Result<(), DbError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let before = find_advanced(&tx, id)?
            .ok_or_else(|| DbError::NotFound(format!("advanced mapping {}", id)))?;
        if before.run_state.is_active() {
            return Err(DbError::Conflict(format!(
                "advanced mapping {} is {}; stop it before deleting",
                id, before.run_state
            )));
        }

        tx.execute("DELETE FROM advanced_mapping_hops WHERE mapping_id = ?1", params![id])?;
        tx.execute("DELETE FROM advanced_mappings WHERE id = ?1", params![id])?;
        insert_audit(
            &tx,
            &AuditRecord::info("advanced-mappings", actor, "delete", format!("deleted advanced mapping {}", id))
                .with_change::<AdvancedMapping, AdvancedMapping>(Some(&before), None),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_advanced(&self, id: i64) -> Result<AdvancedMapping, DbError> {
        let conn = self.reader()?;
        find_advanced(&conn, id)?.ok_or_else(|| DbError::NotFound(format!("advanced mapping {}", id)))
    }

    pub fn list_advanced(&self, page: PageRequest) -> Result<Page<AdvancedMapping>, DbError> {
        let conn = self.reader()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM advanced_mappings", [], |r| r.get(0))?;
        let ids = {
            let mut stmt = conn.prepare("SELECT id FROM advanced_mappings ORDER BY id LIMIT ?1 OFFSET ?2")?;
            let ids = stmt
                .query_map(params![page.limit(), page.offset()], |r| r.get::<_, i64>(0))?
                .collect::<SqlResult<Vec<_>>>()?;
            ids
        };

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mapping) = find_advanced(&conn, id)? {
                items.push(mapping);
            }
        }

        Ok(Page {
            items,
            total,
            page: page.page,
            page_size: page.page_size,
        })
    }

    /// Move an advanced mapping to `to` if its current state is one of `from`.
    pub fn swap_run_state(&self, id: i64, from: &[RunState], to: RunState) -> Result<StateSwap, DbError> {
        self.swap_run_state_inner(id, from, to, None)
    }

    /// Like [`Store::swap_run_state`], writing `record` to the audit log in
    /// the same transaction when the swap applies.
    pub fn swap_run_state_audited(
        &self,
        id: i64,
        from: &[RunState],
        to: RunState,
        record: &AuditRecord,
    ) -> Result<StateSwap, DbError> {
        self.swap_run_state_inner(id, from, to, Some(record))
    }

    fn swap_run_state_inner(
        &self,
        id: i64,
        from: &[RunState],
        to: RunState,
        record: Option<&AuditRecord>,
    ) -> Result<StateSwap, DbError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let current: RunState = tx
            .query_row(
                "SELECT run_state FROM advanced_mappings WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("advanced mapping {}", id)))?;

        if !from.contains(&current) {
            return Ok(StateSwap::Unchanged { current });
        }

        tx.execute(
            "UPDATE advanced_mappings SET run_state = ?1, updated_ms = ?2 WHERE id = ?3",
            params![to, to_ms(Utc::now()), id],
        )?;
        if let Some(record) = record {
            insert_audit(&tx, record)?;
        }
        tx.commit()?;
        Ok(StateSwap::Applied { previous: current })
    }

    /// Move mappings left `starting` or `stopping` by a previous process to
    /// `error`. Returns the affected ids.
    pub fn reset_interrupted(&self) -> Result<Vec<i64>, DbError> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM advanced_mappings WHERE run_state IN ('starting', 'stopping') ORDER BY id",
            )?;
            let ids = stmt
                .query_map([], |r| r.get::<_, i64>(0))?
                .collect::<SqlResult<Vec<_>>>()?;
            ids
        };

        let now = to_ms(Utc::now());
        for id in &ids {
            tx.execute(
                "UPDATE advanced_mappings SET run_state = ?1, updated_ms = ?2 WHERE id = ?3",
                params![RunState::Error, now, id],
            )?;
            insert_audit(
                &tx,
                &AuditRecord::warning(
                    "lifecycle",
                    "system",
                    "recover",
                    format!("advanced mapping {} was interrupted by a restart", id),
                ),
            )?;
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Store the outcome of the latest connectivity test.
    pub fn record_test_result(&self, id: i64, result: &TestResult) -> Result<(), DbError> {
        let json = serde_json::to_string(result).map_err(|e| DbError::Invalid(e.to_string()))?;
        let conn = self.writer()?;
        let changed = conn.execute(
            "UPDATE advanced_mappings SET last_test_result = ?1 WHERE id = ?2",
            params![json, id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound(format!("advanced mapping {}", id)));
        }
        Ok(())
    }
}

// ============================================================================
// Row helpers
// ============================================================================

fn node_from_row(row: &Row<'_>) -> SqlResult<Node> {
    Ok(Node {
        name: row.get(0)?,
        ip: row.get(1)?,
        node_type: row.get(2)?,
        token: row.get(3)?,
        bandwidth_limit: row.get(4)?,
        private_ip: row.get(5)?,
        proxy_node: row.get(6)?,
        status: row.get(7)?,
        latency_ms: row.get(8)?,
        bandwidth_used: row.get(9)?,
        last_seen: row.get::<_, Option<i64>>(10)?.map(from_ms),
        created_at: from_ms(row.get(11)?),
        updated_at: from_ms(row.get(12)?),
    })
}

fn mapping_from_row(row: &Row<'_>) -> SqlResult<Mapping> {
    Ok(Mapping {
        id: row.get(0)?,
        node: row.get(1)?,
        local_port: row.get(2)?,
        remote_host: row.get(3)?,
        remote_port: row.get(4)?,
        protocol: row.get(5)?,
        description: row.get(6)?,
        run_state: row.get(7)?,
        created_at: from_ms(row.get(8)?),
        updated_at: from_ms(row.get(9)?),
    })
}

fn find_node(conn: &Connection, name: &str) -> Result<Option<Node>, DbError> {
    let node = conn
        .query_row(
            &format!("SELECT {} FROM nodes WHERE name = ?1", NODE_COLUMNS),
            params![name],
            node_from_row,
        )
        .optional()?;
    Ok(node)
}

fn find_mapping(conn: &Connection, id: i64) -> Result<Option<Mapping>, DbError> {
    let mapping = conn
        .query_row(
            &format!("SELECT {} FROM mappings WHERE id = ?1", MAPPING_COLUMNS),
            params![id],
            mapping_from_row,
        )
        .optional()?;
    Ok(mapping)
}

fn find_advanced(conn: &Connection, id: i64) -> Result<Option<AdvancedMapping>, DbError> {
    let mapping = conn
        .query_row(
            &format!("SELECT {} FROM advanced_mappings WHERE id = ?1", ADVANCED_COLUMNS),
            params![id],
            |row| {
                let last_test: Option<String> = row.get(8)?;
                Ok(AdvancedMapping {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    protocol: row.get(2)?,
                    entry_port: row.get(3)?,
                    hops: Vec::new(),
                    target_host: row.get(4)?,
                    target_port: row.get(5)?,
                    description: row.get(6)?,
                    run_state: row.get(7)?,
                    last_test_result: last_test.and_then(|s| serde_json::from_str(&s).ok()),
                    created_at: from_ms(row.get(9)?),
                    updated_at: from_ms(row.get(10)?),
                })
            },
        )
        .optional()?;

    let Some(mut mapping) = mapping else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT node_name, relay_port FROM advanced_mapping_hops WHERE mapping_id = ?1 ORDER BY position",
    )?;
    mapping.hops = stmt
        .query_map(params![id], |row| {
            Ok(Hop {
                node: row.get(0)?,
                relay_port: row.get(1)?,
            })
        })?
        .collect::<SqlResult<Vec<_>>>()?;

    Ok(Some(mapping))
}

fn write_hops(conn: &Connection, mapping_id: i64, hops: &[Hop]) -> Result<(), DbError> {
    conn.execute("DELETE FROM advanced_mapping_hops WHERE mapping_id = ?1", params![mapping_id])?;
    let mut stmt = conn.prepare(
        "INSERT INTO advanced_mapping_hops (mapping_id, position, node_name, relay_port) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (position, hop) in hops.iter().enumerate() {
        stmt.execute(params![mapping_id, position as i64, hop.node, hop.relay_port])?;
    }
    Ok(())
}

fn require_node(conn: &Connection, name: &str) -> Result<Node, DbError> {
    find_node(conn, name)?.ok_or_else(|| DbError::Invalid(format!("node '{}' does not exist", name)))
}

/// A private node must point at an existing client or proxy node.
fn check_private_link(conn: &Connection, node: &Node) -> Result<(), DbError> {
    if node.node_type != NodeType::Private {
        return Ok(());
    }

    if node.private_ip.as_deref().map_or(true, str::is_empty) {
        return Err(DbError::Invalid(format!("private node '{}' requires privateIp", node.name)));
    }
    let proxy_name = match node.proxy_node.as_deref() {
        Some(p) if !p.is_empty() => p,
        _ => {
            return Err(DbError::Invalid(format!(
                "private node '{}' requires proxyNodeId",
                node.name
            )))
        }
    };
    if proxy_name == node.name {
        return Err(DbError::Invalid(format!("node '{}' cannot proxy itself", node.name)));
    }

    let proxy = require_node(conn, proxy_name)?;
    if !matches!(proxy.node_type, NodeType::Proxy | NodeType::Client) {
        return Err(DbError::Invalid(format!(
            "proxy node '{}' must be of type proxy or client, not {}",
            proxy_name, proxy.node_type
        )));
    }
    Ok(())
}

fn check_binding(
    conn: &Connection,
    node: &str,
    local_port: u16,
    protocol: Protocol,
    exclude: Option<i64>,
) -> Result<(), DbError> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM mappings WHERE node_name = ?1 AND local_port = ?2 AND protocol = ?3 AND id != ?4",
            params![node, local_port, protocol, exclude.unwrap_or(-1)],
            |r| r.get(0),
        )
        .optional()?;

    match existing {
        Some(id) => Err(DbError::Conflict(format!(
            "{}/{} on node '{}' is already bound by mapping {}",
            protocol, local_port, node, id
        ))),
        None => Ok(()),
    }
}

fn check_advanced_name(conn: &Connection, name: &str, exclude: Option<i64>) -> Result<(), DbError> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM advanced_mappings WHERE name = ?1 AND id != ?2",
            params![name, exclude.unwrap_or(-1)],
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(DbError::Conflict(format!("advanced mapping name '{}' already exists", name)));
    }
    Ok(())
}

fn mapping_refs(conn: &Connection, node: &str) -> Result<i64, DbError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM mappings WHERE node_name = ?1",
        params![node],
        |r| r.get(0),
    )?)
}

fn hop_refs(conn: &Connection, node: &str) -> Result<i64, DbError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM advanced_mapping_hops WHERE node_name = ?1",
        params![node],
        |r| r.get(0),
    )?)
}

fn proxied_refs(conn: &Connection, node: &str) -> Result<i64, DbError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM nodes WHERE proxy_node = ?1",
        params![node],
        |r| r.get(0),
    )?)
}

fn constraint_to_conflict(err: rusqlite::Error, message: &str) -> DbError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            DbError::Conflict(message.to_string())
        }
        _ => DbError::Sqlite(err),
    }
}
