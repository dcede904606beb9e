//! Audit log persistence.

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Result as SqlResult, Row};

use super::models::*;
use super::store::Store;
use super::DbError;

/// Append an audit record using an open connection or transaction.
pub(super) fn insert_audit(conn: &Connection, record: &AuditRecord) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO audit_log (ts_ms, level, module, actor, action, message, before_json, after_json) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            to_ms(Utc::now()),
            record.level,
            record.module,
            record.actor,
            record.action,
            record.message,
            record.before,
            record.after,
        ],
    )?;
    Ok(())
}

fn audit_from_row(row: &Row<'_>) -> SqlResult<AuditEntry> {
    let before: Option<String> = row.get(7)?;
    let after: Option<String> = row.get(8)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        timestamp: from_ms(row.get(1)?),
        level: row.get(2)?,
        module: row.get(3)?,
        actor: row.get(4)?,
        action: row.get(5)?,
        message: row.get(6)?,
        before: before.and_then(|s| serde_json::from_str(&s).ok()),
        after: after.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

/// Build the WHERE clause and its parameters for a filter.
fn filter_clause(filter: &AuditFilter, below_id: Option<i64>) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if let Some(level) = filter.level {
        clauses.push("level = ?");
        values.push(Value::Text(level.as_str().to_string()));
    }
    if let Some(module) = &filter.module {
        clauses.push("module = ?");
        values.push(Value::Text(module.clone()));
    }
    if let Some(id) = below_id {
        clauses.push("id < ?");
        values.push(Value::Integer(id));
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), values)
    }
}

impl Store {
    /// Write a standalone audit record.
    pub fn append_audit(&self, record: &AuditRecord) -> Result<(), DbError> {
        let conn = self.writer()?;
        insert_audit(&conn, record)
    }

    /// Newest-first page of the audit log.
    pub fn list_audit(&self, filter: &AuditFilter, page: PageRequest) -> Result<Page<AuditEntry>, DbError> {
        let conn = self.reader()?;
        let (clause, mut values) = filter_clause(filter, None);

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM audit_log {}", clause),
            params_from_iter(values.iter()),
            |r| r.get(0),
        )?;

        values.push(Value::Integer(page.limit()));
        values.push(Value::Integer(page.offset()));
        let mut stmt = conn.prepare(&format!(
            "SELECT id, ts_ms, level, module, actor, action, message, before_json, after_json \
             FROM audit_log {} ORDER BY id DESC LIMIT ? OFFSET ?",
            clause
        ))?;
        let items = stmt
            .query_map(params_from_iter(values.iter()), audit_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(Page {
            items,
            total,
            page: page.page,
            page_size: page.page_size,
        })
    }

    /// Fetch up to `limit` entries older than `below_id`, newest first.
    /// Used to stream exports in bounded chunks.
    pub fn audit_chunk(
        &self,
        filter: &AuditFilter,
        below_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<AuditEntry>, DbError> {
        let conn = self.reader()?;
        let (clause, mut values) = filter_clause(filter, below_id);
        values.push(Value::Integer(limit));

        let mut stmt = conn.prepare(&format!(
            "SELECT id, ts_ms, level, module, actor, action, message, before_json, after_json \
             FROM audit_log {} ORDER BY id DESC LIMIT ?",
            clause
        ))?;
        let items = stmt
            .query_map(params_from_iter(values.iter()), audit_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(items)
    }
}
