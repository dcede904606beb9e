//! Append-only telemetry storage: traffic samples, connection records and
//! node status samples.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row, ToSql};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::models::*;
use super::{migrate, open_connection, DbError};

/// A fact accepted by the ingest writer.
#[derive(Debug, Clone)]
pub enum TelemetryFact {
    Traffic(TrafficSample),
    Connection(ConnectionRecord),
    NodeStatus(NodeReport),
}

/// Per-bucket byte sums, `index` counted from the series origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSum {
    pub index: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
}

/// Telemetry store with its own writer and reader connections, so ingest
/// never shares a lock with registry traffic or with aggregation reads.
#[derive(Clone)]
pub struct TelemetryStore {
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
}

impl TelemetryStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let writer = open_connection(&path)?;
        migrate(&writer)?;
        let reader = open_connection(&path)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
        })
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.writer.lock().map_err(|_| DbError::Poisoned)
    }

    fn reader(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.reader.lock().map_err(|_| DbError::Poisoned)
    }

    /// Append a batch of facts in one transaction.
    pub fn append_batch(&self, facts: &[TelemetryFact]) -> Result<(), DbError> {
        if facts.is_empty() {
            return Ok(());
        }

        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        {
            let mut traffic = tx.prepare(
                "INSERT INTO traffic_samples (entity_kind, entity_id, ts_ms, bytes_in, bytes_out) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut connections = tx.prepare(
                "INSERT INTO connection_records (entity_kind, entity_id, ts_ms, source_addr, dest_addr, protocol, duration_ms, bytes_total) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            let mut nodes = tx.prepare(
                "INSERT INTO node_samples (node_name, ts_ms, status, latency_ms, bandwidth) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;

            for fact in facts {
                match fact {
                    TelemetryFact::Traffic(s) => {
                        traffic.execute(params![
                            s.entity.kind,
                            s.entity.id,
                            to_ms(s.timestamp),
                            s.bytes_in,
                            s.bytes_out,
                        ])?;
                    }
                    TelemetryFact::Connection(c) => {
                        connections.execute(params![
                            c.entity.kind,
                            c.entity.id,
                            to_ms(c.timestamp),
                            c.source_addr,
                            c.dest_addr,
                            c.protocol,
                            c.duration_ms,
                            c.bytes_total,
                        ])?;
                    }
                    TelemetryFact::NodeStatus(r) => {
                        nodes.execute(params![
                            r.node,
                            to_ms(r.timestamp),
                            r.status,
                            r.latency_ms,
                            r.bandwidth,
                        ])?;
                    }
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Sum traffic per bucket for samples in `[start, end)`.
    ///
    /// Buckets are `width_ms` wide and counted from `origin_ms`; only
    /// non-empty buckets are returned.
    pub fn traffic_buckets(
        &self,
        entity: &EntityRef,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        origin_ms: i64,
        width_ms: i64,
    ) -> Result<Vec<BucketSum>, DbError> {
        self.sum_buckets(
            "entity_kind = ?3 AND entity_id = ?4",
            params![origin_ms, width_ms, entity.kind, entity.id, to_ms(start), to_ms(end)],
        )
    }

    /// Like [`TelemetryStore::traffic_buckets`], summed over every mapping
    /// and advanced mapping.
    pub fn tunnel_traffic_buckets(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        origin_ms: i64,
        width_ms: i64,
    ) -> Result<Vec<BucketSum>, DbError> {
        self.sum_buckets(
            "entity_kind IN (?3, ?4)",
            params![
                origin_ms,
                width_ms,
                EntityKind::Mapping,
                EntityKind::AdvancedMapping,
                to_ms(start),
                to_ms(end)
            ],
        )
    }

    /// `?1` is the origin, `?2` the width, `?5`/`?6` the window; `filter`
    /// binds `?3` and `?4`.
    fn sum_buckets(&self, filter: &str, values: &[&dyn ToSql]) -> Result<Vec<BucketSum>, DbError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT (ts_ms - ?1) / ?2 AS idx, SUM(bytes_in), SUM(bytes_out) FROM traffic_samples \
             WHERE {} AND ts_ms >= ?5 AND ts_ms < ?6 \
             GROUP BY idx ORDER BY idx",
            filter
        ))?;
        let buckets = stmt
            .query_map(values, |row| {
                Ok(BucketSum {
                    index: row.get(0)?,
                    bytes_in: row.get(1)?,
                    bytes_out: row.get(2)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(buckets)
    }

    /// Total bytes in and out across all entities of `kind` since `since`.
    pub fn traffic_total(&self, kind: EntityKind, since: DateTime<Utc>) -> Result<(i64, i64), DbError> {
        let conn = self.reader()?;
        let totals = conn.query_row(
            "SELECT COALESCE(SUM(bytes_in), 0), COALESCE(SUM(bytes_out), 0) FROM traffic_samples \
             WHERE entity_kind = ?1 AND ts_ms >= ?2",
            params![kind, to_ms(since)],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(totals)
    }

    /// Status samples for one node in `[start, end)`, oldest first.
    pub fn node_samples(
        &self,
        node: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<NodeSample>, DbError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT ts_ms, status, latency_ms, bandwidth FROM node_samples \
             WHERE node_name = ?1 AND ts_ms >= ?2 AND ts_ms < ?3 ORDER BY ts_ms",
        )?;
        let samples = stmt
            .query_map(params![node, to_ms(start), to_ms(end)], |row| {
                Ok(NodeSample {
                    time: from_ms(row.get(0)?),
                    status: row.get(1)?,
                    latency_ms: row.get(2)?,
                    bandwidth: row.get(3)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    /// Newest-first page of connection history pinned to `snapshot`.
    ///
    /// Without a snapshot the current highest sequence is used, so a client
    /// that passes the returned snapshot back gets pages that ignore records
    /// appended after its first request.
    pub fn history_page(
        &self,
        entity: &EntityRef,
        page: PageRequest,
        snapshot: Option<i64>,
    ) -> Result<HistoryPage<ConnectionRecord>, DbError> {
        let mut conn = self.reader()?;
        // One read transaction: count and rows come from the same WAL snapshot.
        let tx = conn.transaction()?;

        let snapshot = match snapshot {
            Some(s) => s,
            None => tx
                .query_row("SELECT MAX(seq) FROM connection_records", [], |r| r.get::<_, Option<i64>>(0))?
                .unwrap_or(0),
        };

        let total: i64 = tx.query_row(
            "SELECT COUNT(*) FROM connection_records WHERE entity_kind = ?1 AND entity_id = ?2 AND seq <= ?3",
            params![entity.kind, entity.id, snapshot],
            |r| r.get(0),
        )?;

        let items = {
            let mut stmt = tx.prepare(
                "SELECT seq, entity_kind, entity_id, ts_ms, source_addr, dest_addr, protocol, duration_ms, bytes_total \
                 FROM connection_records WHERE entity_kind = ?1 AND entity_id = ?2 AND seq <= ?3 \
                 ORDER BY seq DESC LIMIT ?4 OFFSET ?5",
            )?;
            let items = stmt
                .query_map(
                    params![entity.kind, entity.id, snapshot, page.limit(), page.offset()],
                    |row| connection_from_row(row).map(|(_, record)| record),
                )?
                .collect::<SqlResult<Vec<_>>>()?;
            items
        };
        tx.commit()?;

        Ok(HistoryPage {
            items,
            total,
            page: page.page,
            page_size: page.page_size,
            snapshot,
        })
    }

    /// Up to `limit` records with `seq < below`, newest first, with their sequence.
    pub fn history_chunk(
        &self,
        entity: &EntityRef,
        below: i64,
        limit: i64,
    ) -> Result<Vec<(i64, ConnectionRecord)>, DbError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT seq, entity_kind, entity_id, ts_ms, source_addr, dest_addr, protocol, duration_ms, bytes_total \
             FROM connection_records WHERE entity_kind = ?1 AND entity_id = ?2 AND seq < ?3 \
             ORDER BY seq DESC LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(params![entity.kind, entity.id, below, limit], connection_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Highest connection record sequence, 0 when empty.
    pub fn latest_connection_seq(&self) -> Result<i64, DbError> {
        let conn = self.reader()?;
        let seq: Option<i64> = conn
            .query_row("SELECT MAX(seq) FROM connection_records", [], |r| r.get(0))
            .optional()?
            .flatten();
        Ok(seq.unwrap_or(0))
    }

    /// Delete telemetry older than `cutoff`. Returns the number of rows removed.
    pub fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.writer()?;
        let cutoff = to_ms(cutoff);
        let mut removed = conn.execute("DELETE FROM traffic_samples WHERE ts_ms < ?1", params![cutoff])?;
        removed += conn.execute("DELETE FROM connection_records WHERE ts_ms < ?1", params![cutoff])?;
        removed += conn.execute("DELETE FROM node_samples WHERE ts_ms < ?1", params![cutoff])?;
        Ok(removed)
    }
}

fn connection_from_row(row: &Row<'_>) -> SqlResult<(i64, ConnectionRecord)> {
    Ok((
        row.get(0)?,
        ConnectionRecord {
            entity: EntityRef {
                kind: row.get(1)?,
                id: row.get(2)?,
            },
            timestamp: from_ms(row.get(3)?),
            source_addr: row.get(4)?,
            dest_addr: row.get(5)?,
            protocol: row.get(6)?,
            duration_ms: row.get(7)?,
            bytes_total: row.get(8)?,
        },
    ))
}
