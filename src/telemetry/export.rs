//! Streaming CSV export.
//!
//! Rows are read from SQLite in bounded keyset chunks on a blocking thread
//! and handed to the HTTP body through a small channel, so memory use does
//! not grow with the size of the export.

use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::db::{AuditEntry, AuditFilter, ConnectionRecord, DbError, EntityRef, Store, TelemetryStore};

/// Rows fetched per query.
const CHUNK_ROWS: i64 = 500;

pub type CsvChunk = Result<Bytes, io::Error>;

const HISTORY_HEADER: &str = "timestamp,entity,source_addr,dest_addr,protocol,duration_ms,bytes_total\n";
const AUDIT_HEADER: &str = "id,timestamp,level,module,actor,action,message\n";

/// Quote a field when it contains a delimiter, quote or line break.
pub fn csv_field(value: &str) -> String {
    if value.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn history_row(record: &ConnectionRecord) -> String {
    format!(
        "{},{},{},{},{},{},{}\n",
        record.timestamp.to_rfc3339(),
        csv_field(&record.entity.to_string()),
        csv_field(&record.source_addr),
        csv_field(&record.dest_addr),
        record.protocol,
        record.duration_ms,
        record.bytes_total,
    )
}

fn audit_row(entry: &AuditEntry) -> String {
    format!(
        "{},{},{},{},{},{},{}\n",
        entry.id,
        entry.timestamp.to_rfc3339(),
        entry.level,
        csv_field(&entry.module),
        csv_field(&entry.actor),
        csv_field(&entry.action),
        csv_field(&entry.message),
    )
}

/// Drive `next_chunk` on a blocking thread until it returns `None`.
fn stream_csv<F>(header: &'static str, mut next_chunk: F) -> ReceiverStream<CsvChunk>
where
    F: FnMut() -> Result<Option<String>, DbError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<CsvChunk>(4);

    tokio::task::spawn_blocking(move || {
        if tx.blocking_send(Ok(Bytes::from_static(header.as_bytes()))).is_err() {
            return;
        }
        loop {
            match next_chunk() {
                Ok(Some(text)) => {
                    if tx.blocking_send(Ok(Bytes::from(text))).is_err() {
                        // Client went away
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::error!("Export: failed to read rows: {}", e);
                    let _ = tx.blocking_send(Err(io::Error::new(io::ErrorKind::Other, e.to_string())));
                    return;
                }
            }
        }
    });

    ReceiverStream::new(rx)
}

/// Full connection history of an entity, newest first, as of the call.
pub fn history_csv(store: TelemetryStore, entity: EntityRef) -> ReceiverStream<CsvChunk> {
    let mut below: Option<i64> = None;
    let mut done = false;

    stream_csv(HISTORY_HEADER, move || {
        if done {
            return Ok(None);
        }
        let cursor = match below {
            Some(seq) => seq,
            None => store.latest_connection_seq()? + 1,
        };
        let rows = store.history_chunk(&entity, cursor, CHUNK_ROWS)?;
        done = (rows.len() as i64) < CHUNK_ROWS;
        let Some((last_seq, _)) = rows.last() else {
            return Ok(None);
        };
        below = Some(*last_seq);
        Ok(Some(rows.iter().map(|(_, record)| history_row(record)).collect()))
    })
}

/// Audit log matching `filter`, newest first.
pub fn audit_csv(store: Arc<Store>, filter: AuditFilter) -> ReceiverStream<CsvChunk> {
    let mut below: Option<i64> = None;
    let mut done = false;

    stream_csv(AUDIT_HEADER, move || {
        if done {
            return Ok(None);
        }
        let rows = store.audit_chunk(&filter, below, CHUNK_ROWS)?;
        done = (rows.len() as i64) < CHUNK_ROWS;
        let Some(last) = rows.last() else {
            return Ok(None);
        };
        below = Some(last.id);
        Ok(Some(rows.iter().map(audit_row).collect()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AuditRecord, Protocol, TelemetryFact};
    use chrono::Utc;
    use tempfile::NamedTempFile;
    use tokio_stream::StreamExt;

    async fn collect(mut stream: ReceiverStream<CsvChunk>) -> String {
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            out.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
        }
        out
    }

    #[test]
    fn test_csv_field_escaping() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }

    #[tokio::test]
    async fn test_history_export_spans_chunks() {
        let tmp = NamedTempFile::new().unwrap();
        let store = TelemetryStore::open(tmp.path()).unwrap();
        let entity = EntityRef::advanced(1);

        let facts: Vec<_> = (0..(CHUNK_ROWS * 2 + 5))
            .map(|i| {
                TelemetryFact::Connection(ConnectionRecord {
                    entity: entity.clone(),
                    timestamp: Utc::now(),
                    source_addr: format!("10.0.0.{}:5000", i % 250),
                    dest_addr: "127.0.0.1:22".to_string(),
                    protocol: Protocol::Tcp,
                    duration_ms: i,
                    bytes_total: 100,
                })
            })
            .collect();
        store.append_batch(&facts).unwrap();

        let csv = collect(history_csv(store, entity)).await;
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines[0], HISTORY_HEADER.trim_end());
        assert_eq!(lines.len() as i64, CHUNK_ROWS * 2 + 5 + 1);
        // Newest first
        assert!(lines[1].contains(&format!(",{},100", CHUNK_ROWS * 2 + 4)));
    }

    #[tokio::test]
    async fn test_audit_export_escapes_messages() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        store
            .append_audit(&AuditRecord::info("nodes", "admin", "create", "created node 'a,b'".to_string()))
            .unwrap();

        let csv = collect(audit_csv(store, AuditFilter::default())).await;
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with(",nodes,admin,create,\"created node 'a,b'\""));
    }
}
