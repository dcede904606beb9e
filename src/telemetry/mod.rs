//! Telemetry aggregator.
//!
//! Ingest is append-only and goes through a channel to a batch writer task,
//! so producers never wait on SQLite. Reads go straight to the telemetry
//! store's reader connection and see a slightly stale but consistent view.

mod buckets;
mod export;
mod latency;

pub use buckets::*;
pub use export::*;
pub use latency::*;

use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::db::{
    ConnectionRecord, EntityKind, EntityRef, HistoryPage, NodeReport, PageRequest, TelemetryFact, TelemetryStore,
    TrafficSample,
};
use crate::error::{Error, Result};

const FLUSH_THRESHOLD: usize = 500;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

enum IngestMsg {
    Fact(TelemetryFact),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct Aggregator {
    store: TelemetryStore,
    tx: mpsc::Sender<IngestMsg>,
}

impl Aggregator {
    /// Create the aggregator and start its batch writer.
    pub fn new(store: TelemetryStore) -> Self {
        let (tx, rx) = mpsc::channel(10_000);
        tokio::spawn(run_batch_writer(rx, store.clone()));
        Self { store, tx }
    }

    /// Queue a traffic sample. Negative byte counts are rejected and dropped.
    pub async fn ingest(&self, sample: TrafficSample) -> Result<()> {
        if sample.bytes_in < 0 || sample.bytes_out < 0 {
            return Err(Error::Validation(format!(
                "negative byte count for {} ({} in, {} out)",
                sample.entity, sample.bytes_in, sample.bytes_out
            )));
        }
        self.send(TelemetryFact::Traffic(sample)).await
    }

    pub async fn ingest_connection(&self, record: ConnectionRecord) -> Result<()> {
        if record.bytes_total < 0 || record.duration_ms < 0 {
            return Err(Error::Validation(format!(
                "negative byte count or duration for connection of {}",
                record.entity
            )));
        }
        self.send(TelemetryFact::Connection(record)).await
    }

    pub async fn ingest_node_report(&self, report: NodeReport) -> Result<()> {
        self.send(TelemetryFact::NodeStatus(report)).await
    }

    /// Wait until everything queued so far is written.
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(IngestMsg::Flush(done_tx))
            .await
            .map_err(|_| Error::Internal("telemetry writer stopped".to_string()))?;
        done_rx
            .await
            .map_err(|_| Error::Internal("telemetry writer stopped".to_string()))
    }

    async fn send(&self, fact: TelemetryFact) -> Result<()> {
        self.tx
            .send(IngestMsg::Fact(fact))
            .await
            .map_err(|_| Error::Internal("telemetry writer stopped".to_string()))
    }

    /// Zero-filled traffic buckets for `entity` over `range`.
    pub fn traffic(&self, entity: &EntityRef, range: TimeRange) -> Result<TrafficSeries> {
        let sums = self.store.traffic_buckets(
            entity,
            range.start,
            range.end,
            range.origin().timestamp_millis(),
            range.bucket_secs() * 1000,
        )?;
        Ok(TrafficSeries::new(entity.clone(), range, sums))
    }

    /// Zero-filled traffic of all mappings and advanced mappings together.
    pub fn traffic_trend(&self, range: TimeRange) -> Result<TrafficSeries> {
        let sums = self.store.tunnel_traffic_buckets(
            range.start,
            range.end,
            range.origin().timestamp_millis(),
            range.bucket_secs() * 1000,
        )?;
        Ok(TrafficSeries::all_tunnels(range, sums))
    }

    /// Reverse-chronological connection history. Pass the returned snapshot
    /// back to keep later pages stable while records keep arriving.
    pub fn history(
        &self,
        entity: &EntityRef,
        page: PageRequest,
        snapshot: Option<i64>,
    ) -> Result<HistoryPage<ConnectionRecord>> {
        Ok(self.store.history_page(entity, page, snapshot)?)
    }

    pub fn export_csv(&self, entity: &EntityRef) -> ReceiverStream<CsvChunk> {
        history_csv(self.store.clone(), entity.clone())
    }

    pub fn node_performance(&self, node: &str, range: TimeRange) -> Result<NodePerformance> {
        let traffic = self.traffic(&EntityRef::node(node), range)?;
        let samples = self.store.node_samples(node, range.start, range.end)?;
        Ok(node_performance(node, &traffic, &samples))
    }

    /// Bytes carried by all mappings over the last 24 hours.
    pub fn tunnel_traffic_last_day(&self) -> Result<i64> {
        let since = Utc::now() - ChronoDuration::hours(24);
        let mut total = 0;
        for kind in [EntityKind::Mapping, EntityKind::AdvancedMapping] {
            let (bytes_in, bytes_out) = self.store.traffic_total(kind, since)?;
            total += bytes_in + bytes_out;
        }
        Ok(total)
    }
}

/// Accumulate facts and write them in batches.
async fn run_batch_writer(mut rx: mpsc::Receiver<IngestMsg>, store: TelemetryStore) {
    let mut buffer: Vec<TelemetryFact> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(IngestMsg::Fact(fact)) => {
                        buffer.push(fact);
                        if buffer.len() >= FLUSH_THRESHOLD {
                            flush_buffer(&store, &mut buffer).await;
                        }
                    }
                    Some(IngestMsg::Flush(done)) => {
                        flush_buffer(&store, &mut buffer).await;
                        let _ = done.send(());
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(&store, &mut buffer).await;
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer).await;
            }
        }
    }
}

async fn flush_buffer(store: &TelemetryStore, buffer: &mut Vec<TelemetryFact>) {
    if buffer.is_empty() {
        return;
    }

    let batch = std::mem::take(buffer);
    let count = batch.len();
    let store = store.clone();
    let result = tokio::task::spawn_blocking(move || store.append_batch(&batch)).await;

    match result {
        Ok(Ok(())) => tracing::debug!("Telemetry: wrote {} facts", count),
        Ok(Err(e)) => tracing::error!("Telemetry: failed to write {} facts: {}", count, e),
        Err(e) => tracing::error!("Telemetry: writer task failed: {}", e),
    }
}
