//! HTTP request handlers.

use super::auth::Principal;
use super::envelope::{ok, ApiError, ApiResult};
use super::AppState;
use crate::db::{
    AdvancedMapping, AdvancedMappingPatch, AdvancedMappingSpec, AuditEntry, AuditFilter, ConnectionRecord,
    EntityRef, HistoryPage, LogLevel, Mapping, MappingPatch, MappingSpec, Node, NodePatch, NodeSpec, NodeStatus,
    Page, PageRequest, TestResult,
};
use crate::engine::EngineEvent;
use crate::error::Error;
use crate::scheduler::DispatchSummary;
use crate::telemetry::{audit_csv, CsvChunk, NodePerformance, TimeRange, TrafficBucket, TrafficSeries};

use axum::{
    body::Body,
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Extension, Path, Query, State,
    },
    http::header,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;

const DEFAULT_PAGE_SIZE: u32 = 10;
const DEFAULT_TIME_RANGE: &str = "1h";

type IdPath = Result<Path<i64>, PathRejection>;

// ============================================================================
// Query parameters
// ============================================================================

fn page_request(page: Option<u32>, page_size: Option<u32>, max: u32) -> PageRequest {
    PageRequest::new(page.unwrap_or(1), page_size.unwrap_or(DEFAULT_PAGE_SIZE).min(max))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    /// Snapshot returned by an earlier page.
    pub snapshot: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRangeQuery {
    #[serde(alias = "range")]
    pub time_range: Option<String>,
}

impl TimeRangeQuery {
    fn range(&self) -> Result<TimeRange, Error> {
        TimeRange::parse(self.time_range.as_deref().unwrap_or(DEFAULT_TIME_RANGE), Utc::now())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    /// `all`, `info`, `warning` or `error`.
    pub level: Option<String>,
    pub module: Option<String>,
}

impl LogsQuery {
    fn filter(&self) -> Result<AuditFilter, Error> {
        let level = match self.level.as_deref().map(str::trim) {
            None | Some("") | Some("all") => None,
            Some(raw) => Some(raw.parse::<LogLevel>().map_err(Error::Validation)?),
        };
        let module = self
            .module
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty() && *m != "all")
            .map(str::to_string);
        Ok(AuditFilter { level, module })
    }
}

// ============================================================================
// Dashboard
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub online_nodes: i64,
    pub active_connections: i64,
    /// Bytes in and out over the last 24 hours.
    pub total_traffic: i64,
    pub avg_latency: f64,
}

pub async fn handle_stats(State(state): State<AppState>) -> ApiResult<Stats> {
    let nodes = state.store.node_summary()?;
    let (mappings, advanced) = state.store.running_counts()?;

    ok(Stats {
        online_nodes: nodes.online,
        active_connections: mappings + advanced,
        total_traffic: state.aggregator.tunnel_traffic_last_day()?,
        avg_latency: nodes.avg_latency_ms,
    })
}

pub async fn handle_traffic_trend(
    State(state): State<AppState>,
    query: Result<Query<TimeRangeQuery>, QueryRejection>,
) -> ApiResult<TrafficResponse> {
    let Query(query) = query?;
    ok(state.aggregator.traffic_trend(query.range()?)?.into())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusCount {
    pub status: NodeStatus,
    pub count: i64,
}

pub async fn handle_node_status(State(state): State<AppState>) -> ApiResult<Vec<NodeStatusCount>> {
    let counts = state.store.node_status_counts()?;
    ok(counts
        .into_iter()
        .map(|(status, count)| NodeStatusCount { status, count })
        .collect())
}

// ============================================================================
// API: Nodes
// ============================================================================

pub async fn handle_list_nodes(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Page<Node>> {
    let Query(query) = query?;
    let page = page_request(query.page, query.page_size, state.config.max_page_size);
    ok(state.nodes.list(page)?)
}

pub async fn handle_create_node(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<NodeSpec>, JsonRejection>,
) -> ApiResult<Node> {
    let Json(spec) = payload?;
    ok(state.nodes.create(spec, &principal.user)?)
}

pub async fn handle_get_node(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Node> {
    ok(state.nodes.get(&name)?)
}

pub async fn handle_update_node(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
    payload: Result<Json<NodePatch>, JsonRejection>,
) -> ApiResult<Node> {
    let Json(patch) = payload?;
    ok(state.nodes.update(&name, patch, &principal.user)?)
}

pub async fn handle_delete_node(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
) -> ApiResult<()> {
    state.nodes.delete(&name, &principal.user)?;
    ok(())
}

/// Performance and connections need real node telemetry; never fabricate it.
fn require_node_telemetry(state: &AppState, what: &str) -> Result<(), Error> {
    if state.engine.capabilities().node_telemetry {
        Ok(())
    } else {
        Err(Error::Unavailable(what.to_string()))
    }
}

pub async fn handle_node_performance(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: Result<Query<TimeRangeQuery>, QueryRejection>,
) -> ApiResult<NodePerformance> {
    let Query(query) = query?;
    require_node_telemetry(&state, "node performance")?;
    state.nodes.get(&name)?;
    ok(state.aggregator.node_performance(&name, query.range()?)?)
}

pub async fn handle_node_connections(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<HistoryPage<ConnectionRecord>> {
    let Query(query) = query?;
    require_node_telemetry(&state, "node connections")?;
    state.nodes.get(&name)?;
    let page = page_request(query.page, query.page_size, state.config.max_page_size);
    ok(state.aggregator.history(&EntityRef::node(&name), page, query.snapshot)?)
}

// ============================================================================
// API: Mappings
// ============================================================================

pub async fn handle_list_mappings(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Page<Mapping>> {
    let Query(query) = query?;
    let page = page_request(query.page, query.page_size, state.config.max_page_size);
    ok(state.mappings.list(page)?)
}

pub async fn handle_create_mapping(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<MappingSpec>, JsonRejection>,
) -> ApiResult<Mapping> {
    let Json(spec) = payload?;
    ok(state.mappings.create(spec, &principal.user)?)
}

pub async fn handle_get_mapping(State(state): State<AppState>, id: IdPath) -> ApiResult<Mapping> {
    let Path(id) = id?;
    ok(state.mappings.get(id)?)
}

pub async fn handle_update_mapping(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    id: IdPath,
    payload: Result<Json<MappingPatch>, JsonRejection>,
) -> ApiResult<Mapping> {
    let Path(id) = id?;
    let Json(patch) = payload?;
    ok(state.mappings.update(id, patch, &principal.user)?)
}

pub async fn handle_delete_mapping(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    id: IdPath,
) -> ApiResult<()> {
    let Path(id) = id?;
    state.mappings.delete(id, &principal.user)?;
    ok(())
}

pub async fn handle_start_mapping(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    id: IdPath,
) -> ApiResult<Mapping> {
    let Path(id) = id?;
    match state.controller.start_mapping(id, &principal.user).await {
        Ok(mapping) => ok(mapping),
        Err(err @ Error::Precondition(_)) => Err(ApiError::from(err).with_data(state.mappings.get(id).ok())),
        Err(err) => Err(err.into()),
    }
}

pub async fn handle_stop_mapping(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    id: IdPath,
) -> ApiResult<Mapping> {
    let Path(id) = id?;
    ok(state.controller.stop_mapping(id, &principal.user).await?)
}

/// Zero-filled traffic series as served to charts.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficResponse {
    /// Absent for the all-tunnel trend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityRef>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket_seconds: i64,
    pub total_in: i64,
    pub total_out: i64,
    pub buckets: Vec<TrafficBucket>,
}

impl From<TrafficSeries> for TrafficResponse {
    fn from(series: TrafficSeries) -> Self {
        let (total_in, total_out) = series.totals();
        Self {
            start: series.range.start,
            end: series.range.end,
            bucket_seconds: series.bucket_secs(),
            total_in,
            total_out,
            buckets: series.iter().collect(),
            entity: series.entity,
        }
    }
}

pub async fn handle_mapping_traffic(
    State(state): State<AppState>,
    id: IdPath,
    query: Result<Query<TimeRangeQuery>, QueryRejection>,
) -> ApiResult<TrafficResponse> {
    let Path(id) = id?;
    let Query(query) = query?;
    state.mappings.get(id)?;
    let series = state.aggregator.traffic(&EntityRef::mapping(id), query.range()?)?;
    ok(series.into())
}

pub async fn handle_mapping_history(
    State(state): State<AppState>,
    id: IdPath,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<HistoryPage<ConnectionRecord>> {
    let Path(id) = id?;
    let Query(query) = query?;
    state.mappings.get(id)?;
    let page = page_request(query.page, query.page_size, state.config.max_page_size);
    ok(state.aggregator.history(&EntityRef::mapping(id), page, query.snapshot)?)
}

// ============================================================================
// API: Advanced mappings
// ============================================================================

pub async fn handle_list_advanced(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Page<AdvancedMapping>> {
    let Query(query) = query?;
    let page = page_request(query.page, query.page_size, state.config.max_page_size);
    ok(state.advanced.list(page)?)
}

pub async fn handle_create_advanced(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<AdvancedMappingSpec>, JsonRejection>,
) -> ApiResult<AdvancedMapping> {
    let Json(spec) = payload?;
    ok(state.advanced.create(spec, &principal.user)?)
}

pub async fn handle_get_advanced(State(state): State<AppState>, id: IdPath) -> ApiResult<AdvancedMapping> {
    let Path(id) = id?;
    ok(state.advanced.get(id)?)
}

pub async fn handle_update_advanced(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    id: IdPath,
    payload: Result<Json<AdvancedMappingPatch>, JsonRejection>,
) -> ApiResult<AdvancedMapping> {
    let Path(id) = id?;
    let Json(patch) = payload?;
    ok(state.advanced.update(id, patch, &principal.user)?)
}

pub async fn handle_delete_advanced(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    id: IdPath,
) -> ApiResult<()> {
    let Path(id) = id?;
    state.advanced.delete(id, &principal.user)?;
    ok(())
}

pub async fn handle_start_advanced(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    id: IdPath,
) -> ApiResult<AdvancedMapping> {
    let Path(id) = id?;
    match state.controller.start(id, &principal.user).await {
        Ok(mapping) => ok(mapping),
        // Let the dashboard show where the mapping actually is
        Err(err @ Error::Precondition(_)) => Err(ApiError::from(err).with_data(state.advanced.get(id).ok())),
        Err(err) => Err(err.into()),
    }
}

pub async fn handle_stop_advanced(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    id: IdPath,
) -> ApiResult<AdvancedMapping> {
    let Path(id) = id?;
    ok(state.controller.stop(id, &principal.user).await?)
}

pub async fn handle_test_advanced(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    id: IdPath,
) -> ApiResult<TestResult> {
    let Path(id) = id?;
    match state.controller.test(id, &principal.user).await {
        Ok(result) => ok(result),
        Err(err @ Error::Timeout(_)) => {
            let recorded = state.advanced.get(id).ok().and_then(|m| m.last_test_result);
            Err(ApiError::from(err).with_data(recorded))
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn handle_advanced_traffic(
    State(state): State<AppState>,
    id: IdPath,
    query: Result<Query<TimeRangeQuery>, QueryRejection>,
) -> ApiResult<TrafficResponse> {
    let Path(id) = id?;
    let Query(query) = query?;
    state.advanced.get(id)?;
    let series = state.aggregator.traffic(&EntityRef::advanced(id), query.range()?)?;
    ok(series.into())
}

pub async fn handle_advanced_history(
    State(state): State<AppState>,
    id: IdPath,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<HistoryPage<ConnectionRecord>> {
    let Path(id) = id?;
    let Query(query) = query?;
    state.advanced.get(id)?;
    let page = page_request(query.page, query.page_size, state.config.max_page_size);
    ok(state.aggregator.history(&EntityRef::advanced(id), page, query.snapshot)?)
}

pub async fn handle_export_advanced_history(
    State(state): State<AppState>,
    id: IdPath,
) -> Result<Response, ApiError> {
    let Path(id) = id?;
    state.advanced.get(id)?;
    let stream = state.aggregator.export_csv(&EntityRef::advanced(id));
    Ok(csv_response(stream, &format!("advanced-mapping-{}-history.csv", id)))
}

fn csv_response(stream: ReceiverStream<CsvChunk>, filename: &str) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", filename)),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

// ============================================================================
// API: Logs
// ============================================================================

pub async fn handle_list_logs(
    State(state): State<AppState>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> ApiResult<Page<AuditEntry>> {
    let Query(query) = query?;
    let page = page_request(query.page, query.page_size, state.config.max_page_size);
    ok(state.store.list_audit(&query.filter()?, page)?)
}

pub async fn handle_export_logs(
    State(state): State<AppState>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    let stream = audit_csv(state.store.clone(), query.filter()?);
    Ok(csv_response(stream, "logs.csv"))
}

// ============================================================================
// Engine push
// ============================================================================

pub async fn handle_engine_events(
    State(state): State<AppState>,
    payload: Result<Json<Vec<EngineEvent>>, JsonRejection>,
) -> ApiResult<DispatchSummary> {
    let Json(events) = payload?;
    ok(state.dispatcher.dispatch_all(events).await)
}
