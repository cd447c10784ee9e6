//! REST API: block-list files, indicator queries and operator controls

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{Duration, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use validator::Validate;

use crate::config::{AppConfig, CloudProvider, FeedFormat};
use crate::dedup::DnsDeduplicator;
use crate::error::{ConfigError, ExportError, PipelineError, StoreError};
use crate::export::{export_indicators, CloudLists, ExportFormat};
use crate::models::ioc_utils::classify_and_normalize;
use crate::models::{Indicator, IndicatorFilter, IndicatorType, PaginatedResponse};
use crate::pipeline::Pipeline;

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<T, ApiError>;

const TOP_COUNTRIES: i64 = 10;
const STATS_HISTORY_DAYS: i64 = 30;

/// Application state shared across handlers
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub dedup: Arc<DnsDeduplicator>,
    pub cloud: Arc<CloudLists>,
    pub metrics: Option<PrometheusHandle>,
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        // Block-lists
        .route("/edl/:name", get(edl_file))
        .route("/api/v1/export", get(export))
        // Indicators
        .route("/api/v1/indicators", get(list_indicators))
        .route("/api/v1/indicators/lookup", get(lookup_indicator))
        // Jobs
        .route("/api/v1/jobs", get(job_status))
        .route("/api/v1/jobs/history", get(job_history).delete(clear_job_history))
        // Allow-lists and the manual block-list
        .route("/api/v1/whitelist", get(list_whitelist).post(add_whitelist))
        .route("/api/v1/whitelist/:id", delete(remove_whitelist))
        .route(
            "/api/v1/safelist",
            get(list_safelist).post(add_safelist).delete(remove_safelist),
        )
        .route("/api/v1/blocklist", get(list_blocklist).post(add_blocklist))
        .route("/api/v1/blocklist/:id", delete(remove_blocklist))
        // Statistics
        .route("/api/v1/stats", get(get_stats))
        // Settings and feeds
        .route("/api/v1/settings", get(get_settings).put(update_settings))
        .route("/api/v1/sources", get(list_sources))
        .route("/api/v1/feeds/refresh", post(refresh_feeds))
        .route("/api/v1/feeds/:name/refresh", post(refresh_feed))
        .route("/api/v1/feeds/:name/test", post(test_feed))
        // DNS dedup
        .route("/api/v1/dns/resolve", post(dns_resolve))
        .route("/api/v1/dns/sweep", post(dns_sweep))
        // Cloud provider allow-lists
        .route("/api/v1/cloud/:provider/refresh", post(refresh_cloud))
        .with_state(state)
}

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::Constraint(_) => error(StatusCode::CONFLICT, "Item already exists"),
        e => {
            tracing::error!(error = %e, "Store operation failed");
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn pipeline_error(e: PipelineError) -> ApiError {
    match e {
        PipelineError::UnknownSource(_) => error(StatusCode::NOT_FOUND, e.to_string()),
        PipelineError::AlreadyRunning | PipelineError::SourceBusy(_) => {
            error(StatusCode::CONFLICT, e.to_string())
        }
        PipelineError::Fetch(_) | PipelineError::Parse(_) => error(StatusCode::BAD_GATEWAY, e.to_string()),
        PipelineError::Store(e) => store_error(e),
        PipelineError::Config(ConfigError::Validation { .. } | ConfigError::Json(_)) => {
            error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
        e => {
            tracing::error!(error = %e, "Pipeline operation failed");
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn validate<T: Validate>(body: &T) -> ApiResult<()> {
    body.validate()
        .map_err(|e| error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))
}

fn parse_item(raw: &str) -> ApiResult<(String, IndicatorType)> {
    classify_and_normalize(raw).ok_or_else(|| {
        error(
            StatusCode::BAD_REQUEST,
            format!("'{raw}' is not an IP, CIDR, domain or URL"),
        )
    })
}

fn comma_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

// ==================== Handlers ====================

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "feedforge",
        "version": env!("CARGO_PKG_VERSION"),
        "aggregation_running": state.pipeline.jobs().is_running(),
    }))
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => error(StatusCode::NOT_FOUND, "Metrics exporter not installed").into_response(),
    }
}

async fn edl_file(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult<Response> {
    let path = state
        .pipeline
        .edl()
        .path_of(&name)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("Unknown list '{name}'")))?;
    match tokio::fs::read_to_string(&path).await {
        Ok(body) => Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(error(StatusCode::NOT_FOUND, format!("'{name}' has not been generated yet")))
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to read EDL file");
            Err(error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    format: Option<String>,
    /// Comma-separated indicator types.
    types: Option<String>,
    /// Comma-separated source names.
    sources: Option<String>,
}

async fn export(State(state): State<Arc<AppState>>, Query(query): Query<ExportQuery>) -> ApiResult<Response> {
    let format = match query.format.as_deref() {
        Some(raw) => raw
            .parse::<ExportFormat>()
            .map_err(|e| error(StatusCode::BAD_REQUEST, e))?,
        None => ExportFormat::Text,
    };
    let types = comma_list(query.types.as_deref())
        .iter()
        .map(|t| t.parse::<IndicatorType>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| error(StatusCode::BAD_REQUEST, e.to_string()))?;
    let sources = comma_list(query.sources.as_deref());

    let body = export_indicators(state.pipeline.store().as_ref(), &types, &sources, format)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Export failed");
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
    Ok(([(header::CONTENT_TYPE, format.content_type())], body).into_response())
}

async fn list_indicators(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<IndicatorFilter>,
) -> ApiResult<Json<PaginatedResponse<Indicator>>> {
    state
        .pipeline
        .store()
        .query_indicators(&filter)
        .await
        .map(Json)
        .map_err(store_error)
}

#[derive(Debug, Deserialize)]
struct LookupQuery {
    value: String,
}

async fn lookup_indicator(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LookupQuery>,
) -> ApiResult<Json<Value>> {
    let value = classify_and_normalize(&query.value)
        .map(|(value, _)| value)
        .unwrap_or_else(|| query.value.trim().to_string());
    let store = state.pipeline.store();
    match store.get_indicator(&value).await.map_err(store_error)? {
        Some(indicator) => {
            let sources = store.sources_for_indicator(&value).await.map_err(store_error)?;
            Ok(Json(json!({
                "found": true,
                "indicator": indicator,
                "sources": sources,
            })))
        }
        None => Ok(Json(json!({
            "found": false,
            "value": value,
        }))),
    }
}

async fn job_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let jobs = state.pipeline.jobs();
    Json(json!({
        "running": jobs.is_running(),
        "sources": jobs.snapshot(),
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

async fn job_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 1000);
    let history = state.pipeline.store().job_history(limit).await.map_err(store_error)?;
    Ok(Json(json!({ "history": history })))
}

async fn clear_job_history(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let removed = state.pipeline.store().clear_job_history().await.map_err(store_error)?;
    Ok(Json(json!({ "removed": removed })))
}

#[derive(Debug, Deserialize, Validate)]
struct NewListItem {
    #[validate(length(min = 1, max = 2048))]
    item: String,
    #[validate(length(max = 500))]
    description: Option<String>,
}

async fn list_whitelist(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let entries = state.pipeline.store().list_whitelist().await.map_err(store_error)?;
    Ok(Json(json!({ "whitelist": entries })))
}

async fn add_whitelist(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewListItem>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    validate(&body)?;
    let (item, indicator_type) = parse_item(&body.item)?;
    let entry = state
        .pipeline
        .store()
        .add_whitelist(&item, indicator_type, body.description.as_deref())
        .await
        .map_err(store_error)?;

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline.cleanup_whitelisted().await {
            tracing::warn!(error = %e, "Whitelist cleanup after insert failed");
        }
    });

    Ok((StatusCode::CREATED, Json(json!(entry))))
}

async fn remove_whitelist(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    match state.pipeline.store().remove_whitelist(id).await.map_err(store_error)? {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(error(StatusCode::NOT_FOUND, "Whitelist entry not found")),
    }
}

#[derive(Debug, Deserialize, Validate)]
struct SafelistItem {
    #[validate(length(min = 1, max = 2048))]
    item: String,
}

async fn list_safelist(State(state): State<Arc<AppState>>) -> Json<Value> {
    let safelist = state.pipeline.whitelist().safelist().state();
    Json(json!({ "safelist": &safelist.items }))
}

async fn add_safelist(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SafelistItem>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    validate(&body)?;
    let (item, _) = parse_item(&body.item)?;
    let added = state
        .pipeline
        .whitelist()
        .safelist()
        .add(&item)
        .await
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if !added {
        return Err(error(StatusCode::CONFLICT, "Item already exists"));
    }

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline.cleanup_whitelisted().await {
            tracing::warn!(error = %e, "Safelist cleanup after insert failed");
        }
    });

    Ok((StatusCode::CREATED, Json(json!({ "item": item }))))
}

async fn remove_safelist(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SafelistItem>,
) -> ApiResult<StatusCode> {
    let item = classify_and_normalize(&query.item)
        .map(|(value, _)| value)
        .unwrap_or_else(|| query.item.trim().to_string());
    let removed = state
        .pipeline
        .whitelist()
        .safelist()
        .remove(&item)
        .await
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    match removed {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(error(StatusCode::NOT_FOUND, "Safelist item not found")),
    }
}

async fn list_blocklist(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let entries = state.pipeline.store().list_blocklist().await.map_err(store_error)?;
    Ok(Json(json!({ "blocklist": entries })))
}

fn spawn_edl_refresh(pipeline: Arc<Pipeline>) {
    tokio::spawn(async move {
        if let Err(e) = pipeline.edl().regenerate(pipeline.store().as_ref()).await {
            tracing::warn!(error = %e, "EDL refresh after block-list change failed");
        }
    });
}

async fn add_blocklist(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewListItem>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    validate(&body)?;
    let (item, indicator_type) = parse_item(&body.item)?;
    let entry = state
        .pipeline
        .store()
        .add_blocklist(&item, indicator_type, body.description.as_deref())
        .await
        .map_err(store_error)?;
    spawn_edl_refresh(state.pipeline.clone());
    Ok((StatusCode::CREATED, Json(json!(entry))))
}

async fn remove_blocklist(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    if !state.pipeline.store().remove_blocklist(id).await.map_err(store_error)? {
        return Err(error(StatusCode::NOT_FOUND, "Block-list entry not found"));
    }
    spawn_edl_refresh(state.pipeline.clone());
    Ok(StatusCode::NO_CONTENT)
}

async fn get_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let store = state.pipeline.store();
    let counts = store.counts_by_type().await.map_err(store_error)?;
    let countries = store.country_stats(TOP_COUNTRIES).await.map_err(store_error)?;
    let sources = store.source_counts().await.map_err(store_error)?;
    let history = store
        .stats_history(Utc::now() - Duration::days(STATS_HISTORY_DAYS))
        .await
        .map_err(store_error)?;
    Ok(Json(json!({
        "total": counts.total(),
        "by_type": counts,
        "top_countries": countries,
        "sources": sources,
        "history": history,
    })))
}

#[derive(Debug, Serialize)]
struct SourceSummary {
    name: String,
    url: String,
    format: FeedFormat,
    confidence: i32,
    enabled: bool,
    schedule_interval_minutes: Option<u64>,
    indicators: i64,
}

async fn list_sources(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let counts = state.pipeline.store().source_counts().await.map_err(store_error)?;
    let sources: Vec<SourceSummary> = state
        .pipeline
        .config()
        .sources
        .into_iter()
        .map(|s| SourceSummary {
            indicators: counts
                .iter()
                .find(|c| c.source_name == s.name)
                .map(|c| c.count)
                .unwrap_or(0),
            name: s.name,
            url: s.url,
            format: s.format,
            confidence: s.confidence,
            enabled: s.enabled,
            schedule_interval_minutes: s.schedule_interval_minutes,
        })
        .collect();
    Ok(Json(json!({ "sources": sources })))
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Json<AppConfig> {
    Json(state.pipeline.config().redacted())
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AppConfig>,
) -> ApiResult<Json<AppConfig>> {
    let updated = state.pipeline.update_config(body).await.map_err(pipeline_error)?;
    Ok(Json(updated.redacted()))
}

async fn refresh_feeds(State(state): State<Arc<AppState>>) -> ApiResult<(StatusCode, Json<Value>)> {
    if state.pipeline.jobs().is_running() {
        return Err(pipeline_error(PipelineError::AlreadyRunning));
    }
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline.run_all().await {
            tracing::error!(error = %e, "Triggered aggregation run failed");
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "Feed refresh triggered" })),
    ))
}

async fn refresh_feed(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if state.pipeline.config().source(&name).is_none() {
        return Err(pipeline_error(PipelineError::UnknownSource(name)));
    }
    if state.pipeline.jobs().is_source_active(&name) {
        return Err(pipeline_error(PipelineError::SourceBusy(name)));
    }
    let pipeline = state.pipeline.clone();
    let source = name.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline.process_single(&source).await {
            tracing::error!(source = %source, error = %e, "Triggered source run failed");
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": format!("Refresh of '{name}' triggered") })),
    ))
}

async fn test_feed(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult<Json<Value>> {
    let source = state
        .pipeline
        .config()
        .source(&name)
        .cloned()
        .ok_or_else(|| pipeline_error(PipelineError::UnknownSource(name)))?;
    let report = state.pipeline.test_feed(&source).await.map_err(pipeline_error)?;
    Ok(Json(json!(report)))
}

async fn dns_resolve(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let report = state.dedup.resolve_batch().await.map_err(store_error)?;
    Ok(Json(json!(report)))
}

async fn dns_sweep(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let report = state.dedup.sweep().await.map_err(store_error)?;
    Ok(Json(json!(report)))
}

async fn refresh_cloud(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> ApiResult<Json<Value>> {
    let provider: CloudProvider = provider.parse().map_err(|e: String| error(StatusCode::NOT_FOUND, e))?;
    match state.cloud.refresh(provider).await {
        Ok(report) => Ok(Json(json!(report))),
        Err(e @ (ExportError::Fetch(_) | ExportError::Payload { .. })) => {
            tracing::warn!(%provider, error = %e, "Cloud list refresh failed");
            Err(error(StatusCode::BAD_GATEWAY, e.to_string()))
        }
        Err(e) => {
            tracing::error!(%provider, error = %e, "Cloud list refresh failed");
            Err(error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}
