//! Health, monitoring and DLQ admin endpoints for stream workers.
//!
//! - Liveness: `/health`, `/healthz`
//! - Readiness: `/ready`, `/readyz` (Redis PING plus any registered [`ReadinessCheck`])
//! - Stream monitoring: `/stream/info`
//! - Prometheus: `/metrics`
//! - DLQ admin: `/admin/dlq/*`, each taking `?stream=` (defaults to the first stream)

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::consumer::read_stream_info;
use crate::dlq::DlqManager;
use crate::metrics;
use crate::registry::StreamDef;

/// Extra dependency checked by the readiness probe (database, ...).
#[async_trait::async_trait]
pub trait ReadinessCheck: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self) -> Result<(), String>;
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoredStream {
    pub stream_name: String,
    pub consumer_group: String,
    pub dlq_stream: String,
}

impl MonitoredStream {
    pub fn from_stream_def<S: StreamDef>() -> Self {
        Self {
            stream_name: S::STREAM_NAME.to_string(),
            consumer_group: S::CONSUMER_GROUP.to_string(),
            dlq_stream: S::DLQ_STREAM.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct HealthState {
    pub redis: ConnectionManager,
    pub app_name: String,
    pub app_version: String,
    pub streams: Vec<MonitoredStream>,
    pub checks: Vec<Arc<dyn ReadinessCheck>>,
}

impl HealthState {
    pub fn new(
        redis: ConnectionManager,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            redis,
            app_name: app_name.into(),
            app_version: app_version.into(),
            streams: Vec::new(),
            checks: Vec::new(),
        }
    }

    pub fn with_stream<S: StreamDef>(mut self) -> Self {
        self.streams.push(MonitoredStream::from_stream_def::<S>());
        self
    }

    pub fn with_check(mut self, check: Arc<dyn ReadinessCheck>) -> Self {
        self.checks.push(check);
        self
    }

    fn dlq_manager(&self, stream: Option<&str>) -> Option<DlqManager> {
        let monitored = match stream {
            Some(name) => self.streams.iter().find(|s| s.stream_name == name),
            None => self.streams.first(),
        }?;
        Some(DlqManager::new(
            self.redis.clone(),
            &monitored.stream_name,
            &monitored.dlq_stream,
        ))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Liveness probe. OK whenever the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let mut conn = state.redis.clone();
    let ping: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;

    let mut results = vec![(
        "redis",
        match ping {
            Ok(ref pong) if pong == "PONG" => Ok(()),
            Ok(other) => Err(format!("unexpected response: {}", other)),
            Err(e) => Err(format!("error: {}", e)),
        },
    )];

    for check in &state.checks {
        results.push((check.name(), check.check().await));
    }

    readiness_report(results)
}

fn readiness_report(results: Vec<(&'static str, Result<(), String>)>) -> (StatusCode, Json<Value>) {
    let ready = results.iter().all(|(_, r)| r.is_ok());
    let checks: serde_json::Map<String, Value> = results
        .into_iter()
        .map(|(name, r)| {
            let value = match r {
                Ok(()) => Value::from("ok"),
                Err(e) => Value::from(e),
            };
            (name.to_string(), value)
        })
        .collect();

    let (status, label) = if ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };

    (status, Json(json!({ "status": label, "checks": checks })))
}

/// Depth and pending count of every monitored stream and its DLQ.
pub async fn stream_info_handler(State(state): State<HealthState>) -> Response {
    let mut conn = state.redis.clone();
    let mut streams = Vec::with_capacity(state.streams.len());

    for monitored in &state.streams {
        let info =
            match read_stream_info(&mut conn, &monitored.stream_name, &monitored.consumer_group).await {
                Ok(info) => info,
                Err(e) => return internal_error(e),
            };
        let dlq_length: i64 = match redis::cmd("XLEN")
            .arg(&monitored.dlq_stream)
            .query_async(&mut conn)
            .await
        {
            Ok(len) => len,
            Err(e) => return internal_error(e),
        };

        streams.push(json!({
            "stream": info.stream_name,
            "consumer_group": info.consumer_group,
            "length": info.length,
            "pending": info.pending_count,
            "dlq_stream": monitored.dlq_stream,
            "dlq_length": dlq_length,
        }));
    }

    Json(json!({ "streams": streams })).into_response()
}

pub async fn metrics_handler() -> Response {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics recorder not installed".to_string(),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct DlqParams {
    pub stream: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub count: usize,
}

fn default_limit() -> usize {
    10
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

fn unknown_stream(stream: Option<&str>) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "unknown stream", "stream": stream })),
    )
        .into_response()
}

fn not_in_dlq(message_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Message not found in DLQ", "message_id": message_id })),
    )
        .into_response()
}

/// `GET /admin/dlq/stats`
pub async fn dlq_stats_handler(
    State(state): State<HealthState>,
    Query(params): Query<DlqParams>,
) -> Response {
    let Some(manager) = state.dlq_manager(params.stream.as_deref()) else {
        return unknown_stream(params.stream.as_deref());
    };

    match manager.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error(e),
    }
}

/// `GET /admin/dlq/messages?limit=10&offset=0`
pub async fn dlq_list_handler(
    State(state): State<HealthState>,
    Query(params): Query<DlqParams>,
) -> Response {
    let Some(manager) = state.dlq_manager(params.stream.as_deref()) else {
        return unknown_stream(params.stream.as_deref());
    };
    let limit = params.limit.min(100);

    match manager.list_messages(limit, params.offset).await {
        Ok(messages) => Json(json!({
            "count": messages.len(),
            "messages": messages,
            "limit": limit,
            "offset": params.offset,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

/// `POST /admin/dlq/reprocess/{id}`
pub async fn dlq_reprocess_one_handler(
    State(state): State<HealthState>,
    Path(message_id): Path<String>,
    Query(params): Query<DlqParams>,
) -> Response {
    let Some(manager) = state.dlq_manager(params.stream.as_deref()) else {
        return unknown_stream(params.stream.as_deref());
    };

    match manager.reprocess_message(&message_id).await {
        Ok(true) => Json(json!({ "success": true, "message_id": message_id })).into_response(),
        Ok(false) => not_in_dlq(&message_id),
        Err(e) => internal_error(e),
    }
}

/// `POST /admin/dlq/reprocess?count=10`
pub async fn dlq_reprocess_batch_handler(
    State(state): State<HealthState>,
    Query(params): Query<DlqParams>,
) -> Response {
    let Some(manager) = state.dlq_manager(params.stream.as_deref()) else {
        return unknown_stream(params.stream.as_deref());
    };

    match manager.reprocess_batch(params.count.min(100)).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => internal_error(e),
    }
}

/// `DELETE /admin/dlq/{id}`
pub async fn dlq_archive_one_handler(
    State(state): State<HealthState>,
    Path(message_id): Path<String>,
    Query(params): Query<DlqParams>,
) -> Response {
    let Some(manager) = state.dlq_manager(params.stream.as_deref()) else {
        return unknown_stream(params.stream.as_deref());
    };

    match manager.archive_message(&message_id).await {
        Ok(true) => Json(json!({ "success": true, "message_id": message_id })).into_response(),
        Ok(false) => not_in_dlq(&message_id),
        Err(e) => internal_error(e),
    }
}

/// `DELETE /admin/dlq/all`. Permanently deletes every entry.
pub async fn dlq_archive_all_handler(
    State(state): State<HealthState>,
    Query(params): Query<DlqParams>,
) -> Response {
    let Some(manager) = state.dlq_manager(params.stream.as_deref()) else {
        return unknown_stream(params.stream.as_deref());
    };

    match manager.archive_all().await {
        Ok(count) => Json(json!({ "success": true, "archived_count": count })).into_response(),
        Err(e) => internal_error(e),
    }
}

fn health_routes() -> Router<HealthState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/stream/info", get(stream_info_handler))
        .route("/metrics", get(metrics_handler))
}

/// Probes, stream info and metrics.
pub fn health_router(state: HealthState) -> Router {
    health_routes().with_state(state)
}

/// [`health_router`] plus the DLQ admin endpoints.
pub fn full_admin_router(state: HealthState) -> Router {
    health_routes()
        .route("/admin/dlq/stats", get(dlq_stats_handler))
        .route("/admin/dlq/messages", get(dlq_list_handler))
        .route("/admin/dlq/reprocess/{id}", post(dlq_reprocess_one_handler))
        .route("/admin/dlq/reprocess", post(dlq_reprocess_batch_handler))
        .route("/admin/dlq/all", delete(dlq_archive_all_handler))
        .route("/admin/dlq/{id}", delete(dlq_archive_one_handler))
        .with_state(state)
}
