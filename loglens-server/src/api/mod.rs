//! HTTP API endpoints

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use loglens_core::engine::LogEngine;
use loglens_core::ingest::IngestReport;
use loglens_core::query::{AggregationJob, AggregationResult};
use loglens_core::storage::StoreStats;
use loglens_core::LogLensError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

/// Application state
pub type AppState = Arc<LogEngine>;

/// Create the API router
pub fn create_router(engine: Arc<LogEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ping", get(ping))

        // Ingest raw log lines
        .route("/ingest", post(ingest))

        // Aggregation jobs
        .route("/query", post(query))

        // Store inspection
        .route("/partitions", get(partitions))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] LogLensError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Engine(LogLensError::InvalidJobSpec(_)) => StatusCode::BAD_REQUEST,
            ApiError::Engine(LogLensError::PartitionNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Engine(LogLensError::StoreUnavailable { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Engine(LogLensError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    /// Also persist the result at this storage path
    destination: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: loglens_core::VERSION.to_string(),
    })
}

async fn ping() -> &'static str {
    "pong"
}

async fn ingest(State(engine): State<AppState>, body: String) -> Result<Json<IngestReport>, ApiError> {
    // Parsing and segment writes block; keep them off the async workers
    let report = tokio::task::spawn_blocking(move || engine.ingest(body.lines())).await??;
    Ok(Json(report))
}

async fn query(
    State(engine): State<AppState>,
    Query(params): Query<QueryParams>,
    body: String,
) -> Result<Json<AggregationResult>, ApiError> {
    let job = AggregationJob::from_json(&body)?;
    let result = match params.destination {
        Some(destination) => engine.query_into(&job, &destination).await?,
        None => engine.query(&job).await?,
    };
    Ok(Json(result))
}

async fn partitions(State(engine): State<AppState>) -> Json<Vec<String>> {
    Json(engine.list_partitions().iter().map(|p| p.to_string()).collect())
}

async fn stats(State(engine): State<AppState>) -> Result<Json<StoreStats>, ApiError> {
    Ok(Json(engine.stats()?))
}

async fn metrics(State(engine): State<AppState>) -> Result<String, ApiError> {
    let stats = engine.stats()?;

    // Prometheus format
    let mut output = String::new();
    output.push_str("# HELP loglens_partitions_total Total number of partitions\n");
    output.push_str("# TYPE loglens_partitions_total gauge\n");
    output.push_str(&format!("loglens_partitions_total {}\n", stats.partition_count));

    output.push_str("# HELP loglens_segments_total Total number of segments\n");
    output.push_str("# TYPE loglens_segments_total gauge\n");
    output.push_str(&format!("loglens_segments_total {}\n", stats.total_segments));

    output.push_str("# HELP loglens_storage_bytes_total Total storage size in bytes\n");
    output.push_str("# TYPE loglens_storage_bytes_total gauge\n");
    output.push_str(&format!("loglens_storage_bytes_total {}\n", stats.total_size_bytes));

    output.push_str("# HELP loglens_rejected_lines_total Lines rejected at parse time\n");
    output.push_str("# TYPE loglens_rejected_lines_total counter\n");
    output.push_str(&format!("loglens_rejected_lines_total {}\n", stats.rejected));

    for partition in stats.partitions {
        output.push_str(&format!(
            "loglens_partition_bytes{{partition=\"{}\"}} {}\n",
            partition.partition, partition.size_bytes
        ));
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use loglens_core::engine::EngineConfig;
    use loglens_core::storage::MemoryBackend;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let engine = LogEngine::with_backend(EngineConfig::default(), backend.clone()).unwrap();
        (create_router(Arc::new(engine)), backend)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri).body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    const LINES: &str = "192.168.0.1,2025-02-25 13:00:15,/index,200,Firefox/98.0\n\
                         192.168.0.2,2025-02-25 13:00:16,/index,500,Chrome/120.0\n\
                         192.168.0.3,2025-02-25 13:00:17\n";

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");

        let (_, body) = send(&app, get("/ping")).await;
        assert_eq!(body, b"pong");
    }

    #[tokio::test]
    async fn test_ingest_then_query() {
        let (app, backend) = app();
        let (status, body) = send(&app, post("/ingest", LINES)).await;
        assert_eq!(status, StatusCode::OK);
        let report: IngestReport = serde_json::from_slice(&body).unwrap();
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected, 1);

        let (_, body) = send(&app, get("/partitions")).await;
        let partitions: Vec<String> = serde_json::from_slice(&body).unwrap();
        assert_eq!(partitions, vec!["200", "500"]);

        let job = r#"{"group_by": {"kind": "url"}}"#;
        let (status, body) = send(&app, post("/query?destination=out/pages.csv", job)).await;
        assert_eq!(status, StatusCode::OK);
        let result: AggregationResult = serde_json::from_slice(&body).unwrap();
        assert_eq!(result.get("/index"), Some(2));
        assert_eq!(backend.contents("out/pages.csv").unwrap(), b"/index,2\n");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (app, backend) = app();
        let (status, _) = send(&app, post("/query", r#"{"aggregate": {"kind": "top_k", "k": 0}}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, post("/query", "not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        send(&app, post("/ingest", LINES)).await;
        let segment = "status_code=200/seg_00000000000000000000.log";
        let before = backend.contents(segment).unwrap();
        let uri = format!("/query?destination={}", segment.replace('=', "%3D"));
        let (status, _) = send(&app, post(&uri, "{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(backend.contents(segment).unwrap(), before);

        backend.set_available(false);
        let (status, body) = send(&app, post("/ingest", LINES)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(error.error.contains("Store unavailable"));
    }

    #[tokio::test]
    async fn test_stats_and_metrics() {
        let (app, _) = app();
        send(&app, post("/ingest", LINES)).await;

        let (status, body) = send(&app, get("/stats")).await;
        assert_eq!(status, StatusCode::OK);
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["partition_count"], 2);
        assert_eq!(stats["rejected"], 1);

        let (_, body) = send(&app, get("/metrics")).await;
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("loglens_partitions_total 2"));
        assert!(text.contains("loglens_rejected_lines_total 1"));
    }
}
