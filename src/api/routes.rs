//! API route definitions.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::ingest;
use super::state::AppState;
use crate::batch::{self, BatchClassifier};
use crate::storage;
use crate::trace::extract_traces;

const DEFAULT_TRACE_LIMIT: usize = 100;
const MAX_TRACE_LIMIT: usize = 1000;
/// Flows from the last export that `/v1/infer` classifies.
const MAX_INFER_FLOWS: usize = 100;

type ApiError = (StatusCode, Json<Value>);

/// Read-side API under `/api/v1`.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/traces", get(list_traces))
        .route("/model/stats", get(model_stats))
        .route("/model/reset", post(model_reset))
}

/// OTLP/HTTP receiver paths, mounted at the root like a collector.
pub fn otlp_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/traces", post(receive_traces))
        .route("/v1/trace-example", get(trace_example))
        .route("/v1/infer", get(infer))
        .route("/v1/metrics", post(receive_metrics))
        .route("/v1/logs", post(receive_logs))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

/// Acknowledge at once; parsing, storage and training happen in the
/// background and never fail the request.
async fn receive_traces(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    tokio::spawn(ingest::process_export(state, body));
    Json(json!({ "status": "received" }))
}

async fn trace_example(State(state): State<AppState>) -> Json<Value> {
    let last = state.last_payload.read().await.clone();
    match last {
        Some(payload) => Json(payload),
        None => Json(json!({ "data": null, "meta": { "message": "no traces received yet" } })),
    }
}

/// Metrics and logs are acknowledged and counted, not stored.
async fn receive_metrics(body: Bytes) -> Result<Json<Value>, ApiError> {
    acknowledge_signal(&body, "resourceMetrics")
}

async fn receive_logs(body: Bytes) -> Result<Json<Value>, ApiError> {
    acknowledge_signal(&body, "resourceLogs")
}

fn acknowledge_signal(body: &[u8], key: &str) -> Result<Json<Value>, ApiError> {
    let payload: Value = serde_json::from_slice(body).map_err(|e| {
        warn!(signal = key, error = %e, "rejecting export that is not valid JSON");
        error_response(StatusCode::BAD_REQUEST, &format!("invalid OTLP JSON: {e}"))
    })?;
    let resources = payload.get(key).and_then(Value::as_array).map_or(0, Vec::len);
    info!(signal = key, resources, "received export");
    Ok(Json(json!({ "status": "received" })))
}

/// Fit the batch classifier on the flows of the last trace export and
/// return its predictions.
async fn infer(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let Some(payload) = state.last_payload.read().await.clone() else {
        return Err(error_response(StatusCode::NOT_FOUND, "no traces received yet"));
    };
    let config = state.config.clone();

    let result = tokio::task::spawn_blocking(move || {
        let mut traces = extract_traces(&payload);
        traces.truncate(MAX_INFER_FLOWS);
        let dataset = batch::preprocess(&traces, &config.batch)?;
        let mut classifier = BatchClassifier::from_config(&config);
        let report = classifier.fit(&dataset)?;
        let predictions = classifier.predict(&dataset)?;
        let accuracy = batch::accuracy(&predictions, &dataset.labels);
        Ok::<_, batch::BatchError>(json!({
            "predictions": predictions,
            "accuracy": accuracy,
            "fit": report,
        }))
    })
    .await;

    match result {
        Ok(Ok(data)) => Ok(Json(json!({ "data": data, "meta": meta() }))),
        Ok(Err(e)) => {
            warn!(error = %e, "inference on last export failed");
            Err(error_response(StatusCode::UNPROCESSABLE_ENTITY, &e.to_string()))
        }
        Err(e) => {
            warn!(error = %e, "inference task failed");
            Err(internal_error("inference failed"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct TraceQuery {
    limit: Option<usize>,
}

async fn list_traces(
    State(state): State<AppState>,
    Query(query): Query<TraceQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_TRACE_LIMIT).min(MAX_TRACE_LIMIT);
    let pool = state.pool.clone();

    let result = tokio::task::spawn_blocking(move || {
        let traces = storage::recent_traces(&pool, limit)?;
        let total = storage::count_traces(&pool)?;
        anyhow::Ok((traces, total))
    })
    .await;

    match result {
        Ok(Ok((traces, total))) => Ok(Json(json!({
            "data": traces,
            "meta": { "total": total, "limit": limit }
        }))),
        Ok(Err(e)) => {
            warn!(error = %e, "failed to read traces");
            Err(internal_error("failed to read traces"))
        }
        Err(e) => {
            warn!(error = %e, "trace query task failed");
            Err(internal_error("failed to read traces"))
        }
    }
}

async fn model_stats(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    match state.trainer.stats().await {
        Ok(stats) => Ok(Json(json!({ "data": stats, "meta": meta() }))),
        Err(e) => {
            warn!(error = %e, "trainer stats unavailable");
            Err(error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()))
        }
    }
}

/// Start the online model over. Also clears a poisoned trainer.
async fn model_reset(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let reset = async {
        state.trainer.reset().await?;
        state.trainer.stats().await
    };
    match reset.await {
        Ok(stats) => {
            info!("online model reset");
            Ok(Json(json!({ "data": stats, "meta": meta() })))
        }
        Err(e) => {
            warn!(error = %e, "trainer reset failed");
            Err(error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()))
        }
    }
}

fn internal_error(message: &str) -> ApiError {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
}

fn error_response(status: StatusCode, message: &str) -> ApiError {
    (status, Json(json!({ "error": message })))
}
