//! Background handling of one OTLP export: parse, extract, store, train.

use axum::body::Bytes;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::AppState;
use crate::storage;
use crate::trace::extract_report;

/// Counts for one processed export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub extracted: usize,
    pub skipped: usize,
    pub stored: usize,
    pub trained: usize,
}

/// Every failure here is logged and swallowed: the sender has already been
/// told the export was received.
pub async fn process_export(state: AppState, body: Bytes) -> IngestSummary {
    let mut summary = IngestSummary::default();
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, bytes = body.len(), "discarding export that is not valid JSON");
            return summary;
        }
    };

    let report = extract_report(&payload);
    *state.last_payload.write().await = Some(payload);
    summary.extracted = report.traces.len();
    summary.skipped = report.skipped;
    if report.traces.is_empty() {
        debug!(skipped = report.skipped, "export contained no flows");
        return summary;
    }

    let ingest_id = Uuid::new_v4();
    let traces = report.traces;
    let pool = state.pool.clone();
    let to_store = traces.clone();
    let ids = match tokio::task::spawn_blocking(move || {
        storage::append_traces(&pool, &ingest_id, &to_store)
    })
    .await
    {
        Ok(Ok(ids)) => ids,
        Ok(Err(e)) => {
            warn!(%ingest_id, error = %e, "failed to store flows");
            Vec::new()
        }
        Err(e) => {
            warn!(%ingest_id, error = %e, "storage task failed");
            Vec::new()
        }
    };
    summary.stored = ids.len();

    let mut scores = Vec::new();
    for (i, trace) in traces.into_iter().enumerate() {
        match state.trainer.train(trace).await {
            Ok(outcome) => {
                summary.trained += 1;
                if let Some(&id) = ids.get(i) {
                    scores.push((id, outcome.anomaly_probability));
                }
            }
            Err(e) => warn!(%ingest_id, index = i, error = %e, "training on flow failed"),
        }
    }

    if !scores.is_empty() {
        let pool = state.pool.clone();
        let stored = tokio::task::spawn_blocking(move || {
            scores
                .iter()
                .try_for_each(|&(id, p)| storage::record_score(&pool, id, p))
        })
        .await;
        match stored {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%ingest_id, error = %e, "failed to record scores"),
            Err(e) => warn!(%ingest_id, error = %e, "score task failed"),
        }
    }

    info!(
        %ingest_id,
        extracted = summary.extracted,
        skipped = summary.skipped,
        stored = summary.stored,
        trained = summary.trained,
        "processed trace export"
    );
    summary
}
