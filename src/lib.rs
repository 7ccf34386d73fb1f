//! flowgnn -- online graph-network anomaly scoring for Cilium flow telemetry.
//!
//! Flows arrive as OTLP trace exports, are turned into small graphs and fed
//! one at a time to an incrementally trained graph convolution network. A
//! batch path scores a fixed set of flows over a k-NN similarity graph.

pub mod api;
pub mod batch;
pub mod config;
pub mod diversity;
pub mod features;
pub mod graph;
pub mod model;
pub mod storage;
pub mod trace;
pub mod trainer;

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::api::state::AppState;
use crate::config::FlowGnnConfig;
use crate::trace::Trace;
use crate::trainer::{IncrementalTrainer, TrainerHandle};

/// Start the flowgnn service: storage, trainer task and HTTP receiver.
pub async fn serve(config: &FlowGnnConfig) -> Result<()> {
    // 1. Initialize Storage
    let db_path = config.server.db_path.display().to_string();
    tracing::info!(%db_path, "Initializing database");
    let pool = storage::open_pool(&config.server.db_path)?;

    // 2. Start the trainer task
    let trainer = IncrementalTrainer::from_config(config);
    let (handle, _task) = TrainerHandle::spawn(trainer, config.server.trainer_queue);

    // 3. Start API Server
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.server.bind))?;
    let app = api::router(
        AppState::new(pool, handle, config.clone()),
        config.server.max_body_bytes,
    );

    tracing::info!(%addr, "flowgnn listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("flowgnn stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Load flows from a JSON file: either an OTLP export or an array of
/// `Trace` records.
pub fn load_traces(path: &Path) -> Result<Vec<Trace>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse JSON in {}", path.display()))?;
    traces_from_value(value).with_context(|| format!("no flows in {}", path.display()))
}

fn traces_from_value(value: Value) -> Result<Vec<Trace>> {
    match value {
        Value::Array(_) => Ok(serde_json::from_value(value)?),
        Value::Object(ref map) if map.contains_key("resourceSpans") => {
            let report = trace::extract_report(&value);
            if report.skipped > 0 {
                tracing::warn!(skipped = report.skipped, "some records could not be extracted");
            }
            Ok(report.traces)
        }
        _ => bail!("expected an OTLP export or an array of traces"),
    }
}
