use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::FlowGnnConfig;
use crate::storage::Pool;
use crate::trainer::TrainerHandle;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub trainer: TrainerHandle,
    /// Model and batch settings for on-demand classification.
    pub config: Arc<FlowGnnConfig>,
    /// Most recent OTLP export body, served back by `/v1/trace-example`.
    pub last_payload: Arc<RwLock<Option<Value>>>,
}

impl AppState {
    pub fn new(pool: Pool, trainer: TrainerHandle, config: FlowGnnConfig) -> Self {
        Self {
            pool,
            trainer,
            config: Arc::new(config),
            last_payload: Arc::new(RwLock::new(None)),
        }
    }
}
