//! Online learner: one flow in, one optimizer step, one anomaly score out.
//!
//! The trainer exclusively owns the label vocabulary, the network and the
//! optimizer state. Every mutating call takes `&mut self`; the service shares
//! it through [`actor::TrainerHandle`] rather than a lock.
//!
//! Supervision is weak: a flow's `is_anomaly` flag is used as the target for
//! *both* of its endpoint nodes.

pub mod actor;

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::{ModelConfig, VocabularyConfig};
use crate::features::{LabelVocabulary, VocabularyError};
use crate::graph::{edge_width, node_width, GraphError, GraphSnapshot, OnlineGraphBuilder};
use crate::model::{Adam, AdamConfig, GraphNetwork, ModelError, NetworkConfig};
use crate::trace::Trace;

pub use actor::TrainerHandle;

/// Index of the anomaly class in the network output.
pub const ANOMALY_CLASS: usize = 1;
const NUM_CLASSES: usize = 2;
const DESTINATION_NODE: usize = 1;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("feature extraction failed: {0}")]
    FeatureExtraction(#[source] GraphError),

    /// The loss or its gradient was NaN/inf. No update was applied and the
    /// trainer refuses further work until reset.
    #[error("numerical instability after {steps} optimizer steps (loss = {loss})")]
    NumericalInstability { loss: f32, steps: u64 },

    #[error("trainer is poisoned by an earlier numerical failure; reset required")]
    Poisoned,

    #[error(transparent)]
    Vocabulary(#[from] VocabularyError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("trainer task is not running")]
    Unavailable,
}

impl From<GraphError> for TrainError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::Vocabulary(v) => TrainError::Vocabulary(v),
            other => TrainError::FeatureExtraction(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrainOutcome {
    pub loss: f32,
    /// Probability of the anomaly class at the destination node, after the
    /// update.
    pub anomaly_probability: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerState {
    Ready,
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainerStats {
    pub state: TrainerState,
    pub calls: u64,
    pub trained: u64,
    pub failed: u64,
    pub optimizer_steps: u64,
    pub last_loss: Option<f32>,
    /// Mean loss over every successful training call.
    pub mean_loss: Option<f32>,
    pub parameter_count: usize,
    pub vocabulary: BTreeMap<String, usize>,
}

/// Result of [`IncrementalTrainer::train_many`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainSummary {
    pub trained: usize,
    pub failed: usize,
    pub mean_loss: Option<f32>,
    pub last: Option<TrainOutcome>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    calls: u64,
    trained: u64,
    failed: u64,
    loss_sum: f64,
    last_loss: Option<f32>,
}

pub struct IncrementalTrainer {
    model_config: ModelConfig,
    vocab_config: VocabularyConfig,
    builder: OnlineGraphBuilder,
    vocab: LabelVocabulary,
    network: GraphNetwork,
    optimizer: Adam,
    state: TrainerState,
    counters: Counters,
}

impl IncrementalTrainer {
    pub fn new(model_config: ModelConfig, vocab_config: VocabularyConfig) -> Self {
        let vocab = LabelVocabulary::new(
            vocab_config.embedding_dim,
            vocab_config.capacity,
            model_config.seed,
        );
        let network = GraphNetwork::new(NetworkConfig {
            node_dim: node_width(vocab_config.embedding_dim),
            edge_dim: edge_width(vocab_config.embedding_dim),
            hidden_dim: model_config.hidden_dim,
            num_classes: NUM_CLASSES,
            dropout: model_config.dropout,
            seed: model_config.seed,
        });
        let optimizer = Adam::new(adam_config(&model_config), network.parameters());

        Self {
            model_config,
            vocab_config,
            builder: OnlineGraphBuilder::new(),
            vocab,
            network,
            optimizer,
            state: TrainerState::Ready,
            counters: Counters::default(),
        }
    }

    pub fn from_config(config: &crate::config::FlowGnnConfig) -> Self {
        Self::new(config.model.clone(), config.vocabulary.clone())
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn parameter_count(&self) -> usize {
        self.network.parameter_count()
    }

    pub fn vocabulary(&self) -> &LabelVocabulary {
        &self.vocab
    }

    /// One training step on `trace`.
    ///
    /// Vocabulary growth from building the snapshot is kept even if a later
    /// stage fails.
    pub fn train_one(&mut self, trace: &Trace) -> Result<TrainOutcome, TrainError> {
        if self.state == TrainerState::Poisoned {
            return Err(TrainError::Poisoned);
        }
        self.counters.calls += 1;

        match self.step(trace) {
            Ok(outcome) => {
                self.counters.trained += 1;
                self.counters.loss_sum += f64::from(outcome.loss);
                self.counters.last_loss = Some(outcome.loss);
                debug!(
                    loss = outcome.loss,
                    anomaly_probability = outcome.anomaly_probability,
                    "trained on flow"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.counters.failed += 1;
                Err(e)
            }
        }
    }

    fn step(&mut self, trace: &Trace) -> Result<TrainOutcome, TrainError> {
        let snapshot = self.snapshot(trace)?;
        let cache = self.network.forward_train(&snapshot)?;
        let targets = vec![usize::from(trace.is_anomaly); snapshot.num_nodes()];
        let (loss, grads) = self.network.backward(&cache, &targets)?;

        if !loss.is_finite() || !grads.is_finite() {
            let steps = self.optimizer.steps();
            self.state = TrainerState::Poisoned;
            error!(loss, steps, "non-finite loss or gradient; trainer poisoned");
            return Err(TrainError::NumericalInstability { loss, steps });
        }

        self.optimizer.step(self.network.parameters_mut(), &grads);
        let anomaly_probability = self.destination_probability(&snapshot)?;
        Ok(TrainOutcome {
            loss,
            anomaly_probability,
        })
    }

    /// Anomaly probability for `trace` without training on it.
    pub fn score_one(&mut self, trace: &Trace) -> Result<f32, TrainError> {
        if self.state == TrainerState::Poisoned {
            return Err(TrainError::Poisoned);
        }
        let snapshot = self.snapshot(trace)?;
        self.destination_probability(&snapshot)
    }

    /// Train on each trace in order. Per-trace failures are logged and
    /// counted; a numerical failure stops the run.
    pub fn train_many(&mut self, traces: &[Trace]) -> TrainSummary {
        let mut summary = TrainSummary::default();
        let mut loss_sum = 0.0f64;

        for (i, trace) in traces.iter().enumerate() {
            match self.train_one(trace) {
                Ok(outcome) => {
                    summary.trained += 1;
                    loss_sum += f64::from(outcome.loss);
                    summary.last = Some(outcome);
                }
                Err(e @ (TrainError::NumericalInstability { .. } | TrainError::Poisoned)) => {
                    summary.failed += traces.len() - i;
                    warn!(error = %e, remaining = traces.len() - i, "stopping training run");
                    break;
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(index = i, error = %e, "skipping flow");
                }
            }
        }

        if summary.trained > 0 {
            summary.mean_loss = Some((loss_sum / summary.trained as f64) as f32);
        }
        summary
    }

    pub fn stats(&self) -> TrainerStats {
        let c = &self.counters;
        TrainerStats {
            state: self.state,
            calls: c.calls,
            trained: c.trained,
            failed: c.failed,
            optimizer_steps: self.optimizer.steps(),
            last_loss: c.last_loss,
            mean_loss: (c.trained > 0).then(|| (c.loss_sum / c.trained as f64) as f32),
            parameter_count: self.parameter_count(),
            vocabulary: self
                .vocab
                .sizes()
                .into_iter()
                .map(|(kind, n)| (kind.to_string(), n))
                .collect(),
        }
    }

    /// Start over: fresh weights, optimizer state and vocabulary.
    pub fn reset(&mut self) {
        *self = Self::new(self.model_config.clone(), self.vocab_config.clone());
    }

    fn snapshot(&mut self, trace: &Trace) -> Result<GraphSnapshot, TrainError> {
        for (endpoint, ip) in [("source", &trace.ip_source), ("destination", &trace.ip_destination)] {
            if ip.trim().is_empty() {
                return Err(GraphError::MissingEndpoint { endpoint }.into());
            }
        }
        Ok(self.builder.build(trace, &mut self.vocab)?)
    }

    fn destination_probability(&self, snapshot: &GraphSnapshot) -> Result<f32, TrainError> {
        let log_probs = self.network.forward(snapshot)?;
        Ok(log_probs[[DESTINATION_NODE, ANOMALY_CLASS]].exp())
    }
}

fn adam_config(model: &ModelConfig) -> AdamConfig {
    AdamConfig {
        learning_rate: model.learning_rate,
        weight_decay: model.weight_decay,
        ..AdamConfig::default()
    }
}
