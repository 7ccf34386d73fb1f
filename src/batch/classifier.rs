use ndarray::Array2;
use serde::Serialize;
use tracing::{debug, info};

use super::{BatchDataset, BatchError};
use crate::config::{BatchConfig, FlowGnnConfig, ModelConfig};
use crate::graph::{knn_graph, GraphSnapshot};
use crate::model::{Adam, AdamConfig, GraphNetwork, NetworkConfig};
use crate::trainer::ANOMALY_CLASS;

const NUM_CLASSES: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitReport {
    pub epochs_run: usize,
    /// Training loss per epoch.
    pub losses: Vec<f32>,
    pub best_loss: f32,
    pub stopped_early: bool,
    pub edges: usize,
}

/// Full-batch graph classifier over a k-NN graph of the rows.
pub struct BatchClassifier {
    batch: BatchConfig,
    model: ModelConfig,
    network: Option<GraphNetwork>,
}

impl BatchClassifier {
    pub fn new(batch: BatchConfig, model: ModelConfig) -> Self {
        Self {
            batch,
            model,
            network: None,
        }
    }

    pub fn from_config(config: &FlowGnnConfig) -> Self {
        Self::new(config.batch.clone(), config.model.clone())
    }

    /// Train a fresh network on `dataset`.
    ///
    /// Stops after `epochs`, or once the loss has not improved for `patience`
    /// consecutive epochs (0 disables early stopping).
    pub fn fit(&mut self, dataset: &BatchDataset) -> Result<FitReport, BatchError> {
        if dataset.is_empty() {
            return Err(BatchError::Empty);
        }
        let snapshot = self.snapshot(dataset);
        let mut network = GraphNetwork::new(NetworkConfig {
            node_dim: dataset.features.ncols(),
            edge_dim: 0,
            hidden_dim: self.model.hidden_dim,
            num_classes: NUM_CLASSES,
            dropout: self.model.dropout,
            seed: self.model.seed,
        });
        let mut optimizer = Adam::new(
            AdamConfig {
                learning_rate: self.model.learning_rate,
                weight_decay: self.model.weight_decay,
                ..AdamConfig::default()
            },
            network.parameters(),
        );

        let mut losses = Vec::with_capacity(self.batch.epochs);
        let mut best = f32::INFINITY;
        let mut stale = 0;
        let mut stopped_early = false;

        for epoch in 0..self.batch.epochs {
            let cache = network.forward_train(&snapshot)?;
            let (loss, grads) = network.backward(&cache, &dataset.labels)?;
            if !loss.is_finite() || !grads.is_finite() {
                return Err(BatchError::NumericalInstability { epoch, loss });
            }
            optimizer.step(network.parameters_mut(), &grads);
            losses.push(loss);
            debug!(epoch, loss, "batch epoch");

            if loss < best {
                best = loss;
                stale = 0;
            } else {
                stale += 1;
                if self.batch.patience > 0 && stale >= self.batch.patience {
                    stopped_early = true;
                    break;
                }
            }
        }

        info!(
            rows = dataset.len(),
            edges = snapshot.num_edges(),
            epochs = losses.len(),
            best_loss = best,
            stopped_early,
            "batch classifier fitted"
        );
        self.network = Some(network);
        Ok(FitReport {
            epochs_run: losses.len(),
            losses,
            best_loss: best,
            stopped_early,
            edges: snapshot.num_edges(),
        })
    }

    /// Anomaly probability per row.
    pub fn predict_proba(&self, dataset: &BatchDataset) -> Result<Vec<f32>, BatchError> {
        let network = self.network.as_ref().ok_or(BatchError::NotFitted)?;
        let expected = network.config().node_dim;
        if dataset.features.ncols() != expected {
            return Err(BatchError::ColumnMismatch {
                expected,
                found: dataset.features.ncols(),
            });
        }
        if dataset.is_empty() {
            return Ok(Vec::new());
        }
        let log_probs = network.forward(&self.snapshot(dataset))?;
        Ok(log_probs
            .column(ANOMALY_CLASS)
            .iter()
            .map(|lp| lp.exp())
            .collect())
    }

    /// Most likely class per row.
    pub fn predict(&self, dataset: &BatchDataset) -> Result<Vec<usize>, BatchError> {
        Ok(self
            .predict_proba(dataset)?
            .into_iter()
            .map(|p| usize::from(p > 0.5))
            .collect())
    }

    fn snapshot(&self, dataset: &BatchDataset) -> GraphSnapshot {
        let edge_index = knn_graph(dataset.features.view(), self.batch.k);
        let edges = edge_index.len();
        GraphSnapshot {
            node_features: dataset.features.clone(),
            edge_index,
            edge_features: Array2::zeros((edges, 0)),
        }
    }
}

/// Fraction of predictions equal to their label.
pub fn accuracy(predictions: &[usize], labels: &[usize]) -> f32 {
    let n = predictions.len().min(labels.len());
    if n == 0 {
        return 0.0;
    }
    let hits = predictions
        .iter()
        .zip(labels)
        .filter(|(p, l)| p == l)
        .count();
    hits as f32 / n as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two well-separated clusters, labelled by cluster.
    fn clusters() -> BatchDataset {
        let rows = 20;
        let features = Array2::from_shape_fn((rows, 6), |(i, j)| {
            let base = if i < rows / 2 { 0.05 } else { 0.95 };
            base + 0.01 * ((i + j) % 3) as f32
        });
        BatchDataset {
            features,
            labels: (0..rows).map(|i| usize::from(i >= rows / 2)).collect(),
            columns: (0..6).map(|c| format!("f{c}")).collect(),
        }
    }

    fn model(learning_rate: f32) -> ModelConfig {
        ModelConfig {
            dropout: 0.0,
            learning_rate,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_fit_separates_clusters() {
        let ds = clusters();
        let batch = BatchConfig {
            k: 3,
            epochs: 300,
            patience: 0,
            ..BatchConfig::default()
        };
        let mut clf = BatchClassifier::new(batch, model(0.05));
        let report = clf.fit(&ds).unwrap();

        assert_eq!(report.epochs_run, 300);
        assert!(report.losses.last().unwrap() < report.losses.first().unwrap());
        let predictions = clf.predict(&ds).unwrap();
        assert!(accuracy(&predictions, &ds.labels) >= 0.9);
    }

    #[test]
    fn test_early_stopping_on_flat_loss() {
        let batch = BatchConfig {
            epochs: 50,
            patience: 3,
            ..BatchConfig::default()
        };
        let mut clf = BatchClassifier::new(batch, model(0.0));
        let report = clf.fit(&clusters()).unwrap();
        assert!(report.stopped_early);
        assert_eq!(report.epochs_run, 4);
    }

    #[test]
    fn test_predict_requires_fit() {
        let clf = BatchClassifier::new(BatchConfig::default(), ModelConfig::default());
        assert!(matches!(clf.predict(&clusters()), Err(BatchError::NotFitted)));
    }

    #[test]
    fn test_predict_checks_columns() {
        let mut clf = BatchClassifier::new(
            BatchConfig {
                epochs: 1,
                ..BatchConfig::default()
            },
            ModelConfig::default(),
        );
        clf.fit(&clusters()).unwrap();
        let mut narrow = clusters();
        narrow.features = Array2::zeros((3, 2));
        assert!(matches!(
            clf.predict(&narrow),
            Err(BatchError::ColumnMismatch { expected: 6, found: 2 })
        ));
    }

    #[test]
    fn test_accuracy() {
        assert_eq!(accuracy(&[1, 0, 1, 1], &[1, 0, 0, 1]), 0.75);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }
}
