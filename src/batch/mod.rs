//! Offline scoring of a fixed set of flows.
//!
//! Flows are encoded into a feature matrix (batch-normalized, see
//! [`crate::features::scale`]), connected by a k-NN similarity graph and
//! classified by the same graph network the online path uses, trained
//! full-batch.

pub mod classifier;
pub mod preprocess;

use ndarray::Array2;
use thiserror::Error;

use crate::diversity::DiversityError;
use crate::features::EncodeError;
use crate::model::ModelError;

pub use classifier::{accuracy, BatchClassifier, FitReport};
pub use preprocess::{feature_columns, preprocess};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("no flows to process")]
    Empty,

    #[error("row {row}: feature extraction failed: {source}")]
    FeatureExtraction {
        row: usize,
        #[source]
        source: EncodeError,
    },

    #[error(transparent)]
    Diversity(#[from] DiversityError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("numerical instability at epoch {epoch} (loss = {loss})")]
    NumericalInstability { epoch: usize, loss: f32 },

    #[error("classifier has not been fitted")]
    NotFitted,

    #[error("dataset has {found} feature columns, classifier was fitted on {expected}")]
    ColumnMismatch { expected: usize, found: usize },
}

/// Encoded flows: one row per flow, one label per row.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchDataset {
    pub features: Array2<f32>,
    /// 1 for anomalous flows.
    pub labels: Vec<usize>,
    pub columns: Vec<String>,
}

impl BatchDataset {
    pub fn len(&self) -> usize {
        self.features.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.features.nrows() == 0
    }

    pub fn anomalies(&self) -> usize {
        self.labels.iter().filter(|&&l| l == 1).count()
    }
}
