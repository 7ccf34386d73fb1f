//! Two-layer graph convolution network with hand-derived gradients.

pub mod network;
pub mod optim;

use thiserror::Error;

pub use network::{
    class_probabilities, nll_loss, ForwardCache, GraphNetwork, NetworkConfig, Parameters,
    Propagation,
};
pub use optim::{Adam, AdamConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("{what}: expected {expected} columns, got {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("edge features have {found} rows for {expected} edges")]
    EdgeCountMismatch { expected: usize, found: usize },

    #[error("edge {edge} references node {node}, but the graph has {num_nodes} nodes")]
    EdgeOutOfRange {
        edge: usize,
        node: usize,
        num_nodes: usize,
    },

    #[error("got {found} targets for {expected} nodes")]
    TargetLength { expected: usize, found: usize },

    #[error("target class {target} out of range for {classes} classes")]
    TargetOutOfRange { target: usize, classes: usize },
}
