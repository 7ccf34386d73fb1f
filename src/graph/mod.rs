//! Graph construction: per-flow snapshots for online training and k-NN
//! similarity graphs for batch scoring.

pub mod knn;
pub mod online;

use ndarray::Array2;
use thiserror::Error;

use crate::features::{encode_ip, EncodeError, IpMode, VocabularyError, IP_FEATURE_SIZE};

pub use knn::knn_graph;
pub use online::OnlineGraphBuilder;

/// Default width of one label embedding.
pub const EMBEDDING_DIM: usize = 16;

/// Node row: IP parts, pod embedding, namespace embedding.
pub const NODE_EMBEDDING_SIZE: usize = node_width(EMBEDDING_DIM);

/// Edge row: source port embedding, destination port embedding, ACK, PSH.
pub const EDGE_FEATURE_SIZE: usize = edge_width(EMBEDDING_DIM);

pub const fn node_width(embedding_dim: usize) -> usize {
    IP_FEATURE_SIZE + 2 * embedding_dim
}

pub const fn edge_width(embedding_dim: usize) -> usize {
    2 * embedding_dim + 2
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A field of the flow could not be turned into features.
    #[error("feature extraction failed for {endpoint} endpoint: {source}")]
    FeatureExtraction {
        endpoint: &'static str,
        #[source]
        source: EncodeError,
    },

    /// The flow has no address for this endpoint.
    #[error("flow has no {endpoint} IP")]
    MissingEndpoint { endpoint: &'static str },

    #[error(transparent)]
    Vocabulary(#[from] VocabularyError),
}

/// Directed edges as parallel source/target columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeIndex {
    pub sources: Vec<usize>,
    pub targets: Vec<usize>,
}

impl EdgeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, source: usize, target: usize) {
        self.sources.push(source);
        self.targets.push(target);
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.sources.iter().copied().zip(self.targets.iter().copied())
    }
}

impl FromIterator<(usize, usize)> for EdgeIndex {
    fn from_iter<I: IntoIterator<Item = (usize, usize)>>(iter: I) -> Self {
        let mut index = EdgeIndex::new();
        for (s, t) in iter {
            index.push(s, t);
        }
        index
    }
}

/// Input to one network pass. Built fresh and dropped afterwards.
///
/// `edge_features` has one row per edge in `edge_index`; with no edges it is a
/// `0 x width` matrix, never absent.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphSnapshot {
    pub node_features: Array2<f32>,
    pub edge_index: EdgeIndex,
    pub edge_features: Array2<f32>,
}

impl GraphSnapshot {
    pub fn num_nodes(&self) -> usize {
        self.node_features.nrows()
    }

    pub fn num_edges(&self) -> usize {
        self.edge_index.len()
    }
}

/// IP features for one endpoint. An unknown address (empty string) is all
/// zeros; anything else must parse.
pub fn ip_features(addr: &str) -> Result<[f32; IP_FEATURE_SIZE], EncodeError> {
    if addr.trim().is_empty() {
        return Ok([0.0; IP_FEATURE_SIZE]);
    }
    encode_ip(addr, IpMode::Strict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widths() {
        assert_eq!(NODE_EMBEDDING_SIZE, 40);
        assert_eq!(EDGE_FEATURE_SIZE, 34);
    }

    #[test]
    fn test_ip_features_empty_is_zero() {
        assert_eq!(ip_features("").unwrap(), [0.0; IP_FEATURE_SIZE]);
        assert!(ip_features("garbage").is_err());
    }

    #[test]
    fn test_edge_index_collect() {
        let index: EdgeIndex = vec![(0, 1), (1, 0)].into_iter().collect();
        assert_eq!(index.len(), 2);
        assert_eq!(index.sources, vec![0, 1]);
        assert_eq!(index.iter().last(), Some((1, 0)));
    }
}
