//! Two-node snapshot for a single flow.
//!
//! Node 0 is the source endpoint and node 1 the destination. There is at most
//! one edge, 0 -> 1, and it exists only when both addresses are known.

use ndarray::{s, Array2, ArrayViewMut1};

use super::{edge_width, ip_features, node_width, EdgeIndex, GraphError, GraphSnapshot};
use crate::features::{encode_bool, LabelKind, LabelVocabulary, IP_FEATURE_SIZE};
use crate::trace::Trace;

#[derive(Debug, Clone, Copy, Default)]
pub struct OnlineGraphBuilder;

impl OnlineGraphBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build the snapshot for `trace`, growing `vocab` with any unseen labels.
    ///
    /// Lookups happen in a fixed order (source pod, source namespace,
    /// destination pod, destination namespace, then the two ports) so first
    /// sighting order, and therefore index assignment, is reproducible.
    pub fn build(
        &self,
        trace: &Trace,
        vocab: &mut LabelVocabulary,
    ) -> Result<GraphSnapshot, GraphError> {
        let dim = vocab.embedding_dim();
        let labels = &trace.labels;

        let source_ip = ip_features(&trace.ip_source)
            .map_err(|source| GraphError::FeatureExtraction { endpoint: "source", source })?;
        let destination_ip = ip_features(&trace.ip_destination).map_err(|source| {
            GraphError::FeatureExtraction { endpoint: "destination", source }
        })?;

        let mut node_features = Array2::zeros((2, node_width(dim)));
        fill_node(
            node_features.row_mut(0),
            &source_ip,
            &labels.source_pod_label,
            &labels.source_namespace_label,
            vocab,
        )?;
        fill_node(
            node_features.row_mut(1),
            &destination_ip,
            &labels.destination_pod_label,
            &labels.destination_namespace_label,
            vocab,
        )?;

        if !trace.has_endpoints() {
            return Ok(GraphSnapshot {
                node_features,
                edge_index: EdgeIndex::new(),
                edge_features: Array2::zeros((0, edge_width(dim))),
            });
        }

        let mut edge_features = Array2::zeros((1, edge_width(dim)));
        {
            let mut row = edge_features.row_mut(0);
            row.slice_mut(s![..dim])
                .assign(&vocab.embed(LabelKind::SourcePort, &labels.source_port_label)?);
            row.slice_mut(s![dim..2 * dim])
                .assign(&vocab.embed(LabelKind::DestinationPort, &labels.destination_port_label)?);
            row[2 * dim] = encode_bool(labels.ack_flag);
            row[2 * dim + 1] = encode_bool(labels.psh_flag);
        }

        let mut edge_index = EdgeIndex::new();
        edge_index.push(0, 1);

        Ok(GraphSnapshot {
            node_features,
            edge_index,
            edge_features,
        })
    }
}

fn fill_node(
    mut row: ArrayViewMut1<'_, f32>,
    ip: &[f32; IP_FEATURE_SIZE],
    pod: &str,
    namespace: &str,
    vocab: &mut LabelVocabulary,
) -> Result<(), GraphError> {
    let dim = vocab.embedding_dim();
    for (slot, &v) in row.iter_mut().zip(ip.iter()) {
        *slot = v;
    }
    let pod_at = IP_FEATURE_SIZE;
    let ns_at = IP_FEATURE_SIZE + dim;
    row.slice_mut(s![pod_at..pod_at + dim])
        .assign(&vocab.embed(LabelKind::Pod, pod)?);
    row.slice_mut(s![ns_at..ns_at + dim])
        .assign(&vocab.embed(LabelKind::Namespace, namespace)?);
    Ok(())
}
