use std::time::Duration;

use ndarray::Array2;
use tracing::debug;

use super::{BatchDataset, BatchError};
use crate::config::BatchConfig;
use crate::diversity::DiversityPreprocessor;
use crate::features::{encode_bool, hash_encode, normalize_numbers, IP_FEATURE_SIZE};
use crate::graph::ip_features;
use crate::trace::Trace;

/// Column names, in matrix order.
pub fn feature_columns(with_diversity: bool) -> Vec<String> {
    let mut columns = vec!["ack_flag".to_string(), "psh_flag".to_string()];
    for endpoint in ["ip_source", "ip_destination"] {
        columns.extend((1..=IP_FEATURE_SIZE).map(|i| format!("{endpoint}_part{i}")));
    }
    columns.extend(
        [
            "source_pod_label",
            "destination_pod_label",
            "source_namespace_label",
            "destination_namespace_label",
            "source_port_label",
            "destination_port_label",
        ]
        .iter()
        .map(|c| format!("{c}_normalized")),
    );
    if with_diversity {
        columns.push("diversity_index".to_string());
    }
    columns
}

/// Encode `traces` into a feature matrix.
pub fn preprocess(traces: &[Trace], config: &BatchConfig) -> Result<BatchDataset, BatchError> {
    if traces.is_empty() {
        return Err(BatchError::Empty);
    }
    let columns = feature_columns(config.use_diversity_index);

    let diversity = if config.use_diversity_index {
        let window = Duration::from_secs(config.diversity_window_secs);
        Some(DiversityPreprocessor::new(window, config.workers).compute_ordered(traces)?)
    } else {
        None
    };

    let label_columns = [
        hash_encode(&column(traces, |t| t.labels.source_pod_label.as_str())),
        hash_encode(&column(traces, |t| t.labels.destination_pod_label.as_str())),
        hash_encode(&column(traces, |t| t.labels.source_namespace_label.as_str())),
        hash_encode(&column(traces, |t| t.labels.destination_namespace_label.as_str())),
        normalize_numbers(&column(traces, |t| t.labels.source_port_label.as_str())),
        normalize_numbers(&column(traces, |t| t.labels.destination_port_label.as_str())),
    ];

    let mut features = Array2::zeros((traces.len(), columns.len()));
    for (row, trace) in traces.iter().enumerate() {
        let src = ip_features(&trace.ip_source)
            .map_err(|source| BatchError::FeatureExtraction { row, source })?;
        let dst = ip_features(&trace.ip_destination)
            .map_err(|source| BatchError::FeatureExtraction { row, source })?;

        let values = [encode_bool(trace.labels.ack_flag), encode_bool(trace.labels.psh_flag)]
            .into_iter()
            .chain(src)
            .chain(dst)
            .chain(label_columns.iter().map(|c| c[row]))
            .chain(diversity.as_ref().map(|d| d[row]));

        for (slot, v) in features.row_mut(row).iter_mut().zip(values) {
            *slot = v;
        }
    }

    let labels = traces.iter().map(|t| usize::from(t.is_anomaly)).collect();
    debug!(rows = traces.len(), columns = columns.len(), "encoded batch");
    Ok(BatchDataset {
        features,
        labels,
        columns,
    })
}

fn column<'a>(traces: &'a [Trace], field: fn(&Trace) -> &str) -> Vec<&'a str> {
    traces.iter().map(field).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TraceLabels;

    fn flow(src: &str, port: &str, secs: u32, anomaly: bool) -> Trace {
        Trace {
            ip_source: src.into(),
            ip_destination: "10.0.2.1".into(),
            is_anomaly: anomaly,
            timestamp: format!("2024-05-01T08:30:{secs:02}Z"),
            labels: TraceLabels {
                source_pod_label: "client".into(),
                destination_pod_label: "server".into(),
                destination_port_label: port.into(),
                ack_flag: true,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_column_layout() {
        let cols = feature_columns(true);
        assert_eq!(cols.len(), 25);
        assert_eq!(cols[0], "ack_flag");
        assert_eq!(cols[2], "ip_source_part1");
        assert_eq!(cols[17], "ip_destination_part8");
        assert_eq!(cols[18], "source_pod_label_normalized");
        assert_eq!(cols[24], "diversity_index");
        assert_eq!(feature_columns(false).len(), 24);
    }

    #[test]
    fn test_preprocess_shapes_and_labels() {
        let traces = vec![
            flow("10.0.1.1", "80", 0, false),
            flow("10.0.1.1", "81", 1, true),
            flow("10.0.1.2", "443", 2, false),
        ];
        let ds = preprocess(&traces, &BatchConfig::default()).unwrap();
        assert_eq!(ds.features.dim(), (3, 25));
        assert_eq!(ds.labels, vec![0, 1, 0]);
        assert_eq!(ds.anomalies(), 1);

        // ack set, psh not
        assert_eq!(ds.features[[0, 0]], 1.0);
        assert_eq!(ds.features[[0, 1]], 0.0);
        // destination port min-max: 80 -> 0, 443 -> 1
        assert_eq!(ds.features[[0, 23]], 0.0);
        assert_eq!(ds.features[[2, 23]], 1.0);
        // second flow from 10.0.1.1 within the window: two ports, two flows
        assert_eq!(ds.features[[1, 24]], 1.0);
        assert!(ds.features.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_preprocess_without_diversity_ignores_timestamps() {
        let mut traces = vec![flow("10.0.1.1", "80", 0, false)];
        traces[0].timestamp.clear();
        let config = BatchConfig {
            use_diversity_index: false,
            ..BatchConfig::default()
        };
        assert_eq!(preprocess(&traces, &config).unwrap().features.ncols(), 24);
        assert!(matches!(
            preprocess(&traces, &BatchConfig::default()),
            Err(BatchError::Diversity(_))
        ));
    }

    #[test]
    fn test_invalid_ip_names_row() {
        let traces = vec![flow("10.0.1.1", "80", 0, false), flow("bogus", "80", 1, false)];
        let config = BatchConfig {
            use_diversity_index: false,
            ..BatchConfig::default()
        };
        assert!(matches!(
            preprocess(&traces, &config),
            Err(BatchError::FeatureExtraction { row: 1, .. })
        ));
    }

    #[test]
    fn test_empty_batch() {
        assert!(matches!(preprocess(&[], &BatchConfig::default()), Err(BatchError::Empty)));
    }
}
