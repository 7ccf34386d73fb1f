//! Flow records extracted from OTLP exports.

pub mod extract;

use serde::{Deserialize, Serialize};

pub use extract::{extract_report, extract_traces, ExtractError, ExtractReport};

/// Categorical fields of a flow: Kubernetes identity, ports and TCP flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceLabels {
    pub source_pod_label: String,
    pub source_namespace_label: String,
    pub source_port_label: String,
    pub destination_pod_label: String,
    pub destination_namespace_label: String,
    pub destination_port_label: String,
    pub ack_flag: bool,
    pub psh_flag: bool,
}

/// One flow event. Every field defaults to empty/false, so a record that only
/// carries some attributes is still a valid `Trace`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Trace {
    pub ip_source: String,
    pub ip_destination: String,
    pub is_anomaly: bool,
    pub labels: TraceLabels,
    /// ISO-8601, as reported by Cilium. May be empty.
    pub timestamp: String,
}

impl Trace {
    /// Both endpoint addresses are known.
    pub fn has_endpoints(&self) -> bool {
        !self.ip_source.is_empty() && !self.ip_destination.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_defaults() {
        let trace = Trace::default();
        assert!(!trace.is_anomaly);
        assert!(!trace.has_endpoints());
        assert_eq!(trace.labels.source_port_label, "");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let trace: Trace = serde_json::from_str(
            r#"{"ip_source": "10.0.0.1", "labels": {"ack_flag": true}}"#,
        )
        .unwrap();
        assert_eq!(trace.ip_source, "10.0.0.1");
        assert_eq!(trace.ip_destination, "");
        assert!(trace.labels.ack_flag);
        assert!(!trace.labels.psh_flag);
    }
}
