//! OTLP/JSON export -> [`Trace`] records.
//!
//! The payload is the JSON form of an `ExportTraceServiceRequest`:
//!
//! ```text
//! resourceSpans[]
//!   resource.attributes[]      (optional: k8s.pod.name, k8s.namespace.name)
//!   scopeSpans[]
//!     spans[]
//!       attributes[] { key, value: { stringValue } }
//! ```
//!
//! Each span becomes one fresh `Trace`. A record that is missing a required
//! level fails on its own and is logged; the rest of the payload still
//! extracts.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::Trace;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    /// A required key was absent or had the wrong JSON type.
    #[error("malformed record at {location}: missing or invalid `{key}`")]
    MalformedRecord { location: String, key: &'static str },
}

/// Traces extracted from one payload, plus how many records were dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub traces: Vec<Trace>,
    pub skipped: usize,
}

type Setter = fn(&mut Trace, &str);

const POD_NAME: &str = "k8s.pod.name";
const NAMESPACE_NAME: &str = "k8s.namespace.name";

/// Every span attribute we understand. Keys not listed here are ignored.
static SPAN_FIELDS: &[(&str, Setter)] = &[
    ("cilium.flow_event.IP.source", |t, v| t.ip_source = v.to_string()),
    ("cilium.flow_event.IP.destination", |t, v| {
        t.ip_destination = v.to_string()
    }),
    ("cilium.flow_event.l4.TCP.source_port", |t, v| {
        t.labels.source_port_label = v.to_string()
    }),
    ("cilium.flow_event.l4.TCP.destination_port", |t, v| {
        t.labels.destination_port_label = v.to_string()
    }),
    ("cilium.flow_event.l4.TCP.flags.ACK", |t, v| {
        t.labels.ack_flag = v == "true"
    }),
    ("cilium.flow_event.l4.TCP.flags.PSH", |t, v| {
        t.labels.psh_flag = v == "true"
    }),
    ("cilium.flow_event.source.namespace", |t, v| {
        t.labels.source_namespace_label = v.to_string()
    }),
    ("cilium.flow_event.destination.namespace", |t, v| {
        t.labels.destination_namespace_label = v.to_string()
    }),
    ("cilium.flow_event.source.pod_name", |t, v| {
        t.labels.source_pod_label = v.to_string()
    }),
    ("cilium.flow_event.destination.pod_name", |t, v| {
        t.labels.destination_pod_label = v.to_string()
    }),
    ("cilium.flow_event.source.labels.is_anomaly", |t, v| {
        t.is_anomaly = v == "true"
    }),
    ("cilium.flow_event.time", |t, v| t.timestamp = v.to_string()),
];

/// Extract every well-formed span; malformed records are logged and skipped.
pub fn extract_traces(payload: &Value) -> Vec<Trace> {
    extract_report(payload).traces
}

/// Like [`extract_traces`], but also reports how many records were skipped.
pub fn extract_report(payload: &Value) -> ExtractReport {
    let mut report = ExtractReport::default();
    let Some(resources) = payload.get("resourceSpans").and_then(Value::as_array) else {
        debug!("payload has no resourceSpans");
        return report;
    };

    for (ri, resource) in resources.iter().enumerate() {
        let location = format!("resourceSpans[{ri}]");
        let spans = match resource_spans(resource, &location) {
            Ok(spans) => spans,
            Err(e) => {
                warn!(error = %e, "skipping resource");
                report.skipped += 1;
                continue;
            }
        };

        let defaults = resource_defaults(resource);
        for (span_location, span) in spans {
            match span_trace(span, &defaults, &span_location) {
                Ok(trace) => report.traces.push(trace),
                Err(e) => {
                    warn!(error = %e, "skipping span");
                    report.skipped += 1;
                }
            }
        }
    }

    report
}

/// Flatten `scopeSpans[].spans[]`, failing the whole resource if any level
/// above the span is missing.
fn resource_spans<'a>(
    resource: &'a Value,
    location: &str,
) -> Result<Vec<(String, &'a Value)>, ExtractError> {
    let scopes = array_at(resource, "scopeSpans", location)?;
    let mut out = Vec::new();
    for (si, scope) in scopes.iter().enumerate() {
        let scope_location = format!("{location}.scopeSpans[{si}]");
        let spans = array_at(scope, "spans", &scope_location)?;
        out.extend(
            spans
                .iter()
                .enumerate()
                .map(|(i, span)| (format!("{scope_location}.spans[{i}]"), span)),
        );
    }
    Ok(out)
}

/// Source pod/namespace inherited from the resource, if the exporter set them.
fn resource_defaults(resource: &Value) -> Trace {
    let mut trace = Trace::default();
    let attributes = resource
        .pointer("/resource/attributes")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for attribute in attributes {
        let (Some(key), Some(value)) = (
            attribute.get("key").and_then(Value::as_str),
            attribute.get("value").and_then(attribute_string),
        ) else {
            continue;
        };
        match key {
            POD_NAME => trace.labels.source_pod_label = value,
            NAMESPACE_NAME => trace.labels.source_namespace_label = value,
            _ => {}
        }
    }
    trace
}

fn span_trace(span: &Value, defaults: &Trace, location: &str) -> Result<Trace, ExtractError> {
    let mut trace = defaults.clone();
    for (ai, attribute) in array_at(span, "attributes", location)?.iter().enumerate() {
        let key = attribute
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed(format!("{location}.attributes[{ai}]"), "key"))?;

        let Some((_, set)) = SPAN_FIELDS.iter().find(|(k, _)| *k == key) else {
            continue;
        };
        let value = attribute
            .get("value")
            .and_then(attribute_string)
            .ok_or_else(|| malformed(format!("{location}.attributes[{ai}]"), "value.stringValue"))?;
        set(&mut trace, &value);
    }
    Ok(trace)
}

/// OTLP/JSON `AnyValue` as a string. Cilium sends everything as
/// `stringValue`; some exporters re-type ports and flags, so those are
/// accepted too.
fn attribute_string(value: &Value) -> Option<String> {
    if let Some(s) = value.get("stringValue").and_then(Value::as_str) {
        return Some(s.to_string());
    }
    if let Some(b) = value.get("boolValue").and_then(Value::as_bool) {
        return Some(b.to_string());
    }
    match value.get("intValue")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn array_at<'a>(
    value: &'a Value,
    key: &'static str,
    location: &str,
) -> Result<&'a Vec<Value>, ExtractError> {
    value
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| malformed(location.to_string(), key))
}

fn malformed(location: String, key: &'static str) -> ExtractError {
    ExtractError::MalformedRecord { location, key }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attr(key: &str, value: &str) -> Value {
        json!({ "key": key, "value": { "stringValue": value } })
    }

    fn payload(spans: Vec<Value>) -> Value {
        json!({
            "resourceSpans": [{
                "resource": { "attributes": [] },
                "scopeSpans": [{ "spans": spans }]
            }]
        })
    }

    #[test]
    fn test_missing_resource_spans_is_empty() {
        assert!(extract_traces(&json!({})).is_empty());
        assert!(extract_traces(&json!({ "resourceSpans": "nope" })).is_empty());
    }

    #[test]
    fn test_one_trace_per_span() {
        let spans = vec![
            json!({ "attributes": [attr("cilium.flow_event.IP.source", "10.0.0.1")] }),
            json!({ "attributes": [attr("cilium.flow_event.IP.source", "10.0.0.2")] }),
        ];
        let traces = extract_traces(&payload(spans));
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].ip_source, "10.0.0.1");
        assert_eq!(traces[1].ip_source, "10.0.0.2");
    }

    #[test]
    fn test_spans_do_not_share_state() {
        let spans = vec![
            json!({ "attributes": [attr("cilium.flow_event.source.labels.is_anomaly", "true")] }),
            json!({ "attributes": [] }),
        ];
        let traces = extract_traces(&payload(spans));
        assert!(traces[0].is_anomaly);
        assert!(!traces[1].is_anomaly);
    }

    #[test]
    fn test_boolean_keys_require_literal_true() {
        let spans = vec![json!({ "attributes": [
            attr("cilium.flow_event.l4.TCP.flags.ACK", "true"),
            attr("cilium.flow_event.l4.TCP.flags.PSH", "True"),
        ] })];
        let traces = extract_traces(&payload(spans));
        assert!(traces[0].labels.ack_flag);
        assert!(!traces[0].labels.psh_flag);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let spans = vec![json!({ "attributes": [
            { "key": "http.method", "value": { "arrayValue": {} } },
            attr("cilium.flow_event.IP.destination", "fe80::1"),
        ] })];
        let traces = extract_traces(&payload(spans));
        assert_eq!(traces[0].ip_destination, "fe80::1");
    }

    #[test]
    fn test_malformed_span_is_skipped() {
        let spans = vec![
            json!({ "name": "no attributes here" }),
            json!({ "attributes": [{ "key": "cilium.flow_event.IP.source", "value": {} }] }),
            json!({ "attributes": [attr("cilium.flow_event.IP.source", "10.0.0.9")] }),
        ];
        let report = extract_report(&payload(spans));
        assert_eq!(report.skipped, 2);
        assert_eq!(report.traces.len(), 1);
        assert_eq!(report.traces[0].ip_source, "10.0.0.9");
    }

    #[test]
    fn test_malformed_resource_is_skipped() {
        let body = json!({
            "resourceSpans": [
                { "resource": {} },
                { "scopeSpans": [{ "spans": [{ "attributes": [] }] }] }
            ]
        });
        let report = extract_report(&body);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.traces.len(), 1);
    }

    #[test]
    fn test_resource_attributes_seed_source_identity() {
        let body = json!({
            "resourceSpans": [{
                "resource": { "attributes": [
                    attr("k8s.pod.name", "hubble-relay-0"),
                    attr("k8s.namespace.name", "kube-system"),
                ] },
                "scopeSpans": [{ "spans": [
                    { "attributes": [] },
                    { "attributes": [attr("cilium.flow_event.source.pod_name", "frontend-1")] }
                ] }]
            }]
        });
        let traces = extract_traces(&body);
        assert_eq!(traces[0].labels.source_pod_label, "hubble-relay-0");
        assert_eq!(traces[0].labels.source_namespace_label, "kube-system");
        assert_eq!(traces[1].labels.source_pod_label, "frontend-1");
        assert_eq!(traces[1].labels.source_namespace_label, "kube-system");
    }

    #[test]
    fn test_int_value_port_accepted() {
        let spans = vec![json!({ "attributes": [
            { "key": "cilium.flow_event.l4.TCP.destination_port", "value": { "intValue": "443" } },
            { "key": "cilium.flow_event.l4.TCP.source_port", "value": { "intValue": 51234 } },
        ] })];
        let traces = extract_traces(&payload(spans));
        assert_eq!(traces[0].labels.destination_port_label, "443");
        assert_eq!(traces[0].labels.source_port_label, "51234");
    }
}
