use std::path::Path;

use flowgnn::config::{ModelConfig, VocabularyConfig};
use flowgnn::trace::{Trace, TraceLabels};
use flowgnn::trainer::{IncrementalTrainer, TrainerState};

fn trainer() -> IncrementalTrainer {
    IncrementalTrainer::new(
        ModelConfig {
            dropout: 0.0,
            ..ModelConfig::default()
        },
        VocabularyConfig::default(),
    )
}

fn scanner() -> Trace {
    Trace {
        ip_source: "10.0.9.66".into(),
        ip_destination: "10.0.2.15".into(),
        is_anomaly: true,
        labels: TraceLabels {
            source_pod_label: "scanner-6b7c".into(),
            source_namespace_label: "tools".into(),
            destination_pod_label: "db-0".into(),
            destination_namespace_label: "data".into(),
            source_port_label: "51515".into(),
            destination_port_label: "22".into(),
            ack_flag: false,
            psh_flag: false,
        },
        timestamp: "2024-03-01T12:00:00Z".into(),
    }
}

fn frontend() -> Trace {
    Trace {
        ip_source: "10.0.1.20".into(),
        ip_destination: "10.0.1.30".into(),
        is_anomaly: false,
        labels: TraceLabels {
            source_pod_label: "frontend-7d9f".into(),
            source_namespace_label: "web".into(),
            destination_pod_label: "api-5c6d".into(),
            destination_namespace_label: "web".into(),
            source_port_label: "40000".into(),
            destination_port_label: "80".into(),
            ack_flag: true,
            psh_flag: true,
        },
        timestamp: "2024-03-01T12:00:01Z".into(),
    }
}

fn mean(xs: &[f32]) -> f32 {
    xs.iter().sum::<f32>() / xs.len() as f32
}

#[test]
fn test_repeated_anomaly_raises_score() {
    let mut t = trainer();
    let flow = scanner();
    let initial = t.score_one(&flow).unwrap();

    let mut scores = Vec::new();
    for _ in 0..20 {
        scores.push(t.train_one(&flow).unwrap().anomaly_probability);
    }

    for pair in scores.windows(2) {
        assert!(
            pair[1] >= pair[0] - 1e-3,
            "score fell from {} to {}",
            pair[0],
            pair[1]
        );
    }
    assert!(scores[19] > initial, "{} should exceed {}", scores[19], initial);
}

#[test]
fn test_alternating_flows_loss_decreases() {
    let mut t = trainer();
    let flows = [scanner(), frontend()];

    let losses: Vec<f32> = (0..100)
        .map(|i| t.train_one(&flows[i % 2]).unwrap().loss)
        .collect();

    let first = mean(&losses[..10]);
    let last = mean(&losses[90..]);
    assert!(last < first, "late loss {last} should be below early loss {first}");

    // The two flows end up on opposite sides of the decision boundary.
    assert!(t.score_one(&scanner()).unwrap() > t.score_one(&frontend()).unwrap());
}

#[test]
fn test_parameter_count_is_fixed() {
    let mut t = trainer();
    let before = t.parameter_count();

    let mut flow = frontend();
    for i in 0..50 {
        flow.labels.source_pod_label = format!("frontend-{i}");
        flow.labels.source_port_label = (40000 + i).to_string();
        t.train_one(&flow).unwrap();
    }

    assert_eq!(t.parameter_count(), before);
    assert_eq!(t.stats().vocabulary["pod"], 51);
}

#[test]
fn test_train_many_on_fixture() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/unpacked_trace.json");
    let traces = flowgnn::load_traces(&path).unwrap();

    let mut t = trainer();
    let summary = t.train_many(&traces);
    assert_eq!(summary.trained, 1);
    assert_eq!(summary.failed, 0);

    let last = summary.last.unwrap();
    assert!(last.loss.is_finite());
    assert!((0.0..=1.0).contains(&last.anomaly_probability));
    assert_eq!(t.state(), TrainerState::Ready);
}

#[test]
fn test_flow_without_endpoints_is_skipped() {
    let mut t = trainer();
    let mut broken = frontend();
    broken.ip_destination.clear();

    let summary = t.train_many(&[scanner(), broken, frontend()]);
    assert_eq!(summary.trained, 2);
    assert_eq!(summary.failed, 1);

    let stats = t.stats();
    assert_eq!(stats.calls, 3);
    assert_eq!(stats.optimizer_steps, 2);
}

#[test]
fn test_reset_forgets_everything() {
    let mut t = trainer();
    let flow = scanner();
    let fresh = t.score_one(&flow).unwrap();
    for _ in 0..10 {
        t.train_one(&flow).unwrap();
    }
    assert_ne!(t.score_one(&flow).unwrap(), fresh);

    t.reset();
    assert_eq!(t.stats().calls, 0);
    assert_eq!(t.score_one(&flow).unwrap(), fresh);
}
