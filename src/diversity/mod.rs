//! Port-diversity index for batch scoring.
//!
//! For each flow at time `t` from source IP `ip`, look at every flow from the
//! same `ip` with a timestamp in `(t - window, t]` and divide the number of
//! distinct destination ports by the number of flows. A port scan pushes this
//! towards 1; steady traffic to one service stays near `1 / n`.
//!
//! Rows are partitioned by a hash of the source IP so that one IP never spans
//! two partitions, and partitions run on a dedicated rayon pool.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;

use crate::trace::Trace;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiversityError {
    #[error("row {row}: cannot parse timestamp {value:?}")]
    InvalidTimestamp { row: usize, value: String },

    #[error("failed to start diversity worker pool: {0}")]
    WorkerPool(String),
}

/// Diversity value for one input row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiversityRow {
    /// Position of the row in the input slice.
    pub row: usize,
    pub diversity_index: f32,
}

#[derive(Debug, Clone)]
pub struct DiversityPreprocessor {
    window: Duration,
    workers: usize,
}

impl Default for DiversityPreprocessor {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, 0)
    }
}

impl DiversityPreprocessor {
    /// `workers == 0` uses one worker per available CPU.
    pub fn new(window: Duration, workers: usize) -> Self {
        let workers = if workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            workers
        };
        Self { window, workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Diversity value for every row. Output order across partitions is not
    /// meaningful; use [`DiversityRow::row`] or [`Self::compute_ordered`].
    ///
    /// Any unparseable timestamp fails the whole computation.
    pub fn compute(&self, traces: &[Trace]) -> Result<Vec<DiversityRow>, DiversityError> {
        if traces.is_empty() {
            return Ok(Vec::new());
        }
        let partitions = self.workers.min(traces.len()).max(1);

        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); partitions];
        for (row, trace) in traces.iter().enumerate() {
            buckets[partition_of(&trace.ip_source, partitions)].push(row);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(partitions)
            .thread_name(|i| format!("diversity-{i}"))
            .build()
            .map_err(|e| DiversityError::WorkerPool(e.to_string()))?;

        let window = i64::try_from(self.window.as_micros())
            .unwrap_or(i64::MAX)
            .max(1);
        let results: Vec<Vec<DiversityRow>> = pool.install(|| {
            buckets
                .par_iter()
                .map(|rows| process_partition(traces, rows, window))
                .collect::<Result<_, _>>()
        })?;

        debug!(rows = traces.len(), partitions, "computed diversity index");
        Ok(results.into_iter().flatten().collect())
    }

    /// Like [`Self::compute`], with values in input row order.
    pub fn compute_ordered(&self, traces: &[Trace]) -> Result<Vec<f32>, DiversityError> {
        let mut values = vec![0.0; traces.len()];
        for r in self.compute(traces)? {
            values[r.row] = r.diversity_index;
        }
        Ok(values)
    }
}

fn partition_of(ip: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    ip.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

fn process_partition(
    traces: &[Trace],
    rows: &[usize],
    window_micros: i64,
) -> Result<Vec<DiversityRow>, DiversityError> {
    let mut by_ip: HashMap<&str, Vec<(i64, usize)>> = HashMap::new();
    for &row in rows {
        let trace = &traces[row];
        let ts = parse_timestamp(&trace.timestamp).ok_or_else(|| {
            DiversityError::InvalidTimestamp {
                row,
                value: trace.timestamp.clone(),
            }
        })?;
        by_ip
            .entry(trace.ip_source.as_str())
            .or_default()
            .push((ts.timestamp_micros(), row));
    }

    let mut out = Vec::with_capacity(rows.len());
    for group in by_ip.values_mut() {
        group.sort_unstable();
        sliding_window(traces, group, window_micros, &mut out);
    }
    Ok(out)
}

/// Two-pointer sweep over one IP's rows, sorted by (timestamp, row).
fn sliding_window(
    traces: &[Trace],
    group: &[(i64, usize)],
    window_micros: i64,
    out: &mut Vec<DiversityRow>,
) {
    let port = |i: usize| traces[group[i].1].labels.destination_port_label.as_str();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut start = 0;

    for end in 0..group.len() {
        *counts.entry(port(end)).or_default() += 1;

        let lower = group[end].0.saturating_sub(window_micros);
        while group[start].0 <= lower {
            let p = port(start);
            if let Some(n) = counts.get_mut(p) {
                *n -= 1;
                if *n == 0 {
                    counts.remove(p);
                }
            }
            start += 1;
        }

        let size = end - start + 1;
        out.push(DiversityRow {
            row: group[end].1,
            diversity_index: counts.len() as f32 / size as f32,
        });
    }
}

/// RFC 3339 first (what Cilium emits), then naive ISO-8601 taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TraceLabels;

    fn flow(ip: &str, secs: u32, port: &str) -> Trace {
        Trace {
            ip_source: ip.into(),
            ip_destination: "10.0.0.100".into(),
            timestamp: format!("2024-05-01T12:00:{secs:02}Z"),
            labels: TraceLabels {
                destination_port_label: port.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_port_scan_scores_high() {
        let traces: Vec<Trace> = (0..5)
            .map(|i| flow("10.0.0.66", i, &(20 + i).to_string()))
            .collect();
        let values = DiversityPreprocessor::new(DEFAULT_WINDOW, 2)
            .compute_ordered(&traces)
            .unwrap();
        assert!(values.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_repeated_port_scores_low() {
        let traces: Vec<Trace> = (0..4).map(|i| flow("10.0.0.5", i, "443")).collect();
        let values = DiversityPreprocessor::new(DEFAULT_WINDOW, 1)
            .compute_ordered(&traces)
            .unwrap();
        assert_eq!(values, vec![1.0, 0.5, 1.0 / 3.0, 0.25]);
    }

    #[test]
    fn test_window_excludes_old_rows() {
        // 0s and 10s: the first falls out of (0, 10].
        let traces = vec![flow("10.0.0.5", 0, "22"), flow("10.0.0.5", 10, "22")];
        let values = DiversityPreprocessor::new(DEFAULT_WINDOW, 1)
            .compute_ordered(&traces)
            .unwrap();
        assert_eq!(values, vec![1.0, 1.0]);
    }

    #[test]
    fn test_ips_are_independent() {
        let traces = vec![
            flow("10.0.0.1", 0, "80"),
            flow("10.0.0.2", 1, "80"),
            flow("10.0.0.1", 2, "80"),
            flow("10.0.0.2", 3, "81"),
        ];
        let values = DiversityPreprocessor::new(DEFAULT_WINDOW, 4)
            .compute_ordered(&traces)
            .unwrap();
        assert_eq!(values, vec![1.0, 1.0, 0.5, 1.0]);
    }

    #[test]
    fn test_unsorted_input_uses_time_order() {
        let traces = vec![flow("10.0.0.1", 5, "81"), flow("10.0.0.1", 1, "80")];
        let rows = DiversityPreprocessor::new(DEFAULT_WINDOW, 1).compute(&traces).unwrap();
        let later = rows.iter().find(|r| r.row == 0).unwrap();
        assert_eq!(later.diversity_index, 1.0);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_bad_timestamp_fails_everything() {
        let mut traces: Vec<Trace> = (0..6).map(|i| flow(&format!("10.0.0.{i}"), i, "80")).collect();
        traces[3].timestamp = "yesterday".into();
        let err = DiversityPreprocessor::new(DEFAULT_WINDOW, 3)
            .compute(&traces)
            .unwrap_err();
        assert_eq!(
            err,
            DiversityError::InvalidTimestamp {
                row: 3,
                value: "yesterday".into()
            }
        );
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-05-01T12:00:00.123456789Z").is_some());
        assert!(parse_timestamp("2024-05-01T12:00:00+02:00").is_some());
        assert!(parse_timestamp("2024-05-01 12:00:00").is_some());
        assert!(parse_timestamp("").is_none());
    }
}
