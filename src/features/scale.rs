//! Batch-scoped scalar encoders.
//!
//! These min-max normalize against the batch they are given, so the same value
//! encodes differently in different batches. That is fine for offline scoring
//! and wrong for the online path, which uses [`super::LabelVocabulary`].

use sha2::{Digest, Sha256};

/// Wide deterministic hash of a label: the leading 128 bits of its SHA-256
/// digest, as `f64`. The empty string (a missing label) hashes to zero.
pub fn label_hash(value: &str) -> f64 {
    if value.is_empty() {
        return 0.0;
    }
    let digest = Sha256::digest(value.as_bytes());
    let mut head = [0u8; 16];
    head.copy_from_slice(&digest[..16]);
    u128::from_be_bytes(head) as f64
}

/// Hash each label and min-max normalize the hashes over the batch.
pub fn hash_encode<S: AsRef<str>>(values: &[S]) -> Vec<f32> {
    let hashes: Vec<f64> = values.iter().map(|v| label_hash(v.as_ref())).collect();
    let (min, max) = bounds(&hashes);
    hashes.iter().map(|&h| rescale(h, min, max)).collect()
}

/// Parse integers (ports) and min-max normalize over the parseable ones.
/// Values that don't parse encode as 0.
pub fn normalize_numbers<S: AsRef<str>>(values: &[S]) -> Vec<f32> {
    let parsed: Vec<Option<f64>> = values
        .iter()
        .map(|v| v.as_ref().trim().parse::<i64>().ok().map(|n| n as f64))
        .collect();
    let present: Vec<f64> = parsed.iter().flatten().copied().collect();
    let (min, max) = bounds(&present);

    parsed
        .iter()
        .map(|p| p.map_or(0.0, |v| rescale(v, min, max)))
        .collect()
}

pub fn encode_bool(flag: bool) -> f32 {
    if flag {
        1.0
    } else {
        0.0
    }
}

fn bounds(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// Degenerate spans (single value, empty batch) map to zero instead of NaN.
fn rescale(value: f64, min: f64, max: f64) -> f32 {
    let span = max - min;
    if span.is_finite() && span > 0.0 {
        ((value - min) / span) as f32
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_hash_is_deterministic() {
        assert_eq!(label_hash("frontend"), label_hash("frontend"));
        assert_ne!(label_hash("frontend"), label_hash("backend"));
        assert_eq!(label_hash(""), 0.0);
    }

    #[test]
    fn test_hash_encode_bounds() {
        let encoded = hash_encode(&["a", "b", "c", "a"]);
        assert_eq!(encoded.len(), 4);
        assert!(encoded.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(encoded.contains(&0.0));
        assert!(encoded.contains(&1.0));
        assert_eq!(encoded[0], encoded[3]);
    }

    #[test]
    fn test_hash_encode_single_value_is_zero() {
        assert_eq!(hash_encode(&["only"]), vec![0.0]);
    }

    #[test]
    fn test_normalize_ports() {
        let encoded = normalize_numbers(&["80", "443", "8080", "oops"]);
        assert_eq!(encoded[0], 0.0);
        assert_eq!(encoded[2], 1.0);
        assert!(encoded[1] > 0.0 && encoded[1] < 1.0);
        assert_eq!(encoded[3], 0.0);
    }

    #[test]
    fn test_encode_bool() {
        assert_eq!(encode_bool(true), 1.0);
        assert_eq!(encode_bool(false), 0.0);
    }
}
