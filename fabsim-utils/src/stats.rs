//! Sorted-sample summary statistics for completion-time distributions.

use serde::{Deserialize, Serialize};

/// Percentile summary of a sample distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Return the `p`-quantile (`0.0 ..= 1.0`) of an already sorted, non-empty slice.
///
/// Uses the nearest-rank index `p * len / 100` convention, clamped to the last
/// element.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    assert!(!sorted.is_empty(), "percentile of an empty sample set");
    assert!((0.0..=1.0).contains(&p), "quantile {p} out of range");
    let idx = ((p * sorted.len() as f64) as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Sort the samples in place and summarize them. Returns `None` for an empty set.
pub fn summarize(samples: &mut Vec<f64>) -> Option<Summary> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(f64::total_cmp);
    let count = samples.len();
    Some(Summary {
        count,
        min: samples[0],
        max: samples[count - 1],
        mean: samples.iter().sum::<f64>() / count as f64,
        p50: percentile(samples, 0.50),
        p95: percentile(samples, 0.95),
        p99: percentile(samples, 0.99),
    })
}
