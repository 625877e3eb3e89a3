//! Rank percentiles for a numeric column.
//!
//! Converts raw values (e.g. the algorithm's risk score) into their position
//! within the column's distribution on a 0-100 scale, and rounds those
//! positions into buckets for grouping.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How tied values share a percentile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TieMethod {
    /// Every member of a tie group receives the mean of the group's 1-based ranks.
    /// `[10, 20, 20, 40]` becomes `[25, 62.5, 62.5, 100]`.
    #[default]
    Average,
    /// Every member receives the highest rank of its tie group, i.e. the share of
    /// values less than or equal to it. `[10, 20, 20, 40]` becomes `[25, 75, 75, 100]`.
    Max,
}

#[derive(Error, Debug, PartialEq)]
pub enum PercentileError {
    #[error("Cannot compute percentiles of an empty column.")]
    EmptyInput,
    #[error("Value at row {row} is not finite ({value}); percentiles require finite input.")]
    NonFinite { row: usize, value: f64 },
    #[error("Percentile bucket width must be a positive finite number, got {0}.")]
    InvalidBucketWidth(f64),
}

/// Computes the rank percentile of every value, in input order.
///
/// The output has the same length as `values` and lies in `(0, 100]`.
/// The transform is monotonic: `a <= b` implies `percentile(a) <= percentile(b)`.
///
/// Under [`TieMethod::Max`] the column maximum always maps to 100. Under
/// [`TieMethod::Average`] that holds only when the maximum is unique: a
/// maximum shared by `k` records maps to `100 * (n - (k - 1) / 2) / n`, so
/// `[1, 5, 5]` gives `[33.3.., 83.3.., 83.3..]`. Use `Max` for the inclusive
/// "share of values at or below" percentile.
pub fn percentile_ranks(values: &[f64], tie_method: TieMethod) -> Result<Vec<f64>, PercentileError> {
    if values.is_empty() {
        return Err(PercentileError::EmptyInput);
    }
    if let Some((row, &value)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(PercentileError::NonFinite { row, value });
    }

    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; n];
    let mut start = 0;
    while start < n {
        // Extend over the run of values equal to the one at `start`.
        let mut end = start + 1;
        while end < n && values[order[end]] == values[order[start]] {
            end += 1;
        }
        let rank = match tie_method {
            // Mean of the 1-based ranks start+1 ..= end.
            TieMethod::Average => (start + 1 + end) as f64 / 2.0,
            TieMethod::Max => end as f64,
        };
        for &idx in &order[start..end] {
            ranks[idx] = rank;
        }
        start = end;
    }

    let scale = 100.0 / n as f64;
    Ok(ranks.into_iter().map(|rank| rank * scale).collect())
}

/// Rounds each percentile to the nearest multiple of `width`.
///
/// With the default width of 1.0 this yields integer percentiles.
pub fn bucket_percentiles(percentiles: &[f64], width: f64) -> Result<Vec<f64>, PercentileError> {
    if !(width.is_finite() && width > 0.0) {
        return Err(PercentileError::InvalidBucketWidth(width));
    }
    percentiles
        .iter()
        .enumerate()
        .map(|(row, &p)| {
            if p.is_finite() {
                // Adding 0.0 folds a rounded -0.0 into 0.0.
                Ok((p / width).round() * width + 0.0)
            } else {
                Err(PercentileError::NonFinite { row, value: p })
            }
        })
        .collect()
}
