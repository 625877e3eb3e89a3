//! Composition of the population flagged above a risk percentile cutoff.
//!
//! Care-management programs enroll patients whose risk score passes a
//! percentile threshold. Reporting each category's share of the flagged group
//! shows how a scoring disparity turns into an enrollment disparity.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Referral to a primary care physician.
pub const REFERRAL_PERCENTILE: f64 = 55.0;
/// Automatic program enrollment.
pub const AUTO_ENROLL_PERCENTILE: f64 = 97.0;

#[derive(Error, Debug, PartialEq)]
pub enum ThresholdError {
    #[error("Percentile cutoff {0} lies outside [0, 100].")]
    CutoffOutOfRange(f64),
    #[error("Got {percentiles} percentiles but {categories} category labels.")]
    LengthMismatch {
        percentiles: usize,
        categories: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryShare {
    pub category: String,
    pub count: usize,
    /// Fraction of the flagged group, in [0, 1].
    pub fraction: f64,
}

/// Records at or above one cutoff and how they split by category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdShare {
    pub cutoff: f64,
    pub flagged: usize,
    pub shares: Vec<CategoryShare>,
}

impl ThresholdShare {
    pub fn fraction_of(&self, category: &str) -> f64 {
        self.shares
            .iter()
            .find(|share| share.category == category)
            .map_or(0.0, |share| share.fraction)
    }
}

/// For each cutoff, counts records with `percentile >= cutoff` per category.
pub fn threshold_shares(
    percentiles: &[f64],
    categories: &[String],
    cutoffs: &[f64],
) -> Result<Vec<ThresholdShare>, ThresholdError> {
    if percentiles.len() != categories.len() {
        return Err(ThresholdError::LengthMismatch {
            percentiles: percentiles.len(),
            categories: categories.len(),
        });
    }
    if let Some(&bad) = cutoffs
        .iter()
        .find(|c| !(c.is_finite() && (0.0..=100.0).contains(*c)))
    {
        return Err(ThresholdError::CutoffOutOfRange(bad));
    }

    Ok(cutoffs
        .iter()
        .map(|&cutoff| {
            let counts = percentiles
                .iter()
                .zip(categories)
                .filter(|(p, _)| **p >= cutoff)
                .map(|(_, category)| category.as_str())
                .counts();
            let flagged: usize = counts.values().sum();
            let shares = counts
                .into_iter()
                .sorted()
                .map(|(category, count)| CategoryShare {
                    category: category.to_string(),
                    count,
                    fraction: count as f64 / flagged as f64,
                })
                .collect();
            ThresholdShare {
                cutoff,
                flagged,
                shares,
            }
        })
        .collect())
}
