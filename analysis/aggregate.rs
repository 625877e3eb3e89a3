//! Grouped means of a target column keyed by (percentile bucket, category).

use crate::types::{PatientTable, TableError};
use ahash::AHashMap;
use itertools::Itertools;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum AggregateError {
    #[error("Cannot aggregate: {0}")]
    Table(#[from] TableError),
}

/// One row of a grouped aggregate: the mean of the target over all records
/// sharing `bucket` and `category`.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRow {
    pub bucket: f64,
    pub category: String,
    pub mean: f64,
    pub count: usize,
    pub min: f64,
    pub max: f64,
}

/// The (bucket, mean) series of a single category, sorted by bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSeries {
    pub category: String,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    /// Number of records behind each mean.
    pub counts: Vec<usize>,
}

impl GroupSeries {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Output of [`aggregate_means`]. Rows are unique per (bucket, category) and
/// sorted by bucket, then category.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedAggregate {
    pub target: String,
    pub rows: Vec<GroupRow>,
}

impl GroupedAggregate {
    /// Distinct category labels in sorted order.
    pub fn categories(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|row| row.category.clone())
            .sorted()
            .dedup()
            .collect()
    }

    pub fn series(&self, category: &str) -> Option<GroupSeries> {
        let rows: Vec<&GroupRow> = self
            .rows
            .iter()
            .filter(|row| row.category == category)
            .collect();
        if rows.is_empty() {
            return None;
        }
        Some(GroupSeries {
            category: category.to_string(),
            x: rows.iter().map(|row| row.bucket).collect(),
            y: rows.iter().map(|row| row.mean).collect(),
            counts: rows.iter().map(|row| row.count).collect(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    sum: f64,
    count: usize,
    min: f64,
    max: f64,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            sum: 0.0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn mean(&self) -> f64 {
        // Rounding can push the quotient a hair outside the observed range.
        (self.sum / self.count as f64).clamp(self.min, self.max)
    }
}

/// Groups the table by the numeric `bucket_column` and the categorical
/// `category_column` and averages `target_column` within each group.
///
/// Only groups that contain at least one record appear in the output.
pub fn aggregate_means(
    table: &PatientTable,
    bucket_column: &str,
    category_column: &str,
    target_column: &str,
) -> Result<GroupedAggregate, AggregateError> {
    let buckets = table.numeric(bucket_column)?;
    let categories = table.categorical(category_column)?;
    let target = table.numeric(target_column)?;

    // Buckets are keyed by bit pattern; `+ 0.0` maps -0.0 onto 0.0 first.
    let mut groups: AHashMap<(u64, &str), Accumulator> = AHashMap::new();
    for ((&bucket, category), &value) in buckets.iter().zip(categories).zip(target.iter()) {
        groups
            .entry(((bucket + 0.0).to_bits(), category.as_str()))
            .or_insert_with(Accumulator::new)
            .push(value);
    }

    let rows: Vec<GroupRow> = groups
        .into_iter()
        .map(|((bits, category), acc)| GroupRow {
            bucket: f64::from_bits(bits),
            category: category.to_string(),
            mean: acc.mean(),
            count: acc.count,
            min: acc.min,
            max: acc.max,
        })
        .sorted_by(|a, b| {
            a.bucket
                .total_cmp(&b.bucket)
                .then_with(|| a.category.cmp(&b.category))
        })
        .collect();

    log::debug!(
        "Aggregated '{}' into {} groups over {} records",
        target_column,
        rows.len(),
        table.n_rows()
    );

    Ok(GroupedAggregate {
        target: target_column.to_string(),
        rows,
    })
}
