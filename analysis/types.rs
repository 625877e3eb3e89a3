//! Shared in-memory structures passed between the pipeline stages.

use ndarray::{Array1, ArrayView1};
use thiserror::Error;

/// A single column of the patient table.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// Finite floating point values.
    Numeric(Array1<f64>),
    /// Free-form labels, e.g. the self-reported race of a patient.
    Categorical(Vec<String>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(values) => values.len(),
            Column::Categorical(labels) => labels.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind(&self) -> &'static str {
        match self {
            Column::Numeric(_) => "numeric",
            Column::Categorical(_) => "categorical",
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum TableError {
    #[error("The column '{0}' does not exist in the patient table.")]
    ColumnNotFound(String),
    #[error("The column '{column_name}' is {found}, but a {expected} column was required.")]
    WrongColumnKind {
        column_name: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("The column '{column_name}' has {found} rows, but the table has {expected}.")]
    LengthMismatch {
        column_name: String,
        expected: usize,
        found: usize,
    },
    #[error("The column '{0}' already exists; derived columns may not replace loaded data.")]
    DuplicateColumn(String),
}

/// Column-oriented patient records.
///
/// Loaded columns are never mutated. Derived columns (percentiles, buckets)
/// are appended with [`PatientTable::insert_numeric`].
#[derive(Debug, Clone, Default)]
pub struct PatientTable {
    columns: Vec<(String, Column)>,
    n_rows: usize,
}

impl PatientTable {
    pub fn new(n_rows: usize) -> Self {
        Self {
            columns: Vec::new(),
            n_rows,
        }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn column(&self, name: &str) -> Result<&Column, TableError> {
        self.columns
            .iter()
            .find(|(column_name, _)| column_name == name)
            .map(|(_, column)| column)
            .ok_or_else(|| TableError::ColumnNotFound(name.to_string()))
    }

    pub fn numeric(&self, name: &str) -> Result<ArrayView1<'_, f64>, TableError> {
        match self.column(name)? {
            Column::Numeric(values) => Ok(values.view()),
            other => Err(TableError::WrongColumnKind {
                column_name: name.to_string(),
                expected: "numeric",
                found: other.kind(),
            }),
        }
    }

    pub fn categorical(&self, name: &str) -> Result<&[String], TableError> {
        match self.column(name)? {
            Column::Categorical(labels) => Ok(labels),
            other => Err(TableError::WrongColumnKind {
                column_name: name.to_string(),
                expected: "categorical",
                found: other.kind(),
            }),
        }
    }

    pub fn insert(&mut self, name: &str, column: Column) -> Result<(), TableError> {
        if self.columns.iter().any(|(existing, _)| existing == name) {
            return Err(TableError::DuplicateColumn(name.to_string()));
        }
        if column.len() != self.n_rows {
            return Err(TableError::LengthMismatch {
                column_name: name.to_string(),
                expected: self.n_rows,
                found: column.len(),
            });
        }
        self.columns.push((name.to_string(), column));
        Ok(())
    }

    pub fn insert_numeric(&mut self, name: &str, values: Vec<f64>) -> Result<(), TableError> {
        self.insert(name, Column::Numeric(Array1::from_vec(values)))
    }
}

/// A fitted curve for one category, sorted by `x`.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedCurve {
    pub label: String,
    pub points: Vec<(f64, f64)>,
}

impl FittedCurve {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn fitted_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|&(_, y)| y)
    }
}
