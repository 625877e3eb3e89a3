//! # Data Loading and Validation Module
//!
//! This module is the only entry point for user-provided patient records.
//! It reads a delimited file with a header row, checks it against the schema
//! requested by the caller, and converts each column into the typed
//! [`PatientTable`] used by the rest of the analysis.
//!
//! - Named Schema: the caller lists which columns must be numeric and which
//!   are categorical. Anything else in the file is dropped after validation.
//! - User-Centric Errors: failures are assumed to be input errors, so the
//!   `DataError` messages name the offending column.
//! - Delegated Parsing: `polars` handles quoting, type inference and the
//!   actual CSV reading.

use crate::types::{Column, PatientTable, TableError};
use ndarray::Array1;
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// The columns a caller needs from the input file.
#[derive(Debug, Clone, Default)]
pub struct TableSchema {
    pub numeric: Vec<String>,
    pub categorical: Vec<String>,
}

impl TableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_numeric(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.numeric.contains(&name) {
            self.numeric.push(name);
        }
        self
    }

    pub fn with_categorical(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.categorical.contains(&name) {
            self.categorical.push(name);
        }
        self
    }

    fn all_columns(&self) -> impl Iterator<Item = &String> {
        self.numeric.iter().chain(self.categorical.iter())
    }
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. It contains non-numeric data. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the required column '{0}'. This tool requires complete data with no missing values."
    )]
    MissingValuesFound(String),
    #[error("Input file contains only {found} data rows, but at least {required} are required.")]
    InsufficientRows { found: usize, required: usize },
    #[error(
        "Non-finite values (NaN or Infinity) were found in the required column '{0}'. This tool requires all data to be finite."
    )]
    NonFiniteValuesFound(String),
    #[error("The column '{0}' was requested as both numeric and categorical.")]
    ConflictingSchema(String),
    #[error("Failed to assemble the patient table: {0}")]
    Table(#[from] TableError),
}

/// Reads `path` and returns a table holding exactly the columns named in `schema`.
pub fn load_patient_table(
    path: &Path,
    schema: &TableSchema,
    delimiter: u8,
) -> Result<PatientTable, DataError> {
    let numeric: HashSet<&str> = schema.numeric.iter().map(String::as_str).collect();
    if let Some(conflict) = schema
        .categorical
        .iter()
        .find(|name| numeric.contains(name.as_str()))
    {
        return Err(DataError::ConflictingSchema(conflict.clone()));
    }

    log::info!("Loading patient records from '{}'", path.display());
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(delimiter)),
        )
        .finish()?;

    internal::table_from_frame(df, schema)
}

/// Internal module for DataFrame conversion logic.
mod internal {
    use super::*;

    const MINIMUM_ROWS: usize = 1;

    // Small helper: validate that an array contains only finite values
    fn validate_is_finite(values: &[f64], column_name: &str) -> Result<(), DataError> {
        if values.iter().any(|&v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(())
    }

    fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let wrong_type = || DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        };

        let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
        // A non-strict cast turns unparseable text into nulls.
        if casted.null_count() > 0 {
            return Err(wrong_type());
        }

        let chunked = casted.f64()?.rechunk();
        let values: Vec<f64> = chunked.into_no_null_iter().collect();
        validate_is_finite(&values, column_name)?;
        Ok(values)
    }

    fn extract_categorical_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<String>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }
        let casted = series.cast(&DataType::String)?;
        let labels = casted
            .str()?
            .into_iter()
            .map(|label| label.map(str::to_string))
            .collect::<Option<Vec<String>>>()
            .ok_or_else(|| DataError::MissingValuesFound(column_name.to_string()))?;
        Ok(labels)
    }

    pub(super) fn table_from_frame(
        df: DataFrame,
        schema: &TableSchema,
    ) -> Result<PatientTable, DataError> {
        if df.height() < MINIMUM_ROWS {
            return Err(DataError::InsufficientRows {
                found: df.height(),
                required: MINIMUM_ROWS,
            });
        }

        // --- Verify all required columns exist ---
        let columns_set: HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        for col_name in schema.all_columns() {
            if !columns_set.contains(col_name) {
                return Err(DataError::ColumnNotFound(col_name.clone()));
            }
        }
        log::debug!(
            "All required columns found: {:?}",
            schema.all_columns().collect::<Vec<_>>()
        );

        // --- Drop unneeded columns once validation has passed ---
        let projection: Vec<&str> = schema.all_columns().map(String::as_str).collect();
        let df = df.select(projection)?;
        log::debug!("Projected input:\n{}", df.head(Some(5)));

        // --- Convert columns into the patient table ---
        let mut table = PatientTable::new(df.height());
        for name in &schema.numeric {
            let values = extract_numeric_column(&df, name)?;
            table.insert(name, Column::Numeric(Array1::from_vec(values)))?;
        }
        for name in &schema.categorical {
            let labels = extract_categorical_column(&df, name)?;
            table.insert(name, Column::Categorical(labels))?;
        }

        log::info!(
            "Data validation successful: {} rows, {} numeric and {} categorical columns.",
            table.n_rows(),
            schema.numeric.len(),
            schema.categorical.len()
        );
        Ok(table)
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    /// A robust helper to create a temporary CSV file for testing.
    fn create_test_csv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    fn study_schema() -> TableSchema {
        TableSchema::new()
            .with_numeric("risk_score_t")
            .with_numeric("cost_t")
            .with_numeric("gagne_sum_t")
            .with_categorical("race")
    }

    #[test]
    fn test_loads_study_columns_and_drops_the_rest() {
        let content = "risk_score_t,cost_t,gagne_sum_t,race,dem_female\n\
                       1.5,1200.0,2,white,1\n\
                       0.7,300.5,0,black,0\n\
                       3.2,8800.0,5,black,1";
        let file = create_test_csv(content).unwrap();
        let table = load_patient_table(file.path(), &study_schema(), b',').unwrap();

        assert_eq!(table.n_rows(), 3);
        assert_eq!(
            table.column_names().collect::<Vec<_>>(),
            vec!["risk_score_t", "cost_t", "gagne_sum_t", "race"]
        );
        let cost = table.numeric("cost_t").unwrap();
        assert_abs_diff_eq!(cost[1], 300.5, epsilon = 1e-9);
        let illness = table.numeric("gagne_sum_t").unwrap();
        assert_abs_diff_eq!(illness[2], 5.0, epsilon = 1e-9);
        assert_eq!(table.categorical("race").unwrap()[1], "black");
    }

    #[test]
    fn test_tab_delimited_input() {
        let content = "risk_score_t\tcost_t\tgagne_sum_t\trace\n2.0\t10\t1\twhite";
        let file = create_test_csv(content).unwrap();
        let table = load_patient_table(file.path(), &study_schema(), b'\t').unwrap();
        assert_eq!(table.n_rows(), 1);
    }

    #[test]
    fn test_missing_column_is_named() {
        let content = "risk_score_t,cost_t,race\n1.0,2.0,white";
        let file = create_test_csv(content).unwrap();
        match load_patient_table(file.path(), &study_schema(), b',').unwrap_err() {
            DataError::ColumnNotFound(col) => assert_eq!(col, "gagne_sum_t"),
            other => panic!("Expected ColumnNotFound(gagne_sum_t), got {:?}", other),
        }
    }

    #[test]
    fn test_text_in_numeric_column_rejected() {
        let content = "risk_score_t,cost_t,gagne_sum_t,race\n1.0,cheap,1,white\n2.0,4.0,2,black";
        let file = create_test_csv(content).unwrap();
        match load_patient_table(file.path(), &study_schema(), b',').unwrap_err() {
            DataError::ColumnWrongType { column_name, .. } => assert_eq!(column_name, "cost_t"),
            other => panic!("Expected ColumnWrongType(cost_t), got {:?}", other),
        }
    }

    #[test]
    fn test_empty_numeric_field_is_missing_value() {
        let content = "risk_score_t,cost_t,gagne_sum_t,race\n1.0,,1,white\n2.0,4.0,2,black";
        let file = create_test_csv(content).unwrap();
        match load_patient_table(file.path(), &study_schema(), b',').unwrap_err() {
            DataError::MissingValuesFound(col) => assert_eq!(col, "cost_t"),
            other => panic!("Expected MissingValuesFound(cost_t), got {:?}", other),
        }
    }

    #[test]
    fn test_header_only_file_has_insufficient_rows() {
        let file = create_test_csv("risk_score_t,cost_t,gagne_sum_t,race").unwrap();
        match load_patient_table(file.path(), &study_schema(), b',').unwrap_err() {
            DataError::InsufficientRows { found, required } => {
                assert_eq!(found, 0);
                assert_eq!(required, 1);
            }
            other => panic!("Expected InsufficientRows, got {:?}", other),
        }
    }

    #[test]
    fn test_numeric_category_codes_become_labels() {
        let content = "risk_score_t,dem_female\n1.0,1\n2.0,0";
        let file = create_test_csv(content).unwrap();
        let schema = TableSchema::new()
            .with_numeric("risk_score_t")
            .with_categorical("dem_female");
        let table = load_patient_table(file.path(), &schema, b',').unwrap();
        assert_eq!(table.categorical("dem_female").unwrap(), &["1", "0"]);
    }

    #[test]
    fn test_conflicting_schema_rejected_before_reading() {
        let schema = TableSchema::new()
            .with_numeric("race")
            .with_categorical("race");
        let err = load_patient_table(Path::new("does-not-exist.csv"), &schema, b',').unwrap_err();
        assert!(matches!(err, DataError::ConflictingSchema(col) if col == "race"));
    }
}
