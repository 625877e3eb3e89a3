//! # Analysis Pipeline
//!
//! Composes the stages of the audit into one run:
//!
//! 1. Load the columns the configuration needs.
//! 2. Append the risk score's percentile and percentile bucket columns.
//! 3. For every figure, aggregate its target by (bucket, category), fit the
//!    configured curve per category, and render the figure.
//! 4. Summarise the category composition above each threshold.
//!
//! Every artifact is written to the output directory, and the returned
//! [`AnalysisReport`] is also saved there as `summary.toml`.

use crate::aggregate::{AggregateError, GroupSeries, GroupedAggregate, aggregate_means};
use crate::config::{AnalysisConfig, ConfigError, FigureConfig, FitKind};
use crate::data::{DataError, TableSchema, load_patient_table};
use crate::glm::{GlmError, GlmFit, GlmStatus, fit_glm};
use crate::lowess::{SmoothingError, smooth_series};
use crate::percentile::{PercentileError, bucket_percentiles, percentile_ranks};
use crate::render::{PlotSpec, RenderError, ScatterSeries, write_svg};
use crate::thresholds::{ThresholdError, ThresholdShare, threshold_shares};
use crate::types::{FittedCurve, PatientTable, TableError};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const SUMMARY_FILE: &str = "summary.toml";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to load the input data: {0}")]
    Data(#[from] DataError),
    #[error("Table error: {0}")]
    Table(#[from] TableError),
    #[error("Percentile computation failed: {0}")]
    Percentile(#[from] PercentileError),
    #[error("Aggregation failed: {0}")]
    Aggregate(#[from] AggregateError),
    #[error("LOWESS smoothing failed for category '{category}' in figure '{figure}': {source}")]
    Smoothing {
        figure: String,
        category: String,
        source: SmoothingError,
    },
    #[error("GLM fitting failed for category '{category}' in figure '{figure}': {source}")]
    Glm {
        figure: String,
        category: String,
        source: GlmError,
    },
    #[error("Rendering failed: {0}")]
    Render(#[from] RenderError),
    #[error("Threshold summary failed: {0}")]
    Threshold(#[from] ThresholdError),
    #[error("None of the selected categories {selected:?} occur in figure '{figure}'.")]
    NoSelectedCategories {
        figure: String,
        selected: Vec<String>,
    },
    #[error("Failed to write a table: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to write output: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize the summary to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Coefficients of one category's GLM fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlmSummary {
    pub category: String,
    pub intercept: f64,
    pub slope: f64,
    pub deviance: f64,
    pub iterations: usize,
    pub status: GlmStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FigureReport {
    pub name: String,
    pub target: String,
    pub fit: FitKind,
    /// Number of (bucket, category) groups in the aggregate.
    pub groups: usize,
    pub categories: Vec<String>,
    pub svg_file: String,
    pub aggregate_file: String,
    pub fit_file: Option<String>,
    pub glm: Vec<GlmSummary>,
}

/// Everything a run produced, as written to `summary.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub data_file: String,
    pub n_rows: usize,
    pub percentile_column: String,
    pub bucket_column: String,
    pub figures: Vec<FigureReport>,
    pub thresholds: Vec<ThresholdShare>,
}

/// Runs the full analysis over `data_path` and writes all artifacts to `out_dir`.
pub fn run_analysis(
    data_path: &Path,
    config: &AnalysisConfig,
    out_dir: &Path,
) -> Result<AnalysisReport, PipelineError> {
    // --- 1. Validate configuration and prepare the output directory ---
    config.validate()?;
    fs::create_dir_all(out_dir)?;

    // --- 2. Load the input ---
    let schema = internal::schema_for(config);
    let mut table = load_patient_table(data_path, &schema, config.delimiter_byte()?)?;

    // --- 3. Percentile columns ---
    let risk_column = &config.columns.risk_score;
    let percentile_column = format!("{risk_column}_percentile");
    let bucket_column = format!("{risk_column}_bucket");
    let scores = table.numeric(risk_column)?.to_vec();
    let percentiles = percentile_ranks(&scores, config.percentile.tie_method)?;
    let buckets = bucket_percentiles(&percentiles, config.percentile.bucket_width)?;
    table.insert_numeric(&percentile_column, percentiles.clone())?;
    table.insert_numeric(&bucket_column, buckets)?;
    log::info!(
        "Computed '{}' and '{}' for {} records",
        percentile_column,
        bucket_column,
        table.n_rows()
    );

    // --- 4. Figures ---
    let mut figures = Vec::with_capacity(config.figures.len());
    for figure in &config.figures {
        figures.push(internal::run_figure(
            &table,
            &bucket_column,
            figure,
            config,
            out_dir,
        )?);
    }

    // --- 5. Threshold summary ---
    let categories = table.categorical(&config.columns.category)?;
    let thresholds = threshold_shares(&percentiles, categories, &config.thresholds)?;
    for share in &thresholds {
        log::info!(
            "{} records at or above percentile {}",
            share.flagged,
            share.cutoff
        );
    }

    let report = AnalysisReport {
        data_file: data_path.display().to_string(),
        n_rows: table.n_rows(),
        percentile_column,
        bucket_column,
        figures,
        thresholds,
    };

    // --- 6. Summary ---
    let summary_path = out_dir.join(SUMMARY_FILE);
    fs::write(&summary_path, toml::to_string_pretty(&report)?)?;
    log::info!("Wrote run summary to {}", summary_path.display());

    Ok(report)
}

/// Internal module for per-figure work and artifact writers.
mod internal {
    use super::*;

    const X_LABEL: &str = "Percentile of algorithm risk score";

    pub(super) fn schema_for(config: &AnalysisConfig) -> TableSchema {
        let columns = &config.columns;
        config.figures.iter().fold(
            TableSchema::new()
                .with_numeric(&columns.risk_score)
                .with_numeric(&columns.cost)
                .with_numeric(&columns.illness_count)
                .with_categorical(&columns.category),
            |schema, figure| schema.with_numeric(figure.target_column(columns)),
        )
    }

    /// Categories to draw for one figure, in sorted order.
    fn selected_categories(
        aggregate: &GroupedAggregate,
        figure: &FigureConfig,
        config: &AnalysisConfig,
    ) -> Result<Vec<String>, PipelineError> {
        let present = aggregate.categories();
        if config.categories.is_empty() {
            return Ok(present);
        }
        for wanted in &config.categories {
            if !present.contains(wanted) {
                log::warn!(
                    "Category '{}' does not occur in figure '{}'; skipping it",
                    wanted,
                    figure.name
                );
            }
        }
        let selected: Vec<String> = present
            .into_iter()
            .filter(|c| config.categories.contains(c))
            .collect();
        if selected.is_empty() {
            return Err(PipelineError::NoSelectedCategories {
                figure: figure.name.clone(),
                selected: config.categories.clone(),
            });
        }
        Ok(selected)
    }

    fn fit_series(
        series: &GroupSeries,
        figure: &FigureConfig,
        config: &AnalysisConfig,
    ) -> Result<Option<(FittedCurve, Option<GlmFit>)>, PipelineError> {
        match figure.fit {
            FitKind::None => Ok(None),
            FitKind::Lowess => {
                let curve = smooth_series(&series.category, &series.x, &series.y, &config.lowess)
                    .map_err(|source| PipelineError::Smoothing {
                        figure: figure.name.clone(),
                        category: series.category.clone(),
                        source,
                    })?;
                Ok(Some((curve, None)))
            }
            FitKind::Glm => {
                let weights: Option<Array1<f64>> = config
                    .glm
                    .weight_by_group_size
                    .then(|| series.counts.iter().map(|&c| c as f64).collect());
                let fit = fit_glm(
                    ArrayView1::from(&series.x),
                    ArrayView1::from(&series.y),
                    weights.as_ref().map(|w| w.view()),
                    &config.glm,
                )
                .map_err(|source| PipelineError::Glm {
                    figure: figure.name.clone(),
                    category: series.category.clone(),
                    source,
                })?;
                // Series x is already sorted by bucket.
                let curve = FittedCurve {
                    label: series.category.clone(),
                    points: series.x.iter().copied().zip(fit.fitted.iter().copied()).collect(),
                };
                Ok(Some((curve, Some(fit))))
            }
        }
    }

    pub(super) fn run_figure(
        table: &PatientTable,
        bucket_column: &str,
        figure: &FigureConfig,
        config: &AnalysisConfig,
        out_dir: &Path,
    ) -> Result<FigureReport, PipelineError> {
        let target = figure.target_column(&config.columns);
        log::info!("Building figure '{}' from '{}'", figure.name, target);
        let aggregate = aggregate_means(table, bucket_column, &config.columns.category, target)?;
        let categories = selected_categories(&aggregate, figure, config)?;

        let mut scatter = Vec::with_capacity(categories.len());
        let mut curves = Vec::new();
        let mut glm = Vec::new();
        for category in &categories {
            let Some(series) = aggregate.series(category) else {
                continue;
            };
            scatter.push(ScatterSeries {
                label: category.clone(),
                points: series.x.iter().copied().zip(series.y.iter().copied()).collect(),
            });
            if let Some((curve, fit)) = fit_series(&series, figure, config)? {
                if let Some(fit) = fit {
                    if fit.status == GlmStatus::MaxIterationsReached {
                        log::warn!(
                            "GLM for '{}' in figure '{}' stopped at the iteration cap",
                            category,
                            figure.name
                        );
                    }
                    glm.push(GlmSummary {
                        category: category.clone(),
                        intercept: fit.intercept,
                        slope: fit.slope,
                        deviance: fit.deviance,
                        iterations: fit.iterations,
                        status: fit.status,
                    });
                }
                curves.push(curve);
            }
        }

        let aggregate_file = format!("aggregate_{}.tsv", figure.name);
        write_aggregate(&aggregate, &categories, &out_dir.join(&aggregate_file))?;

        let fit_file = if curves.is_empty() {
            None
        } else {
            let name = format!("fit_{}.tsv", figure.name);
            write_curves(&curves, &out_dir.join(&name))?;
            Some(name)
        };

        let svg_file = format!("{}.svg", figure.name);
        let spec = PlotSpec {
            title: figure.title.clone(),
            x_label: X_LABEL.to_string(),
            y_label: figure.y_label.clone(),
            width: config.canvas.width,
            height: config.canvas.height,
            log_scale: figure.log_scale,
            scatter,
            curves,
        };
        write_svg(&spec, &out_dir.join(&svg_file))?;

        Ok(FigureReport {
            name: figure.name.clone(),
            target: target.to_string(),
            fit: figure.fit,
            groups: aggregate.rows.len(),
            categories,
            svg_file,
            aggregate_file,
            fit_file,
            glm,
        })
    }

    fn tsv_writer(path: &Path) -> Result<csv::Writer<fs::File>, PipelineError> {
        Ok(csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?)
    }

    fn write_aggregate(
        aggregate: &GroupedAggregate,
        categories: &[String],
        path: &Path,
    ) -> Result<(), PipelineError> {
        let mut writer = tsv_writer(path)?;
        writer.write_record(["bucket", "category", aggregate.target.as_str(), "count", "min", "max"])?;
        for row in aggregate
            .rows
            .iter()
            .filter(|row| categories.contains(&row.category))
        {
            writer.write_record([
                row.bucket.to_string(),
                row.category.clone(),
                row.mean.to_string(),
                row.count.to_string(),
                row.min.to_string(),
                row.max.to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    fn write_curves(curves: &[FittedCurve], path: &Path) -> Result<(), PipelineError> {
        let mut writer = tsv_writer(path)?;
        writer.write_record(["category", "x", "fitted"])?;
        for curve in curves {
            for &(x, y) in &curve.points {
                writer.write_record([curve.label.clone(), x.to_string(), y.to_string()])?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::LogScale;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Two groups whose cost grows with risk; one group is sicker at every score.
    fn write_cohort() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "risk_score_t,cost_t,gagne_sum_t,race,age").unwrap();
        for i in 0..200 {
            let risk = f64::from(i) * 0.05;
            let race = if i % 2 == 0 { "black" } else { "white" };
            let extra = if i % 2 == 0 { 1.0 } else { 0.0 };
            let illness = 1.0 + extra + risk * 0.3;
            let cost = 1000.0 * (0.3 * risk).exp();
            writeln!(file, "{risk},{cost},{illness},{race},{}", 40 + i % 30).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn small_config() -> AnalysisConfig {
        let mut config = AnalysisConfig::default();
        config.percentile.bucket_width = 10.0;
        config.lowess.frac = 0.6;
        config
    }

    #[test]
    fn writes_every_artifact() {
        let data = write_cohort();
        let out = tempfile::tempdir().unwrap();
        let report = run_analysis(data.path(), &small_config(), out.path()).unwrap();

        assert_eq!(report.n_rows, 200);
        assert_eq!(report.bucket_column, "risk_score_t_bucket");
        assert_eq!(report.figures.len(), 3);
        for figure in &report.figures {
            assert!(out.path().join(&figure.svg_file).exists());
            assert!(out.path().join(&figure.aggregate_file).exists());
            assert_eq!(figure.categories, vec!["black".to_string(), "white".to_string()]);
        }
        assert!(out.path().join(SUMMARY_FILE).exists());

        let glm_figure = &report.figures[1];
        assert_eq!(glm_figure.fit, FitKind::Glm);
        assert_eq!(glm_figure.glm.len(), 2);
        assert!(glm_figure.glm.iter().all(|g| g.slope > 0.0));

        assert_eq!(report.thresholds.len(), 2);
        assert_eq!(report.thresholds[1].cutoff, 97.0);
    }

    #[test]
    fn category_filter_limits_the_figures() {
        let data = write_cohort();
        let out = tempfile::tempdir().unwrap();
        let mut config = small_config();
        config.categories = vec!["black".to_string(), "asian".to_string()];
        let report = run_analysis(data.path(), &config, out.path()).unwrap();
        for figure in &report.figures {
            assert_eq!(figure.categories, vec!["black".to_string()]);
        }
        let fit = fs::read_to_string(out.path().join("fit_illness_lowess.tsv")).unwrap();
        assert!(fit.starts_with("category\tx\tfitted"));
        assert!(!fit.contains("white"));
    }

    #[test]
    fn unknown_only_categories_fail() {
        let data = write_cohort();
        let out = tempfile::tempdir().unwrap();
        let mut config = small_config();
        config.categories = vec!["asian".to_string()];
        let err = run_analysis(data.path(), &config, out.path()).unwrap_err();
        assert!(matches!(err, PipelineError::NoSelectedCategories { .. }));
    }

    #[test]
    fn figure_without_fit_has_no_fit_file() {
        let data = write_cohort();
        let out = tempfile::tempdir().unwrap();
        let mut config = small_config();
        config.figures = vec![FigureConfig {
            name: "raw_cost".to_string(),
            target: "cost_t".to_string(),
            fit: FitKind::None,
            log_scale: LogScale::Auto,
            title: "Raw cost".to_string(),
            y_label: "Mean cost".to_string(),
        }];
        let report = run_analysis(data.path(), &config, out.path()).unwrap();
        assert_eq!(report.figures[0].fit_file, None);
        assert!(!out.path().join("fit_raw_cost.tsv").exists());
        let aggregate =
            fs::read_to_string(out.path().join("aggregate_raw_cost.tsv")).unwrap();
        assert!(aggregate.starts_with("bucket\tcategory\tcost_t\tcount\tmin\tmax"));
    }

    #[test]
    fn default_figures_follow_renamed_columns() {
        let mut data = NamedTempFile::new().unwrap();
        writeln!(data, "risk,spend,chronic,race").unwrap();
        for i in 0..120 {
            let risk = f64::from(i) * 0.1;
            let race = if i % 2 == 0 { "black" } else { "white" };
            writeln!(data, "{risk},{},{},{race}", 800.0 + 25.0 * risk, 1 + i % 4).unwrap();
        }
        data.flush().unwrap();

        let mut config = small_config();
        config.columns.risk_score = "risk".to_string();
        config.columns.cost = "spend".to_string();
        config.columns.illness_count = "chronic".to_string();
        let out = tempfile::tempdir().unwrap();
        let report = run_analysis(data.path(), &config, out.path()).unwrap();

        assert_eq!(report.percentile_column, "risk_percentile");
        let targets: Vec<&str> = report.figures.iter().map(|f| f.target.as_str()).collect();
        assert_eq!(targets, vec!["chronic", "chronic", "spend"]);
        let aggregate = fs::read_to_string(out.path().join("aggregate_cost_lowess.tsv")).unwrap();
        assert!(aggregate.starts_with("bucket\tcategory\tspend\tcount"));
    }

    #[test]
    fn group_size_weights_change_the_glm() {
        // Black records are sparse below the 75th percentile and dense above it,
        // so per-bucket counts vary widely within that group.
        let mut data = NamedTempFile::new().unwrap();
        writeln!(data, "risk_score_t,cost_t,gagne_sum_t,race").unwrap();
        for i in 0..200 {
            let risk = f64::from(i) * 0.05;
            let race = if i % 5 == 0 || i >= 150 { "black" } else { "white" };
            let illness = 1.0 + (risk / 4.0).powi(2);
            writeln!(data, "{risk},{},{illness},{race}", 1000.0 + risk).unwrap();
        }
        data.flush().unwrap();

        let mut config = small_config();
        config.figures = vec![FigureConfig {
            name: "illness_glm".to_string(),
            target: "illness_count".to_string(),
            fit: FitKind::Glm,
            log_scale: LogScale::Never,
            title: "Illness".to_string(),
            y_label: "Mean chronic conditions".to_string(),
        }];
        let fit_black = |config: &AnalysisConfig| {
            let out = tempfile::tempdir().unwrap();
            let report = run_analysis(data.path(), config, out.path()).unwrap();
            report.figures[0]
                .glm
                .iter()
                .find(|g| g.category == "black")
                .cloned()
                .unwrap()
        };

        let unweighted = fit_black(&config);
        config.glm.weight_by_group_size = true;
        let weighted = fit_black(&config);

        assert_eq!(weighted.status, GlmStatus::Converged);
        assert!(weighted.slope > 0.0 && unweighted.slope > 0.0);
        assert!(
            (weighted.slope - unweighted.slope).abs() > 1e-6
                || (weighted.intercept - unweighted.intercept).abs() > 1e-6,
            "weights had no effect: {weighted:?} vs {unweighted:?}"
        );
    }

    #[test]
    fn missing_column_is_reported() {
        let data = write_cohort();
        let out = tempfile::tempdir().unwrap();
        let mut config = small_config();
        config.columns.category = "ethnicity".to_string();
        let err = run_analysis(data.path(), &config, out.path()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Data(DataError::ColumnNotFound(ref name)) if name == "ethnicity"
        ));
    }
}
