//! Run configuration for the analysis, stored as TOML.
//!
//! Every section has a default, so an empty file (or no file at all)
//! reproduces the study's three figures over the default column names.

use crate::glm::GlmConfig;
use crate::lowess::{LowessConfig, SmoothingError};
use crate::percentile::TieMethod;
use crate::render::LogScale;
use crate::thresholds::{AUTO_ENROLL_PERCENTILE, REFERRAL_PERCENTILE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error(
        "The delimiter {0:?} is not usable. It must be a single ASCII character other than a quote or a line break."
    )]
    InvalidDelimiter(char),
    #[error("Percentile bucket width must be a positive finite number, got {0}.")]
    InvalidBucketWidth(f64),
    #[error("Invalid [lowess] section: {0}")]
    Lowess(#[from] SmoothingError),
    #[error(
        "Invalid [glm] section: tolerance must be positive (got {tolerance}) and max_iterations at least 1 (got {max_iterations})."
    )]
    InvalidGlm { tolerance: f64, max_iterations: usize },
    #[error("Threshold cutoff {0} lies outside [0, 100].")]
    InvalidThreshold(f64),
    #[error("The configuration defines no figures; nothing would be produced.")]
    NoFigures,
    #[error(
        "Figure name '{0}' is not usable as a file name. Use letters, digits, '_' and '-' only."
    )]
    InvalidFigureName(String),
    #[error("Figure name '{0}' is used more than once.")]
    DuplicateFigure(String),
    #[error("Figure size {width}x{height} is too small; both sides must be at least 100 pixels.")]
    InvalidCanvas { width: u32, height: u32 },
    #[error("Column name for '{0}' is empty.")]
    EmptyColumnName(&'static str),
}

/// Names of the input columns the analysis reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnNames {
    pub risk_score: String,
    pub cost: String,
    pub illness_count: String,
    pub category: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            risk_score: "risk_score_t".to_string(),
            cost: "cost_t".to_string(),
            illness_count: "gagne_sum_t".to_string(),
            category: "race".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PercentileConfig {
    pub tie_method: TieMethod,
    pub bucket_width: f64,
}

impl Default for PercentileConfig {
    fn default() -> Self {
        Self {
            tie_method: TieMethod::Average,
            bucket_width: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanvasConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: 900,
            height: 600,
        }
    }
}

/// The curve drawn over a figure's aggregated points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitKind {
    Lowess,
    Glm,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FigureConfig {
    /// Used for the output file names.
    pub name: String,
    /// Column averaged within each (bucket, category) group. The names
    /// `risk_score`, `cost` and `illness_count` refer to the columns
    /// configured in `[columns]`; anything else is a literal column name.
    pub target: String,
    pub fit: FitKind,
    #[serde(default)]
    pub log_scale: LogScale,
    pub title: String,
    pub y_label: String,
}

impl FigureConfig {
    /// Resolves `target` against the configured column names.
    pub fn target_column<'a>(&'a self, columns: &'a ColumnNames) -> &'a str {
        match self.target.as_str() {
            "risk_score" => &columns.risk_score,
            "cost" => &columns.cost,
            "illness_count" => &columns.illness_count,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub delimiter: char,
    /// Categories to fit and draw. Empty means every category in the data.
    pub categories: Vec<String>,
    /// Percentile cutoffs for the threshold summary.
    pub thresholds: Vec<f64>,
    pub columns: ColumnNames,
    pub percentile: PercentileConfig,
    pub lowess: LowessConfig,
    pub glm: GlmConfig,
    pub canvas: CanvasConfig,
    pub figures: Vec<FigureConfig>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            delimiter: ',',
            categories: Vec::new(),
            thresholds: vec![REFERRAL_PERCENTILE, AUTO_ENROLL_PERCENTILE],
            columns: ColumnNames::default(),
            percentile: PercentileConfig::default(),
            lowess: LowessConfig::default(),
            glm: GlmConfig::default(),
            canvas: CanvasConfig::default(),
            figures: default_figures(),
        }
    }
}

fn default_figures() -> Vec<FigureConfig> {
    vec![
        FigureConfig {
            name: "illness_lowess".to_string(),
            target: "illness_count".to_string(),
            fit: FitKind::Lowess,
            log_scale: LogScale::Never,
            title: "Number of chronic illnesses vs. algorithm-predicted risk".to_string(),
            y_label: "Mean number of chronic illnesses".to_string(),
        },
        FigureConfig {
            name: "illness_glm".to_string(),
            target: "illness_count".to_string(),
            fit: FitKind::Glm,
            log_scale: LogScale::Never,
            title: "Chronic illnesses vs. risk, Gaussian GLM with log link".to_string(),
            y_label: "Mean number of chronic illnesses".to_string(),
        },
        FigureConfig {
            name: "cost_lowess".to_string(),
            target: "cost".to_string(),
            fit: FitKind::Lowess,
            log_scale: LogScale::Always,
            title: "Total medical expenditure vs. algorithm-predicted risk".to_string(),
            y_label: "Mean total medical expenditure".to_string(),
        },
    ]
}

impl AnalysisConfig {
    /// Loads a configuration from a TOML file and validates it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = self.to_toml()?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The delimiter as the single byte the CSV reader expects.
    pub fn delimiter_byte(&self) -> Result<u8, ConfigError> {
        let c = self.delimiter;
        if !c.is_ascii() || matches!(c, '"' | '\n' | '\r') {
            return Err(ConfigError::InvalidDelimiter(c));
        }
        Ok(c as u8)
    }

    /// Checks every parameter before any data is read.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.delimiter_byte()?;

        let columns = [
            ("risk_score", &self.columns.risk_score),
            ("cost", &self.columns.cost),
            ("illness_count", &self.columns.illness_count),
            ("category", &self.columns.category),
        ];
        if let Some(&(field, _)) = columns.iter().find(|(_, name)| name.trim().is_empty()) {
            return Err(ConfigError::EmptyColumnName(field));
        }

        let width = self.percentile.bucket_width;
        if !(width.is_finite() && width > 0.0) {
            return Err(ConfigError::InvalidBucketWidth(width));
        }

        self.lowess.validate()?;

        if !(self.glm.tolerance > 0.0) || self.glm.max_iterations == 0 {
            return Err(ConfigError::InvalidGlm {
                tolerance: self.glm.tolerance,
                max_iterations: self.glm.max_iterations,
            });
        }

        if let Some(&bad) = self
            .thresholds
            .iter()
            .find(|t| !(t.is_finite() && (0.0..=100.0).contains(*t)))
        {
            return Err(ConfigError::InvalidThreshold(bad));
        }

        if self.canvas.width < 100 || self.canvas.height < 100 {
            return Err(ConfigError::InvalidCanvas {
                width: self.canvas.width,
                height: self.canvas.height,
            });
        }

        if self.figures.is_empty() {
            return Err(ConfigError::NoFigures);
        }
        let mut seen = HashSet::new();
        for figure in &self.figures {
            let usable = !figure.name.is_empty()
                && figure
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !usable {
                return Err(ConfigError::InvalidFigureName(figure.name.clone()));
            }
            if !seen.insert(figure.name.as_str()) {
                return Err(ConfigError::DuplicateFigure(figure.name.clone()));
            }
            if figure.target.trim().is_empty() {
                return Err(ConfigError::EmptyColumnName("figure target"));
            }
        }
        Ok(())
    }
}
