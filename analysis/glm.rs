//! Gaussian generalized linear model with an intercept and one predictor.
//!
//! The model is `g(E[y]) = b0 + b1 * x` with Gaussian errors. It is fitted by
//! iteratively reweighted least squares (IRLS) with step halving; the
//! identity link reduces to a single weighted least squares solve.

use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Defines the link function, connecting the linear predictor to the mean response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkFunction {
    /// The log link. The mean is `exp(eta)`, so it is strictly positive.
    #[default]
    Log,
    /// The identity link, i.e. ordinary (weighted) least squares.
    Identity,
}

/// Settings for the IRLS loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlmConfig {
    pub link: LinkFunction,
    pub max_iterations: usize,
    /// Relative deviance change that counts as convergence.
    pub tolerance: f64,
    /// Weight each aggregated point by the number of records behind it.
    pub weight_by_group_size: bool,
}

impl Default for GlmConfig {
    fn default() -> Self {
        Self {
            link: LinkFunction::Log,
            max_iterations: 100,
            tolerance: 1e-8,
            weight_by_group_size: false,
        }
    }
}

/// The status of IRLS convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlmStatus {
    Converged,
    MaxIterationsReached,
}

#[derive(Error, Debug)]
pub enum GlmError {
    #[error("Cannot fit a GLM to an empty series.")]
    EmptySeries,
    #[error("The x series has {x_len} values but the y series has {y_len}.")]
    LengthMismatch { x_len: usize, y_len: usize },
    #[error(
        "The log link requires a strictly positive response, but y = {value} at position {position}."
    )]
    NonPositiveResponse { position: usize, value: f64 },
    #[error(
        "The design is rank deficient: {distinct} distinct x value(s) found, but at least 2 are needed to estimate an intercept and a slope."
    )]
    RankDeficient { distinct: usize },
    #[error("The input series contains a non-finite value at position {0}.")]
    NonFinite(usize),
    #[error("Prior weights must be finite, non-negative and not all zero.")]
    InvalidWeights,
    #[error("A linear system solve failed. The weighted normal equations may be singular. Error: {0}")]
    SingularSystem(#[from] ndarray_linalg::error::LinalgError),
    #[error("IRLS diverged at iteration {iteration}: the deviance became non-finite.")]
    Diverged { iteration: usize },
    #[error("The GLM tolerance must be positive and max_iterations at least 1.")]
    InvalidConfig,
}

/// A fitted model and its predictions at the training points.
#[derive(Debug, Clone)]
pub struct GlmFit {
    pub link: LinkFunction,
    pub intercept: f64,
    pub slope: f64,
    /// Fitted mean at each input x, in input order.
    pub fitted: Array1<f64>,
    /// Weighted residual sum of squares.
    pub deviance: f64,
    pub iterations: usize,
    pub status: GlmStatus,
}

impl GlmFit {
    /// Evaluates the fitted mean at new x values.
    pub fn predict(&self, x: ArrayView1<f64>) -> Array1<f64> {
        x.mapv(|v| inverse_link(self.link, self.intercept + self.slope * v))
    }
}

fn inverse_link(link: LinkFunction, eta: f64) -> f64 {
    match link {
        // Clamp eta to prevent overflow in exp
        LinkFunction::Log => eta.clamp(-700.0, 700.0).exp(),
        LinkFunction::Identity => eta,
    }
}

/// Fits the model to `(x, y)` with optional prior weights.
pub fn fit_glm(
    x: ArrayView1<f64>,
    y: ArrayView1<f64>,
    prior_weights: Option<ArrayView1<f64>>,
    config: &GlmConfig,
) -> Result<GlmFit, GlmError> {
    // --- 1. Validate Inputs ---
    if !(config.tolerance > 0.0) || config.max_iterations == 0 {
        return Err(GlmError::InvalidConfig);
    }
    if x.len() != y.len() {
        return Err(GlmError::LengthMismatch {
            x_len: x.len(),
            y_len: y.len(),
        });
    }
    if x.is_empty() {
        return Err(GlmError::EmptySeries);
    }
    if let Some(pos) = x
        .iter()
        .zip(y.iter())
        .position(|(a, b)| !a.is_finite() || !b.is_finite())
    {
        return Err(GlmError::NonFinite(pos));
    }
    if config.link == LinkFunction::Log {
        if let Some((position, &value)) = y.iter().enumerate().find(|(_, v)| **v <= 0.0) {
            return Err(GlmError::NonPositiveResponse { position, value });
        }
    }
    let weights = match prior_weights {
        Some(w) => {
            if w.len() != y.len()
                || w.iter().any(|v| !v.is_finite() || *v < 0.0)
                || w.sum() <= 0.0
            {
                return Err(GlmError::InvalidWeights);
            }
            w.to_owned()
        }
        None => Array1::ones(y.len()),
    };
    let distinct = count_distinct_weighted(x, weights.view());
    if distinct < 2 {
        return Err(GlmError::RankDeficient { distinct });
    }

    // --- 2. Build the design matrix [1, x] ---
    let mut design: Array2<f64> = Array2::ones((x.len(), 2));
    design.column_mut(1).assign(&x);

    match config.link {
        LinkFunction::Identity => fit_identity(&design, y, &weights),
        LinkFunction::Log => fit_log(&design, y, &weights, config),
    }
}

fn count_distinct_weighted(x: ArrayView1<f64>, weights: ArrayView1<f64>) -> usize {
    let mut values: Vec<f64> = x
        .iter()
        .zip(weights.iter())
        .filter(|(_, w)| **w > 0.0)
        .map(|(v, _)| *v)
        .collect();
    values.sort_by(f64::total_cmp);
    values.dedup();
    values.len()
}

/// Solves the weighted normal equations `(X'WX) beta = X'Wz`.
fn weighted_least_squares(
    design: &Array2<f64>,
    working_weights: &Array1<f64>,
    working_response: &Array1<f64>,
) -> Result<Array1<f64>, GlmError> {
    let weighted_design = design * &working_weights.view().insert_axis(Axis(1));
    let xtwx = design.t().dot(&weighted_design);
    let xtwz = weighted_design.t().dot(working_response);
    Ok(xtwx.solve_into(xtwz)?)
}

fn calculate_deviance(y: ArrayView1<f64>, mu: &Array1<f64>, prior_weights: &Array1<f64>) -> f64 {
    // Weighted RSS: sum_i w_i (y_i - mu_i)^2
    Zip::from(y)
        .and(mu)
        .and(prior_weights)
        .fold(0.0, |acc, &yi, &mui, &wi| acc + wi * (yi - mui) * (yi - mui))
}

fn fit_identity(
    design: &Array2<f64>,
    y: ArrayView1<f64>,
    weights: &Array1<f64>,
) -> Result<GlmFit, GlmError> {
    let beta = weighted_least_squares(design, weights, &y.to_owned())?;
    let fitted = design.dot(&beta);
    let deviance = calculate_deviance(y, &fitted, weights);
    Ok(GlmFit {
        link: LinkFunction::Identity,
        intercept: beta[0],
        slope: beta[1],
        fitted,
        deviance,
        iterations: 1,
        status: GlmStatus::Converged,
    })
}

/// Working weights and response for the Gaussian family under the log link.
///
/// With `mu = exp(eta)`, `d mu / d eta = mu` and the variance function is 1,
/// so the IRLS weight is `w * mu^2` and `z = eta + (y - mu) / mu`.
fn update_glm_vectors(
    y: ArrayView1<f64>,
    eta: &Array1<f64>,
    prior_weights: &Array1<f64>,
) -> (Array1<f64>, Array1<f64>) {
    const MIN_MU: f64 = 1e-10;

    let mu = eta.mapv(|e| inverse_link(LinkFunction::Log, e).max(MIN_MU));
    let weights = prior_weights * &mu.mapv(|m| m * m);
    let z = eta + &((&y - &mu) / &mu);
    (weights, z)
}

fn fit_log(
    design: &Array2<f64>,
    y: ArrayView1<f64>,
    prior_weights: &Array1<f64>,
    config: &GlmConfig,
) -> Result<GlmFit, GlmError> {
    const MAX_HALVINGS: usize = 30;

    // Start halfway between each observation and the mean response.
    let y_mean = y.mean().unwrap_or(1.0);
    let mut eta = y.mapv(|v| ((v + y_mean) / 2.0).ln());
    let mut mu = eta.mapv(f64::exp);
    let mut deviance = calculate_deviance(y, &mu, prior_weights);
    let mut beta: Option<Array1<f64>> = None;

    for iter in 1..=config.max_iterations {
        let (working_weights, z) = update_glm_vectors(y, &eta, prior_weights);
        let beta_trial = weighted_least_squares(design, &working_weights, &z)?;

        let mut eta_trial = design.dot(&beta_trial);
        let mut mu_trial = eta_trial.mapv(|e| inverse_link(LinkFunction::Log, e));
        let mut deviance_trial = calculate_deviance(y, &mu_trial, prior_weights);
        let mut beta_next = beta_trial;

        // Step halving toward the previous coefficients when the step overshoots.
        if let Some(previous) = &beta {
            let mut halvings = 0;
            while (!deviance_trial.is_finite() || deviance_trial > deviance)
                && halvings < MAX_HALVINGS
            {
                beta_next = (&beta_next + previous) / 2.0;
                eta_trial = design.dot(&beta_next);
                mu_trial = eta_trial.mapv(|e| inverse_link(LinkFunction::Log, e));
                deviance_trial = calculate_deviance(y, &mu_trial, prior_weights);
                halvings += 1;
            }
            if halvings > 0 {
                log::debug!("IRLS iteration {iter}: applied {halvings} step halvings");
            }
        }
        if !deviance_trial.is_finite() {
            log::error!("Non-finite deviance at IRLS iteration {iter}");
            return Err(GlmError::Diverged { iteration: iter });
        }

        let change = (deviance_trial - deviance).abs() / (deviance_trial.abs() + 0.1);
        log::debug!(
            "IRLS iteration {iter}: deviance {deviance_trial:.6e}, relative change {change:.3e}"
        );
        let first_step = beta.is_none();
        eta = eta_trial;
        mu = mu_trial;
        deviance = deviance_trial;
        beta = Some(beta_next);

        // The starting point is not a fitted model, so never stop on the first step.
        if !first_step && change < config.tolerance {
            return Ok(finish_log_fit(beta, mu, deviance, iter, GlmStatus::Converged));
        }
    }

    log::warn!(
        "IRLS FAILED to converge after {} iterations (deviance {:.6e}).",
        config.max_iterations,
        deviance
    );
    Ok(finish_log_fit(
        beta,
        mu,
        deviance,
        config.max_iterations,
        GlmStatus::MaxIterationsReached,
    ))
}

fn finish_log_fit(
    beta: Option<Array1<f64>>,
    fitted: Array1<f64>,
    deviance: f64,
    iterations: usize,
    status: GlmStatus,
) -> GlmFit {
    // The loop always runs at least once, so coefficients exist.
    let beta = beta.unwrap_or_else(|| Array1::zeros(2));
    GlmFit {
        link: LinkFunction::Log,
        intercept: beta[0],
        slope: beta[1],
        fitted,
        deviance,
        iterations,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn two_points_are_interpolated_exactly() {
        let x = array![10.0, 90.0];
        let y = array![1.5, 4.0];
        let fit = fit_glm(x.view(), y.view(), None, &GlmConfig::default()).unwrap();
        assert_eq!(fit.status, GlmStatus::Converged);
        assert_eq!(fit.fitted.len(), 2);
        assert_abs_diff_eq!(fit.fitted[0], 1.5, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.fitted[1], 4.0, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.deviance, 0.0, epsilon = 1e-8);
        assert_abs_diff_eq!(fit.slope, (4.0_f64 / 1.5).ln() / 80.0, epsilon = 1e-6);
    }

    #[test]
    fn exponential_curve_is_recovered() {
        let x = Array1::from_iter((0..=20).map(|i| f64::from(i) * 5.0));
        let y = x.mapv(|v| (0.2 + 0.02 * v).exp());
        let fit = fit_glm(x.view(), y.view(), None, &GlmConfig::default()).unwrap();
        assert_abs_diff_eq!(fit.intercept, 0.2, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.slope, 0.02, epsilon = 1e-8);

        let prediction = fit.predict(array![50.0].view());
        assert_abs_diff_eq!(prediction[0], (0.2_f64 + 1.0).exp(), epsilon = 1e-5);
    }

    #[test]
    fn fitting_is_deterministic() {
        let x = array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let y = array![0.9, 1.4, 1.6, 2.9, 3.1, 5.2];
        let config = GlmConfig::default();
        let first = fit_glm(x.view(), y.view(), None, &config).unwrap();
        let second = fit_glm(x.view(), y.view(), None, &config).unwrap();
        assert_eq!(first.fitted, second.fitted);
        assert_eq!(first.fitted.len(), x.len());
        assert_eq!(first.intercept, second.intercept);
    }

    #[test]
    fn identity_link_matches_least_squares() {
        let x = array![0.0, 1.0, 2.0, 3.0];
        let y = array![1.0, 3.0, 2.0, 5.0];
        let config = GlmConfig {
            link: LinkFunction::Identity,
            ..GlmConfig::default()
        };
        let fit = fit_glm(x.view(), y.view(), None, &config).unwrap();
        // Closed form: slope = Sxy / Sxx = 5.5 / 5, intercept = ybar - slope * xbar.
        assert_abs_diff_eq!(fit.slope, 1.1, epsilon = 1e-10);
        assert_abs_diff_eq!(fit.intercept, 2.75 - 1.1 * 1.5, epsilon = 1e-10);
    }

    #[test]
    fn prior_weights_pull_the_fit() {
        let x = array![0.0, 1.0, 2.0];
        let y = array![1.0, 1.0, 4.0];
        let config = GlmConfig {
            link: LinkFunction::Identity,
            ..GlmConfig::default()
        };
        let even = fit_glm(x.view(), y.view(), None, &config).unwrap();
        let heavy = fit_glm(x.view(), y.view(), Some(array![1.0, 1.0, 50.0].view()), &config)
            .unwrap();
        assert!((heavy.fitted[2] - 4.0).abs() < (even.fitted[2] - 4.0).abs());
    }

    #[test]
    fn non_positive_response_rejected_under_log_link() {
        let x = array![1.0, 2.0, 3.0];
        let y = array![1.0, 0.0, 2.0];
        match fit_glm(x.view(), y.view(), None, &GlmConfig::default()).unwrap_err() {
            GlmError::NonPositiveResponse { position, .. } => assert_eq!(position, 1),
            other => panic!("Expected NonPositiveResponse, got {other:?}"),
        }
    }

    #[test]
    fn single_distinct_x_is_rank_deficient() {
        let x = array![5.0, 5.0, 5.0];
        let y = array![1.0, 2.0, 3.0];
        match fit_glm(x.view(), y.view(), None, &GlmConfig::default()).unwrap_err() {
            GlmError::RankDeficient { distinct } => assert_eq!(distinct, 1),
            other => panic!("Expected RankDeficient, got {other:?}"),
        }
    }

    #[test]
    fn malformed_inputs_rejected() {
        let config = GlmConfig::default();
        let empty = Array1::<f64>::zeros(0);
        assert!(matches!(
            fit_glm(empty.view(), empty.view(), None, &config),
            Err(GlmError::EmptySeries)
        ));
        assert!(matches!(
            fit_glm(array![1.0, 2.0].view(), array![1.0].view(), None, &config),
            Err(GlmError::LengthMismatch { x_len: 2, y_len: 1 })
        ));
        assert!(matches!(
            fit_glm(
                array![1.0, 2.0].view(),
                array![1.0, 2.0].view(),
                Some(array![-1.0, 1.0].view()),
                &config
            ),
            Err(GlmError::InvalidWeights)
        ));
    }
}
