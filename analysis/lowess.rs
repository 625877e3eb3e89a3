//! Robust locally weighted regression (LOWESS) for one category's series.
//!
//! This is Cleveland's scatterplot smoother: every fitted value comes from a
//! tricube-weighted linear fit over the `frac` nearest neighbours, and each
//! robustness pass downweights points with large residuals using bisquare
//! weights. Points closer than `delta` to the last fitted point are linearly
//! interpolated instead of fitted.

use crate::types::FittedCurve;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Parameters of the smoother.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LowessConfig {
    /// Fraction of the points used in each local regression, in (0, 1].
    pub frac: f64,
    /// Number of robustness reweighting passes after the first fit.
    pub iterations: usize,
    /// Skip distance as a fraction of the x range. Zero fits every point.
    pub delta_fraction: f64,
}

impl Default for LowessConfig {
    fn default() -> Self {
        Self {
            frac: 0.25,
            iterations: 3,
            delta_fraction: 0.01,
        }
    }
}

impl LowessConfig {
    pub fn validate(&self) -> Result<(), SmoothingError> {
        if !(self.frac > 0.0 && self.frac <= 1.0) {
            return Err(SmoothingError::InvalidFraction(self.frac));
        }
        if !(self.delta_fraction.is_finite() && self.delta_fraction >= 0.0) {
            return Err(SmoothingError::InvalidDelta(self.delta_fraction));
        }
        Ok(())
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SmoothingError {
    #[error("Cannot smooth an empty series.")]
    EmptySeries,
    #[error("The x series has {x_len} values but the y series has {y_len}.")]
    LengthMismatch { x_len: usize, y_len: usize },
    #[error("The LOWESS fraction must lie in (0, 1], got {0}.")]
    InvalidFraction(f64),
    #[error("The LOWESS delta fraction must be a non-negative finite number, got {0}.")]
    InvalidDelta(f64),
    #[error("The input series contains a non-finite value at position {0}.")]
    NonFinite(usize),
}

/// Smooths `y` against `x` and returns the curve sorted by `x`.
pub fn smooth_series(
    label: &str,
    x: &[f64],
    y: &[f64],
    config: &LowessConfig,
) -> Result<FittedCurve, SmoothingError> {
    let (xs, ys) = sorted_pairs(x, y)?;
    let fitted = lowess_sorted(&xs, &ys, config)?;
    Ok(FittedCurve {
        label: label.to_string(),
        points: xs.into_iter().zip(fitted).collect(),
    })
}

/// Fitted values for `(x, y)`, aligned with the input sorted by `x`.
pub fn lowess(x: &[f64], y: &[f64], config: &LowessConfig) -> Result<Vec<f64>, SmoothingError> {
    let (xs, ys) = sorted_pairs(x, y)?;
    lowess_sorted(&xs, &ys, config)
}

fn sorted_pairs(x: &[f64], y: &[f64]) -> Result<(Vec<f64>, Vec<f64>), SmoothingError> {
    if x.len() != y.len() {
        return Err(SmoothingError::LengthMismatch {
            x_len: x.len(),
            y_len: y.len(),
        });
    }
    if x.is_empty() {
        return Err(SmoothingError::EmptySeries);
    }
    if let Some(pos) = x
        .iter()
        .zip(y)
        .position(|(a, b)| !a.is_finite() || !b.is_finite())
    {
        return Err(SmoothingError::NonFinite(pos));
    }

    let mut order: Vec<usize> = (0..x.len()).collect();
    // Stable sort keeps tied x in input order.
    order.sort_by(|&a, &b| x[a].total_cmp(&x[b]));
    Ok((
        order.iter().map(|&i| x[i]).collect(),
        order.iter().map(|&i| y[i]).collect(),
    ))
}

fn lowess_sorted(x: &[f64], y: &[f64], config: &LowessConfig) -> Result<Vec<f64>, SmoothingError> {
    config.validate()?;
    let n = x.len();
    if n < 2 {
        return Ok(y.to_vec());
    }

    let delta = config.delta_fraction * (x[n - 1] - x[0]);
    // Neighbourhood size, never smaller than a line needs.
    let span = ((config.frac * n as f64 + 1e-7).floor() as usize).clamp(2, n);

    let y_scale = y.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));

    let mut fitted = vec![0.0; n];
    let mut robustness = vec![1.0; n];
    let mut residuals = vec![0.0; n];
    let mut weights = vec![0.0; n];

    for pass in 0..=config.iterations {
        fit_pass(x, y, span, delta, pass > 0, &robustness, &mut weights, &mut fitted);

        for i in 0..n {
            residuals[i] = y[i] - fitted[i];
        }
        if pass == config.iterations {
            break;
        }

        let mean_abs = residuals.iter().map(|r| r.abs()).sum::<f64>() / n as f64;
        let mut abs_residuals: Vec<f64> = residuals.iter().map(|r| r.abs()).collect();
        let scale = 6.0 * median(&mut abs_residuals);
        if scale == 0.0 || scale < 1e-7 * mean_abs || mean_abs <= 1e-12 * y_scale {
            log::debug!("LOWESS residuals vanished after pass {pass}; stopping early");
            break;
        }

        let (lower, upper) = (0.001 * scale, 0.999 * scale);
        for (weight, residual) in robustness.iter_mut().zip(&residuals) {
            let r = residual.abs();
            *weight = if r <= lower {
                1.0
            } else if r <= upper {
                let u = r / scale;
                (1.0 - u * u).powi(2)
            } else {
                0.0
            };
        }
    }

    Ok(fitted)
}

/// One sweep over the sorted points, writing local fits into `fitted`.
#[allow(clippy::too_many_arguments)]
fn fit_pass(
    x: &[f64],
    y: &[f64],
    span: usize,
    delta: f64,
    use_robustness: bool,
    robustness: &[f64],
    weights: &mut [f64],
    fitted: &mut [f64],
) {
    let n = x.len();
    let mut left = 0;
    let mut right = span - 1;
    let mut last: Option<usize> = None;
    let mut i = 0;

    loop {
        // Slide the window right while that brings it closer to x[i].
        while right < n - 1 && x[i] - x[left] > x[right + 1] - x[i] {
            left += 1;
            right += 1;
        }

        fitted[i] = local_fit(x, y, x[i], left, right, use_robustness, robustness, weights)
            .unwrap_or(y[i]);

        // Interpolate the points skipped since the last fit.
        if let Some(prev) = last {
            if prev + 1 < i {
                let denom = x[i] - x[prev];
                for j in prev + 1..i {
                    let alpha = (x[j] - x[prev]) / denom;
                    fitted[j] = alpha * fitted[i] + (1.0 - alpha) * fitted[prev];
                }
            }
        }
        let mut anchor = i;

        // Skip ahead past points within delta, copying exact x ties.
        let cut = x[anchor] + delta;
        let mut next = anchor + 1;
        while next < n {
            if x[next] > cut {
                break;
            }
            if x[next] == x[anchor] {
                fitted[next] = fitted[anchor];
                anchor = next;
            }
            next += 1;
        }
        last = Some(anchor);
        if anchor >= n - 1 {
            break;
        }
        i = (anchor + 1).max(next - 1);
    }
}

/// Weighted linear fit around `xs` over the window `[left, right]`.
///
/// Returns `None` when every point in reach has zero weight.
#[allow(clippy::too_many_arguments)]
fn local_fit(
    x: &[f64],
    y: &[f64],
    xs: f64,
    left: usize,
    right: usize,
    use_robustness: bool,
    robustness: &[f64],
    weights: &mut [f64],
) -> Option<f64> {
    let n = x.len();
    let range = x[n - 1] - x[0];
    let h = (xs - x[left]).max(x[right] - xs);
    let (h_near, h_far) = (0.001 * h, 0.999 * h);

    // Points tied with the window edge beyond `right` still get weight.
    let mut total = 0.0;
    let mut j = left;
    while j < n {
        weights[j] = 0.0;
        let r = (x[j] - xs).abs();
        if r <= h_far {
            let mut w = if r <= h_near {
                1.0
            } else {
                (1.0 - (r / h).powi(3)).powi(3)
            };
            if use_robustness {
                w *= robustness[j];
            }
            weights[j] = w;
            total += w;
        } else if x[j] > xs {
            break;
        }
        j += 1;
    }
    let end = j;
    if total <= 0.0 {
        return None;
    }
    for w in &mut weights[left..end] {
        *w /= total;
    }

    if h > 0.0 {
        let center: f64 = (left..end).map(|k| weights[k] * x[k]).sum();
        let spread: f64 = (left..end)
            .map(|k| weights[k] * (x[k] - center).powi(2))
            .sum();
        if spread.sqrt() > 0.001 * range {
            let slope = (xs - center) / spread;
            for k in left..end {
                weights[k] *= slope * (x[k] - center) + 1.0;
            }
        }
    }

    Some((left..end).map(|k| weights[k] * y[k]).sum())
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}
