//! ARIMA and seasonal ARIMA fitted by (iterated) Hannan–Rissanen regression.
//!
//! A seasonal model is an ARIMA whose lag sets include multiples of the period and whose
//! differencing includes a seasonal stage, so both share one estimator.

use super::{FitBudget, FitSettings, FittedModel, Forecaster, Interval};
use crate::error::{PipelineError, Result};
use crate::stats;
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeSet;
use tracing::debug;

/// Lag structure of a (seasonal) ARIMA model.
#[derive(Clone, Debug, PartialEq)]
pub struct ArimaSpec {
    pub label: String,
    pub ar_lags: Vec<usize>,
    pub ma_lags: Vec<usize>,
    /// Differencing stages applied in order, e.g. `[1, 1, 5]` for d=2, D=1, s=5.
    pub diff_lags: Vec<usize>,
}

impl ArimaSpec {
    pub fn arima(p: usize, d: usize, q: usize) -> Self {
        Self {
            label: format!("ARIMA({},{},{})", p, d, q),
            ar_lags: (1..=p).collect(),
            ma_lags: (1..=q).collect(),
            diff_lags: vec![1; d],
        }
    }

    pub fn sarima(p: usize, d: usize, q: usize, sp: usize, sd: usize, sq: usize, period: usize) -> Self {
        let seasonal = |order: usize| (1..=order).map(move |k| k * period);
        let ar: BTreeSet<usize> = (1..=p).chain(seasonal(sp)).filter(|l| *l > 0).collect();
        let ma: BTreeSet<usize> = (1..=q).chain(seasonal(sq)).filter(|l| *l > 0).collect();
        let mut diff_lags = vec![1; d];
        diff_lags.extend(std::iter::repeat_n(period, sd));
        Self {
            label: format!("SARIMA({},{},{})({},{},{})[{}]", p, d, q, sp, sd, sq, period),
            ar_lags: ar.into_iter().collect(),
            ma_lags: ma.into_iter().collect(),
            diff_lags,
        }
    }

    fn max_ar(&self) -> usize {
        self.ar_lags.iter().copied().max().unwrap_or(0)
    }

    fn max_ma(&self) -> usize {
        self.ma_lags.iter().copied().max().unwrap_or(0)
    }

    /// A constant (mean or drift) is estimated unless the series is differenced more than once.
    fn has_constant(&self) -> bool {
        self.diff_lags.len() <= 1
    }

    fn n_params(&self) -> usize {
        self.ar_lags.len() + self.ma_lags.len() + usize::from(self.has_constant())
    }
}

pub struct ArimaForecaster {
    spec: ArimaSpec,
    settings: FitSettings,
}

impl ArimaForecaster {
    pub fn new(spec: ArimaSpec, settings: FitSettings) -> Self {
        Self { spec, settings }
    }
}

impl Forecaster for ArimaForecaster {
    fn fit(&self, history: &[f64], budget: &FitBudget) -> Result<Box<dyn FittedModel>> {
        Ok(Box::new(ArimaModel::fit(&self.spec, history, &self.settings, budget)?))
    }
}

/// A fitted model, holding what the forecast recursion needs.
#[derive(Clone, Debug)]
pub struct ArimaModel {
    pub spec: ArimaSpec,
    pub constant: f64,
    pub ar: Vec<f64>,
    pub ma: Vec<f64>,
    pub sigma2: f64,
    pub aic: f64,
    pub bic: f64,
    /// Input of each differencing stage, outermost first.
    stages: Vec<Vec<f64>>,
    /// Fully differenced series.
    diffed: Vec<f64>,
    residuals: Vec<f64>,
}

pub fn difference(values: &[f64], lag: usize) -> Vec<f64> {
    if lag == 0 || values.len() <= lag {
        return Vec::new();
    }
    values.windows(lag + 1).map(|w| w[lag] - w[0]).collect()
}

impl ArimaModel {
    pub fn fit(spec: &ArimaSpec, history: &[f64], settings: &FitSettings, budget: &FitBudget) -> Result<Self> {
        if history.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::DataQuality("history contains non-finite values".to_string()));
        }
        if spec.diff_lags.contains(&0) || spec.ar_lags.contains(&0) || spec.ma_lags.contains(&0) {
            return Err(PipelineError::Convergence(format!("{}: lags must be positive", spec.label)));
        }

        let mut stages = Vec::with_capacity(spec.diff_lags.len());
        let mut x = history.to_vec();
        for &lag in &spec.diff_lags {
            let next = difference(&x, lag);
            stages.push(x);
            x = next;
        }

        let n = x.len();
        let max_ar = spec.max_ar();
        let max_ma = spec.max_ma();
        let k = spec.n_params();
        if n < max_ar.max(max_ma) + k + 10 {
            return Err(PipelineError::Convergence(format!(
                "{}: {} observations after differencing are too few for this order",
                spec.label, n
            )));
        }

        let (beta, residuals) = if spec.ma_lags.is_empty() {
            let start = max_ar;
            let (rows, y) = design(spec, &x, &[], start);
            let beta = least_squares(&rows, &y, &spec.label)?;
            let residuals = recursive_residuals(spec, &x, &beta);
            (beta, residuals)
        } else {
            hannan_rissanen(spec, &x, settings, budget)?
        };
        budget.check(&spec.label)?;

        let start = max_ar.max(max_ma);
        let effective: Vec<f64> = residuals[start..].to_vec();
        let n_eff = effective.len() as f64;
        let sigma2 = effective.iter().map(|e| e * e).sum::<f64>() / n_eff;
        if !sigma2.is_finite() || beta.iter().any(|b| !b.is_finite()) {
            return Err(PipelineError::Convergence(format!("{}: non-finite estimates", spec.label)));
        }

        let log_likelihood = -0.5 * n_eff * (1.0 + (2.0 * std::f64::consts::PI * sigma2.max(1e-300)).ln());
        let n_est = (k + 1) as f64;
        let aic = -2.0 * log_likelihood + 2.0 * n_est;
        let bic = -2.0 * log_likelihood + n_est * n_eff.ln();

        let (constant, ar, ma) = unpack(spec, &beta);
        Ok(Self {
            spec: spec.clone(),
            constant,
            ar,
            ma,
            sigma2,
            aic,
            bic,
            stages,
            diffed: x,
            residuals,
        })
    }

    /// MA(∞) weights of the integrated model, `psi[0] = 1`.
    fn psi_weights(&self, horizon: usize) -> Vec<f64> {
        // Full AR polynomial: (1 - Σ φ_l B^l) · Π (1 - B^L), written as 1 - Σ a_j B^j.
        let mut poly = vec![0.0; self.spec.max_ar() + 1];
        poly[0] = 1.0;
        for (lag, phi) in self.spec.ar_lags.iter().zip(&self.ar) {
            poly[*lag] -= phi;
        }
        for &lag in &self.spec.diff_lags {
            let mut next = vec![0.0; poly.len() + lag];
            for (i, c) in poly.iter().enumerate() {
                next[i] += c;
                next[i + lag] -= c;
            }
            poly = next;
        }

        let mut theta = vec![0.0; self.spec.max_ma() + 1];
        for (lag, t) in self.spec.ma_lags.iter().zip(&self.ma) {
            theta[*lag] = *t;
        }

        let mut psi = vec![0.0; horizon];
        for j in 0..horizon {
            let mut value = if j == 0 { 1.0 } else { theta.get(j).copied().unwrap_or(0.0) };
            for i in 1..=j.min(poly.len() - 1) {
                value -= poly[i] * psi[j - i];
            }
            psi[j] = value;
        }
        psi
    }

    fn point_forecasts(&self, horizon: usize) -> Vec<f64> {
        let mut x = self.diffed.clone();
        let mut e = self.residuals.clone();
        for _ in 0..horizon {
            let t = x.len();
            let mut value = self.constant;
            for (lag, phi) in self.spec.ar_lags.iter().zip(&self.ar) {
                value += phi * x[t - lag];
            }
            for (lag, theta) in self.spec.ma_lags.iter().zip(&self.ma) {
                value += theta * e[t - lag];
            }
            x.push(value);
            e.push(0.0);
        }

        let mut future: Vec<f64> = x[self.diffed.len()..].to_vec();
        for (stage, &lag) in self.stages.iter().zip(&self.spec.diff_lags).rev() {
            let mut level = stage.clone();
            for dx in &future {
                let t = level.len();
                level.push(dx + level[t - lag]);
            }
            future = level[stage.len()..].to_vec();
        }
        future
    }
}

impl FittedModel for ArimaModel {
    fn describe(&self) -> String {
        format!(
            "{} c={:.6} ar={:?} ma={:?} sigma2={:.6} aic={:.2} bic={:.2}",
            self.spec.label, self.constant, self.ar, self.ma, self.sigma2, self.aic, self.bic
        )
    }

    fn aic(&self) -> Option<f64> {
        Some(self.aic)
    }

    fn forecast(&self, horizon: usize, confidence: f64) -> Result<Vec<Interval>> {
        let z = stats::z_for_confidence(confidence);
        if !z.is_finite() {
            return Err(PipelineError::DataQuality(format!("confidence level {} is not in (0, 1)", confidence)));
        }
        let points = self.point_forecasts(horizon);
        let psi = self.psi_weights(horizon);
        let sigma = self.sigma2.sqrt();

        let mut cumulative = 0.0;
        let mut out = Vec::with_capacity(horizon);
        for (point, w) in points.into_iter().zip(psi) {
            cumulative += w * w;
            let half = z * sigma * cumulative.sqrt();
            if !point.is_finite() || !half.is_finite() {
                return Err(PipelineError::Convergence(format!("{}: forecast diverged", self.spec.label)));
            }
            out.push(Interval { point, lower: point - half, upper: point + half });
        }
        Ok(out)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Estimation
// ──────────────────────────────────────────────────────────────────────────────

/// Regression rows `[1?, x_{t-l}..., e_{t-m}...]` and targets `x_t` for `t >= start`.
fn design(spec: &ArimaSpec, x: &[f64], e: &[f64], start: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
    let mut rows = Vec::with_capacity(x.len().saturating_sub(start));
    let mut y = Vec::with_capacity(x.len().saturating_sub(start));
    for t in start..x.len() {
        let mut row = Vec::with_capacity(spec.n_params());
        if spec.has_constant() {
            row.push(1.0);
        }
        row.extend(spec.ar_lags.iter().map(|l| x[t - l]));
        if !e.is_empty() {
            row.extend(spec.ma_lags.iter().map(|l| e[t - l]));
        }
        rows.push(row);
        y.push(x[t]);
    }
    (rows, y)
}

fn least_squares(rows: &[Vec<f64>], y: &[f64], label: &str) -> Result<Vec<f64>> {
    let cols = rows.first().map(|r| r.len()).unwrap_or(0);
    if cols == 0 || rows.len() <= cols {
        return Err(PipelineError::Convergence(format!("{}: not enough rows for regression", label)));
    }
    let xm = DMatrix::from_fn(rows.len(), cols, |i, j| rows[i][j]);
    let yv = DVector::from_column_slice(y);
    let xtx = xm.transpose() * &xm;
    let xty = xm.transpose() * yv;
    let inv = xtx
        .try_inverse()
        .ok_or_else(|| PipelineError::Convergence(format!("{}: singular regression matrix", label)))?;
    let beta = inv * xty;
    if beta.iter().any(|b| !b.is_finite()) {
        return Err(PipelineError::Convergence(format!("{}: non-finite coefficients", label)));
    }
    Ok(beta.iter().copied().collect())
}

fn unpack(spec: &ArimaSpec, beta: &[f64]) -> (f64, Vec<f64>, Vec<f64>) {
    let offset = usize::from(spec.has_constant());
    let constant = if spec.has_constant() { beta[0] } else { 0.0 };
    let ar = beta[offset..offset + spec.ar_lags.len()].to_vec();
    let ma = beta[offset + spec.ar_lags.len()..].to_vec();
    (constant, ar, ma)
}

/// One-step-ahead errors, with errors before the first full lag window set to zero.
fn recursive_residuals(spec: &ArimaSpec, x: &[f64], beta: &[f64]) -> Vec<f64> {
    let (constant, ar, ma) = unpack(spec, beta);
    let start = spec.max_ar();
    let mut e = vec![0.0; x.len()];
    for t in start..x.len() {
        let mut fitted = constant;
        for (lag, phi) in spec.ar_lags.iter().zip(&ar) {
            fitted += phi * x[t - lag];
        }
        for (lag, theta) in spec.ma_lags.iter().zip(&ma) {
            if t >= *lag {
                fitted += theta * e[t - lag];
            }
        }
        e[t] = x[t] - fitted;
    }
    e
}

fn hannan_rissanen(
    spec: &ArimaSpec,
    x: &[f64],
    settings: &FitSettings,
    budget: &FitBudget,
) -> Result<(Vec<f64>, Vec<f64>)> {
    let n = x.len();
    let max_ar = spec.max_ar();
    let max_ma = spec.max_ma();
    let m = (max_ar + max_ma).max(10).min(n / 4);
    if m < max_ar + max_ma {
        return Err(PipelineError::Convergence(format!(
            "{}: series too short for the long autoregression",
            spec.label
        )));
    }

    // Stage 1: long AR(m) to approximate the innovations.
    let long = ArimaSpec {
        label: format!("{} long AR({})", spec.label, m),
        ar_lags: (1..=m).collect(),
        ma_lags: Vec::new(),
        diff_lags: spec.diff_lags.clone(),
    };
    let (rows, y) = design(&long, x, &[], m);
    let long_beta = least_squares(&rows, &y, &long.label)?;
    let mut e = recursive_residuals(&long, x, &long_beta);

    // Stage 2: regress on lagged values and lagged innovations, then iterate.
    let start = m + max_ma;
    let (rows, y) = design(spec, x, &e, start);
    let mut beta = least_squares(&rows, &y, &spec.label)?;

    for iteration in 1..=settings.max_iterations {
        budget.check(&spec.label)?;
        e = recursive_residuals(spec, x, &beta);
        if e.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::Convergence(format!("{}: residuals diverged", spec.label)));
        }
        let (rows, y) = design(spec, x, &e, max_ar.max(max_ma));
        let next = least_squares(&rows, &y, &spec.label)?;

        let scale = 1.0 + beta.iter().fold(0.0f64, |a, b| a.max(b.abs()));
        let change = beta.iter().zip(&next).fold(0.0f64, |a, (b, c)| a.max((b - c).abs()));
        beta = next;
        if change <= settings.tolerance * scale {
            debug!("{} converged after {} iterations", spec.label, iteration);
            let residuals = recursive_residuals(spec, x, &beta);
            return Ok((beta, residuals));
        }
    }

    Err(PipelineError::Convergence(format!(
        "{}: no convergence within {} iterations",
        spec.label, settings.max_iterations
    )))
}
