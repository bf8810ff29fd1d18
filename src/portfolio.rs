use crate::config::{PortfolioConfig, TRADING_DAYS, VAR_CONFIDENCE};
use crate::error::{PipelineError, Result};
use crate::preprocess::ReturnSeries;
use crate::stats;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────────────────────────────────────

/// Largest universe the exact long-only solver enumerates (2^n supports).
pub const MAX_ENUMERATED_ASSETS: usize = 16;

/// Weights above `-FEASIBILITY_TOL` count as non-negative.
const FEASIBILITY_TOL: f64 = 1e-9;

/// Size of the equal-weight tie-break relative to the mean variance.
const TIE_BREAK_SCALE: f64 = 1e-9;

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveKind {
    MaxSharpe,
    MinVariance,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Objective {
    MaxSharpe { risk_free_rate: f64 },
    /// With a target, the expected return must be at least `target_return`.
    MinVariance { target_return: Option<f64> },
}

impl Objective {
    pub fn from_config(cfg: &PortfolioConfig) -> Self {
        match cfg.objective {
            ObjectiveKind::MaxSharpe => Self::MaxSharpe { risk_free_rate: cfg.risk_free_rate },
            ObjectiveKind::MinVariance => Self::MinVariance { target_return: cfg.target_return },
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::MaxSharpe { risk_free_rate } => format!("max Sharpe (rf={:.2}%)", risk_free_rate * 100.0),
            Self::MinVariance { target_return: Some(t) } => format!("min variance (target {:.2}%)", t * 100.0),
            Self::MinVariance { target_return: None } => "min variance".to_string(),
        }
    }
}

/// Annualized inputs of one optimization.
#[derive(Clone, Debug)]
pub struct OptimizerInputs {
    pub symbols: Vec<String>,
    pub expected_returns: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
    /// Used for the reported Sharpe ratio.
    pub risk_free_rate: f64,
    pub allow_short: bool,
}

/// Complete portfolio allocation result.
#[derive(Clone, Debug, Serialize)]
pub struct PortfolioAllocation {
    pub weights: Vec<(String, f64)>, // (symbol, weight); sums to 1
    pub expected_annual_return: f64,
    pub expected_annual_vol: f64,
    pub sharpe_ratio: Option<f64>,
    /// One-day parametric VaR at 95%, as a positive loss fraction.
    pub var_95_daily: f64,
    pub objective: String,
}

impl PortfolioAllocation {
    pub fn weight_of(&self, symbol: &str) -> Option<f64> {
        self.weights.iter().find(|(s, _)| s == symbol).map(|(_, w)| *w)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Return Statistics
// ──────────────────────────────────────────────────────────────────────────────

/// Annualized sample covariance of return series that share one date index.
pub fn covariance_matrix(returns: &[ReturnSeries]) -> Result<Vec<Vec<f64>>> {
    let Some(first) = returns.first() else {
        return Err(PipelineError::Infeasible("no return series for covariance".to_string()));
    };
    let dates = first.dates();
    for r in returns.iter().skip(1) {
        if r.dates() != dates {
            return Err(PipelineError::Alignment(format!(
                "{} and {} returns are not on the same dates",
                first.symbol, r.symbol
            )));
        }
    }
    if dates.len() < 2 {
        return Err(PipelineError::DataQuality("need at least two returns for covariance".to_string()));
    }

    let values: Vec<Vec<f64>> = returns.iter().map(|r| r.values()).collect();
    let n = values.len();
    let mut cov = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let c = stats::covariance(&values[i], &values[j]).unwrap_or(0.0) * TRADING_DAYS;
            cov[i][j] = c;
            cov[j][i] = c;
        }
    }
    Ok(cov)
}

/// Annualized mean of daily returns; `None` for an empty series.
pub fn historical_expected_return(returns: &ReturnSeries) -> Option<f64> {
    if returns.is_empty() {
        return None;
    }
    stats::mean(&returns.values()).map(|m| m * TRADING_DAYS)
}

fn portfolio_return(weights: &[f64], means: &[f64]) -> f64 {
    weights.iter().zip(means.iter()).map(|(w, r)| w * r).sum()
}

fn portfolio_variance(weights: &[f64], cov: &[Vec<f64>]) -> f64 {
    let n = weights.len();
    let mut var = 0.0;
    for i in 0..n {
        for j in 0..n {
            var += weights[i] * weights[j] * cov[i][j];
        }
    }
    var
}

// ──────────────────────────────────────────────────────────────────────────────
// Optimizer: Exact Active-Set Enumeration
// ──────────────────────────────────────────────────────────────────────────────

struct Candidate {
    weights: Vec<f64>,
    value: f64,
}

/// Solves `min ½ xᵀQx` subject to `A x = b` through its KKT system.
fn solve_equality_qp(q: &DMatrix<f64>, constraints: &[(Vec<f64>, f64)]) -> Option<Vec<f64>> {
    let k = q.nrows();
    let m = constraints.len();
    // Balance the constraint rows against the curvature scale.
    let scale = q.iter().fold(0.0f64, |a, v| a.max(v.abs())).max(1e-300);

    let mut kkt = DMatrix::<f64>::zeros(k + m, k + m);
    kkt.view_mut((0, 0), (k, k)).copy_from(q);
    let mut rhs = DVector::<f64>::zeros(k + m);
    for (r, (row, b)) in constraints.iter().enumerate() {
        for (c, a) in row.iter().enumerate() {
            kkt[(k + r, c)] = a * scale;
            kkt[(c, k + r)] = a * scale;
        }
        rhs[k + r] = b * scale;
    }

    let solution = kkt.lu().solve(&rhs)?;
    let x: Vec<f64> = solution.iter().take(k).copied().collect();
    if x.iter().any(|v| !v.is_finite()) {
        return None;
    }
    // Dependent constraint rows can yield a finite but meaningless solve.
    let satisfied = constraints.iter().all(|(row, b)| {
        let lhs: f64 = row.iter().zip(&x).map(|(a, v)| a * v).sum();
        (lhs - b).abs() <= 1e-8 * b.abs().max(1.0)
    });
    satisfied.then_some(x)
}

/// Covariance plus `ε (I - J/n)`; on the budget plane this adds `ε ‖w - 1/n‖²`.
fn regularized(cov: &[Vec<f64>]) -> DMatrix<f64> {
    let n = cov.len();
    let mean_var = cov.iter().enumerate().map(|(i, row)| row[i]).sum::<f64>() / n as f64;
    let eps = TIE_BREAK_SCALE * if mean_var > 0.0 { mean_var } else { 1.0 };
    DMatrix::from_fn(n, n, |i, j| {
        let centering = if i == j { 1.0 } else { 0.0 } - 1.0 / n as f64;
        cov[i][j] + eps * centering
    })
}

fn quadratic_form(q: &DMatrix<f64>, x: &[f64]) -> f64 {
    let v = DVector::from_column_slice(x);
    (v.transpose() * q * &v)[(0, 0)]
}

/// Minimizes over every support the caller lets `solve` try; `solve` maps a support to a
/// feasible full-length candidate or `None`.
fn best_support(
    n: usize,
    allow_short: bool,
    mut solve: impl FnMut(&[usize]) -> Option<Candidate>,
) -> Option<Candidate> {
    if allow_short {
        let all: Vec<usize> = (0..n).collect();
        return solve(&all);
    }
    let mut best: Option<Candidate> = None;
    for mask in 1u32..(1u32 << n) {
        let support: Vec<usize> = (0..n).filter(|i| mask & (1 << i) != 0).collect();
        if let Some(c) = solve(&support) {
            if best.as_ref().is_none_or(|b| c.value < b.value) {
                best = Some(c);
            }
        }
    }
    best
}

fn sub_matrix(q: &DMatrix<f64>, support: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(support.len(), support.len(), |i, j| q[(support[i], support[j])])
}

fn scatter(n: usize, support: &[usize], values: &[f64]) -> Vec<f64> {
    let mut full = vec![0.0; n];
    for (&i, &v) in support.iter().zip(values) {
        full[i] = v;
    }
    full
}

fn is_nonnegative(x: &[f64], allow_short: bool) -> bool {
    let tol = FEASIBILITY_TOL * x.iter().fold(1.0f64, |a, v| a.max(v.abs()));
    allow_short || x.iter().all(|v| *v >= -tol)
}

fn min_variance_weights(
    mu: &[f64],
    q: &DMatrix<f64>,
    target: Option<f64>,
    allow_short: bool,
) -> Option<Vec<f64>> {
    let n = mu.len();
    best_support(n, allow_short, |support| {
        let qs = sub_matrix(q, support);
        let ones = vec![1.0; support.len()];
        let mu_s: Vec<f64> = support.iter().map(|&i| mu[i]).collect();

        let mut local: Option<Candidate> = None;
        let mut consider = |x: Vec<f64>, active: bool| {
            if !is_nonnegative(&x, allow_short) {
                return;
            }
            let w = scatter(n, support, &x);
            if let (Some(t), false) = (target, active) {
                if portfolio_return(&w, mu) < t - FEASIBILITY_TOL * t.abs().max(1.0) {
                    return;
                }
            }
            let value = quadratic_form(q, &w);
            if local.as_ref().is_none_or(|c| value < c.value) {
                local = Some(Candidate { weights: w, value });
            }
        };

        if let Some(x) = solve_equality_qp(&qs, &[(ones.clone(), 1.0)]) {
            consider(x, false);
        }
        if let Some(t) = target {
            if let Some(x) = solve_equality_qp(&qs, &[(ones, 1.0), (mu_s, t)]) {
                consider(x, true);
            }
        }
        local
    })
    .map(|c| c.weights)
}

/// Tangency portfolio via `min yᵀQy` s.t. `(μ - r_f)·y = 1`, normalized to `w = y / Σy`.
fn max_sharpe_weights(mu: &[f64], q: &DMatrix<f64>, risk_free_rate: f64, allow_short: bool) -> Option<Vec<f64>> {
    let n = mu.len();
    let excess: Vec<f64> = mu.iter().map(|m| m - risk_free_rate).collect();
    best_support(n, allow_short, |support| {
        let qs = sub_matrix(q, support);
        let ex: Vec<f64> = support.iter().map(|&i| excess[i]).collect();
        let y = solve_equality_qp(&qs, &[(ex, 1.0)])?;
        if !is_nonnegative(&y, allow_short) {
            return None;
        }
        let total: f64 = y.iter().sum();
        if total <= FEASIBILITY_TOL {
            return None;
        }
        let full = scatter(n, support, &y);
        let value = quadratic_form(q, &full);
        Some(Candidate { weights: full.iter().map(|v| v / total).collect(), value })
    })
    .map(|c| c.weights)
}

fn validate(inputs: &OptimizerInputs) -> Result<()> {
    let n = inputs.symbols.len();
    if n == 0 {
        return Err(PipelineError::Infeasible("no instruments to allocate".to_string()));
    }
    if inputs.expected_returns.len() != n
        || inputs.covariance.len() != n
        || inputs.covariance.iter().any(|row| row.len() != n)
    {
        return Err(PipelineError::Infeasible(format!(
            "dimension mismatch: {} symbols, {} expected returns, {}x? covariance",
            n,
            inputs.expected_returns.len(),
            inputs.covariance.len()
        )));
    }
    if inputs.expected_returns.iter().chain(inputs.covariance.iter().flatten()).any(|v| !v.is_finite()) {
        return Err(PipelineError::Infeasible("non-finite optimizer input".to_string()));
    }
    if !inputs.allow_short && n > MAX_ENUMERATED_ASSETS {
        return Err(PipelineError::Infeasible(format!(
            "{} instruments exceed the long-only solver limit of {}",
            n, MAX_ENUMERATED_ASSETS
        )));
    }
    Ok(())
}

/// Optimizes portfolio weights exactly.
///
/// Every support of the long-only problem (and, for a return target, whether the target
/// binds) is solved as an equality-constrained QP; the best feasible point wins. A tiny
/// equal-weight penalty makes the optimum unique, so ties resolve toward equal weights.
pub fn optimize(inputs: &OptimizerInputs, objective: &Objective) -> Result<PortfolioAllocation> {
    validate(inputs)?;
    let mu = &inputs.expected_returns;
    let q = regularized(&inputs.covariance);

    info!(
        "Optimizing {} assets for {}{}",
        inputs.symbols.len(),
        objective.label(),
        if inputs.allow_short { " with short selling" } else { "" }
    );
    for (s, r) in inputs.symbols.iter().zip(mu) {
        debug!("  {}: E[r]={:+.4}", s, r);
    }

    let (weights, used) = match *objective {
        Objective::MinVariance { target_return } => {
            if let Some(t) = target_return {
                let best = mu.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if !inputs.allow_short && t > best + FEASIBILITY_TOL {
                    return Err(PipelineError::Infeasible(format!(
                        "target return {:.4} exceeds the best expected return {:.4}",
                        t, best
                    )));
                }
            }
            let w = min_variance_weights(mu, &q, target_return, inputs.allow_short).ok_or_else(|| {
                PipelineError::Infeasible(format!("no allocation satisfies {}", objective.label()))
            })?;
            (w, *objective)
        }
        Objective::MaxSharpe { risk_free_rate } => {
            if mu.iter().all(|m| *m <= risk_free_rate) {
                warn!(
                    "No instrument has an expected return above the risk-free rate {:.4}. Falling back to minimum variance.",
                    risk_free_rate
                );
                let fallback = Objective::MinVariance { target_return: None };
                let w = min_variance_weights(mu, &q, None, inputs.allow_short)
                    .ok_or_else(|| PipelineError::Infeasible("no minimum-variance allocation".to_string()))?;
                (w, fallback)
            } else {
                let w = max_sharpe_weights(mu, &q, risk_free_rate, inputs.allow_short).ok_or_else(|| {
                    PipelineError::Infeasible("no allocation with positive excess return".to_string())
                })?;
                (w, *objective)
            }
        }
    };

    let weights = normalize(weights, inputs.allow_short)?;
    let ret = portfolio_return(&weights, mu);
    let vol = portfolio_variance(&weights, &inputs.covariance).max(0.0).sqrt();
    let sharpe_ratio = (vol > 1e-12).then(|| (ret - inputs.risk_free_rate) / vol);

    let daily_mean = ret / TRADING_DAYS;
    let daily_vol = vol / TRADING_DAYS.sqrt();
    let var_95_daily = -(daily_mean + stats::normal_quantile(1.0 - VAR_CONFIDENCE) * daily_vol);

    Ok(PortfolioAllocation {
        weights: inputs.symbols.iter().cloned().zip(weights).collect(),
        expected_annual_return: ret,
        expected_annual_vol: vol,
        sharpe_ratio,
        var_95_daily,
        objective: used.label(),
    })
}

/// Clears round-off negatives and rescales so the weights sum to exactly one.
fn normalize(mut weights: Vec<f64>, allow_short: bool) -> Result<Vec<f64>> {
    if !allow_short {
        weights.iter_mut().for_each(|w| *w = w.max(0.0));
    }
    let total: f64 = weights.iter().sum();
    if !total.is_finite() || total.abs() < 1e-12 {
        return Err(PipelineError::Infeasible("allocation weights do not sum to a positive total".to_string()));
    }
    weights.iter_mut().for_each(|w| *w /= total);
    Ok(weights)
}

// ──────────────────────────────────────────────────────────────────────────────
// Reporting
// ──────────────────────────────────────────────────────────────────────────────

/// Pretty-prints portfolio allocation to stdout.
pub fn print_allocation(alloc: &PortfolioAllocation, expected_returns: &[(String, f64)]) {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║                  Portfolio Allocation                      ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Objective              : {:<33}║", alloc.objective);
    println!(
        "║  Expected Annual Return : {:>+7.2}%                         ║",
        alloc.expected_annual_return * 100.0
    );
    println!(
        "║  Expected Annual Vol    : {:>7.2}%                         ║",
        alloc.expected_annual_vol * 100.0
    );
    match alloc.sharpe_ratio {
        Some(s) => println!("║  Sharpe Ratio           : {:>7.2}                          ║", s),
        None => println!("║  Sharpe Ratio           :     n/a                          ║"),
    }
    println!(
        "║  VaR 95% (1 day)        : {:>7.2}%                         ║",
        alloc.var_95_daily * 100.0
    );
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Symbol      Weight      E[Ann.Ret]                        ║");
    println!("╠════════════════════════════════════════════════════════════╣");

    let mut sorted: Vec<_> = alloc.weights.clone();
    sorted.sort_by(|a, b| b.1.total_cmp(&a.1));
    for (sym, w) in &sorted {
        let er = expected_returns.iter().find(|(s, _)| s == sym).map(|(_, r)| *r);
        println!(
            "║  {:<8} {:>8.2}%     {:>10}                        ║",
            sym,
            w * 100.0,
            er.map(|r| format!("{:+.2}%", r * 100.0)).unwrap_or_else(|| "n/a".into())
        );
    }
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("⚠  Educational use only. Not financial advice.");
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::{ReturnKind, ReturnPoint};
    use chrono::NaiveDate;

    fn inputs(mu: &[f64], cov: Vec<Vec<f64>>) -> OptimizerInputs {
        OptimizerInputs {
            symbols: ["TSLA", "BND", "SPY", "QQQ"].iter().take(mu.len()).map(|s| s.to_string()).collect(),
            expected_returns: mu.to_vec(),
            covariance: cov,
            risk_free_rate: 0.02,
            allow_short: false,
        }
    }

    fn diag(values: &[f64]) -> Vec<Vec<f64>> {
        (0..values.len())
            .map(|i| (0..values.len()).map(|j| if i == j { values[i] } else { 0.0 }).collect())
            .collect()
    }

    fn assert_valid(alloc: &PortfolioAllocation) {
        let sum: f64 = alloc.weights.iter().map(|(_, w)| w).sum();
        assert!((sum - 1.0).abs() < 1e-6, "Weights should sum to 1.0, got {}", sum);
        assert!(alloc.weights.iter().all(|(_, w)| *w >= 0.0), "Weights should be non-negative");
    }

    fn dense_cov() -> Vec<Vec<f64>> {
        vec![
            vec![0.25, 0.002, 0.03],
            vec![0.002, 0.0025, 0.001],
            vec![0.03, 0.001, 0.04],
        ]
    }

    #[test]
    fn test_target_scenario_matches_closed_form() {
        let mu = [0.12, 0.03, 0.08];
        let var = [0.25, 0.0025, 0.04];
        let target = 0.08;
        let alloc = optimize(&inputs(&mu, diag(&var)), &Objective::MinVariance { target_return: Some(target) }).unwrap();
        assert_valid(&alloc);

        // All weights positive and the target binds: w_i = (a + b μ_i) / σ_i².
        let s: Vec<f64> = var.iter().map(|v| 1.0 / v).collect();
        let s0: f64 = s.iter().sum();
        let s1: f64 = s.iter().zip(&mu).map(|(s, m)| s * m).sum();
        let s2: f64 = s.iter().zip(&mu).map(|(s, m)| s * m * m).sum();
        let det = s0 * s2 - s1 * s1;
        let a = (s2 - s1 * target) / det;
        let b = (s0 * target - s1) / det;
        for (i, (sym, w)) in alloc.weights.iter().enumerate() {
            let expected = s[i] * (a + b * mu[i]);
            assert!((w - expected).abs() < 1e-6, "{}: {} vs {}", sym, w, expected);
        }
        assert!((alloc.expected_annual_return - target).abs() < 1e-6);

        let again = optimize(&inputs(&mu, diag(&var)), &Objective::MinVariance { target_return: Some(target) }).unwrap();
        assert_eq!(alloc.weights, again.weights, "Optimizer should be deterministic");
    }

    #[test]
    fn test_unreachable_target_is_infeasible() {
        let err = optimize(
            &inputs(&[0.12, 0.03, 0.08], diag(&[0.25, 0.0025, 0.04])),
            &Objective::MinVariance { target_return: Some(0.2) },
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Infeasible(_)));
    }

    #[test]
    fn test_slack_target_gives_global_min_variance() {
        let mu = [0.12, 0.03, 0.08];
        let var = [0.25, 0.0025, 0.04];
        let free = optimize(&inputs(&mu, diag(&var)), &Objective::MinVariance { target_return: None }).unwrap();
        let slack = optimize(&inputs(&mu, diag(&var)), &Objective::MinVariance { target_return: Some(0.01) }).unwrap();
        for ((_, a), (_, b)) in free.weights.iter().zip(&slack.weights) {
            assert!((a - b).abs() < 1e-9);
        }
        // Inverse-variance weights.
        assert!((free.weight_of("BND").unwrap() - 400.0 / 429.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_variance_asset_takes_everything() {
        let alloc = optimize(
            &inputs(&[0.10, 0.03, 0.07], diag(&[0.04, 0.0, 0.09])),
            &Objective::MinVariance { target_return: None },
        )
        .unwrap();
        assert_valid(&alloc);
        assert!(alloc.weight_of("BND").unwrap() > 0.999);
    }

    #[test]
    fn test_tied_assets_split_equally() {
        let alloc = optimize(
            &inputs(&[0.03, 0.03, 0.07], diag(&[0.0, 0.0, 0.09])),
            &Objective::MinVariance { target_return: None },
        )
        .unwrap();
        assert_valid(&alloc);
        assert!((alloc.weight_of("TSLA").unwrap() - 0.5).abs() < 1e-6);
        assert!((alloc.weight_of("BND").unwrap() - 0.5).abs() < 1e-6);

        let identical = optimize(
            &inputs(&[0.05, 0.05, 0.05], diag(&[0.04, 0.04, 0.04])),
            &Objective::MaxSharpe { risk_free_rate: 0.02 },
        )
        .unwrap();
        for (_, w) in &identical.weights {
            assert!((w - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_max_sharpe_beats_simple_portfolios() {
        let mu = [0.12, 0.03, 0.08];
        let cov = dense_cov();
        let alloc = optimize(&inputs(&mu, cov.clone()), &Objective::MaxSharpe { risk_free_rate: 0.02 }).unwrap();
        assert_valid(&alloc);

        let sharpe = |w: &[f64]| (portfolio_return(w, &mu) - 0.02) / portfolio_variance(w, &cov).sqrt();
        let best = alloc.sharpe_ratio.unwrap();
        let candidates = [
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
            vec![1.0 / 3.0; 3],
            vec![0.2, 0.5, 0.3],
        ];
        for w in &candidates {
            assert!(best >= sharpe(w) - 1e-9, "{:?} beats the optimum", w);
        }
    }

    #[test]
    fn test_max_sharpe_without_positive_excess_falls_back() {
        let alloc = optimize(
            &inputs(&[0.01, 0.0, -0.02], diag(&[0.04, 0.01, 0.09])),
            &Objective::MaxSharpe { risk_free_rate: 0.02 },
        )
        .unwrap();
        assert_valid(&alloc);
        assert!(alloc.objective.starts_with("min variance"));
    }

    #[test]
    fn test_short_selling_allows_negative_weights() {
        let mut inp = inputs(&[0.12, 0.03, 0.08], dense_cov());
        inp.allow_short = true;
        let alloc = optimize(&inp, &Objective::MinVariance { target_return: Some(0.15) }).unwrap();
        let sum: f64 = alloc.weights.iter().map(|(_, w)| w).sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(alloc.weights.iter().any(|(_, w)| *w < 0.0));
        assert!((alloc.expected_annual_return - 0.15).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_inputs_are_infeasible() {
        let empty = OptimizerInputs {
            symbols: vec![],
            expected_returns: vec![],
            covariance: vec![],
            risk_free_rate: 0.0,
            allow_short: false,
        };
        assert!(matches!(
            optimize(&empty, &Objective::MinVariance { target_return: None }),
            Err(PipelineError::Infeasible(_))
        ));

        let ragged = inputs(&[0.1, 0.2], vec![vec![0.1, 0.0], vec![0.0]]);
        assert!(matches!(
            optimize(&ragged, &Objective::MinVariance { target_return: None }),
            Err(PipelineError::Infeasible(_))
        ));
    }

    #[test]
    fn test_covariance_matrix_requires_common_dates() {
        let series = |symbol: &str, start: u32, values: &[f64]| ReturnSeries {
            symbol: symbol.to_string(),
            kind: ReturnKind::Simple,
            points: values
                .iter()
                .enumerate()
                .map(|(i, v)| ReturnPoint { date: NaiveDate::from_ymd_opt(2024, 1, start + i as u32).unwrap(), value: *v })
                .collect(),
        };
        let a = series("A", 2, &[0.01, -0.02, 0.015, 0.0]);
        let b = series("B", 2, &[0.02, -0.01, 0.005, 0.01]);
        let cov = covariance_matrix(&[a.clone(), b]).unwrap();
        assert_eq!(cov.len(), 2);
        assert!((cov[0][1] - cov[1][0]).abs() < 1e-15, "Covariance matrix should be symmetric");
        assert!(cov[0][0] > 0.0, "Variance should be positive");

        let shifted = series("C", 3, &[0.01, -0.02, 0.015, 0.0]);
        assert!(matches!(covariance_matrix(&[a, shifted]), Err(PipelineError::Alignment(_))));
    }

    #[test]
    fn test_historical_expected_return() {
        let points = (0..4)
            .map(|i| ReturnPoint { date: NaiveDate::from_ymd_opt(2024, 1, 2 + i).unwrap(), value: 0.001 })
            .collect();
        let returns = ReturnSeries { symbol: "A".into(), kind: ReturnKind::Simple, points };
        let er = historical_expected_return(&returns).unwrap();
        assert!((er - 0.252).abs() < 1e-12, "Expected 0.252, got {}", er);

        let empty = ReturnSeries { symbol: "E".into(), kind: ReturnKind::Simple, points: Vec::new() };
        assert!(historical_expected_return(&empty).is_none());
    }
}
