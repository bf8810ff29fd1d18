use crate::config::{HISTOGRAM_BINS, MOVING_AVERAGE_WINDOW, ROLLING_WINDOW, TRADING_DAYS, VAR_CONFIDENCE};
use crate::data::{PriceField, PriceSeries};
use crate::error::{PipelineError, Result};
use crate::preprocess::{self, ReturnKind};
use crate::stats;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

/// Descriptive statistics for one cleaned instrument.
#[derive(Clone, Debug, Serialize)]
pub struct InstrumentSummary {
    pub symbol: String,
    pub observations: usize,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub last_price: f64,
    pub mean_daily_return: f64,
    pub daily_volatility: f64,
    pub annual_volatility: f64,
    /// Annualized volatility over the most recent rolling window.
    pub rolling_volatility: Option<f64>,
    /// Annualized, excess over `risk_free_rate`.
    pub sharpe_ratio: Option<f64>,
    /// Worst peak-to-trough loss of the wealth curve, as a non-positive fraction.
    pub max_drawdown: f64,
    pub cumulative_return: f64,
    /// One-day 95% VaR from the empirical return distribution, as a positive loss.
    pub var_historical: Option<f64>,
    /// One-day 95% VaR under a normal fit of returns, as a positive loss.
    pub var_parametric: Option<f64>,
    pub moving_average: Option<f64>,
    pub price_histogram: Vec<HistogramBin>,
}

/// Multiplicative decomposition `value = trend * seasonal * residual`.
///
/// Trend and residual are `None` where the centered moving average is undefined,
/// i.e. half a period at each end.
#[derive(Clone, Debug, Serialize)]
pub struct Decomposition {
    pub period: usize,
    pub trend: Vec<Option<f64>>,
    pub seasonal: Vec<f64>,
    pub residual: Vec<Option<f64>>,
}

// ──────────────────────────────────────────────────────────────────────────────
// Risk & Return Metrics
// ──────────────────────────────────────────────────────────────────────────────

pub fn daily_volatility(returns: &[f64]) -> Option<f64> {
    stats::sample_std(returns)
}

/// Annualized Sharpe ratio of daily returns; `None` for a flat series.
pub fn sharpe_ratio(returns: &[f64], risk_free_rate: f64) -> Option<f64> {
    let mean = stats::mean(returns)?;
    let std = stats::sample_std(returns)?;
    if std < 1e-12 {
        return None;
    }
    Some((mean - risk_free_rate / TRADING_DAYS) / std * TRADING_DAYS.sqrt())
}

/// Compounded return path `(1 + r).cumprod() - 1`.
pub fn cumulative_returns(returns: &[f64]) -> Vec<f64> {
    returns
        .iter()
        .scan(1.0, |wealth, r| {
            *wealth *= 1.0 + r;
            Some(*wealth - 1.0)
        })
        .collect()
}

/// Largest drop of the wealth curve from its running peak, e.g. `-0.35` for a 35% loss.
pub fn max_drawdown(returns: &[f64]) -> f64 {
    let mut wealth = 1.0;
    let mut peak = 1.0;
    let mut worst: f64 = 0.0;
    for r in returns {
        wealth *= 1.0 + r;
        peak = f64::max(peak, wealth);
        if peak > 0.0 {
            worst = worst.min(wealth / peak - 1.0);
        }
    }
    worst
}

pub fn value_at_risk_historical(returns: &[f64], confidence: f64) -> Option<f64> {
    stats::quantile(returns, 1.0 - confidence).map(|q| -q)
}

pub fn value_at_risk_parametric(returns: &[f64], confidence: f64) -> Option<f64> {
    let mean = stats::mean(returns)?;
    let std = stats::sample_std(returns)?;
    Some(-(mean + stats::normal_quantile(1.0 - confidence) * std))
}

/// Equal-width histogram; the last bin is closed on the right.
pub fn histogram(values: &[f64], bins: usize) -> Vec<HistogramBin> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() || bins == 0 {
        return Vec::new();
    }
    let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
    let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let width = if max > min { (max - min) / bins as f64 } else { 1.0 };

    let mut out: Vec<HistogramBin> = (0..bins)
        .map(|i| HistogramBin {
            lower: min + width * i as f64,
            upper: min + width * (i + 1) as f64,
            count: 0,
        })
        .collect();
    for v in finite {
        let idx = (((v - min) / width) as usize).min(bins - 1);
        out[idx].count += 1;
    }
    out
}

// ──────────────────────────────────────────────────────────────────────────────
// Seasonal Decomposition
// ──────────────────────────────────────────────────────────────────────────────

/// Classical multiplicative decomposition with a centered moving-average trend.
///
/// Requires at least two full periods of strictly positive values.
pub fn seasonal_decompose(values: &[f64], period: usize) -> Result<Decomposition> {
    if period < 2 {
        return Err(PipelineError::DataQuality(format!("seasonal period {} is too short", period)));
    }
    if values.len() < 2 * period {
        return Err(PipelineError::DataQuality(format!(
            "need at least {} observations for period {}, got {}",
            2 * period,
            period,
            values.len()
        )));
    }
    if values.iter().any(|v| !v.is_finite() || *v <= 0.0) {
        return Err(PipelineError::DataQuality(
            "multiplicative decomposition needs strictly positive values".to_string(),
        ));
    }

    let trend = centered_moving_average(values, period);

    let mut sums = vec![0.0; period];
    let mut counts = vec![0usize; period];
    for (i, (v, t)) in values.iter().zip(&trend).enumerate() {
        if let Some(t) = t {
            sums[i % period] += v / t;
            counts[i % period] += 1;
        }
    }
    let mut indices: Vec<f64> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &c)| if c > 0 { s / c as f64 } else { 1.0 })
        .collect();
    let norm = stats::mean(&indices).unwrap_or(1.0);
    indices.iter_mut().for_each(|s| *s /= norm);

    let seasonal: Vec<f64> = (0..values.len()).map(|i| indices[i % period]).collect();
    let residual = values
        .iter()
        .zip(&trend)
        .zip(&seasonal)
        .map(|((v, t), s)| t.map(|t| v / (t * s)))
        .collect();

    Ok(Decomposition { period, trend, seasonal, residual })
}

/// Centered moving average; a 2×period average when the period is even.
fn centered_moving_average(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let n = values.len();
    let half = period / 2;
    let mut out = vec![None; n];
    if period % 2 == 1 {
        for (i, slot) in out.iter_mut().enumerate().take(n - half).skip(half) {
            let window = &values[i - half..=i + half];
            *slot = Some(window.iter().sum::<f64>() / period as f64);
        }
    } else {
        for (i, slot) in out.iter_mut().enumerate().take(n - half).skip(half) {
            let window = &values[i - half..=i + half];
            let inner: f64 = window[1..period].iter().sum();
            let edges = 0.5 * (window[0] + window[period]);
            *slot = Some((inner + edges) / period as f64);
        }
    }
    out
}

// ──────────────────────────────────────────────────────────────────────────────
// Summary
// ──────────────────────────────────────────────────────────────────────────────

pub fn summarize(series: &PriceSeries, field: PriceField, risk_free_rate: f64) -> Result<InstrumentSummary> {
    let (Some(first), Some(last)) = (series.first(), series.last()) else {
        return Err(PipelineError::DataQuality(format!("{}: empty series", series.symbol())));
    };
    let returns = preprocess::compute_returns(series, field, ReturnKind::Simple).values();
    let daily_vol = daily_volatility(&returns).ok_or_else(|| {
        PipelineError::DataQuality(format!("{}: need at least two returns", series.symbol()))
    })?;
    let prices = series.prices(field);

    let summary = InstrumentSummary {
        symbol: series.symbol().to_string(),
        observations: series.len(),
        start: first.date,
        end: last.date,
        last_price: last.price(field),
        mean_daily_return: stats::mean(&returns).unwrap_or(0.0),
        daily_volatility: daily_vol,
        annual_volatility: daily_vol * TRADING_DAYS.sqrt(),
        rolling_volatility: preprocess::rolling_volatility(&returns, ROLLING_WINDOW, true)
            .last()
            .copied()
            .flatten(),
        sharpe_ratio: sharpe_ratio(&returns, risk_free_rate),
        max_drawdown: max_drawdown(&returns),
        cumulative_return: cumulative_returns(&returns).last().copied().unwrap_or(0.0),
        var_historical: value_at_risk_historical(&returns, VAR_CONFIDENCE),
        var_parametric: value_at_risk_parametric(&returns, VAR_CONFIDENCE),
        moving_average: preprocess::moving_average(&prices, MOVING_AVERAGE_WINDOW)
            .last()
            .copied()
            .flatten(),
        price_histogram: histogram(&prices, HISTOGRAM_BINS),
    };

    info!(
        "{}: vol={:.4} sharpe={} max_dd={:.2}% cum={:.2}%",
        summary.symbol,
        summary.annual_volatility,
        summary.sharpe_ratio.map(|s| format!("{:.2}", s)).unwrap_or_else(|| "n/a".into()),
        summary.max_drawdown * 100.0,
        summary.cumulative_return * 100.0
    );
    Ok(summary)
}

pub fn print_summary(summary: &InstrumentSummary) {
    let pct = |v: Option<f64>| v.map(|v| format!("{:.2}%", v * 100.0)).unwrap_or_else(|| "n/a".into());
    println!("\n=== {} ({} to {}, {} bars) ===", summary.symbol, summary.start, summary.end, summary.observations);
    println!("  Last price           : {:.2}", summary.last_price);
    println!("  Mean daily return    : {:+.4}%", summary.mean_daily_return * 100.0);
    println!("  Annual volatility    : {:.2}%", summary.annual_volatility * 100.0);
    println!("  {}-day rolling vol   : {}", ROLLING_WINDOW, pct(summary.rolling_volatility));
    println!(
        "  Sharpe ratio         : {}",
        summary.sharpe_ratio.map(|s| format!("{:.2}", s)).unwrap_or_else(|| "n/a".into())
    );
    println!("  Max drawdown         : {:.2}%", summary.max_drawdown * 100.0);
    println!("  Cumulative return    : {:+.2}%", summary.cumulative_return * 100.0);
    println!("  VaR 95% (historical) : {}", pct(summary.var_historical));
    println!("  VaR 95% (normal)     : {}", pct(summary.var_parametric));
    if let Some(ma) = summary.moving_average {
        println!("  {}-day moving average: {:.2}", MOVING_AVERAGE_WINDOW, ma);
    }
}
