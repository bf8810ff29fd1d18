use crate::error::{PipelineError, Result};
use crate::forecast::ForecastResult;
use chrono::NaiveDate;
use serde::Serialize;

/// Accuracy of one forecast over a held-out window.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AccuracyReport {
    pub symbol: String,
    pub model: String,
    pub points: usize,
    pub mae: f64,
    pub rmse: f64,
    /// Percent, over points with a non-zero actual. `None` when every actual is zero.
    pub mape: Option<f64>,
    /// Share of actuals inside the forecast interval.
    pub coverage: f64,
}

/// Scores `forecast` against `actual`. Both must carry the same dates in the same order.
pub fn evaluate(actual: &[(NaiveDate, f64)], forecast: &ForecastResult) -> Result<AccuracyReport> {
    let points = forecast.points();
    if actual.is_empty() || points.is_empty() {
        return Err(PipelineError::Alignment(format!("{}: nothing to evaluate", forecast.symbol)));
    }
    if actual.len() != points.len() {
        return Err(PipelineError::Alignment(format!(
            "{}: {} actual values for {} forecasts",
            forecast.symbol,
            actual.len(),
            points.len()
        )));
    }
    if let Some(((date, _), p)) = actual.iter().zip(points).find(|((date, _), p)| *date != p.date) {
        return Err(PipelineError::Alignment(format!(
            "{}: actual dated {} lines up with forecast dated {}",
            forecast.symbol, date, p.date
        )));
    }
    if actual.iter().any(|(_, v)| !v.is_finite()) {
        return Err(PipelineError::DataQuality(format!("{}: non-finite actual value", forecast.symbol)));
    }

    let n = actual.len() as f64;
    let mut abs_sum = 0.0;
    let mut sq_sum = 0.0;
    let mut pct_sum = 0.0;
    let mut pct_count = 0usize;
    let mut covered = 0usize;
    for ((_, a), p) in actual.iter().zip(points) {
        let err = a - p.point;
        abs_sum += err.abs();
        sq_sum += err * err;
        if *a != 0.0 {
            pct_sum += (err / a).abs();
            pct_count += 1;
        }
        if p.lower <= *a && *a <= p.upper {
            covered += 1;
        }
    }

    Ok(AccuracyReport {
        symbol: forecast.symbol.clone(),
        model: forecast.model.clone(),
        points: actual.len(),
        mae: abs_sum / n,
        rmse: (sq_sum / n).sqrt(),
        mape: (pct_count > 0).then(|| pct_sum / pct_count as f64 * 100.0),
        coverage: covered as f64 / n,
    })
}

pub fn print_report(report: &AccuracyReport) {
    println!(
        "{:<6} {:<28} n={:<4} MAE={:>10.4} RMSE={:>10.4} MAPE={:>8} coverage={:>5.1}%",
        report.symbol,
        report.model,
        report.points,
        report.mae,
        report.rmse,
        report.mape.map(|m| format!("{:.2}%", m)).unwrap_or_else(|| "n/a".into()),
        report.coverage * 100.0
    );
}
