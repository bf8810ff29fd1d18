//! Model families, the fit/forecast contract and the fallback chain.

pub mod arima;
pub mod lstm;

use crate::config::{ForecastConfig, LEARNING_RATE, LSTM_EPOCHS, LSTM_HIDDEN, LSTM_LAYERS, LSTM_LOOKBACK, TRADING_DAYS};
use crate::data::{PriceField, PriceSeries};
use crate::error::{PipelineError, Result};
use crate::evaluate::{self, AccuracyReport};
use crate::preprocess::{self, ReturnKind};
use crate::stats;
use arima::{ArimaForecaster, ArimaSpec};
use chrono::NaiveDate;
use lstm::LstmForecaster;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Model Selection
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ModelKind {
    Arima {
        p: usize,
        d: usize,
        q: usize,
    },
    /// Seasonal terms enter as additional lags at multiples of `period`.
    Sarima {
        p: usize,
        d: usize,
        q: usize,
        seasonal_p: usize,
        seasonal_d: usize,
        seasonal_q: usize,
        period: usize,
    },
    Lstm {
        lookback: usize,
        hidden: usize,
        layers: usize,
        epochs: usize,
        learning_rate: f64,
    },
}

impl ModelKind {
    pub fn default_lstm() -> Self {
        Self::Lstm {
            lookback: LSTM_LOOKBACK,
            hidden: LSTM_HIDDEN,
            layers: LSTM_LAYERS,
            epochs: LSTM_EPOCHS,
            learning_rate: LEARNING_RATE,
        }
    }

    /// ARIMA(1,d,1) with the differencing the target calls for.
    pub fn default_arima(target: ForecastTarget) -> Self {
        Self::Arima { p: 1, d: target.default_differencing(), q: 1 }
    }

    /// Non-seasonal differencing order. Zero for LSTM.
    pub fn differencing(&self) -> usize {
        match self {
            Self::Arima { d, .. } | Self::Sarima { d, .. } => *d,
            Self::Lstm { .. } => 0,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Arima { p, d, q } => format!("ARIMA({},{},{})", p, d, q),
            Self::Sarima { p, d, q, seasonal_p, seasonal_d, seasonal_q, period } => format!(
                "SARIMA({},{},{})({},{},{})[{}]",
                p, d, q, seasonal_p, seasonal_d, seasonal_q, period
            ),
            Self::Lstm { lookback, hidden, layers, .. } => {
                format!("LSTM(lookback={}, hidden={}, layers={})", lookback, hidden, layers)
            }
        }
    }

    /// The next simpler family to try after a convergence failure.
    ///
    /// LSTM and SARIMA fall back to ARIMA, ARIMA falls back to the drift-only
    /// ARIMA(0,d,0), and that has no fallback.
    pub fn fallback(&self, target: ForecastTarget) -> Option<Self> {
        let d = target.default_differencing();
        match self {
            Self::Lstm { .. } => Some(Self::Arima { p: 1, d, q: 1 }),
            Self::Sarima { p, d, q, .. } => Some(Self::Arima { p: *p, d: *d, q: *q }),
            Self::Arima { p: 0, q: 0, .. } => None,
            Self::Arima { d, .. } => Some(Self::Arima { p: 0, d: *d, q: 0 }),
        }
    }

    pub fn forecaster(&self, settings: &FitSettings) -> Box<dyn Forecaster> {
        match self {
            Self::Arima { p, d, q } => Box::new(ArimaForecaster::new(ArimaSpec::arima(*p, *d, *q), settings.clone())),
            Self::Sarima { p, d, q, seasonal_p, seasonal_d, seasonal_q, period } => Box::new(ArimaForecaster::new(
                ArimaSpec::sarima(*p, *d, *q, *seasonal_p, *seasonal_d, *seasonal_q, *period),
                settings.clone(),
            )),
            Self::Lstm { lookback, hidden, layers, epochs, learning_rate } => Box::new(LstmForecaster {
                lookback: *lookback,
                hidden: *hidden,
                layers: *layers,
                epochs: *epochs,
                learning_rate: *learning_rate,
                settings: settings.clone(),
            }),
        }
    }
}

/// What series a model is fitted on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastTarget {
    Price,
    LogReturn,
}

impl ForecastTarget {
    /// Differencing order used for automatic and fallback ARIMA models.
    pub fn default_differencing(self) -> usize {
        match self {
            Self::Price => 1,
            Self::LogReturn => 0,
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Fit Contract
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct FitSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub budget: Option<Duration>,
    pub use_cuda: bool,
}

impl From<&ForecastConfig> for FitSettings {
    fn from(cfg: &ForecastConfig) -> Self {
        Self {
            max_iterations: cfg.max_iterations,
            tolerance: cfg.tolerance,
            budget: cfg.fit_budget(),
            use_cuda: cfg.use_cuda,
        }
    }
}

/// Wall-clock limit for a single fit.
#[derive(Clone, Debug)]
pub struct FitBudget {
    started: Instant,
    limit: Option<Duration>,
}

impl FitBudget {
    pub fn start(limit: Option<Duration>) -> Self {
        Self { started: Instant::now(), limit }
    }

    pub fn unlimited() -> Self {
        Self::start(None)
    }

    pub fn check(&self, stage: &str) -> Result<()> {
        match self.limit {
            Some(limit) if self.started.elapsed() > limit => Err(PipelineError::Convergence(format!(
                "{} exceeded the fit budget of {:.1}s",
                stage,
                limit.as_secs_f64()
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Interval {
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
}

pub trait Forecaster {
    fn fit(&self, history: &[f64], budget: &FitBudget) -> Result<Box<dyn FittedModel>>;
}

pub trait FittedModel {
    fn describe(&self) -> String;

    /// Akaike information criterion, when the model has a likelihood.
    fn aic(&self) -> Option<f64>;

    /// Point and interval forecasts for the next `horizon` steps.
    fn forecast(&self, horizon: usize, confidence: f64) -> Result<Vec<Interval>>;
}

// ──────────────────────────────────────────────────────────────────────────────
// Forecast Results
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub date: NaiveDate,
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Dated forecasts for one instrument. Every point satisfies `lower <= point <= upper`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ForecastResult {
    pub symbol: String,
    pub model: String,
    pub target: ForecastTarget,
    pub confidence: f64,
    points: Vec<ForecastPoint>,
}

impl ForecastResult {
    pub fn new(
        symbol: impl Into<String>,
        model: impl Into<String>,
        target: ForecastTarget,
        confidence: f64,
        points: Vec<ForecastPoint>,
    ) -> Result<Self> {
        let symbol = symbol.into();
        for p in &points {
            if !(p.point.is_finite() && p.lower.is_finite() && p.upper.is_finite()) {
                return Err(PipelineError::Convergence(format!(
                    "{}: non-finite forecast on {}",
                    symbol, p.date
                )));
            }
            if !(p.lower <= p.point && p.point <= p.upper) {
                return Err(PipelineError::Convergence(format!(
                    "{}: interval [{}, {}] does not contain {} on {}",
                    symbol, p.lower, p.upper, p.point, p.date
                )));
            }
        }
        if points.windows(2).any(|w| w[0].date >= w[1].date) {
            return Err(PipelineError::Alignment(format!("{}: forecast dates are not increasing", symbol)));
        }
        Ok(Self { symbol, model: model.into(), target, confidence, points })
    }

    pub fn from_intervals(
        symbol: &str,
        model: &str,
        target: ForecastTarget,
        confidence: f64,
        dates: &[NaiveDate],
        intervals: &[Interval],
    ) -> Result<Self> {
        if dates.len() != intervals.len() {
            return Err(PipelineError::Alignment(format!(
                "{}: {} forecast dates for {} forecasts",
                symbol,
                dates.len(),
                intervals.len()
            )));
        }
        let points = dates
            .iter()
            .zip(intervals)
            .map(|(&date, i)| ForecastPoint { date, point: i.point, lower: i.lower, upper: i.upper })
            .collect();
        Self::new(symbol, model, target, confidence, points)
    }

    pub fn points(&self) -> &[ForecastPoint] {
        &self.points
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.points.iter().map(|p| p.date).collect()
    }

    pub fn horizon(&self) -> usize {
        self.points.len()
    }

    /// Keeps only the points dated in `dates`.
    pub fn restrict_to(&self, dates: &[NaiveDate]) -> Self {
        let keep: HashSet<NaiveDate> = dates.iter().copied().collect();
        Self {
            points: self.points.iter().filter(|p| keep.contains(&p.date)).copied().collect(),
            ..self.clone()
        }
    }

    /// Annualized expected return implied by the forecast path.
    ///
    /// `last_value` is the last observed price for price forecasts; it is ignored for return forecasts.
    pub fn expected_annual_return(&self, last_value: f64) -> Option<f64> {
        let last = self.points.last()?;
        match self.target {
            ForecastTarget::Price if last_value > 0.0 => {
                Some((last.point / last_value - 1.0) * TRADING_DAYS / self.points.len() as f64)
            }
            ForecastTarget::Price => None,
            ForecastTarget::LogReturn => {
                let values: Vec<f64> = self.points.iter().map(|p| p.point).collect();
                stats::mean(&values).map(|m| m * TRADING_DAYS)
            }
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Splitting & Fitting
// ──────────────────────────────────────────────────────────────────────────────

/// Dated values a model of `target` is fitted on.
pub fn target_values(series: &PriceSeries, field: PriceField, target: ForecastTarget) -> Vec<(NaiveDate, f64)> {
    match target {
        ForecastTarget::Price => series.bars().iter().map(|b| (b.date, b.price(field))).collect(),
        ForecastTarget::LogReturn => preprocess::compute_returns(series, field, ReturnKind::Log)
            .points
            .iter()
            .map(|p| (p.date, p.value))
            .collect(),
    }
}

/// Number of held-out points for `fraction` of `len`, leaving at least two for training.
pub fn test_len_from_fraction(len: usize, fraction: f64) -> usize {
    let raw = (len as f64 * fraction.clamp(0.0, 1.0)).round() as usize;
    raw.clamp(1, len.saturating_sub(2).max(1))
}

/// Splits into train and test in time order; the test window is the last `test_len` values.
pub fn chronological_split<T>(values: &[T], test_len: usize) -> Result<(&[T], &[T])> {
    if test_len == 0 || test_len + 2 > values.len() {
        return Err(PipelineError::DataQuality(format!(
            "cannot hold out {} of {} observations",
            test_len,
            values.len()
        )));
    }
    Ok(values.split_at(values.len() - test_len))
}

/// Fits `kind`, stepping down the fallback chain on convergence failures.
pub fn fit_with_fallback(
    kind: &ModelKind,
    target: ForecastTarget,
    history: &[f64],
    settings: &FitSettings,
) -> Result<(ModelKind, Box<dyn FittedModel>)> {
    let mut current = kind.clone();
    loop {
        let budget = FitBudget::start(settings.budget);
        match current.forecaster(settings).fit(history, &budget) {
            Ok(model) => {
                debug!("Fitted {}", model.describe());
                return Ok((current, model));
            }
            Err(e) if e.is_convergence() => match current.fallback(target) {
                Some(next) => {
                    warn!("{} failed ({}). Falling back to {}.", current.label(), e, next.label());
                    current = next;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

/// Grid search over ARIMA(p, d, q) for `p, q <= max_order`, keeping the lowest AIC.
pub fn auto_arima(
    history: &[f64],
    d: usize,
    max_order: usize,
    settings: &FitSettings,
) -> Result<(ModelKind, Box<dyn FittedModel>)> {
    let mut best: Option<(f64, ModelKind, Box<dyn FittedModel>)> = None;
    for p in 0..=max_order {
        for q in 0..=max_order {
            let kind = ModelKind::Arima { p, d, q };
            let budget = FitBudget::start(settings.budget);
            match kind.forecaster(settings).fit(history, &budget) {
                Ok(model) => {
                    let aic = model.aic().unwrap_or(f64::INFINITY);
                    debug!("{}: AIC={:.2}", kind.label(), aic);
                    if best.as_ref().is_none_or(|(b, _, _)| aic < *b) {
                        best = Some((aic, kind, model));
                    }
                }
                Err(e) if e.is_convergence() => debug!("{} skipped: {}", kind.label(), e),
                Err(e) => return Err(e),
            }
        }
    }
    match best {
        Some((aic, kind, model)) => {
            info!("Selected {} (AIC={:.2})", kind.label(), aic);
            Ok((kind, model))
        }
        None => Err(PipelineError::Convergence(format!(
            "no ARIMA order up to ({0},{1},{0}) could be fitted",
            max_order, d
        ))),
    }
}

fn fit_configured(
    history: &[f64],
    cfg: &ForecastConfig,
) -> Result<(ModelKind, Box<dyn FittedModel>)> {
    let settings = FitSettings::from(cfg);
    if cfg.auto_select {
        return auto_arima(history, cfg.target.default_differencing(), cfg.auto_max_order, &settings);
    }
    let kind = cfg.model.clone().unwrap_or_else(|| ModelKind::default_arima(cfg.target));
    check_target_differencing(&kind, cfg.target)?;
    fit_with_fallback(&kind, cfg.target, history, &settings)
}

/// Rejects an integrated model on a log-return target.
fn check_target_differencing(kind: &ModelKind, target: ForecastTarget) -> Result<()> {
    if target == ForecastTarget::LogReturn && kind.differencing() > 0 {
        return Err(PipelineError::DataQuality(format!(
            "{} differences a log-return target; use d = 0",
            kind.label()
        )));
    }
    Ok(())
}

fn check_confidence(confidence: f64) -> Result<()> {
    if confidence > 0.0 && confidence < 1.0 {
        Ok(())
    } else {
        Err(PipelineError::DataQuality(format!("confidence level {} is not in (0, 1)", confidence)))
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Backtest & Forecast
// ──────────────────────────────────────────────────────────────────────────────

/// Held-out evaluation of one instrument.
#[derive(Clone, Debug, Serialize)]
pub struct Backtest {
    pub model: ModelKind,
    pub forecast: ForecastResult,
    pub accuracy: AccuracyReport,
}

/// Fits on the training window and scores the forecast over the held-out window.
pub fn backtest(series: &PriceSeries, field: PriceField, cfg: &ForecastConfig) -> Result<Backtest> {
    check_confidence(cfg.confidence)?;
    let values = target_values(series, field, cfg.target);
    let test_len = test_len_from_fraction(values.len(), cfg.test_fraction);
    let (train, test) = chronological_split(&values, test_len)?;

    let history: Vec<f64> = train.iter().map(|(_, v)| *v).collect();
    let (model, fitted) = fit_configured(&history, cfg)?;
    let intervals = fitted.forecast(test.len(), cfg.confidence)?;

    let dates: Vec<NaiveDate> = test.iter().map(|(d, _)| *d).collect();
    let forecast = ForecastResult::from_intervals(
        series.symbol(),
        &model.label(),
        cfg.target,
        cfg.confidence,
        &dates,
        &intervals,
    )?;
    let accuracy = evaluate::evaluate(test, &forecast)?;
    info!(
        "{} {} on {} held-out points: MAE={:.4} RMSE={:.4}",
        series.symbol(),
        model.label(),
        test.len(),
        accuracy.mae,
        accuracy.rmse
    );
    Ok(Backtest { model, forecast, accuracy })
}

/// Refits on the full series and forecasts the next `horizon` trading days.
pub fn forecast_series(series: &PriceSeries, field: PriceField, cfg: &ForecastConfig) -> Result<ForecastResult> {
    check_confidence(cfg.confidence)?;
    if cfg.horizon == 0 {
        return Err(PipelineError::DataQuality("forecast horizon must be positive".to_string()));
    }
    let Some(last) = series.last() else {
        return Err(PipelineError::DataQuality(format!("{}: empty series", series.symbol())));
    };

    let history: Vec<f64> = target_values(series, field, cfg.target).into_iter().map(|(_, v)| v).collect();
    let (model, fitted) = fit_configured(&history, cfg)?;
    let intervals = fitted.forecast(cfg.horizon, cfg.confidence)?;
    let dates = preprocess::next_trading_days(last.date, cfg.horizon);

    ForecastResult::from_intervals(series.symbol(), &model.label(), cfg.target, cfg.confidence, &dates, &intervals)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn point(date: NaiveDate, point: f64) -> ForecastPoint {
        ForecastPoint { date, point, lower: point - 1.0, upper: point + 1.0 }
    }

    #[test]
    fn test_forecast_result_rejects_inverted_interval() {
        let bad = ForecastPoint { date: d(2024, 1, 2), point: 5.0, lower: 6.0, upper: 7.0 };
        let err = ForecastResult::new("X", "m", ForecastTarget::Price, 0.95, vec![bad]).unwrap_err();
        assert!(err.is_convergence());

        let nan = ForecastPoint { date: d(2024, 1, 2), point: f64::NAN, lower: 0.0, upper: 1.0 };
        assert!(ForecastResult::new("X", "m", ForecastTarget::Price, 0.95, vec![nan]).is_err());
    }

    #[test]
    fn test_fallback_chain_terminates() {
        let mut kind = ModelKind::default_lstm();
        let mut chain = vec![kind.label()];
        while let Some(next) = kind.fallback(ForecastTarget::Price) {
            chain.push(next.label());
            kind = next;
        }
        assert_eq!(chain, vec![ModelKind::default_lstm().label(), "ARIMA(1,1,1)".to_string(), "ARIMA(0,1,0)".to_string()]);

        let sarima = ModelKind::Sarima { p: 2, d: 1, q: 0, seasonal_p: 1, seasonal_d: 0, seasonal_q: 0, period: 5 };
        assert_eq!(sarima.fallback(ForecastTarget::Price), Some(ModelKind::Arima { p: 2, d: 1, q: 0 }));
    }

    #[test]
    fn test_chronological_split_keeps_order() {
        let values: Vec<usize> = (0..10).collect();
        let (train, test) = chronological_split(&values, 3).unwrap();
        assert_eq!(train, &[0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(test, &[7, 8, 9]);
        assert!(chronological_split(&values, 9).is_err());
        assert!(chronological_split(&values, 0).is_err());
    }

    #[test]
    fn test_len_from_fraction_bounds() {
        assert_eq!(test_len_from_fraction(100, 0.2), 20);
        assert_eq!(test_len_from_fraction(100, 0.0), 1);
        assert_eq!(test_len_from_fraction(10, 1.0), 8);
    }

    #[test]
    fn test_expected_annual_return() {
        let points: Vec<ForecastPoint> = (0..10).map(|i| point(d(2024, 1, 1) + chrono::Duration::days(i), 110.0)).collect();
        let f = ForecastResult::new("X", "m", ForecastTarget::Price, 0.95, points).unwrap();
        let er = f.expected_annual_return(100.0).unwrap();
        assert!((er - 0.1 * 252.0 / 10.0).abs() < 1e-12);

        let rets: Vec<ForecastPoint> = (0..4).map(|i| point(d(2024, 1, 1) + chrono::Duration::days(i), 0.001)).collect();
        let f = ForecastResult::new("X", "m", ForecastTarget::LogReturn, 0.95, rets).unwrap();
        assert!((f.expected_annual_return(0.0).unwrap() - 0.252).abs() < 1e-12);
    }

    #[test]
    fn test_restrict_to_dates() {
        let points: Vec<ForecastPoint> = (0..5).map(|i| point(d(2024, 1, 1) + chrono::Duration::days(i), i as f64)).collect();
        let f = ForecastResult::new("X", "m", ForecastTarget::Price, 0.95, points).unwrap();
        let r = f.restrict_to(&[d(2024, 1, 2), d(2024, 1, 4)]);
        assert_eq!(r.dates(), vec![d(2024, 1, 2), d(2024, 1, 4)]);
    }

    #[test]
    fn test_backtest_and_forecast_on_mock_prices() {
        let series = crate::data::mock_series("SPY", 300, 5);
        let cfg = ForecastConfig { horizon: 10, ..Default::default() };

        let bt = backtest(&series, PriceField::Close, &cfg).unwrap();
        assert_eq!(bt.forecast.horizon(), 60);
        assert!(bt.accuracy.mae.is_finite());
        assert!(bt.forecast.points().iter().all(|p| p.lower <= p.point && p.point <= p.upper));

        let f = forecast_series(&series, PriceField::Close, &cfg).unwrap();
        assert_eq!(f.horizon(), 10);
        assert!(f.dates()[0] > series.last().unwrap().date);
        assert!(f.dates().iter().all(|d| preprocess::is_weekday(*d)));
    }

    #[test]
    fn test_auto_arima_on_log_returns() {
        let series = crate::data::mock_series("BND", 250, 8);
        let cfg = ForecastConfig {
            auto_select: true,
            target: ForecastTarget::LogReturn,
            horizon: 5,
            auto_max_order: 1,
            ..Default::default()
        };
        let f = forecast_series(&series, PriceField::Close, &cfg).unwrap();
        assert!(f.model.starts_with("ARIMA("));
        assert_eq!(f.horizon(), 5);
    }

    #[test]
    fn test_default_model_follows_log_return_target() {
        let series = crate::data::mock_series("BND", 300, 8);
        let cfg = ForecastConfig { target: ForecastTarget::LogReturn, horizon: 30, ..Default::default() };

        let f = forecast_series(&series, PriceField::Close, &cfg).unwrap();
        assert!(f.model.starts_with("ARIMA(") && f.model.contains(",0,"), "got {}", f.model);
        let er = f.expected_annual_return(0.0).unwrap();
        assert!(er.abs() < 1.0, "expected annual return {} is not plausible", er);
    }

    #[test]
    fn test_integrated_model_on_log_returns_is_rejected() {
        let series = crate::data::mock_series("BND", 300, 8);
        let cfg = ForecastConfig {
            model: Some(ModelKind::Arima { p: 1, d: 1, q: 1 }),
            target: ForecastTarget::LogReturn,
            ..Default::default()
        };
        let err = forecast_series(&series, PriceField::Close, &cfg).unwrap_err();
        assert_eq!(err.kind(), "DataQualityError");

        assert_eq!(ModelKind::default_arima(ForecastTarget::Price), ModelKind::Arima { p: 1, d: 1, q: 1 });
        assert_eq!(ModelKind::default_arima(ForecastTarget::LogReturn), ModelKind::Arima { p: 1, d: 0, q: 1 });
    }

    #[test]
    fn test_fit_with_fallback_steps_down_from_lstm() {
        let history: Vec<f64> = crate::data::mock_series("X", 50, 3).bars().iter().map(|b| b.close).collect();
        let lstm = ModelKind::Lstm { lookback: 60, hidden: 8, layers: 1, epochs: 1, learning_rate: 0.01 };
        let settings = FitSettings::from(&ForecastConfig::default());

        let (landed, model) = fit_with_fallback(&lstm, ForecastTarget::Price, &history, &settings).unwrap();
        assert!(matches!(landed, ModelKind::Arima { d: 1, .. }), "landed on {}", landed.label());
        assert_eq!(model.forecast(3, 0.95).unwrap().len(), 3);
    }

    #[test]
    fn test_fit_with_fallback_propagates_final_convergence_error() {
        let history = [100.0, 101.0, 100.5, 102.0, 101.5];
        let settings = FitSettings::from(&ForecastConfig::default());

        let err = fit_with_fallback(&ModelKind::Arima { p: 0, d: 1, q: 0 }, ForecastTarget::Price, &history, &settings)
            .err().unwrap();
        assert!(err.is_convergence(), "got {}", err);
    }
}
