use crate::data::PriceField;
use crate::forecast::{ForecastTarget, ModelKind};
use crate::portfolio::ObjectiveKind;
use crate::preprocess::{CalendarPolicy, ReturnKind};
use anyhow::{Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Annual trading days for annualization.
pub const TRADING_DAYS: f64 = 252.0;
/// Risk-free annual rate used in Sharpe calculations.
pub const RISK_FREE_RATE: f64 = 0.02;
/// Reject a series when more than this share of its cells is missing or non-numeric.
pub const MAX_MISSING_FRACTION: f64 = 0.05;
/// Reject a series when more than this share of its cleaned bars are calendar dates absent from the file.
pub const MAX_FILLED_DATE_FRACTION: f64 = 0.10;
/// Trading days to forecast past the last observation.
pub const FORECAST_HORIZON: usize = 30;
/// Share of each series held out for scoring forecasts.
pub const TEST_FRACTION: f64 = 0.2;
pub const CONFIDENCE_LEVEL: f64 = 0.95;
/// Window of the rolling volatility reported per instrument.
pub const ROLLING_WINDOW: usize = 21;
pub const MOVING_AVERAGE_WINDOW: usize = 50;
/// One trading year; period of the seasonal decomposition.
pub const SEASONAL_PERIOD: usize = 252;
pub const HISTOGRAM_BINS: usize = 30;
pub const VAR_CONFIDENCE: f64 = 0.95;

// ── Model fitting ───────────────────────────────────────────────────────────
pub const MAX_ITERATIONS: usize = 200;
pub const TOLERANCE: f64 = 1e-6;
/// Largest p/q tried by the automatic ARIMA order search.
pub const AUTO_MAX_ORDER: usize = 2;
pub const LSTM_LOOKBACK: usize = 60;
pub const LSTM_HIDDEN: usize = 32;
pub const LSTM_LAYERS: usize = 1;
pub const LSTM_EPOCHS: usize = 40;
pub const LSTM_BATCH_SIZE: usize = 64;
pub const LEARNING_RATE: f64 = 1e-3;
pub const WEIGHT_DECAY: f64 = 0.01;
pub const SHUFFLE_SEED: u64 = 42;

pub const DEFAULT_SYMBOLS: &[&str] = &["TSLA", "BND", "SPY"];
pub const DEFAULT_START: &str = "2015-01-01";
pub const DEFAULT_END: &str = "2024-10-31";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Column read for returns, forecasts and covariance.
    pub price_field: PriceField,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            price_field: PriceField::AdjClose,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub calendar: CalendarPolicy,
    pub max_missing_fraction: f64,
    pub max_filled_date_fraction: f64,
    pub return_kind: ReturnKind,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            calendar: CalendarPolicy::Weekdays,
            max_missing_fraction: MAX_MISSING_FRACTION,
            max_filled_date_fraction: MAX_FILLED_DATE_FRACTION,
            return_kind: ReturnKind::Simple,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// `None` fits ARIMA(1,d,1) with `d` taken from the target.
    pub model: Option<ModelKind>,
    /// Search ARIMA orders by AIC instead of fitting `model`.
    pub auto_select: bool,
    pub target: ForecastTarget,
    pub horizon: usize,
    pub test_fraction: f64,
    pub confidence: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub auto_max_order: usize,
    /// Wall-clock budget for a single model fit.
    pub fit_budget_secs: Option<f64>,
    pub use_cuda: bool,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            model: None,
            auto_select: false,
            target: ForecastTarget::Price,
            horizon: FORECAST_HORIZON,
            test_fraction: TEST_FRACTION,
            confidence: CONFIDENCE_LEVEL,
            max_iterations: MAX_ITERATIONS,
            tolerance: TOLERANCE,
            auto_max_order: AUTO_MAX_ORDER,
            fit_budget_secs: None,
            use_cuda: false,
        }
    }
}

impl ForecastConfig {
    pub fn fit_budget(&self) -> Option<Duration> {
        self.fit_budget_secs
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioConfig {
    pub objective: ObjectiveKind,
    pub target_return: Option<f64>,
    pub risk_free_rate: f64,
    pub allow_short: bool,
    /// Use the annualized historical mean for instruments that have no forecast.
    pub historical_fallback: bool,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            objective: ObjectiveKind::MaxSharpe,
            target_return: None,
            risk_free_rate: RISK_FREE_RATE,
            allow_short: false,
            historical_fallback: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub loader: LoaderConfig,
    pub preprocess: PreprocessConfig,
    pub forecast: ForecastConfig,
    pub portfolio: PortfolioConfig,
}

impl PipelineConfig {
    /// Builds the run configuration: defaults, then the optional JSON file, then `FOLIOCAST_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("opening config {}", path.display()))?;
                let reader = std::io::BufReader::new(file);
                let parsed: Self = serde_json::from_reader(reader)
                    .with_context(|| format!("parsing config {}", path.display()))?;
                info!("Loaded configuration from {}", path.display());
                parsed
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<usize>("FOLIOCAST_HORIZON") {
            self.forecast.horizon = v;
        }
        if let Some(v) = env_parse::<f64>("FOLIOCAST_TEST_FRACTION") {
            self.forecast.test_fraction = v;
        }
        if let Some(v) = env_parse::<f64>("FOLIOCAST_CONFIDENCE") {
            self.forecast.confidence = v;
        }
        if let Some(v) = env_parse::<f64>("FOLIOCAST_FIT_BUDGET_SECS") {
            self.forecast.fit_budget_secs = Some(v);
        }
        if let Some(v) = env_parse::<f64>("FOLIOCAST_MAX_MISSING_FRACTION") {
            self.preprocess.max_missing_fraction = v;
        }
        if let Some(v) = env_parse::<f64>("FOLIOCAST_MAX_FILLED_DATE_FRACTION") {
            self.preprocess.max_filled_date_fraction = v;
        }
        if let Some(v) = env_parse::<f64>("FOLIOCAST_RISK_FREE_RATE") {
            self.portfolio.risk_free_rate = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {}={}: not a valid value", name, trimmed);
            None
        }
    }
}

pub fn get_device(use_cuda: bool) -> Device {
    if use_cuda {
        #[cfg(feature = "cuda")]
        {
            match Device::new_cuda(0) {
                Ok(device) => {
                    info!("Using CUDA device 0");
                    return device;
                }
                Err(e) => {
                    warn!("Failed to initialize CUDA: {}. Falling back to CPU.", e);
                }
            }
        }
        #[cfg(not(feature = "cuda"))]
        {
            warn!("--cuda flag set but binary was compiled without the 'cuda' feature. Falling back to CPU.");
        }
    }

    #[cfg(feature = "mkl")]
    info!("Using CPU device with Intel MKL BLAS acceleration");

    Device::Cpu
}
