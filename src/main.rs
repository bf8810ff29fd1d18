mod analysis;
mod config;
mod data;
mod error;
mod evaluate;
mod forecast;
mod pipeline;
mod portfolio;
mod preprocess;
mod report;
mod stats;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use config::{DEFAULT_END, DEFAULT_START, DEFAULT_SYMBOLS, PipelineConfig, SEASONAL_PERIOD};
use forecast::{ForecastTarget, ModelKind};
use portfolio::ObjectiveKind;
use preprocess::CalendarPolicy;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "foliocast: forecast-driven portfolio allocation from daily price files",
    after_help = "EXAMPLES:
    # Download the reference instruments
    cargo run --release -- fetch --symbols TSLA,BND,SPY --out-dir data

    # Full pipeline over local files
    cargo run --release -- run data/TSLA.csv data/BND.csv data/SPY.csv --out-dir out

    # Minimum-variance allocation with an 8% return floor
    cargo run --release -- optimize data/*.csv --forecast-dir out/forecasts --objective min-variance --target-return 0.08"
)]
struct Cli {
    /// JSON configuration file; FOLIOCAST_* variables and flags override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `foliocast=trace` (defaults to RUST_LOG, then foliocast=info)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Use CUDA GPU acceleration for LSTM models (requires --features cuda at compile time)
    #[arg(long, global = true)]
    cuda: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download daily bars from Yahoo Finance into CSV files
    Fetch {
        /// Comma-separated symbols
        #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect::<Vec<_>>())]
        symbols: Vec<String>,
        #[arg(long, default_value = DEFAULT_START)]
        start: NaiveDate,
        #[arg(long, default_value = DEFAULT_END)]
        end: NaiveDate,
        #[arg(long, default_value = "data")]
        out_dir: PathBuf,
    },
    /// Clean price files and write cleaned prices and returns
    Preprocess {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long, default_value = "out")]
        out_dir: PathBuf,
        #[arg(long, value_enum)]
        calendar: Option<CalendarArg>,
        /// Put every instrument on one shared calendar
        #[arg(long)]
        align: bool,
    },
    /// Descriptive statistics, risk metrics and seasonal decomposition
    Analyze {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Write the report as JSON
        #[arg(long)]
        out: Option<PathBuf>,
        /// Seasonal period for the multiplicative decomposition
        #[arg(long, default_value_t = SEASONAL_PERIOD)]
        period: usize,
    },
    /// Backtest a model on the held-out tail, then forecast past the last date
    Forecast {
        file: PathBuf,
        #[arg(long, value_enum)]
        model: Option<ModelArg>,
        #[command(flatten)]
        opts: ForecastOpts,
        #[arg(long, default_value = "out")]
        out_dir: PathBuf,
    },
    /// Score a forecast file against actual prices
    Evaluate {
        /// Price file holding the realized values
        #[arg(long)]
        actual: PathBuf,
        /// Forecast file (Date,Forecast,Lower,Upper)
        #[arg(long)]
        forecast: PathBuf,
        #[arg(long, value_enum)]
        target: Option<TargetArg>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Allocate across instruments from forecasts and historical covariance
    Optimize {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Directory with <SYMBOL>_forecast.csv files
        #[arg(long)]
        forecast_dir: Option<PathBuf>,
        #[arg(long, value_enum)]
        objective: Option<ObjectiveArg>,
        /// Minimum annual expected return (min-variance only)
        #[arg(long)]
        target_return: Option<f64>,
        #[arg(long)]
        allow_short: bool,
        #[arg(long, default_value = "out")]
        out_dir: PathBuf,
    },
    /// Full pipeline: clean, analyze, backtest, forecast and allocate
    Run {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[command(flatten)]
        opts: ForecastOpts,
        #[arg(long, default_value = "out")]
        out_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ForecastOpts {
    /// Trading days to forecast
    #[arg(long)]
    horizon: Option<usize>,
    /// Held-out share of the series for scoring
    #[arg(long)]
    test_size: Option<f64>,
    #[arg(long, value_enum)]
    target: Option<TargetArg>,
    /// Wall-clock budget per model fit, in seconds
    #[arg(long)]
    fit_budget: Option<f64>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CalendarArg {
    Weekdays,
    AsIs,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModelArg {
    Arima,
    Sarima,
    Lstm,
    /// ARIMA order chosen by AIC
    Auto,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TargetArg {
    Price,
    LogReturn,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ObjectiveArg {
    MaxSharpe,
    MinVariance,
}

impl From<TargetArg> for ForecastTarget {
    fn from(t: TargetArg) -> Self {
        match t {
            TargetArg::Price => Self::Price,
            TargetArg::LogReturn => Self::LogReturn,
        }
    }
}

impl ForecastOpts {
    fn apply(&self, cfg: &mut PipelineConfig) {
        if let Some(h) = self.horizon {
            cfg.forecast.horizon = h;
        }
        if let Some(t) = self.test_size {
            cfg.forecast.test_fraction = t;
        }
        if let Some(t) = self.target {
            cfg.forecast.target = t.into();
        }
        if let Some(b) = self.fit_budget {
            cfg.forecast.fit_budget_secs = Some(b);
        }
    }
}

fn apply_model(cfg: &mut PipelineConfig, model: ModelArg) {
    let d = cfg.forecast.target.default_differencing();
    cfg.forecast.auto_select = matches!(model, ModelArg::Auto);
    cfg.forecast.model = match (model, cfg.forecast.model.take()) {
        (ModelArg::Auto, _) => None,
        (ModelArg::Arima, Some(kind @ ModelKind::Arima { .. })) => Some(kind),
        (ModelArg::Arima, _) => Some(ModelKind::default_arima(cfg.forecast.target)),
        (ModelArg::Sarima, Some(kind @ ModelKind::Sarima { .. })) => Some(kind),
        (ModelArg::Sarima, _) => Some(ModelKind::Sarima {
            p: 1,
            d,
            q: 1,
            seasonal_p: 1,
            seasonal_d: 0,
            seasonal_q: 0,
            period: 5,
        }),
        (ModelArg::Lstm, Some(kind @ ModelKind::Lstm { .. })) => Some(kind),
        (ModelArg::Lstm, _) => Some(ModelKind::default_lstm()),
    };
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let env_filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("foliocast=info")),
    };
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut cfg = PipelineConfig::load(cli.config.as_deref())?;
    if cli.cuda {
        if !cfg!(feature = "cuda") {
            bail!("--cuda was requested, but this binary was compiled without CUDA support. Rebuild with --features cuda");
        }
        cfg.forecast.use_cuda = true;
    }

    match cli.command {
        Command::Fetch { symbols, start, end, out_dir } => fetch(&symbols, start, end, &out_dir).await,
        Command::Preprocess { files, out_dir, calendar, align } => {
            if let Some(c) = calendar {
                cfg.preprocess.calendar = match c {
                    CalendarArg::Weekdays => CalendarPolicy::Weekdays,
                    CalendarArg::AsIs => CalendarPolicy::AsIs,
                };
            }
            let raws = pipeline::load_instruments(&files);
            if raws.is_empty() {
                bail!("no input file could be loaded");
            }
            let instruments = pipeline::clean_instruments(&raws, &cfg, align)?;
            if instruments.is_empty() {
                bail!("no instrument survived cleaning");
            }
            pipeline::write_cleaned(&out_dir, &instruments)?;
            info!("Wrote {} cleaned instruments to {}", instruments.len(), out_dir.display());
            Ok(())
        }
        Command::Analyze { files, out, period } => analyze(&files, &cfg, out.as_deref(), period),
        Command::Forecast { file, model, opts, out_dir } => {
            opts.apply(&mut cfg);
            if let Some(m) = model {
                apply_model(&mut cfg, m);
            }
            forecast_one(&file, &cfg, &out_dir)
        }
        Command::Evaluate { actual, forecast, target, out } => {
            if let Some(t) = target {
                cfg.forecast.target = t.into();
            }
            evaluate_file(&actual, &forecast, &cfg, out.as_deref())
        }
        Command::Optimize { files, forecast_dir, objective, target_return, allow_short, out_dir } => {
            if let Some(o) = objective {
                cfg.portfolio.objective = match o {
                    ObjectiveArg::MaxSharpe => ObjectiveKind::MaxSharpe,
                    ObjectiveArg::MinVariance => ObjectiveKind::MinVariance,
                };
            }
            if target_return.is_some() {
                cfg.portfolio.target_return = target_return;
            }
            cfg.portfolio.allow_short |= allow_short;
            optimize(&files, forecast_dir.as_deref(), &cfg, &out_dir)
        }
        Command::Run { files, opts, out_dir } => {
            opts.apply(&mut cfg);
            let report = pipeline::run(&files, &cfg, &out_dir)?;
            info!(
                "Run complete: {} instruments allocated, artifacts in {}",
                report.instruments.len(),
                out_dir.display()
            );
            Ok(())
        }
    }
}

async fn fetch(symbols: &[String], start: NaiveDate, end: NaiveDate, out_dir: &Path) -> Result<()> {
    if start >= end {
        bail!("--start {} must be before --end {}", start, end);
    }
    let client = reqwest::Client::builder()
        .user_agent("Mozilla/5.0")
        .build()
        .context("building HTTP client")?;

    let mut failures = 0usize;
    for symbol in symbols.iter().map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty()) {
        match data::fetch_history(&client, &symbol, start, end).await {
            Ok(raw) => {
                let path = out_dir.join(format!("{}.csv", symbol));
                data::write_raw_csv(&path, &raw).with_context(|| format!("writing {}", path.display()))?;
                info!("{}: wrote {} rows to {}", symbol, raw.bars.len(), path.display());
            }
            Err(e) => {
                error!("{}: {:#}", symbol, e);
                failures += 1;
            }
        }
    }
    if failures == symbols.len() {
        bail!("every download failed");
    }
    Ok(())
}

#[derive(Serialize)]
struct AnalysisEntry {
    summary: analysis::InstrumentSummary,
    decomposition: Option<analysis::Decomposition>,
}

fn analyze(files: &[PathBuf], cfg: &PipelineConfig, out: Option<&Path>, period: usize) -> Result<()> {
    let raws = pipeline::load_instruments(files);
    let instruments = pipeline::clean_instruments(&raws, cfg, false)?;
    if instruments.is_empty() {
        bail!("no instrument could be loaded and cleaned");
    }

    let field = cfg.loader.price_field;
    let mut entries = Vec::with_capacity(instruments.len());
    for inst in &instruments {
        let summary = match analysis::summarize(inst.series(), field, cfg.portfolio.risk_free_rate) {
            Ok(s) => s,
            Err(e) => {
                error!("{}: {}", inst.symbol(), e);
                continue;
            }
        };
        analysis::print_summary(&summary);
        let decomposition = match analysis::seasonal_decompose(&inst.series().prices(field), period) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!("{}: seasonal decomposition skipped: {}", inst.symbol(), e);
                None
            }
        };
        entries.push(AnalysisEntry { summary, decomposition });
    }

    if let Some(path) = out {
        report::write_json(path, &entries)?;
    }
    Ok(())
}

fn forecast_one(file: &Path, cfg: &PipelineConfig, out_dir: &Path) -> Result<()> {
    let raw = data::load_csv(file)?;
    let instruments = pipeline::clean_instruments(std::slice::from_ref(&raw), cfg, false)?;
    let Some(inst) = instruments.first() else {
        bail!("{}: could not be cleaned", file.display());
    };
    let field = cfg.loader.price_field;
    let symbol = inst.symbol();

    let bt = forecast::backtest(inst.series(), field, &cfg.forecast)?;
    evaluate::print_report(&bt.accuracy);
    report::write_forecast_csv(&out_dir.join("backtests").join(format!("{}_backtest.csv", symbol)), &bt.forecast)?;
    report::write_json(&out_dir.join(format!("{}_accuracy.json", symbol)), &bt.accuracy)?;

    let result = forecast::forecast_series(inst.series(), field, &cfg.forecast)?;
    report::write_forecast_csv(&out_dir.join("forecasts").join(format!("{}_forecast.csv", symbol)), &result)?;
    let last = inst.series().last().map(|b| b.price(field)).unwrap_or(0.0);
    match result.expected_annual_return(last) {
        Some(er) => info!("{} {}: expected annual return {:+.2}%", symbol, result.model, er * 100.0),
        None => warn!("{}: forecast implies no expected return", symbol),
    }
    Ok(())
}

fn evaluate_file(actual: &Path, forecast_path: &Path, cfg: &PipelineConfig, out: Option<&Path>) -> Result<()> {
    let raw = data::load_csv(actual)?;
    let series = preprocess::clean_on_calendar(
        &raw,
        &preprocess::trading_calendar(&raw, CalendarPolicy::AsIs),
        &cfg.preprocess,
    )?
    .series;
    let values = forecast::target_values(&series, cfg.loader.price_field, cfg.forecast.target);

    let predicted = report::read_forecast_csv(forecast_path, series.symbol(), cfg.forecast.target, cfg.forecast.confidence)?;
    let wanted = predicted.dates();
    let actual_pairs: Vec<(NaiveDate, f64)> = values.into_iter().filter(|(d, _)| wanted.contains(d)).collect();
    if actual_pairs.len() < wanted.len() {
        warn!(
            "{}: only {} of {} forecast dates have actual values",
            series.symbol(),
            actual_pairs.len(),
            wanted.len()
        );
    }
    let dates: Vec<NaiveDate> = actual_pairs.iter().map(|(d, _)| *d).collect();
    let report = evaluate::evaluate(&actual_pairs, &predicted.restrict_to(&dates))?;
    evaluate::print_report(&report);
    if let Some(path) = out {
        report::write_json(path, &report)?;
    }
    Ok(())
}

fn optimize(files: &[PathBuf], forecast_dir: Option<&Path>, cfg: &PipelineConfig, out_dir: &Path) -> Result<()> {
    let raws = pipeline::load_instruments(files);
    let instruments = pipeline::clean_instruments(&raws, cfg, true)?;

    let mut kept = Vec::with_capacity(instruments.len());
    let mut expected = Vec::with_capacity(instruments.len());
    for inst in &instruments {
        let forecast = forecast_dir.and_then(|dir| {
            let path = dir.join(format!("{}_forecast.csv", inst.symbol()));
            if !path.exists() {
                return None;
            }
            report::read_forecast_csv(&path, inst.symbol(), cfg.forecast.target, cfg.forecast.confidence)
                .map_err(|e| error!("{}: {}", path.display(), e))
                .ok()
        });
        match pipeline::expected_return(inst, forecast.as_ref(), cfg) {
            Some(er) => {
                kept.push(inst);
                expected.push(er);
            }
            None => error!("{}: no forecast and historical fallback is disabled. Dropping instrument.", inst.symbol()),
        }
    }

    let allocation = pipeline::allocate(&kept, &expected, cfg)?;
    report::write_allocation_csv(&out_dir.join("allocation.csv"), &allocation)?;
    report::write_json(&out_dir.join("allocation.json"), &allocation)?;
    let er: Vec<(String, f64)> = kept.iter().map(|i| i.symbol().to_string()).zip(expected).collect();
    portfolio::print_allocation(&allocation, &er);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_optimize() {
        let cli = Cli::parse_from([
            "foliocast",
            "optimize",
            "a.csv",
            "b.csv",
            "--objective",
            "min-variance",
            "--target-return",
            "0.08",
        ]);
        match cli.command {
            Command::Optimize { files, objective, target_return, .. } => {
                assert_eq!(files.len(), 2);
                assert!(matches!(objective, Some(ObjectiveArg::MinVariance)));
                assert_eq!(target_return, Some(0.08));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_fetch_defaults_to_reference_symbols() {
        let cli = Cli::parse_from(["foliocast", "fetch"]);
        match cli.command {
            Command::Fetch { symbols, start, .. } => {
                assert_eq!(symbols, vec!["TSLA", "BND", "SPY"]);
                assert_eq!(start, NaiveDate::from_ymd_opt(2015, 1, 1).unwrap());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_rejects_reversed_range_before_downloading() {
        let dir = tempfile::tempdir().unwrap();
        let start = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let err = fetch(&["SPY".to_string()], start, end, dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("must be before"), "unexpected error: {}", err);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none(), "nothing should be written");
    }

    #[test]
    fn test_model_flag_keeps_configured_order() {
        let mut cfg = PipelineConfig::default();
        cfg.forecast.model = Some(ModelKind::Arima { p: 2, d: 1, q: 0 });
        apply_model(&mut cfg, ModelArg::Arima);
        assert_eq!(cfg.forecast.model, Some(ModelKind::Arima { p: 2, d: 1, q: 0 }));

        apply_model(&mut cfg, ModelArg::Sarima);
        assert!(matches!(cfg.forecast.model, Some(ModelKind::Sarima { period: 5, .. })));

        apply_model(&mut cfg, ModelArg::Auto);
        assert!(cfg.forecast.model.is_none());
        assert!(cfg.forecast.auto_select);
    }

    #[test]
    fn test_model_flag_follows_log_return_target() {
        let mut cfg = PipelineConfig::default();
        cfg.forecast.target = ForecastTarget::LogReturn;
        apply_model(&mut cfg, ModelArg::Arima);
        assert_eq!(cfg.forecast.model, Some(ModelKind::Arima { p: 1, d: 0, q: 1 }));
        assert!(!cfg.forecast.auto_select);
    }
}
