//! Stage orchestration shared by the CLI commands.
//!
//! Per-instrument failures are logged and the instrument is dropped; failures that affect
//! the whole universe (no common calendar, optimizer) end the run.

use crate::analysis::{self, InstrumentSummary};
use crate::config::PipelineConfig;
use crate::data::{self, PriceSeries, RawPriceSeries};
use crate::evaluate::{self, AccuracyReport};
use crate::forecast::{self, ForecastResult};
use crate::portfolio::{self, Objective, OptimizerInputs, PortfolioAllocation};
use crate::preprocess::{self, Cleaned, ReturnKind, ReturnSeries};
use crate::report;
use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// One cleaned instrument with its derived returns.
pub struct Instrument {
    pub cleaned: Cleaned,
    pub returns: ReturnSeries,
}

impl Instrument {
    pub fn symbol(&self) -> &str {
        self.cleaned.series.symbol()
    }

    pub fn series(&self) -> &PriceSeries {
        &self.cleaned.series
    }
}

/// Loads every file, logging and skipping the ones that fail.
pub fn load_instruments(paths: &[PathBuf]) -> Vec<RawPriceSeries> {
    let mut loaded: Vec<RawPriceSeries> = Vec::with_capacity(paths.len());
    for path in paths {
        match data::load_csv(path) {
            Ok(raw) if loaded.iter().any(|r| r.symbol == raw.symbol) => {
                warn!("{}: duplicate symbol {}. Skipping.", path.display(), raw.symbol);
            }
            Ok(raw) => loaded.push(raw),
            Err(e) => error!("{}: {} ({}). Skipping.", path.display(), e, e.kind()),
        }
    }
    loaded
}

/// Cleans instruments, optionally onto one shared calendar trimmed to a common start.
pub fn clean_instruments(raws: &[RawPriceSeries], cfg: &PipelineConfig, align: bool) -> Result<Vec<Instrument>> {
    let field = cfg.loader.price_field;
    let instruments: Vec<Instrument> = if align {
        preprocess::align_calendars(raws, &cfg.preprocess)?
            .into_iter()
            .map(|cleaned| {
                let returns = preprocess::compute_returns(&cleaned.series, field, cfg.preprocess.return_kind);
                Instrument { cleaned, returns }
            })
            .collect()
    } else {
        raws.iter()
            .filter_map(|raw| match preprocess::preprocess(raw, &cfg.preprocess, field) {
                Ok((cleaned, returns)) => Some(Instrument { cleaned, returns }),
                Err(e) => {
                    error!("{}: {} ({}). Dropping instrument.", raw.symbol, e, e.kind());
                    None
                }
            })
            .collect()
    };

    for inst in &instruments {
        let report = &inst.cleaned.report;
        info!(
            "{}: {} bars ({} cells filled, {} dates filled, {:.2}% missing)",
            inst.symbol(),
            report.output_rows,
            report.filled_cells,
            report.filled_dates,
            report.missing_fraction * 100.0
        );
    }
    Ok(instruments)
}

pub fn write_cleaned(out_dir: &Path, instruments: &[Instrument]) -> Result<()> {
    for inst in instruments {
        let path = out_dir.join("cleaned").join(format!("{}.csv", inst.symbol()));
        data::write_csv(&path, inst.series()).with_context(|| format!("writing {}", path.display()))?;
        let path = out_dir.join("returns").join(format!("{}_returns.csv", inst.symbol()));
        report::write_returns_csv(&path, &inst.returns).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

/// Expected annual return per instrument, from its forecast or, when allowed, its history.
pub fn expected_return(
    inst: &Instrument,
    forecast: Option<&ForecastResult>,
    cfg: &PipelineConfig,
) -> Option<f64> {
    let last = inst.series().last().map(|b| b.price(cfg.loader.price_field)).unwrap_or(0.0);
    if let Some(er) = forecast.and_then(|f| f.expected_annual_return(last)) {
        return Some(er);
    }
    if cfg.portfolio.historical_fallback {
        let simple = preprocess::compute_returns(inst.series(), cfg.loader.price_field, ReturnKind::Simple);
        let er = portfolio::historical_expected_return(&simple);
        if let Some(er) = er {
            warn!("{}: no usable forecast, using historical mean return {:+.4}", inst.symbol(), er);
        }
        return er;
    }
    None
}

/// Optimizes over instruments that share a return index.
pub fn allocate(instruments: &[&Instrument], expected: &[f64], cfg: &PipelineConfig) -> Result<PortfolioAllocation> {
    if instruments.is_empty() {
        bail!("no instruments left to allocate");
    }
    // Covariance always uses simple returns on the shared index.
    let returns: Vec<ReturnSeries> = instruments
        .iter()
        .map(|i| preprocess::compute_returns(i.series(), cfg.loader.price_field, ReturnKind::Simple))
        .collect();
    let covariance = portfolio::covariance_matrix(&returns)?;
    let inputs = OptimizerInputs {
        symbols: instruments.iter().map(|i| i.symbol().to_string()).collect(),
        expected_returns: expected.to_vec(),
        covariance,
        risk_free_rate: cfg.portfolio.risk_free_rate,
        allow_short: cfg.portfolio.allow_short,
    };
    Ok(portfolio::optimize(&inputs, &Objective::from_config(&cfg.portfolio))?)
}

// ──────────────────────────────────────────────────────────────────────────────
// Full Run
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct InstrumentReport {
    pub symbol: String,
    pub summary: InstrumentSummary,
    pub accuracy: Option<AccuracyReport>,
    pub model: Option<String>,
    pub expected_annual_return: f64,
}

#[derive(Serialize)]
pub struct RunReport {
    pub instruments: Vec<InstrumentReport>,
    pub allocation: PortfolioAllocation,
}

/// Load → clean → analyze → backtest → forecast → optimize, writing every artifact under `out_dir`.
pub fn run(paths: &[PathBuf], cfg: &PipelineConfig, out_dir: &Path) -> Result<RunReport> {
    let raws = load_instruments(paths);
    if raws.is_empty() {
        bail!("none of the {} input files could be loaded", paths.len());
    }
    let instruments = clean_instruments(&raws, cfg, true)?;
    if instruments.is_empty() {
        bail!("no instrument survived cleaning");
    }
    write_cleaned(out_dir, &instruments)?;

    let field = cfg.loader.price_field;
    let mut kept: Vec<&Instrument> = Vec::new();
    let mut expected: Vec<f64> = Vec::new();
    let mut reports: Vec<InstrumentReport> = Vec::new();

    for inst in &instruments {
        let symbol = inst.symbol().to_string();
        let summary = match analysis::summarize(inst.series(), field, cfg.portfolio.risk_free_rate) {
            Ok(s) => s,
            Err(e) => {
                error!("{}: analysis failed: {} ({}). Dropping instrument.", symbol, e, e.kind());
                continue;
            }
        };

        let accuracy = match forecast::backtest(inst.series(), field, &cfg.forecast) {
            Ok(bt) => {
                let path = out_dir.join("backtests").join(format!("{}_backtest.csv", symbol));
                report::write_forecast_csv(&path, &bt.forecast)?;
                Some(bt.accuracy)
            }
            Err(e) if cfg.portfolio.historical_fallback => {
                error!("{}: backtest failed: {} ({})", symbol, e, e.kind());
                None
            }
            Err(e) => {
                error!("{}: backtest failed: {} ({}). Dropping instrument.", symbol, e, e.kind());
                continue;
            }
        };

        let forecast = match forecast::forecast_series(inst.series(), field, &cfg.forecast) {
            Ok(f) => {
                let path = out_dir.join("forecasts").join(format!("{}_forecast.csv", symbol));
                report::write_forecast_csv(&path, &f)?;
                Some(f)
            }
            Err(e) => {
                error!("{}: forecast failed: {} ({})", symbol, e, e.kind());
                None
            }
        };

        let Some(er) = expected_return(inst, forecast.as_ref(), cfg) else {
            error!("{}: no expected return available. Dropping instrument.", symbol);
            continue;
        };

        kept.push(inst);
        expected.push(er);
        reports.push(InstrumentReport {
            symbol,
            summary,
            accuracy,
            model: forecast.map(|f| f.model),
            expected_annual_return: er,
        });
    }

    let allocation = allocate(&kept, &expected, cfg).context("portfolio optimization failed")?;

    let summaries: Vec<&InstrumentSummary> = reports.iter().map(|r| &r.summary).collect();
    report::write_json(&out_dir.join("analysis.json"), &summaries)?;
    let accuracies: Vec<&AccuracyReport> = reports.iter().filter_map(|r| r.accuracy.as_ref()).collect();
    report::write_json(&out_dir.join("accuracy.json"), &accuracies)?;
    report::write_allocation_csv(&out_dir.join("allocation.csv"), &allocation)?;
    report::write_json(&out_dir.join("allocation.json"), &allocation)?;

    for r in &reports {
        analysis::print_summary(&r.summary);
    }
    println!();
    for a in &accuracies {
        evaluate::print_report(a);
    }
    let er: Vec<(String, f64)> = reports.iter().map(|r| (r.symbol.clone(), r.expected_annual_return)).collect();
    portfolio::print_allocation(&allocation, &er);

    let run = RunReport { instruments: reports, allocation };
    report::write_json(&out_dir.join("run.json"), &run)?;
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_mock(dir: &Path, symbol: &str, days: usize, seed: u64) -> PathBuf {
        let path = dir.join(format!("{}.csv", symbol));
        data::write_csv(&path, &data::mock_series(symbol, days, seed)).unwrap();
        path
    }

    #[test]
    fn test_run_writes_artifacts_and_valid_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![
            write_mock(dir.path(), "TSLA", 260, 1),
            write_mock(dir.path(), "BND", 260, 2),
            write_mock(dir.path(), "SPY", 240, 3),
            dir.path().join("MISSING.csv"),
        ];
        let out = dir.path().join("out");
        let mut cfg = PipelineConfig::default();
        cfg.forecast.horizon = 5;
        cfg.forecast.model = Some(forecast::ModelKind::Arima { p: 1, d: 1, q: 0 });

        let run = run(&paths, &cfg, &out).unwrap();
        assert_eq!(run.instruments.len(), 3);
        let sum: f64 = run.allocation.weights.iter().map(|(_, w)| w).sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(run.allocation.weights.iter().all(|(_, w)| *w >= 0.0));

        for file in ["allocation.csv", "allocation.json", "accuracy.json", "analysis.json", "cleaned/SPY.csv", "forecasts/TSLA_forecast.csv", "returns/BND_returns.csv"] {
            assert!(out.join(file).exists(), "missing {}", file);
        }
    }

    #[test]
    fn test_bad_instrument_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_mock(dir.path(), "SPY", 120, 4);
        let bad = dir.path().join("BAD.csv");
        std::fs::write(&bad, "Date,Open,High,Low,Close,Adj Close,Volume\n2020-01-06,1,1,1,-5,1,10\n").unwrap();

        let raws = load_instruments(&[good, bad]);
        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].symbol, "SPY");
    }
}
