use crate::data::DATE_FORMAT;
use crate::error::{PipelineError, Result};
use crate::forecast::{ForecastPoint, ForecastResult, ForecastTarget};
use crate::portfolio::PortfolioAllocation;
use crate::preprocess::ReturnSeries;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tracing::info;

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[derive(Serialize)]
struct ReturnRow {
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Return")]
    value: f64,
}

pub fn write_returns_csv(path: &Path, returns: &ReturnSeries) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for p in &returns.points {
        writer.serialize(ReturnRow { date: p.date.format(DATE_FORMAT).to_string(), value: p.value })?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct ForecastRow {
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Forecast")]
    point: f64,
    #[serde(rename = "Lower")]
    lower: f64,
    #[serde(rename = "Upper")]
    upper: f64,
}

pub fn write_forecast_csv(path: &Path, forecast: &ForecastResult) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for p in forecast.points() {
        writer.serialize(ForecastRow {
            date: p.date.format(DATE_FORMAT).to_string(),
            point: p.point,
            lower: p.lower,
            upper: p.upper,
        })?;
    }
    writer.flush()?;
    info!("Wrote {} forecast rows to {}", forecast.horizon(), path.display());
    Ok(())
}

/// Reads a `Date,Forecast,Lower,Upper` file back into a validated result.
pub fn read_forecast_csv(path: &Path, symbol: &str, target: ForecastTarget, confidence: f64) -> Result<ForecastResult> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut points = Vec::new();
    for row in reader.deserialize::<ForecastRow>() {
        let row = row?;
        let date = NaiveDate::parse_from_str(row.date.trim(), DATE_FORMAT).map_err(|e| {
            PipelineError::DataQuality(format!("{}: bad forecast date '{}': {}", path.display(), row.date, e))
        })?;
        points.push(ForecastPoint { date, point: row.point, lower: row.lower, upper: row.upper });
    }
    if points.is_empty() {
        return Err(PipelineError::DataQuality(format!("{}: no forecast rows", path.display())));
    }
    ForecastResult::new(symbol, "file", target, confidence, points)
}

#[derive(Serialize)]
struct AllocationRow<'a> {
    #[serde(rename = "Symbol")]
    symbol: &'a str,
    #[serde(rename = "Weight")]
    weight: f64,
}

pub fn write_allocation_csv(path: &Path, allocation: &PortfolioAllocation) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for (symbol, weight) in &allocation.weights {
        writer.serialize(AllocationRow { symbol, weight: *weight })?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    let file = std::fs::File::create(path)?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|e| PipelineError::Io(std::io::Error::other(e)))?;
    writer.flush()?;
    info!("Wrote {}", path.display());
    Ok(())
}
