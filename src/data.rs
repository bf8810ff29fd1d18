use crate::error::{PipelineError, Result};
use anyhow::Context;
use chrono::{DateTime, NaiveDate};
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Price column used for returns, forecasts and covariance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceField {
    Close,
    AdjClose,
}

/// One row as read from disk. `None` marks an empty or non-numeric cell.
#[derive(Clone, Debug, PartialEq)]
pub struct RawBar {
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    pub volume: Option<f64>,
}

impl RawBar {
    pub const FIELDS: usize = 6;

    pub fn missing_cells(&self) -> usize {
        [self.open, self.high, self.low, self.close, self.adj_close, self.volume]
            .iter()
            .filter(|v| v.is_none())
            .count()
    }
}

/// Loader output: validated dates, possibly incomplete values.
#[derive(Clone, Debug)]
pub struct RawPriceSeries {
    pub symbol: String,
    pub bars: Vec<RawBar>,
    /// Cells that held text which did not parse as a number.
    pub non_numeric_cells: usize,
}

impl RawPriceSeries {
    pub fn missing_cells(&self) -> usize {
        self.bars.iter().map(RawBar::missing_cells).sum()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.bars.first().map(|b| b.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.bars.last().map(|b| b.date)
    }
}

/// Represents a single daily OHLCV record.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: f64,
    pub volume: u64,
}

impl PriceBar {
    pub fn price(&self, field: PriceField) -> f64 {
        match field {
            PriceField::Close => self.close,
            PriceField::AdjClose => self.adj_close,
        }
    }
}

/// Complete daily history for one instrument.
///
/// Dates are strictly increasing, every price is finite and non-negative, and
/// close and adjusted close are strictly positive so returns are always defined.
/// The bars cannot be mutated once the series is built.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceSeries {
    symbol: String,
    bars: Vec<PriceBar>,
}

impl PriceSeries {
    pub fn new(symbol: impl Into<String>, bars: Vec<PriceBar>) -> Result<Self> {
        let symbol = symbol.into();
        for (i, bar) in bars.iter().enumerate() {
            let prices = [bar.open, bar.high, bar.low, bar.close, bar.adj_close];
            if prices.iter().any(|p| !p.is_finite() || *p < 0.0) {
                return Err(PipelineError::DataQuality(format!(
                    "{}: invalid price on {}",
                    symbol, bar.date
                )));
            }
            if bar.close <= 0.0 || bar.adj_close <= 0.0 {
                return Err(PipelineError::DataQuality(format!(
                    "{}: non-positive close on {}",
                    symbol, bar.date
                )));
            }
            if i > 0 && bars[i - 1].date >= bar.date {
                return Err(PipelineError::DataQuality(format!(
                    "{}: dates must be strictly increasing ({} followed by {})",
                    symbol,
                    bars[i - 1].date,
                    bar.date
                )));
            }
        }
        Ok(Self { symbol, bars })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn bars(&self) -> &[PriceBar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn first(&self) -> Option<&PriceBar> {
        self.bars.first()
    }

    pub fn last(&self) -> Option<&PriceBar> {
        self.bars.last()
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.bars.iter().map(|b| b.date).collect()
    }

    pub fn prices(&self, field: PriceField) -> Vec<f64> {
        self.bars.iter().map(|b| b.price(field)).collect()
    }

    /// Keeps only bars dated on or after `start`.
    pub fn since(&self, start: NaiveDate) -> Self {
        Self {
            symbol: self.symbol.clone(),
            bars: self.bars.iter().filter(|b| b.date >= start).cloned().collect(),
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// CSV loading
// ──────────────────────────────────────────────────────────────────────────────

struct ColumnMap {
    date: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    adj_close: Option<usize>,
    volume: usize,
}

impl ColumnMap {
    fn from_headers(headers: &StringRecord, symbol: &str) -> Result<Self> {
        let find = |names: &[&str]| {
            headers.iter().position(|h| {
                let h = h.trim().to_ascii_lowercase();
                names.iter().any(|n| *n == h)
            })
        };
        let require = |names: &[&str], label: &str| {
            find(names).ok_or_else(|| {
                PipelineError::DataQuality(format!("{}: missing required column '{}'", symbol, label))
            })
        };

        Ok(Self {
            date: require(&["date", "datetime", "timestamp"], "Date")?,
            open: require(&["open"], "Open")?,
            high: require(&["high"], "High")?,
            low: require(&["low"], "Low")?,
            close: require(&["close"], "Close")?,
            adj_close: find(&["adj close", "adj_close", "adjclose", "adjusted_close"]),
            volume: require(&["volume"], "Volume")?,
        })
    }
}

enum Cell {
    Value(f64),
    Empty,
    NonNumeric,
}

fn parse_cell(raw: Option<&str>) -> Cell {
    let text = raw.map(str::trim).unwrap_or("");
    if text.is_empty()
        || text.eq_ignore_ascii_case("nan")
        || text.eq_ignore_ascii_case("null")
        || text.eq_ignore_ascii_case("na")
    {
        return Cell::Empty;
    }
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() => Cell::Value(v),
        Ok(_) => Cell::Empty,
        Err(_) => Cell::NonNumeric,
    }
}

/// Parses an ISO-8601 date; a time or offset suffix after the day is ignored.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    let day = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(day, DATE_FORMAT).ok()
}

/// Derives the instrument symbol from a file name such as `data/TSLA.csv`.
pub fn symbol_from_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.trim_end_matches("_forecast").to_uppercase())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

/// Loads OHLCV rows for one instrument.
///
/// Empty and non-numeric cells become `None` and are left for the preprocessor to fill.
/// A missing column, a bad date, a duplicate date, or a negative value is a data quality error.
pub fn load_csv(path: &Path) -> Result<RawPriceSeries> {
    let symbol = symbol_from_path(path);
    load_csv_as(path, &symbol)
}

pub fn load_csv_as(path: &Path, symbol: &str) -> Result<RawPriceSeries> {
    info!("Loading {} from {}", symbol, path.display());

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_path(path)?;

    let columns = ColumnMap::from_headers(reader.headers()?, symbol)?;
    let mut bars = Vec::new();
    let mut non_numeric_cells = 0usize;

    for (row_idx, record) in reader.records().enumerate() {
        let record = record?;
        let line = row_idx + 2;

        let date_text = record.get(columns.date).unwrap_or("");
        let date = parse_date(date_text).ok_or_else(|| {
            PipelineError::DataQuality(format!(
                "{}: unparseable date '{}' on line {}",
                symbol, date_text, line
            ))
        })?;

        let mut read = |idx: usize, label: &str| -> Result<Option<f64>> {
            match parse_cell(record.get(idx)) {
                Cell::Value(v) if v < 0.0 => Err(PipelineError::DataQuality(format!(
                    "{}: negative {} ({}) on {}",
                    symbol, label, v, date
                ))),
                Cell::Value(v) => Ok(Some(v)),
                Cell::Empty => Ok(None),
                Cell::NonNumeric => {
                    non_numeric_cells += 1;
                    debug!("{}: non-numeric {} on line {}", symbol, label, line);
                    Ok(None)
                }
            }
        };

        let open = read(columns.open, "open")?;
        let high = read(columns.high, "high")?;
        let low = read(columns.low, "low")?;
        let close = read(columns.close, "close")?;
        let adj_close = match columns.adj_close {
            Some(idx) => read(idx, "adj close")?,
            None => close,
        };
        let volume = read(columns.volume, "volume")?;
        if let Some(v) = volume.filter(|v| v.fract() != 0.0) {
            return Err(PipelineError::DataQuality(format!(
                "{}: volume {} on {} is not a whole number",
                symbol, v, date
            )));
        }

        bars.push(RawBar { date, open, high, low, close, adj_close, volume });
    }

    if columns.adj_close.is_none() {
        warn!("{}: no 'Adj Close' column, using Close", symbol);
    }

    bars.sort_by_key(|b| b.date);
    if let Some(w) = bars.windows(2).find(|w| w[0].date == w[1].date) {
        return Err(PipelineError::DataQuality(format!(
            "{}: duplicate date {}",
            symbol, w[0].date
        )));
    }
    if bars.is_empty() {
        return Err(PipelineError::DataQuality(format!("{}: no rows in {}", symbol, path.display())));
    }

    info!(
        "Loaded {} rows for {} ({} to {})",
        bars.len(),
        symbol,
        bars[0].date,
        bars[bars.len() - 1].date
    );

    Ok(RawPriceSeries {
        symbol: symbol.to_string(),
        bars,
        non_numeric_cells,
    })
}

#[derive(Serialize)]
struct CsvRow {
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Open")]
    open: Option<f64>,
    #[serde(rename = "High")]
    high: Option<f64>,
    #[serde(rename = "Low")]
    low: Option<f64>,
    #[serde(rename = "Close")]
    close: Option<f64>,
    #[serde(rename = "Adj Close")]
    adj_close: Option<f64>,
    #[serde(rename = "Volume")]
    volume: Option<u64>,
}

fn write_rows(path: &Path, rows: impl Iterator<Item = CsvRow>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_csv(path: &Path, series: &PriceSeries) -> Result<()> {
    if series.is_empty() {
        return Err(PipelineError::DataQuality(format!("{}: no bars to write", series.symbol())));
    }
    write_rows(
        path,
        series.bars().iter().map(|b| CsvRow {
            date: b.date.format(DATE_FORMAT).to_string(),
            open: Some(b.open),
            high: Some(b.high),
            low: Some(b.low),
            close: Some(b.close),
            adj_close: Some(b.adj_close),
            volume: Some(b.volume),
        }),
    )
}

pub fn write_raw_csv(path: &Path, series: &RawPriceSeries) -> Result<()> {
    write_rows(
        path,
        series.bars.iter().map(|b| CsvRow {
            date: b.date.format(DATE_FORMAT).to_string(),
            open: b.open,
            high: b.high,
            low: b.low,
            close: b.close,
            adj_close: b.adj_close,
            volume: b.volume.map(|v| v.round() as u64),
        }),
    )
}

// ──────────────────────────────────────────────────────────────────────────────
// Market-data provider (Yahoo Finance chart endpoint)
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct YahooChartResponse {
    chart: YahooChart,
}

#[derive(Deserialize, Debug)]
struct YahooChart {
    result: Option<Vec<YahooResult>>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct YahooResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: YahooIndicators,
}

#[derive(Deserialize, Debug)]
struct YahooIndicators {
    quote: Vec<YahooQuote>,
    #[serde(default)]
    adjclose: Vec<YahooAdjClose>,
}

#[derive(Deserialize, Debug)]
struct YahooQuote {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<f64>>,
}

#[derive(Deserialize, Debug)]
struct YahooAdjClose {
    adjclose: Vec<Option<f64>>,
}

fn yahoo_to_raw_series(symbol: &str, response: YahooChartResponse) -> anyhow::Result<RawPriceSeries> {
    if let Some(err) = response.chart.error.filter(|e| !e.is_null()) {
        anyhow::bail!("Yahoo returned an error for {}: {}", symbol, err);
    }
    let result = response
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| anyhow::anyhow!("No data found for {}", symbol))?;
    let quote = result
        .indicators
        .quote
        .first()
        .ok_or_else(|| anyhow::anyhow!("No quote block for {}", symbol))?;
    let adjclose = result.indicators.adjclose.first();

    let at = |v: &[Option<f64>], i: usize| v.get(i).copied().flatten();

    let mut bars = Vec::with_capacity(result.timestamp.len());
    for (i, &ts) in result.timestamp.iter().enumerate() {
        let Some(dt) = DateTime::from_timestamp(ts, 0) else {
            warn!("{}: skipping out-of-range timestamp {}", symbol, ts);
            continue;
        };
        let close = at(&quote.close, i);
        bars.push(RawBar {
            date: dt.date_naive(),
            open: at(&quote.open, i),
            high: at(&quote.high, i),
            low: at(&quote.low, i),
            close,
            adj_close: adjclose.map(|a| at(&a.adjclose, i)).unwrap_or(close),
            volume: at(&quote.volume, i),
        });
    }
    bars.dedup_by_key(|b| b.date);

    Ok(RawPriceSeries {
        symbol: symbol.to_uppercase(),
        bars,
        non_numeric_cells: 0,
    })
}

/// Downloads daily bars for `symbol` between `start` and `end` (exclusive).
pub async fn fetch_history(
    client: &reqwest::Client,
    symbol: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> anyhow::Result<RawPriceSeries> {
    let to_ts = |d: NaiveDate| d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp()).unwrap_or(0);
    let url = format!(
        "https://query1.finance.yahoo.com/v8/finance/chart/{}?period1={}&period2={}&interval=1d&events=div%2Csplits",
        symbol,
        to_ts(start),
        to_ts(end)
    );

    let mut attempts = 0;
    let max_attempts = 3;

    loop {
        attempts += 1;
        info!("Fetching {} from {} to {} (attempt {}/{})", symbol, start, end, attempts, max_attempts);
        let outcome = async {
            let resp = client
                .get(&url)
                .header("User-Agent", "Mozilla/5.0")
                .send()
                .await?
                .error_for_status()?;
            resp.json::<YahooChartResponse>().await
        }
        .await;

        match outcome {
            Ok(response) => {
                let series = yahoo_to_raw_series(symbol, response)?;
                info!("Fetched {} rows for {}", series.bars.len(), symbol);
                return Ok(series);
            }
            Err(e) => {
                if attempts >= max_attempts {
                    return Err(e).with_context(|| format!("fetching {} from Yahoo Finance", symbol));
                }
                warn!("Failed to fetch data for {} (attempt {}/{}): {}", symbol, attempts, max_attempts, e);
            }
        }

        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    }
}

#[cfg(test)]
pub fn mock_series(symbol: &str, days: usize, seed: u64) -> PriceSeries {
    use rand::{Rng, SeedableRng, rngs::StdRng};

    let mut rng = StdRng::seed_from_u64(seed);
    let mut bars = Vec::with_capacity(days);
    let mut price: f64 = 100.0;
    let mut date = NaiveDate::from_ymd_opt(2020, 1, 6).unwrap();

    while bars.len() < days {
        if crate::preprocess::is_weekday(date) {
            let change: f64 = rng.gen_range(-0.02..0.021);
            let open = price;
            let close = open * (1.0 + change);
            bars.push(PriceBar {
                date,
                open,
                high: open.max(close) * (1.0 + rng.gen_range(0.0..0.01)),
                low: open.min(close) * (1.0 - rng.gen_range(0.0..0.01)),
                close,
                adj_close: close,
                volume: rng.gen_range(1_000..10_000),
            });
            price = close;
        }
        date = date.succ_opt().unwrap();
    }

    PriceSeries::new(symbol, bars).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_csv_parses_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "TSLA.csv",
            "Date,Open,High,Low,Close,Adj Close,Volume\n\
             2024-01-03,10,11,9,10.5,10.4,1000\n\
             2024-01-02,9,10,8,9.5,9.4,900\n",
        );

        let raw = load_csv(&path).unwrap();
        assert_eq!(raw.symbol, "TSLA");
        assert_eq!(raw.bars.len(), 2);
        assert_eq!(raw.bars[0].date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(raw.bars[1].adj_close, Some(10.4));
        assert_eq!(raw.missing_cells(), 0);
    }

    #[test]
    fn test_load_csv_marks_missing_and_non_numeric() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "SPY.csv",
            "Date,Open,High,Low,Close,Adj Close,Volume\n\
             2024-01-02,1,1,1,1,1,10\n\
             2024-01-03,,abc,1,1,1,10\n",
        );

        let raw = load_csv(&path).unwrap();
        assert_eq!(raw.bars[1].open, None);
        assert_eq!(raw.bars[1].high, None);
        assert_eq!(raw.non_numeric_cells, 1);
        assert_eq!(raw.missing_cells(), 2);
    }

    #[test]
    fn test_load_csv_rejects_duplicates_and_bad_dates() {
        let dir = tempfile::tempdir().unwrap();
        let dup = write_file(
            &dir,
            "DUP.csv",
            "Date,Open,High,Low,Close,Adj Close,Volume\n\
             2024-01-02,1,1,1,1,1,10\n\
             2024-01-02,1,1,1,1,1,10\n",
        );
        assert!(matches!(load_csv(&dup), Err(PipelineError::DataQuality(_))));

        let bad = write_file(
            &dir,
            "BAD.csv",
            "Date,Open,High,Low,Close,Adj Close,Volume\n\
             01/02/2024,1,1,1,1,1,10\n",
        );
        assert!(matches!(load_csv(&bad), Err(PipelineError::DataQuality(_))));
    }

    #[test]
    fn test_load_csv_rejects_missing_column_and_negative_price() {
        let dir = tempfile::tempdir().unwrap();
        let no_vol = write_file(&dir, "A.csv", "Date,Open,High,Low,Close\n2024-01-02,1,1,1,1\n");
        let err = load_csv(&no_vol).unwrap_err();
        assert!(err.to_string().contains("Volume"));

        let negative = write_file(
            &dir,
            "B.csv",
            "Date,Open,High,Low,Close,Adj Close,Volume\n2024-01-02,1,1,-1,1,1,10\n",
        );
        assert!(matches!(load_csv(&negative), Err(PipelineError::DataQuality(_))));
    }

    #[test]
    fn test_load_csv_rejects_fractional_volume() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "FRAC.csv",
            "Date,Open,High,Low,Close,Adj Close,Volume
2024-01-02,1,1,1,1,1,10.7
",
        );
        let err = load_csv(&path).unwrap_err();
        assert!(matches!(err, PipelineError::DataQuality(_)));
        assert!(err.to_string().contains("whole number"), "got {}", err);

        let whole = write_file(
            &dir,
            "WHOLE.csv",
            "Date,Open,High,Low,Close,Adj Close,Volume
2024-01-02,1,1,1,1,1,10.0
",
        );
        assert_eq!(load_csv(&whole).unwrap().bars[0].volume, Some(10.0));
    }

    #[test]
    fn test_missing_adj_close_falls_back_to_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "BND.csv",
            "date,open,high,low,close,volume\n2024-01-02 00:00:00-05:00,1,2,0.5,1.5,10\n",
        );
        let raw = load_csv(&path).unwrap();
        assert_eq!(raw.bars[0].adj_close, Some(1.5));
    }

    #[test]
    fn test_write_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let series = mock_series("SPY", 15, 7);
        let path = dir.path().join("out").join("SPY.csv");
        write_csv(&path, &series).unwrap();

        let raw = load_csv(&path).unwrap();
        assert_eq!(raw.bars.len(), series.len());
        assert_eq!(raw.missing_cells(), 0);
        assert_eq!(raw.bars[3].volume, Some(series.bars()[3].volume as f64));
    }

    #[test]
    fn test_price_series_rejects_unordered_dates() {
        let series = mock_series("X", 3, 1);
        let mut bars = series.bars().to_vec();
        bars.swap(0, 1);
        assert!(PriceSeries::new("X", bars).is_err());
    }

    #[test]
    fn test_price_series_rejects_zero_close() {
        let mut bars = mock_series("X", 3, 1).bars().to_vec();
        bars[1].close = 0.0;
        bars[1].low = 0.0;
        let err = PriceSeries::new("X", bars).unwrap_err();
        assert!(matches!(err, PipelineError::DataQuality(_)));

        let mut bars = mock_series("X", 3, 1).bars().to_vec();
        bars[2].adj_close = 0.0;
        assert!(PriceSeries::new("X", bars).is_err());
    }

    #[test]
    fn test_write_csv_rejects_empty_series() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EMPTY.csv");
        let empty = PriceSeries::new("EMPTY", Vec::new()).unwrap();
        assert!(matches!(write_csv(&path, &empty), Err(PipelineError::DataQuality(_))));
        assert!(!path.exists());
    }

    #[test]
    fn test_yahoo_payload_conversion() {
        let json = r#"{"chart":{"result":[{"timestamp":[1704205800,1704292200],
            "indicators":{"quote":[{"open":[10.0,null],"high":[11.0,12.0],"low":[9.0,10.0],"close":[10.5,11.5],"volume":[100.0,200.0]}],
            "adjclose":[{"adjclose":[10.4,11.4]}]}}],"error":null}}"#;
        let response: YahooChartResponse = serde_json::from_str(json).unwrap();
        let raw = yahoo_to_raw_series("tsla", response).unwrap();

        assert_eq!(raw.symbol, "TSLA");
        assert_eq!(raw.bars.len(), 2);
        assert_eq!(raw.bars[0].date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(raw.bars[1].open, None);
        assert_eq!(raw.bars[1].adj_close, Some(11.4));
    }
}
