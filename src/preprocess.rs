//! Cleaning, calendar alignment and derived series.
//!
//! Gaps are forward filled. A missing field copies the same field from the previous
//! cleaned bar. A missing calendar date becomes a flat bar at the previous close with
//! zero volume. Leading bars that have nothing to copy from are dropped. A zero or
//! negative close is rejected when the cleaned series is built, never flattened into a
//! zero return.

use crate::config::{PreprocessConfig, TRADING_DAYS};
use crate::data::{PriceBar, PriceField, PriceSeries, RawBar, RawPriceSeries};
use crate::error::{PipelineError, Result};
use crate::stats;
use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarPolicy {
    /// Monday to Friday between the first and last observation, plus any date present in the data.
    Weekdays,
    /// Only the dates present in the data.
    AsIs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnKind {
    Simple,
    Log,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ReturnPoint {
    pub date: NaiveDate,
    pub value: f64,
}

/// Period returns derived from a price series; one shorter than its source.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReturnSeries {
    pub symbol: String,
    pub kind: ReturnKind,
    pub points: Vec<ReturnPoint>,
}

impl ReturnSeries {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.points.iter().map(|p| p.date).collect()
    }
}

/// What the cleaner changed, for logs and reports.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CleanReport {
    pub symbol: String,
    pub input_rows: usize,
    pub output_rows: usize,
    pub filled_cells: usize,
    pub filled_dates: usize,
    pub dropped_leading: usize,
    pub missing_fraction: f64,
}

#[derive(Clone, Debug)]
pub struct Cleaned {
    pub series: PriceSeries,
    pub report: CleanReport,
}

pub fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

pub fn weekdays_between(first: NaiveDate, last: NaiveDate) -> Vec<NaiveDate> {
    first
        .iter_days()
        .take_while(|d| *d <= last)
        .filter(|d| is_weekday(*d))
        .collect()
}

/// The next `n` weekdays strictly after `after`.
pub fn next_trading_days(after: NaiveDate, n: usize) -> Vec<NaiveDate> {
    after
        .iter_days()
        .skip(1)
        .filter(|d| is_weekday(*d))
        .take(n)
        .collect()
}

pub fn trading_calendar(raw: &RawPriceSeries, policy: CalendarPolicy) -> Vec<NaiveDate> {
    let present: BTreeSet<NaiveDate> = raw.bars.iter().map(|b| b.date).collect();
    match (policy, raw.first_date(), raw.last_date()) {
        (CalendarPolicy::Weekdays, Some(first), Some(last)) => {
            let mut all: BTreeSet<NaiveDate> = weekdays_between(first, last).into_iter().collect();
            all.extend(present);
            all.into_iter().collect()
        }
        _ => present.into_iter().collect(),
    }
}

/// Cleans one instrument on its own trading calendar and derives its returns.
pub fn preprocess(
    raw: &RawPriceSeries,
    config: &PreprocessConfig,
    field: PriceField,
) -> Result<(Cleaned, ReturnSeries)> {
    let calendar = trading_calendar(raw, config.calendar);
    let cleaned = clean_on_calendar(raw, &calendar, config)?;
    let returns = compute_returns(&cleaned.series, field, config.return_kind);
    Ok((cleaned, returns))
}

/// Forward fills `raw` onto `calendar`.
///
/// Rows outside the calendar range are ignored. Fails when the share of missing or
/// non-numeric cells among the rows in range exceeds `max_missing_fraction`, when the
/// share of bars invented for absent dates exceeds `max_filled_date_fraction`, or when
/// fewer than two bars survive.
pub fn clean_on_calendar(
    raw: &RawPriceSeries,
    calendar: &[NaiveDate],
    config: &PreprocessConfig,
) -> Result<Cleaned> {
    let max_missing_fraction = config.max_missing_fraction;
    let symbol = raw.symbol.clone();
    let (Some(&start), Some(&end)) = (calendar.first(), calendar.last()) else {
        return Err(PipelineError::DataQuality(format!("{}: empty trading calendar", symbol)));
    };

    let in_range: Vec<&RawBar> = raw
        .bars
        .iter()
        .filter(|b| b.date >= start && b.date <= end)
        .collect();
    if in_range.is_empty() {
        return Err(PipelineError::DataQuality(format!(
            "{}: no rows between {} and {}",
            symbol, start, end
        )));
    }

    let total_cells = in_range.len() * RawBar::FIELDS;
    let missing_cells: usize = in_range.iter().map(|b| b.missing_cells()).sum();
    let missing_fraction = missing_cells as f64 / total_cells as f64;
    if missing_fraction > max_missing_fraction {
        return Err(PipelineError::DataQuality(format!(
            "{}: {:.2}% of values are missing or non-numeric (limit {:.2}%)",
            symbol,
            missing_fraction * 100.0,
            max_missing_fraction * 100.0
        )));
    }

    let by_date: HashMap<NaiveDate, &RawBar> = in_range.iter().map(|b| (b.date, *b)).collect();
    let mut bars: Vec<PriceBar> = Vec::with_capacity(calendar.len());
    let mut report = CleanReport {
        symbol: symbol.clone(),
        input_rows: in_range.len(),
        missing_fraction,
        ..Default::default()
    };

    for &date in calendar {
        let prev = bars.last().cloned();
        match (by_date.get(&date), prev) {
            (Some(raw_bar), prev) => match fill_bar(raw_bar, prev.as_ref()) {
                Some((bar, filled)) => {
                    report.filled_cells += filled;
                    bars.push(bar);
                }
                None => report.dropped_leading += 1,
            },
            (None, Some(prev)) => {
                let flat = PriceBar {
                    date,
                    open: prev.close,
                    high: prev.close,
                    low: prev.close,
                    close: prev.close,
                    adj_close: prev.adj_close,
                    volume: 0,
                };
                report.filled_dates += 1;
                bars.push(flat);
            }
            (None, None) => {}
        }
    }

    if bars.len() < 2 {
        return Err(PipelineError::DataQuality(format!(
            "{}: only {} usable bars after cleaning",
            symbol,
            bars.len()
        )));
    }

    let filled_fraction = report.filled_dates as f64 / bars.len() as f64;
    if filled_fraction > config.max_filled_date_fraction {
        return Err(PipelineError::DataQuality(format!(
            "{}: {} of {} bars ({:.2}%) are calendar dates absent from the file (limit {:.2}%)",
            symbol,
            report.filled_dates,
            bars.len(),
            filled_fraction * 100.0,
            config.max_filled_date_fraction * 100.0
        )));
    }

    report.output_rows = bars.len();
    if report.dropped_leading > 0 {
        warn!("{}: dropped {} leading rows with unfillable gaps", symbol, report.dropped_leading);
    }
    debug!(
        "{}: filled {} cells and {} calendar dates",
        symbol, report.filled_cells, report.filled_dates
    );

    let series = PriceSeries::new(symbol, bars)?;
    Ok(Cleaned { series, report })
}

fn fill_bar(raw: &RawBar, prev: Option<&PriceBar>) -> Option<(PriceBar, usize)> {
    let mut filled = 0usize;
    let mut pick = |value: Option<f64>, fallback: Option<f64>| match value {
        Some(v) => Some(v),
        None => {
            filled += 1;
            fallback
        }
    };

    let open = pick(raw.open, prev.map(|p| p.open))?;
    let high = pick(raw.high, prev.map(|p| p.high))?;
    let low = pick(raw.low, prev.map(|p| p.low))?;
    let close = pick(raw.close, prev.map(|p| p.close))?;
    let adj_close = pick(raw.adj_close, prev.map(|p| p.adj_close))?;
    let volume = pick(raw.volume, prev.map(|p| p.volume as f64))?;

    Some((
        PriceBar {
            date: raw.date,
            open,
            high,
            low,
            close,
            adj_close,
            volume: volume.round() as u64,
        },
        filled,
    ))
}

/// The calendar shared by several instruments.
///
/// It spans from the latest first date to the earliest last date and contains the union
/// of their dates inside that span. With `Weekdays` it also contains every weekday in the span.
pub fn common_calendar(raws: &[RawPriceSeries], policy: CalendarPolicy) -> Result<Vec<NaiveDate>> {
    let start = raws.iter().filter_map(|r| r.first_date()).max();
    let end = raws.iter().filter_map(|r| r.last_date()).min();
    let (Some(start), Some(end)) = (start, end) else {
        return Err(PipelineError::Alignment("no instruments to align".to_string()));
    };
    if start > end {
        return Err(PipelineError::Alignment(format!(
            "instruments share no common date range (latest start {} is after earliest end {})",
            start, end
        )));
    }

    let mut dates: BTreeSet<NaiveDate> = raws
        .iter()
        .flat_map(|r| r.bars.iter().map(|b| b.date))
        .filter(|d| *d >= start && *d <= end)
        .collect();
    if policy == CalendarPolicy::Weekdays {
        dates.extend(weekdays_between(start, end));
    }
    Ok(dates.into_iter().collect())
}

/// Trims cleaned series to their latest common first date so they share one index.
pub fn trim_to_common_start(cleaned: Vec<Cleaned>) -> Result<Vec<Cleaned>> {
    let Some(start) = cleaned.iter().filter_map(|c| c.series.first().map(|b| b.date)).max() else {
        return Ok(cleaned);
    };
    let trimmed: Vec<Cleaned> = cleaned
        .into_iter()
        .map(|c| {
            let series = c.series.since(start);
            let report = CleanReport { output_rows: series.len(), ..c.report };
            Cleaned { series, report }
        })
        .collect();

    if let Some(first) = trimmed.first() {
        let reference = first.series.dates();
        for other in trimmed.iter().skip(1) {
            if other.series.dates() != reference {
                return Err(PipelineError::Alignment(format!(
                    "{} and {} do not share a date index after cleaning",
                    first.series.symbol(),
                    other.series.symbol()
                )));
            }
        }
    }
    Ok(trimmed)
}

/// Cleans several instruments onto one shared calendar.
///
/// An instrument that fails cleaning is logged and left out; the others still share one index.
pub fn align_calendars(raws: &[RawPriceSeries], config: &PreprocessConfig) -> Result<Vec<Cleaned>> {
    let calendar = common_calendar(raws, config.calendar)?;
    info!(
        "Aligning {} instruments on {} dates ({} to {})",
        raws.len(),
        calendar.len(),
        calendar.first().map(|d| d.to_string()).unwrap_or_default(),
        calendar.last().map(|d| d.to_string()).unwrap_or_default()
    );
    let mut cleaned = Vec::with_capacity(raws.len());
    for raw in raws {
        match clean_on_calendar(raw, &calendar, config) {
            Ok(c) => cleaned.push(c),
            Err(e) => error!("{}: {} ({}). Dropping instrument.", raw.symbol, e, e.kind()),
        }
    }
    trim_to_common_start(cleaned)
}

/// Period returns of `field`. `PriceSeries` keeps closes strictly positive, so every return is finite.
pub fn compute_returns(series: &PriceSeries, field: PriceField, kind: ReturnKind) -> ReturnSeries {
    let points = series
        .bars()
        .windows(2)
        .map(|w| {
            let (prev, cur) = (w[0].price(field), w[1].price(field));
            let value = match kind {
                ReturnKind::Simple => cur / prev - 1.0,
                ReturnKind::Log => (cur / prev).ln(),
            };
            ReturnPoint { date: w[1].date, value }
        })
        .collect();

    ReturnSeries {
        symbol: series.symbol().to_string(),
        kind,
        points,
    }
}

/// Rolling sample standard deviation; `None` until the window is full.
pub fn rolling_volatility(values: &[f64], window: usize, annualize: bool) -> Vec<Option<f64>> {
    let scale = if annualize { TRADING_DAYS.sqrt() } else { 1.0 };
    rolling(values, window, |w| stats::sample_std(w).map(|s| s * scale))
}

/// Trailing moving average; `None` until the window is full.
pub fn moving_average(values: &[f64], window: usize) -> Vec<Option<f64>> {
    rolling(values, window, stats::mean)
}

fn rolling(values: &[f64], window: usize, f: impl Fn(&[f64]) -> Option<f64>) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; values.len()];
    }
    (0..values.len())
        .map(|i| {
            if i + 1 < window {
                None
            } else {
                f(&values[i + 1 - window..=i])
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn raw_bar(date: NaiveDate, close: f64) -> RawBar {
        RawBar {
            date,
            open: Some(close),
            high: Some(close + 1.0),
            low: Some(close - 1.0),
            close: Some(close),
            adj_close: Some(close),
            volume: Some(1000.0),
        }
    }

    fn raw(symbol: &str, bars: Vec<RawBar>) -> RawPriceSeries {
        RawPriceSeries { symbol: symbol.to_string(), bars, non_numeric_cells: 0 }
    }

    fn lenient_missing() -> PreprocessConfig {
        PreprocessConfig { max_missing_fraction: 0.5, ..Default::default() }
    }

    /// Short fixtures where calendar filling dominates.
    fn lenient_fill() -> PreprocessConfig {
        PreprocessConfig { max_filled_date_fraction: 1.0, ..Default::default() }
    }

    #[test]
    fn test_single_missing_date_is_forward_filled() {
        // Three weeks from Mon 2024-01-08 with Wednesday 2024-01-10 missing.
        let bars: Vec<RawBar> = weekdays_between(d(2024, 1, 8), d(2024, 1, 26))
            .into_iter()
            .enumerate()
            .filter(|(_, date)| *date != d(2024, 1, 10))
            .map(|(i, date)| raw_bar(date, 100.0 + i as f64))
            .collect();
        let input = raw("SPY", bars);

        let (cleaned, returns) =
            preprocess(&input, &PreprocessConfig::default(), PriceField::AdjClose).unwrap();

        let bars = cleaned.series.bars();
        assert_eq!(bars.len(), 15);
        assert_eq!(bars[2].date, d(2024, 1, 10));
        assert_eq!(bars[2].close, 101.0);
        assert_eq!(bars[2].open, 101.0);
        assert_eq!(bars[2].volume, 0);
        assert_eq!(cleaned.report.filled_dates, 1);

        assert_eq!(returns.len(), bars.len() - 1);
        assert_eq!(returns.points[1].value, 0.0);
        assert_eq!(returns.points[1].date, d(2024, 1, 10));
    }

    #[test]
    fn test_weekly_file_on_weekday_calendar_is_data_quality_error() {
        // Mondays only over 20 weeks: four of every five cleaned bars would be invented.
        let bars: Vec<RawBar> = (0..20)
            .map(|i| raw_bar(d(2024, 1, 1) + chrono::Duration::weeks(i), 100.0 + i as f64))
            .collect();
        let input = raw("WEEKLY", bars);

        let err = preprocess(&input, &PreprocessConfig::default(), PriceField::Close).unwrap_err();
        assert!(matches!(err, PipelineError::DataQuality(_)), "got {}", err);
        assert!(err.to_string().contains("absent from the file"), "got {}", err);

        let as_is = PreprocessConfig { calendar: CalendarPolicy::AsIs, ..Default::default() };
        let (cleaned, _) = preprocess(&input, &as_is, PriceField::Close).unwrap();
        assert_eq!(cleaned.report.filled_dates, 0);
        assert_eq!(cleaned.series.len(), 20);
    }

    #[test]
    fn test_cleaned_dates_strictly_increase() {
        let input = raw(
            "TSLA",
            vec![
                raw_bar(d(2024, 1, 5), 10.0),
                raw_bar(d(2024, 1, 6), 10.5), // Saturday row is kept
                raw_bar(d(2024, 1, 10), 11.0),
            ],
        );
        let (cleaned, _) = preprocess(&input, &lenient_fill(), PriceField::Close).unwrap();
        let dates = cleaned.series.dates();
        assert!(dates.windows(2).all(|w| w[0] < w[1]));
        assert!(dates.contains(&d(2024, 1, 6)));
        assert!(dates.contains(&d(2024, 1, 8)));
    }

    #[test]
    fn test_missing_fields_copy_previous_values() {
        let mut gap = raw_bar(d(2024, 1, 9), 50.0);
        gap.close = None;
        gap.adj_close = None;
        let input = raw("BND", vec![raw_bar(d(2024, 1, 8), 70.0), gap, raw_bar(d(2024, 1, 10), 71.0)]);

        let cleaned = clean_on_calendar(&input, &trading_calendar(&input, CalendarPolicy::AsIs), &lenient_missing()).unwrap();
        let bars = cleaned.series.bars();
        assert_eq!(bars[1].close, 70.0);
        assert_eq!(bars[1].adj_close, 70.0);
        assert_eq!(bars[1].open, 50.0);
        assert_eq!(cleaned.report.filled_cells, 2);
    }

    #[test]
    fn test_leading_unfillable_rows_are_dropped() {
        let mut first = raw_bar(d(2024, 1, 8), 1.0);
        first.close = None;
        let input = raw("X", vec![first, raw_bar(d(2024, 1, 9), 2.0), raw_bar(d(2024, 1, 10), 3.0)]);

        let cleaned = clean_on_calendar(&input, &trading_calendar(&input, CalendarPolicy::AsIs), &lenient_missing()).unwrap();
        assert_eq!(cleaned.report.dropped_leading, 1);
        assert_eq!(cleaned.series.first().unwrap().date, d(2024, 1, 9));
    }

    #[test]
    fn test_too_many_missing_values_is_data_quality_error() {
        let mut bars: Vec<RawBar> = (0..5).map(|i| raw_bar(d(2024, 1, 8 + i), 10.0)).collect();
        bars[2].open = None;
        bars[2].high = None;
        bars[3].low = None;
        let input = raw("BAD", bars);

        let config = PreprocessConfig { max_missing_fraction: 0.05, ..Default::default() };
        let err = preprocess(&input, &config, PriceField::Close).unwrap_err();
        assert!(matches!(err, PipelineError::DataQuality(_)));

        let lenient = PreprocessConfig { max_missing_fraction: 0.2, ..Default::default() };
        assert!(preprocess(&input, &lenient, PriceField::Close).is_ok());
    }

    #[test]
    fn test_single_bar_is_rejected() {
        let input = raw("ONE", vec![raw_bar(d(2024, 1, 8), 10.0)]);
        assert!(matches!(
            preprocess(&input, &PreprocessConfig::default(), PriceField::Close),
            Err(PipelineError::DataQuality(_))
        ));
    }

    #[test]
    fn test_align_calendars_shares_index() {
        let a = raw(
            "A",
            (0..10).map(|i| raw_bar(d(2024, 1, 1) + chrono::Duration::days(i), 10.0 + i as f64)).collect(),
        );
        let b = raw(
            "B",
            vec![
                raw_bar(d(2024, 1, 3), 5.0),
                raw_bar(d(2024, 1, 4), 5.5),
                raw_bar(d(2024, 1, 9), 6.0),
                raw_bar(d(2024, 1, 15), 6.5),
            ],
        );

        let aligned = align_calendars(&[a, b], &lenient_fill()).unwrap();
        assert_eq!(aligned.len(), 2);
        assert_eq!(aligned[0].series.dates(), aligned[1].series.dates());
        assert_eq!(aligned[0].series.first().unwrap().date, d(2024, 1, 3));
        assert_eq!(aligned[0].series.last().unwrap().date, d(2024, 1, 10));
    }

    #[test]
    fn test_align_drops_instrument_that_fails_cleaning() {
        let a = raw("A", (0..5).map(|i| raw_bar(d(2024, 1, 1) + chrono::Duration::days(i), 10.0)).collect());
        let mut bars: Vec<RawBar> = (0..5).map(|i| raw_bar(d(2024, 1, 1) + chrono::Duration::days(i), 20.0)).collect();
        for bar in bars.iter_mut().skip(1) {
            bar.close = None;
            bar.adj_close = None;
        }
        let b = raw("B", bars);

        let aligned = align_calendars(&[a, b], &PreprocessConfig::default()).unwrap();
        assert_eq!(aligned.len(), 1, "B is mostly missing and should be dropped");
        assert_eq!(aligned[0].series.symbol(), "A");
    }

    #[test]
    fn test_disjoint_ranges_fail_alignment() {
        let a = raw("A", vec![raw_bar(d(2024, 1, 1), 1.0), raw_bar(d(2024, 1, 2), 1.0)]);
        let b = raw("B", vec![raw_bar(d(2024, 2, 1), 1.0), raw_bar(d(2024, 2, 2), 1.0)]);
        assert!(matches!(
            align_calendars(&[a, b], &PreprocessConfig::default()),
            Err(PipelineError::Alignment(_))
        ));
    }

    #[test]
    fn test_log_and_simple_returns() {
        let series = crate::data::mock_series("R", 30, 3);
        let simple = compute_returns(&series, PriceField::Close, ReturnKind::Simple);
        let log = compute_returns(&series, PriceField::Close, ReturnKind::Log);
        assert_eq!(simple.len(), 29);
        for (s, l) in simple.points.iter().zip(&log.points) {
            assert!(((1.0 + s.value).ln() - l.value).abs() < 1e-12);
        }
    }

    #[test]
    fn test_rolling_windows() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let ma = moving_average(&values, 2);
        assert_eq!(ma, vec![None, Some(1.5), Some(2.5), Some(3.5)]);

        let vol = rolling_volatility(&values, 3, false);
        assert!(vol[1].is_none());
        assert!((vol[2].unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_next_trading_days_skip_weekend() {
        let days = next_trading_days(d(2024, 1, 12), 3);
        assert_eq!(days, vec![d(2024, 1, 15), d(2024, 1, 16), d(2024, 1, 17)]);
    }
}
