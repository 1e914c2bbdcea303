//! Data loading and alignment.
//!
//! Inputs are plain CSV files as produced by the usual collection scripts:
//!
//! - **Prices**: a wide table (`date,SPY,AGG,...`) or a directory holding one
//!   OHLCV file per asset.
//! - **Returns**: the same wide layout holding periodic simple returns.
//! - **Indicators**: economic series such as VIX or the 10Y-2Y spread, possibly
//!   at a lower frequency than the returns.
//! - **Factors**: Fama-French style factor returns, optionally in percent.
//!
//! Everything is converted into a [`ReturnsDataset`], which enforces the
//! uniform-frequency, no-duplicate-timestamp invariants.

use crate::error::{PortfolioError, Result};
use crate::types::Frequency;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use csv::{ReaderBuilder, StringRecord};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info, warn};

const DATE_ALIASES: &[&str] = &[
    "date", "Date", "DATE", "timestamp", "Timestamp", "time", "Time", "datetime", "Datetime",
];

const CLOSE_ALIASES: &[&str] = &["Adj Close", "adj_close", "Close", "close", "c"];

/// Data source configuration.
#[derive(Debug, Clone)]
pub struct DataConfig {
    /// Date format string for parsing (e.g., "%Y-%m-%d").
    pub date_format: Option<String>,
    /// CSV delimiter character. If None, delimiter is auto-detected.
    pub delimiter: Option<u8>,
    /// Skip rows with unparseable cells instead of failing.
    pub skip_invalid: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            date_format: None,
            delimiter: None,
            skip_invalid: true,
        }
    }
}

/// Detect the CSV delimiter from the first few lines of the file.
///
/// Picks the delimiter among comma, tab, semicolon and pipe that yields a
/// consistent column count of at least two.
fn detect_delimiter(path: &Path) -> Result<u8> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let lines: Vec<String> = reader.lines().take(5).filter_map(|l| l.ok()).collect();

    if lines.is_empty() {
        return Ok(b',');
    }

    let delimiters = [b',', b'\t', b';', b'|'];
    let mut best_delimiter = b',';
    let mut best_score = 0;

    for &delim in &delimiters {
        let counts: Vec<usize> = lines
            .iter()
            .map(|line| line.as_bytes().iter().filter(|&&b| b == delim).count() + 1)
            .collect();

        let first_count = counts[0];
        let all_consistent = counts.iter().all(|&c| c == first_count);

        if all_consistent && first_count >= 2 && first_count > best_score {
            best_score = first_count;
            best_delimiter = delim;
        }
    }

    debug!(
        "Detected delimiter {:?} with {} fields",
        best_delimiter as char, best_score
    );
    Ok(best_delimiter)
}

fn midnight(d: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN))
}

/// Parse a date string, trying an explicit format first and then common layouts.
pub fn parse_datetime(s: &str, format: Option<&str>) -> Result<DateTime<Utc>> {
    let s = s.trim();

    if let Some(fmt) = format {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(midnight(d));
        }
    }

    let datetime_formats = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%SZ",
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y/%m/%d %H:%M:%S",
    ];
    for fmt in &datetime_formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
    }

    // "2020-01-02 00:00:00-05:00" as written by pandas for tz-aware indexes
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%:z") {
        return Ok(midnight(dt.date_naive()));
    }

    let date_formats = [
        "%Y-%m-%d", "%Y/%m/%d", "%d-%m-%Y", "%d/%m/%Y", "%m/%d/%Y", "%d-%b-%Y", "%d %b %Y",
        "%b %d, %Y",
    ];
    for fmt in &date_formats {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(midnight(d));
        }
    }

    if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(d) = NaiveDate::parse_from_str(s, "%Y%m%d") {
            return Ok(midnight(d));
        }
    }

    // Month labels ("2010-01", "201001") as used by factor libraries
    if let Ok(d) = NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d") {
        return Ok(midnight(d));
    }
    if s.len() == 6 && s.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(d) = NaiveDate::parse_from_str(&format!("{}01", s), "%Y%m%d") {
            return Ok(midnight(d));
        }
    }

    if let Ok(ts) = s.parse::<i64>() {
        if let Some(dt) = DateTime::from_timestamp(ts, 0) {
            return Ok(dt);
        }
    }

    Err(PortfolioError::DateParseError(format!(
        "could not parse '{}'",
        s
    )))
}

fn parse_cell(cell: &str, allow_missing: bool) -> Option<f64> {
    let cell = cell.trim();
    if cell.is_empty() || cell.eq_ignore_ascii_case("nan") || cell == "." || cell == "NA" {
        return if allow_missing { Some(f64::NAN) } else { None };
    }
    cell.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// A date-indexed wide table read from CSV.
#[derive(Debug, Clone)]
struct WideTable {
    timestamps: Vec<DateTime<Utc>>,
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

fn read_wide(path: &Path, config: &DataConfig, allow_missing: bool) -> Result<WideTable> {
    info!("Loading data from: {}", path.display());

    let delimiter = match config.delimiter {
        Some(d) => d,
        None => detect_delimiter(path)?,
    };

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    if headers.len() < 2 {
        return Err(PortfolioError::DataError(format!(
            "{}: expected a date column followed by at least one value column",
            path.display()
        )));
    }
    let columns: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();

    let mut seen = HashSet::new();
    for name in &columns {
        if name.is_empty() || !seen.insert(name.as_str()) {
            return Err(PortfolioError::DataError(format!(
                "{}: empty or duplicate column name '{}'",
                path.display(),
                name
            )));
        }
    }

    let mut entries: Vec<(DateTime<Utc>, Vec<f64>)> = Vec::new();
    let mut skipped = 0;
    let mut record = StringRecord::new();
    let mut row_num = 0;

    while reader.read_record(&mut record)? {
        row_num += 1;
        let parsed = parse_wide_row(&record, &columns, config, allow_missing);
        match parsed {
            Ok(entry) => entries.push(entry),
            Err(e) if config.skip_invalid => {
                debug!("Skipping row {}: {}", row_num, e);
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    if skipped > 0 {
        warn!("Skipped {} invalid rows in {}", skipped, path.display());
    }

    entries.sort_by_key(|(ts, _)| *ts);
    let original_len = entries.len();
    entries.dedup_by_key(|(ts, _)| *ts);
    if entries.len() < original_len {
        warn!(
            "Removed {} duplicate timestamps",
            original_len - entries.len()
        );
    }

    if entries.is_empty() {
        return Err(PortfolioError::NoData);
    }

    let (timestamps, rows) = entries.into_iter().unzip();
    Ok(WideTable {
        timestamps,
        columns,
        rows,
    })
}

fn parse_wide_row(
    record: &StringRecord,
    columns: &[String],
    config: &DataConfig,
    allow_missing: bool,
) -> Result<(DateTime<Utc>, Vec<f64>)> {
    let date = record
        .get(0)
        .ok_or_else(|| PortfolioError::DataError("missing date cell".to_string()))?;
    let ts = parse_datetime(date, config.date_format.as_deref())?;

    let mut values = Vec::with_capacity(columns.len());
    for (i, name) in columns.iter().enumerate() {
        let cell = record.get(i + 1).unwrap_or("");
        let value = parse_cell(cell, allow_missing).ok_or_else(|| {
            PortfolioError::DataError(format!("invalid value '{}' for {}", cell, name))
        })?;
        values.push(value);
    }
    Ok((ts, values))
}

/// Determine the sampling frequency and check that every gap matches it.
pub fn detect_frequency(timestamps: &[DateTime<Utc>]) -> Result<Frequency> {
    if timestamps.len() < 2 {
        return Err(PortfolioError::InsufficientData {
            required: 2,
            actual: timestamps.len(),
        });
    }

    let mut gaps: Vec<i64> = timestamps
        .windows(2)
        .map(|w| (w[1] - w[0]).num_days())
        .collect();
    let raw_gaps = gaps.clone();
    gaps.sort_unstable();
    let median = gaps[gaps.len() / 2];

    let frequency = Frequency::from_gap_days(median).ok_or_else(|| {
        PortfolioError::DataError(format!(
            "cannot infer a sampling frequency from a median gap of {} days",
            median
        ))
    })?;

    let (lo, hi) = frequency.gap_bounds();
    for (i, gap) in raw_gaps.iter().enumerate() {
        if *gap < lo || *gap > hi {
            return Err(PortfolioError::DataError(format!(
                "non-uniform {} series: gap of {} days between {} and {}",
                frequency,
                gap,
                timestamps[i].format("%Y-%m-%d"),
                timestamps[i + 1].format("%Y-%m-%d")
            )));
        }
    }

    Ok(frequency)
}

/// Asset prices on a common date index.
#[derive(Debug, Clone)]
pub struct PriceTable {
    pub timestamps: Vec<DateTime<Utc>>,
    pub assets: Vec<String>,
    /// Row-major prices, one row per timestamp.
    pub prices: Vec<Vec<f64>>,
}

impl PriceTable {
    /// Convert prices into simple periodic returns `p_t / p_{t-1} - 1`.
    pub fn to_returns(&self) -> Result<ReturnsDataset> {
        if self.prices.len() < 3 {
            return Err(PortfolioError::InsufficientData {
                required: 3,
                actual: self.prices.len(),
            });
        }

        for (t, row) in self.prices.iter().enumerate() {
            if let Some(j) = row.iter().position(|&p| p <= 0.0) {
                return Err(PortfolioError::DataError(format!(
                    "non-positive price {} for {} on {}",
                    row[j],
                    self.assets[j],
                    self.timestamps[t].format("%Y-%m-%d")
                )));
            }
        }

        let returns: Vec<Vec<f64>> = self
            .prices
            .windows(2)
            .map(|w| w[1].iter().zip(&w[0]).map(|(p1, p0)| p1 / p0 - 1.0).collect())
            .collect();

        ReturnsDataset::new(
            self.timestamps[1..].to_vec(),
            self.assets.clone(),
            returns,
        )
    }
}

/// Load a wide price table (`date,ASSET1,ASSET2,...`).
pub fn load_prices(path: impl AsRef<Path>, config: &DataConfig) -> Result<PriceTable> {
    let table = read_wide(path.as_ref(), config, false)?;
    info!(
        "Loaded prices for {} assets over {} dates",
        table.columns.len(),
        table.timestamps.len()
    );
    Ok(PriceTable {
        timestamps: table.timestamps,
        assets: table.columns,
        prices: table.rows,
    })
}

/// Load a wide table of periodic simple returns.
pub fn load_returns(path: impl AsRef<Path>, config: &DataConfig) -> Result<ReturnsDataset> {
    let table = read_wide(path.as_ref(), config, false)?;
    ReturnsDataset::new(table.timestamps, table.columns, table.rows)
}

fn find_column(headers: &StringRecord, aliases: &[&str]) -> Option<usize> {
    aliases
        .iter()
        .find_map(|alias| headers.iter().position(|h| h.trim() == *alias))
}

fn load_close_series(
    path: &Path,
    config: &DataConfig,
) -> Result<BTreeMap<DateTime<Utc>, f64>> {
    let delimiter = match config.delimiter {
        Some(d) => d,
        None => detect_delimiter(path)?,
    };
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let date_idx = find_column(&headers, DATE_ALIASES).unwrap_or(0);
    let close_idx = find_column(&headers, CLOSE_ALIASES).ok_or_else(|| {
        PortfolioError::DataError(format!("{}: no close column found", path.display()))
    })?;

    let mut series = BTreeMap::new();
    let mut skipped = 0;
    for result in reader.records() {
        let record = result?;
        let parsed = record
            .get(date_idx)
            .ok_or_else(|| PortfolioError::DataError("missing date".to_string()))
            .and_then(|d| parse_datetime(d, config.date_format.as_deref()))
            .and_then(|ts| {
                record
                    .get(close_idx)
                    .and_then(|c| parse_cell(c, false))
                    .map(|c| (ts, c))
                    .ok_or_else(|| PortfolioError::DataError("invalid close".to_string()))
            });
        match parsed {
            Ok((ts, close)) => {
                series.insert(ts, close);
            }
            Err(e) if config.skip_invalid => {
                debug!("Skipping row in {}: {}", path.display(), e);
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }
    if skipped > 0 {
        warn!("Skipped {} invalid rows in {}", skipped, path.display());
    }
    Ok(series)
}

/// Load one close-price CSV per asset from a directory and inner-join them.
///
/// The asset name is the file stem (`SPY.csv` becomes `SPY`).
pub fn load_price_dir(dir: impl AsRef<Path>, config: &DataConfig) -> Result<PriceTable> {
    let dir = dir.as_ref();
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .map(|e| e.eq_ignore_ascii_case("csv"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(PortfolioError::NoData);
    }

    let mut assets = Vec::with_capacity(paths.len());
    let mut all_series = Vec::with_capacity(paths.len());
    for path in &paths {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .ok_or_else(|| PortfolioError::DataError(format!("bad file name {}", path.display())))?;
        debug!("Loading {} from {}", name, path.display());
        all_series.push(load_close_series(path, config)?);
        assets.push(name);
    }

    // Inner join on timestamps present in every series
    let first = &all_series[0];
    let mut timestamps = Vec::new();
    let mut prices = Vec::new();
    for ts in first.keys() {
        let row: Option<Vec<f64>> = all_series.iter().map(|s| s.get(ts).copied()).collect();
        if let Some(row) = row {
            timestamps.push(*ts);
            prices.push(row);
        }
    }

    let dropped = all_series.iter().map(|s| s.len()).max().unwrap_or(0) - timestamps.len();
    if dropped > 0 {
        warn!("Dropped {} dates not shared by every asset", dropped);
    }
    if timestamps.is_empty() {
        return Err(PortfolioError::NoData);
    }

    info!(
        "Loaded {} assets from {} with {} common dates",
        assets.len(),
        dir.display(),
        timestamps.len()
    );

    Ok(PriceTable {
        timestamps,
        assets,
        prices,
    })
}

/// Uniformly spaced periodic returns for a set of assets.
#[derive(Debug, Clone)]
pub struct ReturnsDataset {
    timestamps: Vec<DateTime<Utc>>,
    assets: Vec<String>,
    returns: Vec<Vec<f64>>,
    frequency: Frequency,
}

impl ReturnsDataset {
    /// Build a dataset, validating every data-model invariant.
    pub fn new(
        timestamps: Vec<DateTime<Utc>>,
        assets: Vec<String>,
        returns: Vec<Vec<f64>>,
    ) -> Result<Self> {
        if assets.is_empty() {
            return Err(PortfolioError::InvalidInput(
                "dataset needs at least one asset".to_string(),
            ));
        }
        let unique: HashSet<&String> = assets.iter().collect();
        if unique.len() != assets.len() {
            return Err(PortfolioError::InvalidInput(
                "asset names must be unique".to_string(),
            ));
        }
        if timestamps.len() != returns.len() {
            return Err(PortfolioError::InvalidInput(format!(
                "{} timestamps but {} return rows",
                timestamps.len(),
                returns.len()
            )));
        }
        if timestamps.windows(2).any(|w| w[1] <= w[0]) {
            return Err(PortfolioError::DataError(
                "timestamps must be strictly increasing without duplicates".to_string(),
            ));
        }
        for (t, row) in returns.iter().enumerate() {
            if row.len() != assets.len() {
                return Err(PortfolioError::InvalidInput(format!(
                    "row {} has {} values, expected {}",
                    t,
                    row.len(),
                    assets.len()
                )));
            }
            if let Some(j) = row.iter().position(|r| !r.is_finite() || *r <= -1.0) {
                return Err(PortfolioError::DataError(format!(
                    "invalid return {} for {} at row {}",
                    row[j], assets[j], t
                )));
            }
        }

        let frequency = detect_frequency(&timestamps)?;

        Ok(Self {
            timestamps,
            assets,
            returns,
            frequency,
        })
    }

    /// Re-check the invariants, e.g. after deserializing or filtering.
    pub fn validate(&self) -> Result<()> {
        Self::new(
            self.timestamps.clone(),
            self.assets.clone(),
            self.returns.clone(),
        )
        .map(|_| ())
    }

    pub fn len(&self) -> usize {
        self.returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.returns.is_empty()
    }

    pub fn n_assets(&self) -> usize {
        self.assets.len()
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.returns
    }

    pub fn row(&self, t: usize) -> &[f64] {
        &self.returns[t]
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    pub fn periods_per_year(&self) -> f64 {
        self.frequency.periods_per_year()
    }

    pub fn asset_index(&self, asset: &str) -> Option<usize> {
        self.assets.iter().position(|a| a == asset)
    }

    /// Return series of one asset by column index.
    pub fn column(&self, j: usize) -> Vec<f64> {
        self.returns.iter().map(|r| r[j]).collect()
    }

    /// Return series of one asset by name.
    pub fn asset_returns(&self, asset: &str) -> Option<Vec<f64>> {
        self.asset_index(asset).map(|j| self.column(j))
    }

    /// Returns of the equally weighted, per-period rebalanced basket.
    pub fn equal_weight_composite(&self) -> Vec<f64> {
        let n = self.assets.len() as f64;
        self.returns
            .iter()
            .map(|r| r.iter().sum::<f64>() / n)
            .collect()
    }

    /// Subset of rows by index, preserving order.
    ///
    /// The result is generally not contiguous in time, so it is only meant for
    /// estimation, not for compounding.
    pub fn select_rows(&self, indices: &[usize]) -> ReturnsDataset {
        ReturnsDataset {
            timestamps: indices.iter().map(|&i| self.timestamps[i]).collect(),
            assets: self.assets.clone(),
            returns: indices.iter().map(|&i| self.returns[i].clone()).collect(),
            frequency: self.frequency,
        }
    }

    /// Restrict the dataset to a subset of assets, in the given order.
    pub fn select_assets(&self, assets: &[String]) -> Result<ReturnsDataset> {
        let idx: Vec<usize> = assets
            .iter()
            .map(|a| {
                self.asset_index(a)
                    .ok_or_else(|| PortfolioError::InvalidInput(format!("unknown asset {}", a)))
            })
            .collect::<Result<_>>()?;
        ReturnsDataset::new(
            self.timestamps.clone(),
            assets.to_vec(),
            self.returns
                .iter()
                .map(|r| idx.iter().map(|&j| r[j]).collect())
                .collect(),
        )
    }

    /// Contiguous range of rows `[start, end)`.
    pub fn slice(&self, start: usize, end: usize) -> ReturnsDataset {
        let end = end.min(self.len());
        let start = start.min(end);
        ReturnsDataset {
            timestamps: self.timestamps[start..end].to_vec(),
            assets: self.assets.clone(),
            returns: self.returns[start..end].to_vec(),
            frequency: self.frequency,
        }
    }

    /// Restrict to an inclusive date range, revalidating the result.
    pub fn between(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<ReturnsDataset> {
        let first = start.map_or(0, |s| self.timestamps.partition_point(|ts| *ts < s));
        let last = end.map_or(self.len(), |e| self.timestamps.partition_point(|ts| *ts <= e));
        let subset = self.slice(first, last);
        ReturnsDataset::new(subset.timestamps, subset.assets, subset.returns)
    }
}

/// Economic indicator series (missing observations are NaN).
#[derive(Debug, Clone)]
pub struct IndicatorTable {
    pub timestamps: Vec<DateTime<Utc>>,
    pub names: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

impl IndicatorTable {
    /// Values of one indicator, if present.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let j = self.names.iter().position(|n| n == name)?;
        Some(self.values.iter().map(|r| r[j]).collect())
    }

    /// As-of alignment: each target date takes the latest observation at or
    /// before it, per column. Columns with no observation yet stay NaN.
    pub fn align_to(&self, targets: &[DateTime<Utc>]) -> Result<IndicatorTable> {
        let first = self.timestamps.first().ok_or(PortfolioError::NoData)?;
        if let Some(early) = targets.iter().find(|t| *t < first) {
            return Err(PortfolioError::DataError(format!(
                "indicator data starts at {} but returns start at {}",
                first.format("%Y-%m-%d"),
                early.format("%Y-%m-%d")
            )));
        }

        let mut last = vec![f64::NAN; self.names.len()];
        let mut src = 0;
        let mut values = Vec::with_capacity(targets.len());

        for target in targets {
            while src < self.timestamps.len() && self.timestamps[src] <= *target {
                for (j, v) in self.values[src].iter().enumerate() {
                    if v.is_finite() {
                        last[j] = *v;
                    }
                }
                src += 1;
            }
            values.push(last.clone());
        }

        Ok(IndicatorTable {
            timestamps: targets.to_vec(),
            names: self.names.clone(),
            values,
        })
    }
}

/// Load economic indicators (`date,VIX,T10Y2Y,...`); blank cells are allowed.
pub fn load_indicators(path: impl AsRef<Path>, config: &DataConfig) -> Result<IndicatorTable> {
    let table = read_wide(path.as_ref(), config, true)?;
    info!(
        "Loaded {} indicators over {} dates",
        table.columns.len(),
        table.timestamps.len()
    );
    Ok(IndicatorTable {
        timestamps: table.timestamps,
        names: table.columns,
        values: table.rows,
    })
}

/// Factor returns such as the Fama-French research factors.
#[derive(Debug, Clone)]
pub struct FactorTable {
    pub timestamps: Vec<DateTime<Utc>>,
    pub names: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

impl FactorTable {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let j = self.names.iter().position(|n| n == name)?;
        Some(self.values.iter().map(|r| r[j]).collect())
    }

    /// Drop a column (e.g. the risk-free rate) from the factor set.
    pub fn without(&self, name: &str) -> FactorTable {
        let keep: Vec<usize> = (0..self.names.len())
            .filter(|&j| self.names[j] != name)
            .collect();
        FactorTable {
            timestamps: self.timestamps.clone(),
            names: keep.iter().map(|&j| self.names[j].clone()).collect(),
            values: self
                .values
                .iter()
                .map(|r| keep.iter().map(|&j| r[j]).collect())
                .collect(),
        }
    }

    /// Rows at `indices`, in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> FactorTable {
        FactorTable {
            timestamps: indices.iter().map(|&i| self.timestamps[i]).collect(),
            names: self.names.clone(),
            values: indices.iter().map(|&i| self.values[i].clone()).collect(),
        }
    }

    /// Align factor rows to return dates.
    ///
    /// Monthly and quarterly data match on calendar month, since factor
    /// libraries label months while price data carries month-end dates.
    pub fn align_to(
        &self,
        targets: &[DateTime<Utc>],
        frequency: Frequency,
    ) -> Result<FactorTable> {
        let by_month = matches!(frequency, Frequency::Monthly | Frequency::Quarterly);
        let key = |ts: &DateTime<Utc>| -> (i32, u32, u32) {
            if by_month {
                (ts.year(), ts.month(), 0)
            } else {
                (ts.year(), ts.month(), ts.day())
            }
        };

        let index: BTreeMap<(i32, u32, u32), usize> = self
            .timestamps
            .iter()
            .enumerate()
            .map(|(i, ts)| (key(ts), i))
            .collect();

        let mut values = Vec::with_capacity(targets.len());
        for target in targets {
            let i = index.get(&key(target)).ok_or_else(|| {
                PortfolioError::DataError(format!(
                    "no factor observation for {}",
                    target.format("%Y-%m-%d")
                ))
            })?;
            values.push(self.values[*i].clone());
        }

        Ok(FactorTable {
            timestamps: targets.to_vec(),
            names: self.names.clone(),
            values,
        })
    }
}

/// Load factor returns; `percent` divides every value by 100.
pub fn load_factors(
    path: impl AsRef<Path>,
    config: &DataConfig,
    percent: bool,
) -> Result<FactorTable> {
    let table = read_wide(path.as_ref(), config, false)?;
    let scale = if percent { 0.01 } else { 1.0 };
    info!(
        "Loaded {} factors over {} dates",
        table.columns.len(),
        table.timestamps.len()
    );
    Ok(FactorTable {
        timestamps: table.timestamps,
        names: table.columns,
        values: table
            .rows
            .into_iter()
            .map(|r| r.into_iter().map(|v| v * scale).collect())
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn write_csv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file.flush().unwrap();
        file
    }

    fn daily(n: usize) -> Vec<DateTime<Utc>> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n).map(|i| start + Duration::days(i as i64)).collect()
    }

    #[test]
    fn test_load_prices_and_returns() {
        let file = write_csv(
            "Date,SPY,AGG\n2024-01-02,100,50\n2024-01-03,110,50\n2024-01-04,99,55\n",
        );
        let prices = load_prices(file.path(), &DataConfig::default()).unwrap();
        assert_eq!(prices.assets, vec!["SPY", "AGG"]);
        assert_eq!(prices.timestamps.len(), 3);

        let returns = prices.to_returns().unwrap();
        assert_eq!(returns.len(), 2);
        assert!((returns.row(0)[0] - 0.10).abs() < 1e-12);
        assert!((returns.row(1)[0] - (-0.10)).abs() < 1e-12);
        assert!((returns.row(1)[1] - 0.10).abs() < 1e-12);
        assert_eq!(returns.frequency(), Frequency::Daily);
    }

    #[test]
    fn test_load_prices_sorts_and_dedups() {
        let file = write_csv(
            "date;A\n2024-01-04;3\n2024-01-02;1\n2024-01-03;2\n2024-01-03;2\n",
        );
        let prices = load_prices(file.path(), &DataConfig::default()).unwrap();
        assert_eq!(prices.timestamps.len(), 3);
        assert_eq!(prices.prices[0][0], 1.0);
        assert_eq!(prices.prices[2][0], 3.0);
    }

    #[test]
    fn test_invalid_rows_skipped_or_rejected() {
        let file = write_csv("date,A\n2024-01-02,1\n2024-01-03,abc\n2024-01-04,2\n");
        let prices = load_prices(file.path(), &DataConfig::default()).unwrap();
        assert_eq!(prices.timestamps.len(), 2);

        let strict = DataConfig {
            skip_invalid: false,
            ..Default::default()
        };
        assert!(load_prices(file.path(), &strict).is_err());
    }

    #[test]
    fn test_non_positive_price_rejected() {
        let file = write_csv("date,A\n2024-01-02,1\n2024-01-03,0\n2024-01-04,2\n");
        let prices = load_prices(file.path(), &DataConfig::default()).unwrap();
        assert!(prices.to_returns().is_err());
    }

    #[test]
    fn test_parse_datetime_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
        assert_eq!(parse_datetime("2024-03-15", None).unwrap(), expected);
        assert_eq!(parse_datetime("2024/03/15", None).unwrap(), expected);
        assert_eq!(parse_datetime("20240315", None).unwrap(), expected);
        assert_eq!(
            parse_datetime("15.03.2024", Some("%d.%m.%Y")).unwrap(),
            expected
        );
        let month = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_datetime("2024-03", None).unwrap(), month);
        assert_eq!(parse_datetime("202403", None).unwrap(), month);
        assert!(parse_datetime("not a date", None).is_err());
    }

    #[test]
    fn test_detect_frequency() {
        assert_eq!(detect_frequency(&daily(10)).unwrap(), Frequency::Daily);

        let start = Utc.with_ymd_and_hms(2020, 1, 31, 0, 0, 0).unwrap();
        let monthly: Vec<_> = (0..12)
            .map(|i| start + Duration::days(30 * i as i64))
            .collect();
        assert_eq!(detect_frequency(&monthly).unwrap(), Frequency::Monthly);
    }

    #[test]
    fn test_detect_frequency_month_end_trading_days() {
        let month_ends: Vec<_> = [
            "2019-01-31", "2019-02-28", "2019-03-29", "2019-04-30", "2019-05-31", "2019-06-28",
            "2019-07-31", "2019-08-30", "2019-09-30", "2019-10-31", "2019-11-29", "2019-12-31",
        ]
        .iter()
        .map(|d| parse_datetime(d, None).unwrap())
        .collect();
        assert_eq!(detect_frequency(&month_ends).unwrap(), Frequency::Monthly);

        // First trading day of each month, with Labor Day pushing September out
        let month_starts: Vec<_> = ["2019-07-01", "2019-08-01", "2019-09-03", "2019-10-01"]
            .iter()
            .map(|d| parse_datetime(d, None).unwrap())
            .collect();
        assert_eq!(detect_frequency(&month_starts).unwrap(), Frequency::Monthly);

        let quarter_ends: Vec<_> = ["2019-03-29", "2019-06-28", "2019-09-30", "2019-12-31"]
            .iter()
            .map(|d| parse_datetime(d, None).unwrap())
            .collect();
        assert_eq!(detect_frequency(&quarter_ends).unwrap(), Frequency::Quarterly);
    }

    #[test]
    fn test_detect_frequency_rejects_gaps() {
        let mut ts = daily(10);
        ts.push(ts[9] + Duration::days(40));
        assert!(detect_frequency(&ts).is_err());
    }

    #[test]
    fn test_between_is_inclusive() {
        let ts = daily(10);
        let rows: Vec<Vec<f64>> = (0..10).map(|i| vec![i as f64 / 1000.0]).collect();
        let ds = ReturnsDataset::new(ts.clone(), vec!["A".into()], rows).unwrap();

        let sub = ds.between(Some(ts[2]), Some(ts[5])).unwrap();
        assert_eq!(sub.timestamps(), &ts[2..=5]);
        assert_eq!(sub.row(0)[0], 0.002);

        let tail = ds.between(Some(ts[7] + Duration::hours(1)), None).unwrap();
        assert_eq!(tail.len(), 2);
        assert!(ds.between(Some(ts[9]), None).is_err());

        assert_eq!(ds.slice(8, 20).len(), 2);
    }

    #[test]
    fn test_dataset_rejects_duplicates() {
        let mut ts = daily(3);
        ts[2] = ts[1];
        let rows = vec![vec![0.01]; 3];
        assert!(ReturnsDataset::new(ts, vec!["A".into()], rows).is_err());
    }

    #[test]
    fn test_dataset_rejects_non_finite() {
        let rows = vec![vec![0.01], vec![f64::NAN], vec![0.0]];
        assert!(ReturnsDataset::new(daily(3), vec!["A".into()], rows).is_err());
    }

    #[test]
    fn test_dataset_accessors() {
        let rows = vec![vec![0.01, 0.03], vec![-0.02, 0.0], vec![0.0, 0.02]];
        let ds = ReturnsDataset::new(daily(3), vec!["A".into(), "B".into()], rows).unwrap();
        assert_eq!(ds.column(1), vec![0.03, 0.0, 0.02]);
        assert_eq!(ds.asset_index("B"), Some(1));
        let composite = ds.equal_weight_composite();
        assert!((composite[0] - 0.02).abs() < 1e-12);

        let subset = ds.select_rows(&[0, 2]);
        assert_eq!(subset.len(), 2);
        assert_eq!(subset.row(1), &[0.0, 0.02]);

        let only_b = ds.select_assets(&["B".to_string()]).unwrap();
        assert_eq!(only_b.n_assets(), 1);
        assert_eq!(only_b.column(0), ds.column(1));
    }

    #[test]
    fn test_indicator_forward_fill() {
        let file = write_csv("date,VIX,GDP\n2024-01-01,20,\n2024-01-03,35,1.5\n");
        let table = load_indicators(file.path(), &DataConfig::default()).unwrap();
        let aligned = table.align_to(&daily(5)).unwrap();
        let vix = aligned.column("VIX").unwrap();
        assert_eq!(vix, vec![20.0, 20.0, 35.0, 35.0, 35.0]);
        let gdp = aligned.column("GDP").unwrap();
        assert!(gdp[0].is_nan());
        assert_eq!(gdp[4], 1.5);
    }

    #[test]
    fn test_indicator_alignment_before_start_fails() {
        let file = write_csv("date,VIX\n2024-01-03,20\n");
        let table = load_indicators(file.path(), &DataConfig::default()).unwrap();
        assert!(table.align_to(&daily(5)).is_err());
    }

    #[test]
    fn test_factor_percent_and_monthly_alignment() {
        let file = write_csv("date,Mkt-RF,SMB,RF\n202401,1.5,-0.5,0.4\n202402,2.0,0.1,0.4\n");
        let factors = load_factors(file.path(), &DataConfig::default(), true).unwrap();
        assert!((factors.values[0][0] - 0.015).abs() < 1e-12);

        let month_ends = vec![
            Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap(),
        ];
        let aligned = factors.align_to(&month_ends, Frequency::Monthly).unwrap();
        assert!((aligned.values[1][0] - 0.02).abs() < 1e-12);

        let no_rf = aligned.without("RF");
        assert_eq!(no_rf.names, vec!["Mkt-RF", "SMB"]);

        let daily_targets = daily(2);
        assert!(factors.align_to(&daily_targets, Frequency::Daily).is_err());
    }

    #[test]
    fn test_load_price_dir_inner_join() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("SPY.csv"),
            "Date,Open,High,Low,Close,Volume\n2024-01-02,1,1,1,100,10\n2024-01-03,1,1,1,101,10\n2024-01-04,1,1,1,102,10\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("GLD.csv"),
            "Date,Close\n2024-01-03,50\n2024-01-04,51\n2024-01-05,52\n",
        )
        .unwrap();

        let prices = load_price_dir(dir.path(), &DataConfig::default()).unwrap();
        assert_eq!(prices.assets, vec!["GLD", "SPY"]);
        assert_eq!(prices.timestamps.len(), 2);
        assert_eq!(prices.prices[0], vec![50.0, 101.0]);
    }
}
