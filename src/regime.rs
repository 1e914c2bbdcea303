//! Market regime classification.
//!
//! Every period of a market return series is labeled with one of four
//! regimes using transparent rules on trailing volatility, trend and
//! drawdown, optionally combined with an economic indicator such as VIX:
//!
//! - **HighVolatility**: trailing annualized volatility (or the indicator)
//!   above its threshold. Takes priority over everything else.
//! - **Bear**: deep drawdown with a negative trailing trend.
//! - **Recovery**: deep drawdown with a positive trend, or a rebound out of
//!   a bear market that has not yet closed the drawdown.
//! - **Bull**: everything else.
//!
//! Labels only use information available at the labeled timestamp.
//!
//! # Example
//!
//! ```ignore
//! use regimefolio::regime::{RegimeConfig, RuleBasedClassifier};
//!
//! let classifier = RuleBasedClassifier::new(RegimeConfig::default());
//! let labels = classifier.classify_dataset(&dataset, Some("SPY"), None)?;
//! for segment in labels.segments() {
//!     println!("{} .. {}: {}", segment.start_time, segment.end_time, segment.regime);
//! }
//! ```

use crate::data::{parse_datetime, DataConfig, ReturnsDataset};
use crate::error::{PortfolioError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Market regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Bull,
    Bear,
    Recovery,
    HighVolatility,
}

impl Regime {
    pub const ALL: [Regime; 4] = [
        Regime::Bull,
        Regime::Bear,
        Regime::Recovery,
        Regime::HighVolatility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Bull => "bull",
            Regime::Bear => "bear",
            Regime::Recovery => "recovery",
            Regime::HighVolatility => "high_volatility",
        }
    }

    /// Directional regimes describe the market trend; high volatility overrides it.
    pub fn is_directional(&self) -> bool {
        !matches!(self, Regime::HighVolatility)
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Regime {
    type Err = PortfolioError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "bull" => Ok(Regime::Bull),
            "bear" => Ok(Regime::Bear),
            "recovery" => Ok(Regime::Recovery),
            "high_volatility" | "highvolatility" | "high_vol" | "crisis" => {
                Ok(Regime::HighVolatility)
            }
            _ => Err(PortfolioError::InvalidInput(format!(
                "unknown regime '{}' (expected bull, bear, recovery or high_volatility)",
                s
            ))),
        }
    }
}

/// One regime label per timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeLabels {
    timestamps: Vec<DateTime<Utc>>,
    labels: Vec<Regime>,
}

impl RegimeLabels {
    pub fn new(timestamps: Vec<DateTime<Utc>>, labels: Vec<Regime>) -> Result<Self> {
        if timestamps.len() != labels.len() {
            return Err(PortfolioError::RegimeCoverage(format!(
                "{} timestamps but {} labels",
                timestamps.len(),
                labels.len()
            )));
        }
        if timestamps.windows(2).any(|w| w[1] <= w[0]) {
            return Err(PortfolioError::DataError(
                "regime timestamps must be strictly increasing".to_string(),
            ));
        }
        Ok(Self { timestamps, labels })
    }

    /// Read externally produced labels from a `date,regime` CSV.
    pub fn from_csv(path: impl AsRef<Path>, config: &DataConfig) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading regime labels from: {}", path.display());

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .delimiter(config.delimiter.unwrap_or(b','))
            .from_path(path)?;
        let headers = reader.headers()?.clone();
        let regime_idx = headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case("regime"))
            .unwrap_or(1);

        let mut entries: BTreeMap<DateTime<Utc>, Regime> = BTreeMap::new();
        let mut duplicates = 0;
        for result in reader.records() {
            let record = result?;
            let date = record
                .get(0)
                .ok_or_else(|| PortfolioError::DataError("missing date".to_string()))?;
            let ts = parse_datetime(date, config.date_format.as_deref())?;
            let regime: Regime = record
                .get(regime_idx)
                .ok_or_else(|| PortfolioError::DataError("missing regime".to_string()))?
                .parse()?;
            // First label for a date wins
            match entries.entry(ts) {
                Entry::Vacant(slot) => {
                    slot.insert(regime);
                }
                Entry::Occupied(_) => duplicates += 1,
            }
        }
        if duplicates > 0 {
            warn!(
                "Ignored {} duplicate dates in {}",
                duplicates,
                path.display()
            );
        }

        if entries.is_empty() {
            return Err(PortfolioError::NoData);
        }
        let (timestamps, labels) = entries.into_iter().unzip();
        Self::new(timestamps, labels)
    }

    /// Restrict labels to `targets`; every target must carry a label.
    pub fn align_to(&self, targets: &[DateTime<Utc>]) -> Result<Self> {
        let lookup: HashMap<DateTime<Utc>, Regime> = self
            .timestamps
            .iter()
            .copied()
            .zip(self.labels.iter().copied())
            .collect();

        let labels = targets
            .iter()
            .map(|ts| {
                lookup.get(ts).copied().ok_or_else(|| {
                    PortfolioError::RegimeCoverage(format!(
                        "no regime label for {}",
                        ts.format("%Y-%m-%d")
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Self::new(targets.to_vec(), labels)
    }

    /// Check that the labels match the given timestamps one-to-one.
    pub fn ensure_covers(&self, timestamps: &[DateTime<Utc>]) -> Result<()> {
        if self.timestamps != timestamps {
            return Err(PortfolioError::RegimeCoverage(format!(
                "{} labels for {} return periods",
                self.labels.len(),
                timestamps.len()
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn labels(&self) -> &[Regime] {
        &self.labels
    }

    pub fn get(&self, i: usize) -> Option<Regime> {
        self.labels.get(i).copied()
    }

    /// Row indices carrying `regime`.
    pub fn indices_of(&self, regime: Regime) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, r)| **r == regime)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn counts(&self) -> BTreeMap<Regime, usize> {
        let mut counts = BTreeMap::new();
        for regime in &self.labels {
            *counts.entry(*regime).or_insert(0) += 1;
        }
        counts
    }

    /// Contiguous runs of the same regime.
    pub fn segments(&self) -> Vec<RegimeSegment> {
        let mut segments = Vec::new();
        let mut start = 0;
        for i in 1..=self.labels.len() {
            if i == self.labels.len() || self.labels[i] != self.labels[start] {
                segments.push(RegimeSegment {
                    regime: self.labels[start],
                    start,
                    end: i - 1,
                    start_time: self.timestamps[start],
                    end_time: self.timestamps[i - 1],
                    periods: i - start,
                });
                start = i;
            }
        }
        segments
    }
}

/// A contiguous run of one regime (`start..=end`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSegment {
    pub regime: Regime,
    pub start: usize,
    pub end: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub periods: usize,
}

/// Configuration for the rule-based classifier.
///
/// Lookbacks are in periods of the input series; thresholds are fractions
/// (0.20 is a 20% drawdown).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Trailing window for realized volatility.
    pub vol_lookback: usize,
    /// Trailing window for the compounded trend.
    pub trend_lookback: usize,
    /// Annualized volatility above which the market is `HighVolatility`.
    pub high_vol_threshold: f64,
    /// Indicator level above which the market is `HighVolatility`.
    pub indicator_threshold: Option<f64>,
    /// Drawdown from peak that marks a bear market.
    pub bear_drawdown: f64,
    /// Recovery ends once the drawdown shrinks to this level.
    pub recovery_exit_drawdown: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            vol_lookback: 21,
            trend_lookback: 63,
            high_vol_threshold: 0.30,
            indicator_threshold: Some(30.0),
            bear_drawdown: 0.20,
            recovery_exit_drawdown: 0.05,
        }
    }
}

impl RegimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vol_lookback < 2 || self.trend_lookback == 0 {
            return Err(PortfolioError::ConfigError(
                "vol_lookback must be >= 2 and trend_lookback >= 1".to_string(),
            ));
        }
        if self.high_vol_threshold <= 0.0 {
            return Err(PortfolioError::ConfigError(
                "high_vol_threshold must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.bear_drawdown) || self.bear_drawdown == 0.0 {
            return Err(PortfolioError::ConfigError(
                "bear_drawdown must be in (0, 1)".to_string(),
            ));
        }
        if self.recovery_exit_drawdown < 0.0 || self.recovery_exit_drawdown >= self.bear_drawdown {
            return Err(PortfolioError::ConfigError(
                "recovery_exit_drawdown must be in [0, bear_drawdown)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rule-based regime classifier.
pub struct RuleBasedClassifier {
    config: RegimeConfig,
}

impl RuleBasedClassifier {
    pub fn new(config: RegimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RegimeConfig {
        &self.config
    }

    /// Label every period of `market_returns`.
    ///
    /// `indicator`, when given, must be aligned with the returns; NaN entries
    /// are ignored.
    pub fn classify(
        &self,
        market_returns: &[f64],
        timestamps: &[DateTime<Utc>],
        periods_per_year: f64,
        indicator: Option<&[f64]>,
    ) -> Result<RegimeLabels> {
        self.config.validate()?;

        if market_returns.len() != timestamps.len() {
            return Err(PortfolioError::InvalidInput(format!(
                "{} returns but {} timestamps",
                market_returns.len(),
                timestamps.len()
            )));
        }
        if market_returns.is_empty() {
            return Err(PortfolioError::NoData);
        }
        if let Some(ind) = indicator {
            if ind.len() != market_returns.len() {
                return Err(PortfolioError::InvalidInput(format!(
                    "indicator has {} values for {} returns",
                    ind.len(),
                    market_returns.len()
                )));
            }
        }

        let cfg = &self.config;
        let mut labels = Vec::with_capacity(market_returns.len());
        let mut level = 1.0;
        let mut peak = 1.0_f64;
        let mut last_directional: Option<Regime> = None;

        for t in 0..market_returns.len() {
            level *= 1.0 + market_returns[t];
            peak = peak.max(level);
            let drawdown = 1.0 - level / peak;

            let vol_window = &market_returns[(t + 1).saturating_sub(cfg.vol_lookback)..=t];
            let vol = annualized_std(vol_window, periods_per_year);

            let trend_window = &market_returns[(t + 1).saturating_sub(cfg.trend_lookback)..=t];
            let trend = trend_window.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0;

            let indicator_stress = match (indicator, cfg.indicator_threshold) {
                (Some(ind), Some(threshold)) => ind[t].is_finite() && ind[t] > threshold,
                _ => false,
            };

            let regime = if vol > cfg.high_vol_threshold || indicator_stress {
                Regime::HighVolatility
            } else if drawdown >= cfg.bear_drawdown {
                if trend < 0.0 {
                    Regime::Bear
                } else {
                    Regime::Recovery
                }
            } else if matches!(last_directional, Some(Regime::Bear | Regime::Recovery))
                && trend > 0.0
                && drawdown > cfg.recovery_exit_drawdown
            {
                Regime::Recovery
            } else {
                Regime::Bull
            };

            if regime.is_directional() {
                last_directional = Some(regime);
            }
            labels.push(regime);
        }

        let labels = RegimeLabels::new(timestamps.to_vec(), labels)?;
        debug!("Regime counts: {:?}", labels.counts());
        Ok(labels)
    }

    /// Classify using a benchmark asset, or the equal-weight composite when
    /// `benchmark` is `None`.
    pub fn classify_dataset(
        &self,
        dataset: &ReturnsDataset,
        benchmark: Option<&str>,
        indicator: Option<&[f64]>,
    ) -> Result<RegimeLabels> {
        let market = match benchmark {
            Some(name) => dataset.asset_returns(name).ok_or_else(|| {
                PortfolioError::InvalidInput(format!("benchmark asset '{}' not in dataset", name))
            })?,
            None => dataset.equal_weight_composite(),
        };
        info!(
            "Classifying {} periods using {}",
            market.len(),
            benchmark.unwrap_or("the equal-weight composite")
        );
        self.classify(
            &market,
            dataset.timestamps(),
            dataset.periods_per_year(),
            indicator,
        )
    }
}

fn annualized_std(window: &[f64], periods_per_year: f64) -> f64 {
    if window.len() < 2 {
        return 0.0;
    }
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let var = window.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    var.sqrt() * periods_per_year.sqrt()
}

/// A switch between consecutive labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeChange {
    /// Index of the first period in the new regime.
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub from: Regime,
    pub to: Regime,
}

/// Detect regime changes in a label sequence.
pub fn detect_regime_changes(labels: &RegimeLabels) -> Vec<RegimeChange> {
    labels
        .labels
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[0] != w[1])
        .map(|(i, w)| RegimeChange {
            index: i + 1,
            timestamp: labels.timestamps[i + 1],
            from: w[0],
            to: w[1],
        })
        .collect()
}

/// Summary statistics of a label sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeStats {
    pub counts: BTreeMap<Regime, usize>,
    /// Share of periods in each regime, in percent.
    pub percentages: BTreeMap<Regime, f64>,
    /// Average run length of each regime, in periods.
    pub avg_durations: BTreeMap<Regime, f64>,
    pub num_changes: usize,
    /// Average periods between changes.
    pub avg_regime_duration: f64,
    /// Observed transitions `(from, to) -> count`.
    pub transitions: Vec<(Regime, Regime, usize)>,
}

impl RegimeStats {
    pub fn from_labels(labels: &RegimeLabels) -> Self {
        let counts = labels.counts();
        let total = labels.len().max(1) as f64;

        let percentages = counts
            .iter()
            .map(|(r, c)| (*r, *c as f64 / total * 100.0))
            .collect();

        let mut runs: BTreeMap<Regime, Vec<usize>> = BTreeMap::new();
        for segment in labels.segments() {
            runs.entry(segment.regime).or_default().push(segment.periods);
        }
        let avg_durations = runs
            .into_iter()
            .map(|(r, v)| (r, v.iter().sum::<usize>() as f64 / v.len() as f64))
            .collect();

        let changes = detect_regime_changes(labels);
        let mut transition_counts: BTreeMap<(Regime, Regime), usize> = BTreeMap::new();
        for change in &changes {
            *transition_counts.entry((change.from, change.to)).or_insert(0) += 1;
        }

        let num_changes = changes.len();
        Self {
            counts,
            percentages,
            avg_durations,
            num_changes,
            avg_regime_duration: labels.len() as f64 / (num_changes + 1) as f64,
            transitions: transition_counts
                .into_iter()
                .map(|((from, to), n)| (from, to, n))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn dates(n: usize) -> Vec<DateTime<Utc>> {
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        (0..n).map(|i| start + Duration::days(i as i64)).collect()
    }

    fn quiet_config() -> RegimeConfig {
        RegimeConfig {
            vol_lookback: 5,
            trend_lookback: 5,
            high_vol_threshold: 10.0,
            indicator_threshold: Some(30.0),
            bear_drawdown: 0.20,
            recovery_exit_drawdown: 0.05,
        }
    }

    #[test]
    fn test_regime_parse_and_display() {
        assert_eq!("Bull".parse::<Regime>().unwrap(), Regime::Bull);
        assert_eq!(
            "high-volatility".parse::<Regime>().unwrap(),
            Regime::HighVolatility
        );
        assert_eq!(Regime::HighVolatility.to_string(), "high_volatility");
        assert!("sideways".parse::<Regime>().is_err());
    }

    #[test]
    fn test_steady_gains_are_bull() {
        let returns = vec![0.001; 50];
        let labels = RuleBasedClassifier::new(quiet_config())
            .classify(&returns, &dates(50), 252.0, None)
            .unwrap();
        assert_eq!(labels.len(), 50);
        assert!(labels.labels().iter().all(|r| *r == Regime::Bull));
    }

    #[test]
    fn test_crash_then_rebound() {
        // 5 steady days, a 30% crash spread over 3 days, then a rebound.
        let mut returns = vec![0.0; 5];
        returns.extend([-0.11, -0.11, -0.11]);
        returns.extend(vec![0.02; 20]);
        let labels = RuleBasedClassifier::new(quiet_config())
            .classify(&returns, &dates(returns.len()), 252.0, None)
            .unwrap();

        assert_eq!(labels.get(4), Some(Regime::Bull));
        assert_eq!(labels.get(7), Some(Regime::Bear));
        // Trend turns positive while the drawdown is still deep
        assert!(labels.labels()[8..].contains(&Regime::Recovery));
        // Rebound closes the drawdown eventually
        assert_eq!(labels.labels().last(), Some(&Regime::Bull));
    }

    #[test]
    fn test_high_volatility_has_priority() {
        let returns: Vec<f64> = (0..30)
            .map(|i| if i % 2 == 0 { 0.05 } else { -0.045 })
            .collect();
        let cfg = RegimeConfig {
            high_vol_threshold: 0.30,
            ..quiet_config()
        };
        let labels = RuleBasedClassifier::new(cfg)
            .classify(&returns, &dates(30), 252.0, None)
            .unwrap();
        assert_eq!(labels.get(29), Some(Regime::HighVolatility));
    }

    #[test]
    fn test_indicator_triggers_high_volatility() {
        let returns = vec![0.0; 4];
        let vix = vec![15.0, 45.0, f64::NAN, 20.0];
        let labels = RuleBasedClassifier::new(quiet_config())
            .classify(&returns, &dates(4), 252.0, Some(&vix))
            .unwrap();
        assert_eq!(
            labels.labels(),
            &[
                Regime::Bull,
                Regime::HighVolatility,
                Regime::Bull,
                Regime::Bull
            ]
        );
    }

    #[test]
    fn test_classify_rejects_mismatched_input() {
        let classifier = RuleBasedClassifier::new(quiet_config());
        assert!(classifier.classify(&[0.0; 3], &dates(2), 252.0, None).is_err());
        assert!(classifier
            .classify(&[0.0; 3], &dates(3), 252.0, Some(&[1.0]))
            .is_err());
    }

    #[test]
    fn test_invalid_config() {
        let cfg = RegimeConfig {
            recovery_exit_drawdown: 0.3,
            ..RegimeConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_segments_and_changes() {
        let labels = RegimeLabels::new(
            dates(5),
            vec![
                Regime::Bull,
                Regime::Bull,
                Regime::Bear,
                Regime::Bear,
                Regime::Bull,
            ],
        )
        .unwrap();

        let segments = labels.segments();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[1].regime, Regime::Bear);
        assert_eq!((segments[1].start, segments[1].end), (2, 3));

        let changes = detect_regime_changes(&labels);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].index, 2);
        assert_eq!(changes[0].from, Regime::Bull);

        assert_eq!(labels.indices_of(Regime::Bear), vec![2, 3]);
    }

    #[test]
    fn test_regime_stats() {
        let labels = RegimeLabels::new(
            dates(4),
            vec![Regime::Bull, Regime::Bull, Regime::Bear, Regime::Bull],
        )
        .unwrap();
        let stats = RegimeStats::from_labels(&labels);
        assert_eq!(stats.counts[&Regime::Bull], 3);
        assert!((stats.percentages[&Regime::Bear] - 25.0).abs() < 1e-9);
        assert!((stats.avg_durations[&Regime::Bull] - 1.5).abs() < 1e-9);
        assert_eq!(stats.num_changes, 2);
        assert_eq!(stats.transitions.len(), 2);
    }

    #[test]
    fn test_align_requires_full_coverage() {
        let labels = RegimeLabels::new(dates(3), vec![Regime::Bull; 3]).unwrap();
        assert!(labels.align_to(&dates(3)[1..]).is_ok());
        assert!(labels.align_to(&dates(4)).is_err());
    }

    #[test]
    fn test_from_csv() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "date,regime\n2020-01-02,bear\n2020-01-01,bull\n2020-01-03,high_volatility\n"
        )
        .unwrap();
        let labels = RegimeLabels::from_csv(file.path(), &DataConfig::default()).unwrap();
        assert_eq!(
            labels.labels(),
            &[Regime::Bull, Regime::Bear, Regime::HighVolatility]
        );
    }

    #[test]
    fn test_from_csv_keeps_first_duplicate() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "date,regime\n2020-01-01,bull\n2020-01-02,bear\n2020-01-02,recovery\n"
        )
        .unwrap();
        let labels = RegimeLabels::from_csv(file.path(), &DataConfig::default()).unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get(1), Some(Regime::Bear));
    }
}
