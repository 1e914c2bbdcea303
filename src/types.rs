//! Core data types shared across the crate.

use crate::error::{PortfolioError, Result};
use crate::regime::Regime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tolerance applied to the sum-to-one invariant of weight vectors.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Sampling frequency of a return series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
}

impl Frequency {
    /// Number of periods in a year, used for annualization.
    pub fn periods_per_year(&self) -> f64 {
        match self {
            Frequency::Daily => 252.0,
            Frequency::Weekly => 52.0,
            Frequency::Monthly => 12.0,
            Frequency::Quarterly => 4.0,
        }
    }

    /// Inclusive range of calendar-day gaps accepted between consecutive observations.
    ///
    /// Daily data may skip weekends and holidays, monthly data follows month lengths.
    pub fn gap_bounds(&self) -> (i64, i64) {
        match self {
            Frequency::Daily => (1, 5),
            Frequency::Weekly => (5, 9),
            Frequency::Monthly => (26, 35),
            Frequency::Quarterly => (84, 98),
        }
    }

    /// Classify a typical gap (in days) into a frequency.
    pub fn from_gap_days(days: i64) -> Option<Self> {
        [
            Frequency::Daily,
            Frequency::Weekly,
            Frequency::Monthly,
            Frequency::Quarterly,
        ]
        .into_iter()
        .find(|f| {
            let (lo, hi) = f.gap_bounds();
            days >= lo && days <= hi
        })
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Quarterly => "quarterly",
        };
        write!(f, "{}", s)
    }
}

/// Allocation across assets.
///
/// Weights are finite and always sum to one (within [`WEIGHT_TOLERANCE`]).
/// Negative weights are short positions; use [`WeightVector::is_long_only`]
/// to check the no-short constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct WeightVector(BTreeMap<String, f64>);

impl WeightVector {
    /// Create a weight vector, validating the sum-to-one invariant.
    pub fn new(weights: BTreeMap<String, f64>) -> Result<Self> {
        if weights.is_empty() {
            return Err(PortfolioError::InvalidWeights(
                "weight vector is empty".to_string(),
            ));
        }
        if let Some((asset, w)) = weights.iter().find(|(_, w)| !w.is_finite()) {
            return Err(PortfolioError::InvalidWeights(format!(
                "weight for {} is not finite: {}",
                asset, w
            )));
        }
        let sum: f64 = weights.values().sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(PortfolioError::InvalidWeights(format!(
                "weights sum to {:.8}, expected 1",
                sum
            )));
        }
        Ok(Self(weights))
    }

    /// Create from parallel slices of asset names and weights.
    pub fn from_slice(assets: &[String], weights: &[f64]) -> Result<Self> {
        if assets.len() != weights.len() {
            return Err(PortfolioError::InvalidInput(format!(
                "{} assets but {} weights",
                assets.len(),
                weights.len()
            )));
        }
        Self::new(assets.iter().cloned().zip(weights.iter().copied()).collect())
    }

    /// Scale raw scores so they sum to one.
    pub fn normalized(assets: &[String], raw: &[f64]) -> Result<Self> {
        let total: f64 = raw.iter().sum();
        if !total.is_finite() || total.abs() < 1e-12 {
            return Err(PortfolioError::InvalidWeights(format!(
                "cannot normalize weights with total {}",
                total
            )));
        }
        let scaled: Vec<f64> = raw.iter().map(|w| w / total).collect();
        Self::from_slice(assets, &scaled)
    }

    /// Equal weight across all assets.
    pub fn equal(assets: &[String]) -> Result<Self> {
        if assets.is_empty() {
            return Err(PortfolioError::InvalidWeights(
                "cannot build equal weights for zero assets".to_string(),
            ));
        }
        let w = 1.0 / assets.len() as f64;
        Self::from_slice(assets, &vec![w; assets.len()])
    }

    /// Weight for an asset (zero when absent).
    pub fn get(&self, asset: &str) -> f64 {
        self.0.get(asset).copied().unwrap_or(0.0)
    }

    /// Weights ordered to match `assets`.
    pub fn to_vec(&self, assets: &[String]) -> Vec<f64> {
        assets.iter().map(|a| self.get(a)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn assets(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.0.values().sum()
    }

    /// True when no weight is meaningfully negative.
    pub fn is_long_only(&self) -> bool {
        self.0.values().all(|&w| w >= -WEIGHT_TOLERANCE)
    }

    /// One-way turnover: half the sum of absolute weight changes.
    pub fn turnover(&self, other: &WeightVector) -> f64 {
        let total_diff: f64 = self
            .0
            .keys()
            .chain(other.0.keys())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .map(|a| (self.get(a) - other.get(a)).abs())
            .sum();
        total_diff / 2.0
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.0
    }
}

impl TryFrom<BTreeMap<String, f64>> for WeightVector {
    type Error = PortfolioError;

    fn try_from(value: BTreeMap<String, f64>) -> Result<Self> {
        Self::new(value)
    }
}

impl From<WeightVector> for BTreeMap<String, f64> {
    fn from(value: WeightVector) -> Self {
        value.0
    }
}

impl fmt::Display for WeightVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(a, w)| format!("{}={:.2}%", a, w * 100.0))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Equity snapshot at the end of a period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    /// Portfolio return over the period, net of costs.
    pub period_return: f64,
    /// Drawdown from the running peak, as a percentage.
    pub drawdown_pct: f64,
    /// Regime the period was labeled with.
    pub regime: Option<Regime>,
}
