//! Return and risk statistics.
//!
//! Estimates per-asset means, volatilities, downside deviations and the
//! covariance matrix of a [`ReturnsDataset`], either over the whole sample
//! or separately for each market regime.
//!
//! All estimates are per period; the `annualized_*` helpers scale means by
//! the number of periods per year and volatilities by its square root.
//!
//! Three covariance estimators are available:
//!
//! - [`CovarianceEstimator::Sample`]: unbiased sample covariance (n - 1).
//! - [`CovarianceEstimator::LedoitWolf`]: shrinkage toward a scaled identity
//!   with the analytic optimal intensity. Well conditioned even when the
//!   number of observations is close to the number of assets.
//! - [`CovarianceEstimator::Ewma`]: exponentially weighted, recent
//!   observations count more.

use crate::data::ReturnsDataset;
use crate::error::{PortfolioError, Result};
use crate::regime::{Regime, RegimeLabels};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const SYMMETRY_TOLERANCE: f64 = 1e-9;
const PSD_TOLERANCE: f64 = 1e-10;

/// Covariance estimation method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum CovarianceEstimator {
    Sample,
    LedoitWolf,
    Ewma { decay: f64 },
}

impl Default for CovarianceEstimator {
    fn default() -> Self {
        CovarianceEstimator::LedoitWolf
    }
}

/// Settings for [`ReturnStatistics::estimate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub covariance: CovarianceEstimator,
    /// Fewer observations than this is an error (regimes below it are skipped).
    pub min_observations: usize,
    /// Minimum acceptable per-period return for downside deviation.
    pub minimum_acceptable_return: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            covariance: CovarianceEstimator::default(),
            min_observations: 20,
            minimum_acceptable_return: 0.0,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if let CovarianceEstimator::Ewma { decay } = self.covariance {
            if !(decay > 0.0 && decay < 1.0) {
                return Err(PortfolioError::ConfigError(format!(
                    "EWMA decay must be in (0, 1), got {}",
                    decay
                )));
            }
        }
        Ok(())
    }
}

/// Symmetric, finite covariance matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CovarianceMatrix {
    matrix: DMatrix<f64>,
}

impl CovarianceMatrix {
    /// Build from row-major values, validating shape, finiteness and symmetry.
    pub fn new(rows: Vec<Vec<f64>>) -> Result<Self> {
        let n = rows.len();
        if n == 0 {
            return Err(PortfolioError::InvalidInput(
                "covariance matrix is empty".to_string(),
            ));
        }
        if rows.iter().any(|r| r.len() != n) {
            return Err(PortfolioError::InvalidInput(
                "covariance matrix must be square".to_string(),
            ));
        }
        Self::from_matrix(DMatrix::from_fn(n, n, |i, j| rows[i][j]))
    }

    pub fn from_matrix(matrix: DMatrix<f64>) -> Result<Self> {
        if !matrix.is_square() || matrix.nrows() == 0 {
            return Err(PortfolioError::InvalidInput(
                "covariance matrix must be square and non-empty".to_string(),
            ));
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(PortfolioError::InvalidInput(
                "covariance matrix contains non-finite values".to_string(),
            ));
        }
        let scale = matrix.amax().max(1.0);
        let n = matrix.nrows();
        for i in 0..n {
            if matrix[(i, i)] < -PSD_TOLERANCE {
                return Err(PortfolioError::InvalidInput(format!(
                    "negative variance {} on the diagonal",
                    matrix[(i, i)]
                )));
            }
            for j in (i + 1)..n {
                if (matrix[(i, j)] - matrix[(j, i)]).abs() > SYMMETRY_TOLERANCE * scale {
                    return Err(PortfolioError::InvalidInput(format!(
                        "covariance matrix is not symmetric at ({}, {})",
                        i, j
                    )));
                }
            }
        }
        // Remove floating-point asymmetry
        let symmetric = (&matrix + matrix.transpose()) * 0.5;
        Ok(Self { matrix: symmetric })
    }

    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.matrix[(i, j)]
    }

    pub fn as_matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        (0..self.dim())
            .map(|i| self.matrix.row(i).iter().copied().collect())
            .collect()
    }

    pub fn variances(&self) -> Vec<f64> {
        self.matrix.diagonal().iter().copied().collect()
    }

    pub fn volatilities(&self) -> Vec<f64> {
        self.variances().iter().map(|v| v.max(0.0).sqrt()).collect()
    }

    fn min_eigenvalue(&self) -> f64 {
        SymmetricEigen::new(self.matrix.clone())
            .eigenvalues
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }

    pub fn is_positive_semidefinite(&self) -> bool {
        let scale = self.matrix.amax().max(1.0);
        self.min_eigenvalue() >= -PSD_TOLERANCE * scale
    }

    /// Nearest PSD matrix in Frobenius norm, by clipping negative eigenvalues.
    pub fn nearest_psd(&self) -> CovarianceMatrix {
        let eigen = SymmetricEigen::new(self.matrix.clone());
        let clipped = eigen.eigenvalues.map(|l| l.max(0.0));
        let rebuilt =
            &eigen.eigenvectors * DMatrix::from_diagonal(&clipped) * eigen.eigenvectors.transpose();
        CovarianceMatrix {
            matrix: (&rebuilt + rebuilt.transpose()) * 0.5,
        }
    }

    /// Correlation matrix; assets with zero variance get zero correlation.
    pub fn correlation(&self) -> Vec<Vec<f64>> {
        let vols = self.volatilities();
        let n = self.dim();
        (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| {
                        if i == j {
                            1.0
                        } else if vols[i] > 0.0 && vols[j] > 0.0 {
                            (self.matrix[(i, j)] / (vols[i] * vols[j])).clamp(-1.0, 1.0)
                        } else {
                            0.0
                        }
                    })
                    .collect()
            })
            .collect()
    }

    /// `w' Σ w`.
    pub fn portfolio_variance(&self, weights: &[f64]) -> f64 {
        let w = DVector::from_column_slice(weights);
        (w.transpose() * &self.matrix * &w)[(0, 0)]
    }

    /// `Σ w`, the marginal contribution of each asset to variance.
    pub fn times(&self, weights: &[f64]) -> Vec<f64> {
        let w = DVector::from_column_slice(weights);
        (&self.matrix * w).iter().copied().collect()
    }

    pub fn scaled(&self, factor: f64) -> CovarianceMatrix {
        CovarianceMatrix {
            matrix: &self.matrix * factor,
        }
    }
}

fn to_matrix(rows: &[Vec<f64>]) -> DMatrix<f64> {
    let t = rows.len();
    let n = rows.first().map_or(0, |r| r.len());
    DMatrix::from_fn(t, n, |i, j| rows[i][j])
}

fn column_means(x: &DMatrix<f64>) -> DVector<f64> {
    let t = x.nrows() as f64;
    DVector::from_iterator(x.ncols(), x.column_iter().map(|c| c.sum() / t))
}

fn demeaned(x: &DMatrix<f64>) -> DMatrix<f64> {
    let means = column_means(x);
    DMatrix::from_fn(x.nrows(), x.ncols(), |i, j| x[(i, j)] - means[j])
}

/// Unbiased sample covariance of row-major returns.
pub fn sample_covariance(rows: &[Vec<f64>]) -> Result<DMatrix<f64>> {
    if rows.len() < 2 {
        return Err(PortfolioError::InsufficientData {
            required: 2,
            actual: rows.len(),
        });
    }
    let xc = demeaned(&to_matrix(rows));
    Ok(xc.transpose() * &xc / (rows.len() as f64 - 1.0))
}

/// Ledoit-Wolf shrinkage toward `m·I`, returning the estimate and the
/// shrinkage intensity in `[0, 1]`.
pub fn ledoit_wolf_covariance(rows: &[Vec<f64>]) -> Result<(DMatrix<f64>, f64)> {
    if rows.len() < 2 {
        return Err(PortfolioError::InsufficientData {
            required: 2,
            actual: rows.len(),
        });
    }
    let t = rows.len() as f64;
    let xc = demeaned(&to_matrix(rows));
    let n = xc.ncols();
    let s = xc.transpose() * &xc / t;

    let mu = s.trace() / n as f64;
    let target = DMatrix::<f64>::identity(n, n) * mu;
    let d2 = (&s - &target).norm_squared();

    let mut b_bar2 = 0.0;
    for row in xc.row_iter() {
        let x = row.transpose();
        b_bar2 += (&x * x.transpose() - &s).norm_squared();
    }
    b_bar2 /= t * t;

    let shrinkage = if d2 <= f64::EPSILON {
        1.0
    } else {
        (b_bar2.min(d2) / d2).clamp(0.0, 1.0)
    };

    debug!("Ledoit-Wolf shrinkage intensity: {:.4}", shrinkage);
    Ok((&target * shrinkage + &s * (1.0 - shrinkage), shrinkage))
}

/// Exponentially weighted covariance; the newest row has weight 1, the one
/// before it `decay`, and so on.
pub fn ewma_covariance(rows: &[Vec<f64>], decay: f64) -> Result<DMatrix<f64>> {
    if rows.len() < 2 {
        return Err(PortfolioError::InsufficientData {
            required: 2,
            actual: rows.len(),
        });
    }
    if !(decay > 0.0 && decay < 1.0) {
        return Err(PortfolioError::InvalidInput(format!(
            "EWMA decay must be in (0, 1), got {}",
            decay
        )));
    }
    let x = to_matrix(rows);
    let t = x.nrows();
    let weights: Vec<f64> = (0..t).map(|i| decay.powi((t - 1 - i) as i32)).collect();
    let total: f64 = weights.iter().sum();

    let mut mean = DVector::zeros(x.ncols());
    for (i, w) in weights.iter().enumerate() {
        mean += x.row(i).transpose() * (*w / total);
    }

    let mut cov = DMatrix::zeros(x.ncols(), x.ncols());
    for (i, w) in weights.iter().enumerate() {
        let d = x.row(i).transpose() - &mean;
        cov += &d * d.transpose() * (*w / total);
    }
    Ok(cov)
}

/// Per-asset statistics of one sample.
#[derive(Debug, Clone)]
pub struct ReturnStatistics {
    pub assets: Vec<String>,
    pub means: Vec<f64>,
    pub volatilities: Vec<f64>,
    pub downside_deviations: Vec<f64>,
    pub covariance: CovarianceMatrix,
    pub observations: usize,
    pub periods_per_year: f64,
    /// Ledoit-Wolf shrinkage intensity, when that estimator was used.
    pub shrinkage: Option<f64>,
}

impl ReturnStatistics {
    pub fn estimate(dataset: &ReturnsDataset, config: &EstimatorConfig) -> Result<Self> {
        config.validate()?;

        let required = config.min_observations.max(2);
        if dataset.len() < required {
            return Err(PortfolioError::InsufficientData {
                required,
                actual: dataset.len(),
            });
        }

        let rows = dataset.rows();
        let t = rows.len() as f64;
        let n = dataset.n_assets();

        let means: Vec<f64> = (0..n)
            .map(|j| rows.iter().map(|r| r[j]).sum::<f64>() / t)
            .collect();
        let volatilities: Vec<f64> = (0..n)
            .map(|j| {
                let var = rows.iter().map(|r| (r[j] - means[j]).powi(2)).sum::<f64>() / (t - 1.0);
                var.sqrt()
            })
            .collect();
        let mar = config.minimum_acceptable_return;
        let downside_deviations: Vec<f64> = (0..n)
            .map(|j| {
                let sum_sq: f64 = rows.iter().map(|r| (r[j] - mar).min(0.0).powi(2)).sum();
                (sum_sq / t).sqrt()
            })
            .collect();

        let (matrix, shrinkage) = match config.covariance {
            CovarianceEstimator::Sample => (sample_covariance(rows)?, None),
            CovarianceEstimator::LedoitWolf => {
                let (m, s) = ledoit_wolf_covariance(rows)?;
                (m, Some(s))
            }
            CovarianceEstimator::Ewma { decay } => (ewma_covariance(rows, decay)?, None),
        };

        let mut covariance = CovarianceMatrix::from_matrix(matrix)?;
        if !covariance.is_positive_semidefinite() {
            warn!("Covariance estimate is not PSD; projecting to the nearest PSD matrix");
            covariance = covariance.nearest_psd();
        }

        Ok(Self {
            assets: dataset.assets().to_vec(),
            means,
            volatilities,
            downside_deviations,
            covariance,
            observations: dataset.len(),
            periods_per_year: dataset.periods_per_year(),
            shrinkage,
        })
    }

    pub fn n_assets(&self) -> usize {
        self.assets.len()
    }

    pub fn annualized_means(&self) -> Vec<f64> {
        self.means.iter().map(|m| m * self.periods_per_year).collect()
    }

    pub fn annualized_volatilities(&self) -> Vec<f64> {
        let s = self.periods_per_year.sqrt();
        self.volatilities.iter().map(|v| v * s).collect()
    }

    pub fn annualized_downside_deviations(&self) -> Vec<f64> {
        let s = self.periods_per_year.sqrt();
        self.downside_deviations.iter().map(|v| v * s).collect()
    }

    pub fn annualized_covariance(&self) -> CovarianceMatrix {
        self.covariance.scaled(self.periods_per_year)
    }
}

/// Statistics estimated separately within each regime.
#[derive(Debug, Clone)]
pub struct RegimeStatistics {
    pub by_regime: BTreeMap<Regime, ReturnStatistics>,
    /// Regimes with too few observations, with their counts.
    pub skipped: BTreeMap<Regime, usize>,
}

impl RegimeStatistics {
    pub fn estimate(
        dataset: &ReturnsDataset,
        labels: &RegimeLabels,
        config: &EstimatorConfig,
    ) -> Result<Self> {
        labels.ensure_covers(dataset.timestamps())?;

        let required = config.min_observations.max(2);
        let (eligible, skipped): (Vec<_>, Vec<_>) = labels
            .counts()
            .into_iter()
            .partition(|(_, count)| *count >= required);

        for (regime, count) in &skipped {
            warn!(
                "Regime {} has {} observations (< {}), skipping",
                regime, count, required
            );
        }

        let by_regime = eligible
            .par_iter()
            .map(|(regime, _)| {
                let subset = dataset.select_rows(&labels.indices_of(*regime));
                ReturnStatistics::estimate(&subset, config).map(|s| (*regime, s))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self {
            by_regime,
            skipped: skipped.into_iter().collect(),
        })
    }

    pub fn get(&self, regime: Regime) -> Option<&ReturnStatistics> {
        self.by_regime.get(&regime)
    }
}
