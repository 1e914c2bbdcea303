//! Linear factor model.
//!
//! Each asset's returns are regressed on a set of factor returns (for
//! example Fama-French Mkt-RF, SMB, HML) with an intercept:
//!
//! ```text
//! r_i,t = alpha_i + sum_k beta_i,k * f_k,t + e_i,t
//! ```
//!
//! The fitted model implies an expected return vector `alpha + B mu_f` and a
//! covariance matrix `B Sigma_f B' + D`, where `D` holds the residual
//! variances. The implied covariance is positive semidefinite by
//! construction, which makes it a stable input for optimization.

use crate::data::{FactorTable, ReturnsDataset};
use crate::error::{PortfolioError, Result};
use crate::stats::{sample_covariance, CovarianceMatrix};
use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use tracing::{debug, info};

const SVD_EPS: f64 = 1e-12;

/// Fitted factor model for a set of assets.
#[derive(Debug, Clone)]
pub struct FactorModel {
    pub assets: Vec<String>,
    pub factors: Vec<String>,
    pub alphas: Vec<f64>,
    /// Loadings, one row per asset and one column per factor.
    pub loadings: DMatrix<f64>,
    pub residual_variances: Vec<f64>,
    pub factor_means: Vec<f64>,
    pub factor_covariance: CovarianceMatrix,
    pub r_squared: Vec<f64>,
    pub observations: usize,
}

/// Regression summary for one asset.
#[derive(Debug, Clone, Serialize)]
pub struct FactorExposure {
    pub asset: String,
    pub alpha: f64,
    pub betas: Vec<(String, f64)>,
    pub r_squared: f64,
    pub residual_volatility: f64,
}

impl FactorModel {
    /// Fit by ordinary least squares; `factors` must already be aligned to
    /// the dataset's timestamps.
    pub fn fit(dataset: &ReturnsDataset, factors: &FactorTable) -> Result<Self> {
        if factors.timestamps.as_slice() != dataset.timestamps() {
            return Err(PortfolioError::DataError(
                "factor rows are not aligned with the return dates".to_string(),
            ));
        }
        let k = factors.names.len();
        if k == 0 {
            return Err(PortfolioError::InvalidInput(
                "factor table has no columns".to_string(),
            ));
        }
        let t = dataset.len();
        let required = k + 2;
        if t < required {
            return Err(PortfolioError::InsufficientData {
                required,
                actual: t,
            });
        }

        let n = dataset.n_assets();
        let x = DMatrix::from_fn(t, k + 1, |i, j| {
            if j == 0 {
                1.0
            } else {
                factors.values[i][j - 1]
            }
        });
        let y = DMatrix::from_fn(t, n, |i, j| dataset.row(i)[j]);

        let coefficients = x
            .clone()
            .svd(true, true)
            .solve(&y, SVD_EPS)
            .map_err(|e| PortfolioError::DataError(format!("factor regression failed: {}", e)))?;

        let residuals = &y - &x * &coefficients;
        let dof = (t - k - 1) as f64;

        let mut alphas = Vec::with_capacity(n);
        let mut residual_variances = Vec::with_capacity(n);
        let mut r_squared = Vec::with_capacity(n);
        for j in 0..n {
            alphas.push(coefficients[(0, j)]);
            let ssr = residuals.column(j).norm_squared();
            residual_variances.push(ssr / dof);

            let col = y.column(j);
            let mean = col.sum() / t as f64;
            let sst: f64 = col.iter().map(|v| (v - mean).powi(2)).sum();
            r_squared.push(if sst > 0.0 { 1.0 - ssr / sst } else { 0.0 });
        }

        let loadings = coefficients.rows(1, k).transpose();
        let factor_means = (0..k)
            .map(|j| factors.values.iter().map(|r| r[j]).sum::<f64>() / t as f64)
            .collect();
        let factor_covariance =
            CovarianceMatrix::from_matrix(sample_covariance(&factors.values)?)?;

        info!(
            "Fitted {}-factor model on {} assets over {} periods",
            k, n, t
        );
        debug!("Factor model R²: {:?}", r_squared);

        Ok(Self {
            assets: dataset.assets().to_vec(),
            factors: factors.names.clone(),
            alphas,
            loadings,
            residual_variances,
            factor_means,
            factor_covariance,
            r_squared,
            observations: t,
        })
    }

    /// `B Σ_f B' + diag(residual variances)`.
    pub fn implied_covariance(&self) -> Result<CovarianceMatrix> {
        let systematic =
            &self.loadings * self.factor_covariance.as_matrix() * self.loadings.transpose();
        let specific = DMatrix::from_diagonal(&DVector::from_column_slice(&self.residual_variances));
        let total = systematic + specific;
        CovarianceMatrix::from_matrix((&total + total.transpose()) * 0.5)
    }

    /// Expected returns `B μ_f`, plus alpha when requested.
    pub fn implied_returns(&self, include_alpha: bool) -> Vec<f64> {
        let mu = DVector::from_column_slice(&self.factor_means);
        let systematic = &self.loadings * mu;
        systematic
            .iter()
            .zip(&self.alphas)
            .map(|(s, a)| if include_alpha { s + a } else { *s })
            .collect()
    }

    pub fn exposures(&self) -> Vec<FactorExposure> {
        self.assets
            .iter()
            .enumerate()
            .map(|(i, asset)| FactorExposure {
                asset: asset.clone(),
                alpha: self.alphas[i],
                betas: self
                    .factors
                    .iter()
                    .enumerate()
                    .map(|(k, f)| (f.clone(), self.loadings[(i, k)]))
                    .collect(),
                r_squared: self.r_squared[i],
                residual_volatility: self.residual_variances[i].sqrt(),
            })
            .collect()
    }
}
