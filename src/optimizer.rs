//! Portfolio optimizers.
//!
//! - [`MeanVarianceOptimizer`]: Markowitz minimum variance, maximum Sharpe
//!   ratio and target return portfolios, solved as quadratic programs with
//!   Clarabel.
//! - [`risk_parity_weights`]: equal (or budgeted) risk contribution weights
//!   by cyclical coordinate descent.
//!
//! Weight bounds are passed as [`WeightBounds`]; the sum-to-one budget
//! constraint is always enforced.

use crate::error::{PortfolioError, Result};
use crate::stats::CovarianceMatrix;
use clarabel::algebra::CscMatrix;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const SOLVER_MAX_ITER: u32 = 200;
const RISK_PARITY_MAX_SWEEPS: usize = 10_000;
const RISK_PARITY_TOLERANCE: f64 = 1e-12;

/// Per-asset bounds applied by the optimizers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightBounds {
    /// Lower bound on every weight; `None` allows unbounded short positions.
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl WeightBounds {
    pub fn long_only() -> Self {
        Self {
            lower: Some(0.0),
            upper: None,
        }
    }

    /// Check that a fully invested portfolio can satisfy the bounds.
    pub fn check_feasible(&self, n: usize) -> Result<()> {
        let n = n as f64;
        if let (Some(lo), Some(hi)) = (self.lower, self.upper) {
            if lo > hi {
                return Err(PortfolioError::ConstraintViolation(format!(
                    "min weight {} exceeds max weight {}",
                    lo, hi
                )));
            }
        }
        if let Some(hi) = self.upper {
            if hi * n < 1.0 - 1e-9 {
                return Err(PortfolioError::ConstraintViolation(format!(
                    "max weight {:.4} is too small to invest in {} assets",
                    hi, n
                )));
            }
        }
        if let Some(lo) = self.lower {
            if lo * n > 1.0 + 1e-9 {
                return Err(PortfolioError::ConstraintViolation(format!(
                    "min weight {:.4} is too large for {} assets",
                    lo, n
                )));
            }
        }
        Ok(())
    }
}

/// Objective for mean-variance optimization.
///
/// Rates are expressed in the same units as the expected returns passed to
/// the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeanVarianceObjective {
    /// Minimize variance, ignoring expected returns.
    #[serde(rename = "min_variance")]
    MinimumVariance,
    /// Maximize `(μ'w - rf) / σ_p`.
    #[serde(rename = "max_sharpe")]
    MaximumSharpe {
        #[serde(default)]
        risk_free_rate: f64,
    },
    /// Minimize variance subject to `μ'w = target`.
    TargetReturn { target: f64 },
}

impl MeanVarianceObjective {
    pub fn label(&self) -> &'static str {
        match self {
            MeanVarianceObjective::MinimumVariance => "min_variance",
            MeanVarianceObjective::MaximumSharpe { .. } => "max_sharpe",
            MeanVarianceObjective::TargetReturn { .. } => "target_return",
        }
    }
}

/// A point on the efficient frontier.
#[derive(Debug, Clone, Serialize)]
pub struct FrontierPoint {
    pub target_return: f64,
    pub expected_return: f64,
    pub volatility: f64,
    pub weights: Vec<f64>,
}

/// Mean-variance portfolio optimizer using the Markowitz framework.
pub struct MeanVarianceOptimizer {
    expected_returns: Vec<f64>,
    covariance: CovarianceMatrix,
    bounds: WeightBounds,
}

impl MeanVarianceOptimizer {
    pub fn new(
        expected_returns: Vec<f64>,
        covariance: CovarianceMatrix,
        bounds: WeightBounds,
    ) -> Result<Self> {
        let n = expected_returns.len();
        if n == 0 {
            return Err(PortfolioError::InvalidInput(
                "Need at least one asset".to_string(),
            ));
        }
        if covariance.dim() != n {
            return Err(PortfolioError::InvalidInput(format!(
                "Covariance matrix is {}x{} but there are {} expected returns",
                covariance.dim(),
                covariance.dim(),
                n
            )));
        }
        if expected_returns.iter().any(|r| !r.is_finite()) {
            return Err(PortfolioError::InvalidInput(
                "Expected returns must be finite".to_string(),
            ));
        }
        bounds.check_feasible(n)?;

        Ok(Self {
            expected_returns,
            covariance,
            bounds,
        })
    }

    pub fn n_assets(&self) -> usize {
        self.expected_returns.len()
    }

    pub fn optimize(&self, objective: &MeanVarianceObjective) -> Result<Vec<f64>> {
        match objective {
            MeanVarianceObjective::MinimumVariance => self.minimum_variance(),
            MeanVarianceObjective::MaximumSharpe { risk_free_rate } => {
                self.maximum_sharpe_ratio(*risk_free_rate)
            }
            MeanVarianceObjective::TargetReturn { target } => self.target_return(*target),
        }
    }

    /// Find the minimum variance portfolio (ignoring returns).
    pub fn minimum_variance(&self) -> Result<Vec<f64>> {
        let n = self.n_assets();
        let mut problem = QpBuilder::new(n, self.covariance.as_matrix());
        problem.equality(vec![1.0; n], 1.0);
        self.add_bounds(&mut problem);
        let x = problem.solve("minimum variance")?;
        Ok(clean_weights(&x, self.bounds))
    }

    /// Minimize variance for a target expected return.
    pub fn target_return(&self, target: f64) -> Result<Vec<f64>> {
        let n = self.n_assets();
        let mut problem = QpBuilder::new(n, self.covariance.as_matrix());
        problem.equality(vec![1.0; n], 1.0);
        problem.equality(self.expected_returns.clone(), target);
        self.add_bounds(&mut problem);
        let x = problem.solve("target return").map_err(|e| {
            PortfolioError::OptimizationError(format!(
                "target return {:.6} is not attainable: {}",
                target, e
            ))
        })?;
        Ok(clean_weights(&x, self.bounds))
    }

    /// Find the maximum Sharpe ratio portfolio.
    ///
    /// Solved in homogenized form over `(y, κ)` with `w = y / κ`:
    /// minimize `y'Σy` subject to `(μ - rf)'y = 1`, `Σy = κ` and the bounds
    /// scaled by `κ`. Falls back to minimum variance when no asset has a
    /// positive excess return.
    pub fn maximum_sharpe_ratio(&self, risk_free_rate: f64) -> Result<Vec<f64>> {
        let n = self.n_assets();
        let excess: Vec<f64> = self
            .expected_returns
            .iter()
            .map(|r| r - risk_free_rate)
            .collect();

        if excess.iter().all(|&r| r <= 0.0) {
            debug!("No asset has positive excess return; using minimum variance");
            return self.minimum_variance();
        }

        let sigma = self.covariance.as_matrix();
        let p = DMatrix::from_fn(n + 1, n + 1, |i, j| {
            if i < n && j < n {
                sigma[(i, j)]
            } else {
                0.0
            }
        });
        let mut problem = QpBuilder::new(n + 1, &p);

        let mut excess_row = excess;
        excess_row.push(0.0);
        problem.equality(excess_row, 1.0);

        let mut budget_row = vec![1.0; n];
        budget_row.push(-1.0);
        problem.equality(budget_row, 0.0);

        for i in 0..n {
            if let Some(lo) = self.bounds.lower {
                // lo·κ - y_i <= 0
                let mut row = vec![0.0; n + 1];
                row[i] = -1.0;
                row[n] = lo;
                problem.inequality(row, 0.0);
            }
            if let Some(hi) = self.bounds.upper {
                // y_i - hi·κ <= 0
                let mut row = vec![0.0; n + 1];
                row[i] = 1.0;
                row[n] = -hi;
                problem.inequality(row, 0.0);
            }
        }
        let mut kappa_row = vec![0.0; n + 1];
        kappa_row[n] = -1.0;
        problem.inequality(kappa_row, 0.0);

        let x = problem.solve("maximum Sharpe")?;
        let kappa = x[n];
        if kappa <= 1e-12 {
            return Err(PortfolioError::OptimizationError(
                "Max Sharpe optimization returned a degenerate scale".to_string(),
            ));
        }
        let weights: Vec<f64> = x[..n].iter().map(|y| y / kappa).collect();
        Ok(clean_weights(&weights, self.bounds))
    }

    /// Largest expected return reachable under the bounds.
    fn max_attainable_return(&self) -> f64 {
        let n = self.n_assets();
        let lo = self.bounds.lower.unwrap_or(0.0);
        let hi = self.bounds.upper.unwrap_or(1.0).max(lo);

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            self.expected_returns[b]
                .partial_cmp(&self.expected_returns[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut weights = vec![lo; n];
        let mut remaining = 1.0 - lo * n as f64;
        for i in order {
            let add = remaining.min(hi - lo).max(0.0);
            weights[i] += add;
            remaining -= add;
        }
        portfolio_return(&weights, &self.expected_returns)
    }

    /// Sweep target returns from the minimum variance portfolio up to the
    /// maximum attainable return.
    pub fn efficient_frontier(&self, points: usize) -> Result<Vec<FrontierPoint>> {
        if points < 2 {
            return Err(PortfolioError::InvalidInput(
                "efficient frontier needs at least 2 points".to_string(),
            ));
        }

        let min_var = self.minimum_variance()?;
        let r_min = portfolio_return(&min_var, &self.expected_returns);
        let r_max = self.max_attainable_return().max(r_min);

        let mut frontier = Vec::with_capacity(points);
        for k in 0..points {
            let target = r_min + (r_max - r_min) * k as f64 / (points - 1) as f64;
            let weights = if k == 0 {
                Ok(min_var.clone())
            } else {
                self.target_return(target)
            };
            match weights {
                Ok(w) => frontier.push(FrontierPoint {
                    target_return: target,
                    expected_return: portfolio_return(&w, &self.expected_returns),
                    volatility: portfolio_volatility(&w, &self.covariance),
                    weights: w,
                }),
                Err(e) => warn!("Skipping frontier point at {:.6}: {}", target, e),
            }
        }
        Ok(frontier)
    }

    fn add_bounds(&self, problem: &mut QpBuilder) {
        let n = self.n_assets();
        for i in 0..n {
            if let Some(lo) = self.bounds.lower {
                let mut row = vec![0.0; n];
                row[i] = -1.0;
                problem.inequality(row, -lo);
            }
            if let Some(hi) = self.bounds.upper {
                let mut row = vec![0.0; n];
                row[i] = 1.0;
                problem.inequality(row, hi);
            }
        }
    }
}

/// Dense description of `min ½x'Px s.t. Ax = b (zero cone), Gx <= h`.
struct QpBuilder {
    n: usize,
    p: CscMatrix<f64>,
    eq_rows: Vec<Vec<f64>>,
    eq_rhs: Vec<f64>,
    ineq_rows: Vec<Vec<f64>>,
    ineq_rhs: Vec<f64>,
}

impl QpBuilder {
    fn new(n: usize, p: &DMatrix<f64>) -> Self {
        Self {
            n,
            p: upper_triangular_csc(p),
            eq_rows: Vec::new(),
            eq_rhs: Vec::new(),
            ineq_rows: Vec::new(),
            ineq_rhs: Vec::new(),
        }
    }

    fn equality(&mut self, row: Vec<f64>, rhs: f64) {
        self.eq_rows.push(row);
        self.eq_rhs.push(rhs);
    }

    fn inequality(&mut self, row: Vec<f64>, rhs: f64) {
        self.ineq_rows.push(row);
        self.ineq_rhs.push(rhs);
    }

    fn solve(self, what: &str) -> Result<Vec<f64>> {
        use clarabel::solver::*;

        let rows: Vec<&Vec<f64>> = self.eq_rows.iter().chain(&self.ineq_rows).collect();
        let a = dense_to_csc(&rows, self.n);
        let b: Vec<f64> = self.eq_rhs.iter().chain(&self.ineq_rhs).copied().collect();
        let q = vec![0.0; self.n];

        let mut cones: Vec<SupportedConeT<f64>> = vec![ZeroConeT(self.eq_rows.len())];
        if !self.ineq_rows.is_empty() {
            cones.push(NonnegativeConeT(self.ineq_rows.len()));
        }

        let settings = DefaultSettingsBuilder::default()
            .max_iter(SOLVER_MAX_ITER)
            .verbose(false)
            .build()
            .map_err(|e| {
                PortfolioError::OptimizationError(format!("Failed to build settings: {}", e))
            })?;

        let mut solver = DefaultSolver::new(&self.p, &q, &a, &b, &cones, settings).map_err(|e| {
            PortfolioError::OptimizationError(format!("Failed to create solver: {:?}", e))
        })?;

        solver.solve();

        match solver.solution.status {
            SolverStatus::Solved => {}
            SolverStatus::AlmostSolved => {
                debug!("{} optimization reached reduced accuracy", what);
            }
            status => {
                return Err(PortfolioError::OptimizationError(format!(
                    "{} optimization failed with status: {:?}",
                    what, status
                )));
            }
        }
        Ok(solver.solution.x.clone())
    }
}

/// Upper triangle of a dense symmetric matrix in CSC form, as Clarabel expects.
fn upper_triangular_csc(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let n = m.ncols();
    let mut colptr = vec![0];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();
    for j in 0..n {
        for i in 0..=j {
            let v = m[(i, j)];
            if v != 0.0 {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr.push(nzval.len());
    }
    CscMatrix::new(n, n, colptr, rowval, nzval)
}

fn dense_to_csc(rows: &[&Vec<f64>], ncols: usize) -> CscMatrix<f64> {
    let mut colptr = vec![0];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();
    for j in 0..ncols {
        for (i, row) in rows.iter().enumerate() {
            if row[j] != 0.0 {
                rowval.push(i);
                nzval.push(row[j]);
            }
        }
        colptr.push(nzval.len());
    }
    CscMatrix::new(rows.len(), ncols, colptr, rowval, nzval)
}

/// Snap solver noise onto the bounds and restore the unit budget.
fn clean_weights(x: &[f64], bounds: WeightBounds) -> Vec<f64> {
    let clipped: Vec<f64> = x
        .iter()
        .map(|&w| {
            let w = bounds.lower.map_or(w, |lo| w.max(lo));
            bounds.upper.map_or(w, |hi| w.min(hi))
        })
        .map(|w| if w.abs() < 1e-10 { 0.0 } else { w })
        .collect();
    let total: f64 = clipped.iter().sum();
    if total.abs() > 1e-12 {
        clipped.iter().map(|w| w / total).collect()
    } else {
        clipped
    }
}

/// Risk parity weights: each asset contributes `budget_i` of total variance.
///
/// Minimizes `½ y'Σy - Σ b_i ln y_i` by cyclical coordinate descent and
/// normalizes `w = y / Σy`. Weights are strictly positive.
pub fn risk_parity_weights(covariance: &CovarianceMatrix, budgets: &[f64]) -> Result<Vec<f64>> {
    let n = covariance.dim();
    if budgets.len() != n {
        return Err(PortfolioError::InvalidInput(format!(
            "{} risk budgets for {} assets",
            budgets.len(),
            n
        )));
    }
    if budgets.iter().any(|b| !(b.is_finite() && *b > 0.0)) {
        return Err(PortfolioError::InvalidInput(
            "risk budgets must be positive".to_string(),
        ));
    }
    let total_budget: f64 = budgets.iter().sum();
    let b: Vec<f64> = budgets.iter().map(|x| x / total_budget).collect();

    let sigma = covariance.as_matrix();
    if let Some(i) = (0..n).find(|&i| sigma[(i, i)] <= 0.0) {
        return Err(PortfolioError::InvalidInput(format!(
            "asset {} has zero variance; risk parity is undefined",
            i
        )));
    }

    let mut y: Vec<f64> = (0..n).map(|i| b[i] / sigma[(i, i)].sqrt()).collect();
    let mut converged = false;

    for sweep in 0..RISK_PARITY_MAX_SWEEPS {
        let mut max_change = 0.0_f64;
        for i in 0..n {
            let a = sigma[(i, i)];
            let c: f64 = (0..n).filter(|&j| j != i).map(|j| sigma[(i, j)] * y[j]).sum();
            let updated = (-c + (c * c + 4.0 * a * b[i]).sqrt()) / (2.0 * a);
            max_change = max_change.max((updated - y[i]).abs() / y[i].abs().max(1e-300));
            y[i] = updated;
        }
        if max_change < RISK_PARITY_TOLERANCE {
            debug!("Risk parity converged after {} sweeps", sweep + 1);
            converged = true;
            break;
        }
    }

    if !converged {
        warn!(
            "Risk parity did not converge within {} sweeps",
            RISK_PARITY_MAX_SWEEPS
        );
    }

    let total: f64 = y.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(PortfolioError::OptimizationError(
            "risk parity produced invalid weights".to_string(),
        ));
    }
    Ok(y.iter().map(|v| v / total).collect())
}

/// `w_i (Σw)_i`; the contributions sum to the portfolio variance.
pub fn risk_contributions(weights: &[f64], covariance: &CovarianceMatrix) -> Vec<f64> {
    covariance
        .times(weights)
        .iter()
        .zip(weights)
        .map(|(m, w)| m * w)
        .collect()
}

pub fn portfolio_return(weights: &[f64], expected_returns: &[f64]) -> f64 {
    weights.iter().zip(expected_returns).map(|(w, r)| w * r).sum()
}

pub fn portfolio_volatility(weights: &[f64], covariance: &CovarianceMatrix) -> f64 {
    covariance.portfolio_variance(weights).max(0.0).sqrt()
}
