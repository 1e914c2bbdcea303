//! Allocation models and portfolio constraints.
//!
//! An [`AllocationModel`] turns estimated statistics into a [`WeightVector`].
//! Models are interchangeable and can be run side by side by the
//! [`Backtester`](crate::engine::Backtester):
//!
//! | Model | Inputs | Notes |
//! |-------|--------|-------|
//! | [`EqualWeight`] | none | 1/N |
//! | [`InverseVolatility`] | volatilities | `w ∝ 1/σ` |
//! | [`MeanVariance`] | means, covariance | min variance, max Sharpe, target return |
//! | [`RiskParity`] | covariance | equal or budgeted risk contributions |
//! | [`FactorBased`] | factor model | mean-variance on factor-implied moments |
//!
//! Mean-variance objectives work on annualized moments, so rates in
//! [`MeanVarianceObjective`] are annual.

use crate::error::{PortfolioError, Result};
use crate::factor::FactorModel;
use crate::optimizer::{risk_parity_weights, MeanVarianceObjective, MeanVarianceOptimizer, WeightBounds};
use crate::stats::{CovarianceMatrix, ReturnStatistics};
use crate::types::{WeightVector, WEIGHT_TOLERANCE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Portfolio-level constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioConstraints {
    /// Forbid short positions.
    pub long_only: bool,
    /// Maximum weight per asset (e.g., 0.40 = 40%).
    pub max_weight: Option<f64>,
    /// Minimum weight per asset. Negative values allow bounded shorts.
    pub min_weight: Option<f64>,
    /// Maximum one-way turnover per rebalance.
    pub max_turnover: Option<f64>,
}

impl Default for PortfolioConstraints {
    fn default() -> Self {
        Self {
            long_only: true,
            max_weight: None,
            min_weight: None,
            max_turnover: None,
        }
    }
}

impl PortfolioConstraints {
    /// Create constraints with no limits (shorts allowed).
    pub fn none() -> Self {
        Self {
            long_only: false,
            ..Default::default()
        }
    }

    pub fn with_max_weight(mut self, max: f64) -> Self {
        self.max_weight = Some(max);
        self
    }

    /// Per-asset bounds implied by the constraints.
    pub fn bounds(&self) -> WeightBounds {
        let lower = match (self.long_only, self.min_weight) {
            (true, Some(min)) => Some(min.max(0.0)),
            (true, None) => Some(0.0),
            (false, min) => min,
        };
        WeightBounds {
            lower,
            upper: self.max_weight,
        }
    }

    /// Validate weights against every constraint.
    pub fn validate(&self, weights: &WeightVector) -> Result<()> {
        if (weights.sum() - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(PortfolioError::ConstraintViolation(format!(
                "weights sum to {:.6}",
                weights.sum()
            )));
        }
        let bounds = self.bounds();
        for (asset, &w) in weights.iter() {
            if let Some(lo) = bounds.lower {
                if w < lo - WEIGHT_TOLERANCE {
                    return Err(PortfolioError::ConstraintViolation(format!(
                        "Position size {:.2}% for {} is below minimum {:.2}%",
                        w * 100.0,
                        asset,
                        lo * 100.0
                    )));
                }
            }
            if let Some(hi) = bounds.upper {
                if w > hi + WEIGHT_TOLERANCE {
                    return Err(PortfolioError::ConstraintViolation(format!(
                        "Position size {:.2}% for {} exceeds maximum {:.2}%",
                        w * 100.0,
                        asset,
                        hi * 100.0
                    )));
                }
            }
        }
        Ok(())
    }

    /// Turnover between current and proposed weights.
    pub fn turnover(current: &WeightVector, proposed: &WeightVector) -> f64 {
        current.turnover(proposed)
    }

    pub fn validate_turnover(&self, current: &WeightVector, proposed: &WeightVector) -> Result<()> {
        if let Some(max_turnover) = self.max_turnover {
            let turnover = Self::turnover(current, proposed);
            if turnover > max_turnover + WEIGHT_TOLERANCE {
                return Err(PortfolioError::ConstraintViolation(format!(
                    "Turnover {:.2}% exceeds maximum {:.2}%",
                    turnover * 100.0,
                    max_turnover * 100.0
                )));
            }
        }
        Ok(())
    }

    /// Move `raw` weights into the bounds while keeping the unit budget.
    ///
    /// Weights outside the bounds are clamped and the difference is spread
    /// over the remaining assets in proportion to their weights.
    pub fn project(&self, raw: &[f64]) -> Result<Vec<f64>> {
        let bounds = self.bounds();
        bounds.check_feasible(raw.len())?;
        let lo = bounds.lower.unwrap_or(f64::NEG_INFINITY);
        let hi = bounds.upper.unwrap_or(f64::INFINITY);

        let mut w = raw.to_vec();
        for _ in 0..=2 * raw.len() {
            for x in w.iter_mut() {
                *x = x.clamp(lo, hi);
            }
            let gap = 1.0 - w.iter().sum::<f64>();
            if gap.abs() < 1e-12 {
                return Ok(w);
            }

            let free: Vec<usize> = (0..w.len())
                .filter(|&i| {
                    if gap > 0.0 {
                        w[i] < hi - 1e-12
                    } else {
                        w[i] > lo + 1e-12
                    }
                })
                .collect();
            if free.is_empty() {
                break;
            }
            let base: f64 = free.iter().map(|&i| w[i].abs()).sum();
            for &i in &free {
                let share = if base > 1e-12 {
                    w[i].abs() / base
                } else {
                    1.0 / free.len() as f64
                };
                w[i] += gap * share;
            }
        }

        Err(PortfolioError::ConstraintViolation(
            "could not project weights onto the constraints".to_string(),
        ))
    }
}

/// Everything a model may use to produce weights.
pub struct AllocationInput<'a> {
    pub statistics: &'a ReturnStatistics,
    pub factor_model: Option<&'a FactorModel>,
    pub constraints: &'a PortfolioConstraints,
}

impl<'a> AllocationInput<'a> {
    pub fn new(statistics: &'a ReturnStatistics, constraints: &'a PortfolioConstraints) -> Self {
        Self {
            statistics,
            factor_model: None,
            constraints,
        }
    }

    pub fn with_factor_model(mut self, model: &'a FactorModel) -> Self {
        self.factor_model = Some(model);
        self
    }

    pub fn assets(&self) -> &[String] {
        &self.statistics.assets
    }

    fn finish(&self, raw: &[f64]) -> Result<WeightVector> {
        let projected = self.constraints.project(raw)?;
        WeightVector::normalized(self.assets(), &projected)
    }
}

/// A portfolio construction rule.
pub trait AllocationModel: Send + Sync {
    /// Display name, unique within one comparison.
    fn name(&self) -> String;

    /// Compute target weights from the input statistics.
    fn allocate(&self, input: &AllocationInput) -> Result<WeightVector>;

    fn requires_factor_model(&self) -> bool {
        false
    }
}

/// 1/N allocation.
#[derive(Debug, Clone, Default)]
pub struct EqualWeight;

impl AllocationModel for EqualWeight {
    fn name(&self) -> String {
        "equal_weight".to_string()
    }

    fn allocate(&self, input: &AllocationInput) -> Result<WeightVector> {
        let n = input.assets().len();
        input.finish(&vec![1.0 / n as f64; n])
    }
}

/// Weights proportional to inverse volatility.
#[derive(Debug, Clone, Default)]
pub struct InverseVolatility;

impl AllocationModel for InverseVolatility {
    fn name(&self) -> String {
        "inverse_volatility".to_string()
    }

    fn allocate(&self, input: &AllocationInput) -> Result<WeightVector> {
        let vols = &input.statistics.volatilities;
        if let Some(i) = vols.iter().position(|v| *v <= 0.0) {
            return Err(PortfolioError::InvalidInput(format!(
                "{} has zero volatility",
                input.assets()[i]
            )));
        }
        let inverse: Vec<f64> = vols.iter().map(|v| 1.0 / v).collect();
        let total: f64 = inverse.iter().sum();
        let raw: Vec<f64> = inverse.iter().map(|x| x / total).collect();
        input.finish(&raw)
    }
}

fn optimize_mean_variance(
    input: &AllocationInput,
    expected_returns: Vec<f64>,
    covariance: CovarianceMatrix,
    objective: &MeanVarianceObjective,
) -> Result<WeightVector> {
    let optimizer =
        MeanVarianceOptimizer::new(expected_returns, covariance, input.constraints.bounds())?;
    let weights = optimizer.optimize(objective)?;
    WeightVector::normalized(input.assets(), &weights)
}

/// Markowitz mean-variance allocation on sample moments.
#[derive(Debug, Clone)]
pub struct MeanVariance {
    pub objective: MeanVarianceObjective,
}

impl MeanVariance {
    pub fn minimum_variance() -> Self {
        Self {
            objective: MeanVarianceObjective::MinimumVariance,
        }
    }

    pub fn maximum_sharpe(risk_free_rate: f64) -> Self {
        Self {
            objective: MeanVarianceObjective::MaximumSharpe { risk_free_rate },
        }
    }

    pub fn target_return(target: f64) -> Self {
        Self {
            objective: MeanVarianceObjective::TargetReturn { target },
        }
    }
}

impl AllocationModel for MeanVariance {
    fn name(&self) -> String {
        self.objective.label().to_string()
    }

    fn allocate(&self, input: &AllocationInput) -> Result<WeightVector> {
        let stats = input.statistics;
        optimize_mean_variance(
            input,
            stats.annualized_means(),
            stats.annualized_covariance(),
            &self.objective,
        )
    }
}

/// Equal or budgeted risk contribution.
#[derive(Debug, Clone, Default)]
pub struct RiskParity {
    /// Relative risk budgets by asset; missing assets get 1.
    pub budgets: BTreeMap<String, f64>,
}

impl AllocationModel for RiskParity {
    fn name(&self) -> String {
        "risk_parity".to_string()
    }

    fn allocate(&self, input: &AllocationInput) -> Result<WeightVector> {
        let budgets: Vec<f64> = input
            .assets()
            .iter()
            .map(|a| self.budgets.get(a).copied().unwrap_or(1.0))
            .collect();
        let raw = risk_parity_weights(&input.statistics.covariance, &budgets)?;
        if input.constraints.max_weight.is_some() || input.constraints.min_weight.is_some() {
            debug!("Projecting risk parity weights onto weight bounds");
        }
        input.finish(&raw)
    }
}

/// Mean-variance on factor-implied expected returns and covariance.
#[derive(Debug, Clone)]
pub struct FactorBased {
    pub objective: MeanVarianceObjective,
    pub include_alpha: bool,
}

impl AllocationModel for FactorBased {
    fn name(&self) -> String {
        format!("factor_{}", self.objective.label())
    }

    fn allocate(&self, input: &AllocationInput) -> Result<WeightVector> {
        let model = input.factor_model.ok_or_else(|| {
            PortfolioError::InvalidInput(
                "factor-based allocation requires factor data".to_string(),
            )
        })?;
        if model.assets != input.statistics.assets {
            return Err(PortfolioError::InvalidInput(
                "factor model assets do not match the statistics".to_string(),
            ));
        }
        let ppy = input.statistics.periods_per_year;
        let returns: Vec<f64> = model
            .implied_returns(self.include_alpha)
            .iter()
            .map(|r| r * ppy)
            .collect();
        let covariance = model.implied_covariance()?.scaled(ppy);
        optimize_mean_variance(input, returns, covariance, &self.objective)
    }

    fn requires_factor_model(&self) -> bool {
        true
    }
}

/// Serializable description of a model, as written in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelSpec {
    EqualWeight,
    InverseVolatility,
    MeanVariance {
        objective: MeanVarianceObjective,
    },
    RiskParity {
        #[serde(default)]
        budgets: BTreeMap<String, f64>,
    },
    FactorBased {
        objective: MeanVarianceObjective,
        #[serde(default)]
        include_alpha: bool,
    },
}

impl ModelSpec {
    pub fn build(&self) -> Box<dyn AllocationModel> {
        match self {
            ModelSpec::EqualWeight => Box::new(EqualWeight),
            ModelSpec::InverseVolatility => Box::new(InverseVolatility),
            ModelSpec::MeanVariance { objective } => Box::new(MeanVariance {
                objective: *objective,
            }),
            ModelSpec::RiskParity { budgets } => Box::new(RiskParity {
                budgets: budgets.clone(),
            }),
            ModelSpec::FactorBased {
                objective,
                include_alpha,
            } => Box::new(FactorBased {
                objective: *objective,
                include_alpha: *include_alpha,
            }),
        }
    }

    /// Available model types with a one-line description.
    pub fn catalog() -> Vec<(&'static str, &'static str)> {
        vec![
            ("equal_weight", "1/N across all assets"),
            ("inverse_volatility", "weights proportional to 1/volatility"),
            (
                "mean_variance",
                "Markowitz: min_variance, max_sharpe or target_return objective",
            ),
            (
                "risk_parity",
                "equal (or budgeted) risk contribution per asset",
            ),
            (
                "factor_based",
                "mean-variance on factor-implied returns and covariance",
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ReturnsDataset;
    use crate::stats::{CovarianceEstimator, EstimatorConfig};
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};

    fn statistics() -> ReturnStatistics {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let rows: Vec<Vec<f64>> = (0..60)
            .map(|i| {
                let x = ((i * 7 % 13) as f64 - 6.0) / 100.0;
                let y = ((i * 5 % 11) as f64 - 5.0) / 300.0;
                vec![x + 0.002, 0.5 * x + y + 0.001, y + 0.0005]
            })
            .collect();
        let ts = (0..60).map(|i| start + Duration::days(i)).collect();
        let ds = ReturnsDataset::new(ts, vec!["EQ".into(), "MIX".into(), "BND".into()], rows)
            .unwrap();
        let config = EstimatorConfig {
            covariance: CovarianceEstimator::Sample,
            min_observations: 10,
            minimum_acceptable_return: 0.0,
        };
        ReturnStatistics::estimate(&ds, &config).unwrap()
    }

    #[test]
    fn test_all_models_produce_valid_long_only_weights() {
        let stats = statistics();
        let constraints = PortfolioConstraints::default();
        let input = AllocationInput::new(&stats, &constraints);

        let models: Vec<Box<dyn AllocationModel>> = vec![
            Box::new(EqualWeight),
            Box::new(InverseVolatility),
            Box::new(MeanVariance::minimum_variance()),
            Box::new(MeanVariance::maximum_sharpe(0.0)),
            Box::new(RiskParity::default()),
        ];

        for model in models {
            let w = model.allocate(&input).unwrap();
            assert_relative_eq!(w.sum(), 1.0, epsilon = 1e-6);
            assert!(w.is_long_only(), "{} produced shorts", model.name());
            constraints.validate(&w).unwrap();
        }
    }

    #[test]
    fn test_inverse_volatility_favors_low_vol() {
        let stats = statistics();
        let constraints = PortfolioConstraints::default();
        let w = InverseVolatility
            .allocate(&AllocationInput::new(&stats, &constraints))
            .unwrap();
        assert!(w.get("BND") > w.get("EQ"));
    }

    #[test]
    fn test_max_weight_applies_to_heuristics() {
        let stats = statistics();
        let constraints = PortfolioConstraints::default().with_max_weight(0.4);
        let input = AllocationInput::new(&stats, &constraints);
        for model in [
            Box::new(InverseVolatility) as Box<dyn AllocationModel>,
            Box::new(RiskParity::default()),
            Box::new(MeanVariance::minimum_variance()),
        ] {
            let w = model.allocate(&input).unwrap();
            assert!(w.iter().all(|(_, x)| *x <= 0.4 + 1e-6));
            constraints.validate(&w).unwrap();
        }
    }

    #[test]
    fn test_factor_based_requires_model() {
        let stats = statistics();
        let constraints = PortfolioConstraints::default();
        let model = FactorBased {
            objective: MeanVarianceObjective::MinimumVariance,
            include_alpha: false,
        };
        assert!(model.requires_factor_model());
        assert!(model
            .allocate(&AllocationInput::new(&stats, &constraints))
            .is_err());
    }

    #[test]
    fn test_project_redistributes_excess() {
        let constraints = PortfolioConstraints::default().with_max_weight(0.5);
        let w = constraints.project(&[0.8, 0.1, 0.1]).unwrap();
        assert_relative_eq!(w[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(w[1], 0.25, epsilon = 1e-12);
        assert_relative_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-12);

        let infeasible = PortfolioConstraints::default().with_max_weight(0.2);
        assert!(infeasible.project(&[0.5, 0.5]).is_err());
    }

    #[test]
    fn test_validate_and_turnover() {
        let assets = vec!["A".to_string(), "B".to_string()];
        let short = WeightVector::from_slice(&assets, &[1.2, -0.2]).unwrap();
        assert!(PortfolioConstraints::default().validate(&short).is_err());
        assert!(PortfolioConstraints::none().validate(&short).is_ok());

        let current = WeightVector::from_slice(&assets, &[0.5, 0.5]).unwrap();
        let proposed = WeightVector::from_slice(&assets, &[0.8, 0.2]).unwrap();
        assert_relative_eq!(
            PortfolioConstraints::turnover(&current, &proposed),
            0.3,
            epsilon = 1e-12
        );
        let limited = PortfolioConstraints {
            max_turnover: Some(0.2),
            ..Default::default()
        };
        assert!(limited.validate_turnover(&current, &proposed).is_err());
    }

    #[test]
    fn test_model_spec_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            models: Vec<ModelSpec>,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
            [[models]]
            type = "equal_weight"

            [[models]]
            type = "mean_variance"
            objective = { type = "max_sharpe", risk_free_rate = 0.02 }

            [[models]]
            type = "risk_parity"
            budgets = { SPY = 2.0 }
            "#,
        )
        .unwrap();
        assert_eq!(parsed.models.len(), 3);
        assert_eq!(parsed.models[1].build().name(), "max_sharpe");
        assert_eq!(ModelSpec::catalog().len(), 5);
    }
}
