//! Walk-forward evaluation engine.

use crate::allocation::{AllocationInput, AllocationModel, PortfolioConstraints};
use crate::analytics::{BenchmarkMetrics, PerformanceMetrics, RegimePerformance};
use crate::data::{FactorTable, ReturnsDataset};
use crate::error::{PortfolioError, Result};
use crate::factor::FactorModel;
use crate::optimizer::{portfolio_return, portfolio_volatility, risk_contributions};
use crate::regime::{Regime, RegimeLabels};
use crate::stats::{EstimatorConfig, ReturnStatistics};
use crate::types::{EquityPoint, WeightVector, WEIGHT_TOLERANCE};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Which past rows feed the estimator at each rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EstimationWindow {
    /// Every row since the start of the sample.
    #[default]
    Expanding,
    /// The most recent `periods` rows.
    Rolling { periods: usize },
}

/// Configuration for the evaluation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Initial capital.
    pub initial_capital: f64,
    /// Periods between rebalances.
    pub rebalance_every: usize,
    /// Rows required before the first allocation.
    pub min_history: usize,
    pub window: EstimationWindow,
    /// Cost per unit of one-way turnover, in basis points.
    pub transaction_cost_bps: f64,
    /// Annual risk-free rate used by the metrics.
    pub risk_free_rate: f64,
    /// Estimate only from past rows in the current regime.
    pub regime_conditional: bool,
    /// Below this many same-regime rows the full window is used instead.
    pub min_regime_observations: usize,
    /// Asset to compare against.
    pub benchmark: Option<String>,
    /// Show progress bar during evaluation.
    pub show_progress: bool,
    pub estimation: EstimatorConfig,
    pub constraints: PortfolioConstraints,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            initial_capital: 100_000.0,
            rebalance_every: 21,
            min_history: 252,
            window: EstimationWindow::Expanding,
            transaction_cost_bps: 10.0,
            risk_free_rate: 0.0,
            regime_conditional: false,
            min_regime_observations: 60,
            benchmark: None,
            show_progress: false,
            estimation: EstimatorConfig::default(),
            constraints: PortfolioConstraints::default(),
        }
    }
}

impl EvaluationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.initial_capital > 0.0) {
            return Err(PortfolioError::ConfigError(
                "initial_capital must be positive".to_string(),
            ));
        }
        if self.rebalance_every == 0 {
            return Err(PortfolioError::ConfigError(
                "rebalance_every must be at least 1".to_string(),
            ));
        }
        if self.min_history < 2 {
            return Err(PortfolioError::ConfigError(
                "min_history must be at least 2".to_string(),
            ));
        }
        if self.transaction_cost_bps < 0.0 {
            return Err(PortfolioError::ConfigError(
                "transaction_cost_bps cannot be negative".to_string(),
            ));
        }
        if let EstimationWindow::Rolling { periods } = self.window {
            if periods < 2 {
                return Err(PortfolioError::ConfigError(
                    "rolling window needs at least 2 periods".to_string(),
                ));
            }
        }
        self.estimation.validate()
    }
}

/// Target weights set at one rebalance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceRecord {
    pub timestamp: DateTime<Utc>,
    pub weights: WeightVector,
    pub turnover: f64,
    pub cost: f64,
    /// Regime the estimation was conditioned on, if any.
    pub regime: Option<Regime>,
    pub estimation_observations: usize,
    /// The model failed and the previous weights were kept.
    pub fallback: bool,
    /// Too few rows carried the prior regime, so the full window was used.
    #[serde(default)]
    pub regime_fallback: bool,
}

/// Results from an evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub model_name: String,
    pub assets: Vec<String>,
    pub config: EvaluationConfig,
    pub initial_capital: f64,
    pub final_equity: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub metrics: PerformanceMetrics,
    pub regime_metrics: Vec<RegimePerformance>,
    pub benchmark: Option<BenchmarkMetrics>,
    pub total_turnover: f64,
    pub total_costs: f64,
    pub failed_allocations: usize,
    pub rebalances: Vec<RebalanceRecord>,
    pub equity_curve: Vec<EquityPoint>,
}

impl BacktestResult {
    pub fn returns(&self) -> Vec<f64> {
        self.equity_curve.iter().map(|p| p.period_return).collect()
    }
}

/// Weights a model would hold today, with their ex-ante risk.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSnapshot {
    pub model_name: String,
    pub regime: Option<Regime>,
    pub observations: usize,
    pub weights: WeightVector,
    /// Annualized.
    pub expected_return: f64,
    /// Annualized.
    pub volatility: f64,
    /// Share of variance per asset, in dataset order.
    pub risk_contributions: Vec<(String, f64)>,
}

/// Apply fixed weights, rebalanced back to target every period.
///
/// No costs are charged. Every timestamp must carry a regime label.
pub fn evaluate_static(
    dataset: &ReturnsDataset,
    weights: &WeightVector,
    labels: &RegimeLabels,
    config: &EvaluationConfig,
) -> Result<BacktestResult> {
    config.validate()?;
    labels.ensure_covers(dataset.timestamps())?;
    if dataset.is_empty() {
        return Err(PortfolioError::NoData);
    }

    let assets = dataset.assets();
    let w = weights.to_vec(assets);
    let covered: f64 = w.iter().sum();
    if (covered - weights.sum()).abs() > WEIGHT_TOLERANCE {
        return Err(PortfolioError::InvalidWeights(
            "weights reference assets missing from the dataset".to_string(),
        ));
    }

    let returns: Vec<f64> = dataset
        .rows()
        .iter()
        .map(|row| portfolio_return(&w, row))
        .collect();
    let mut level = 1.0;
    for (r, ts) in returns.iter().zip(dataset.timestamps()) {
        level *= 1.0 + r;
        if level <= 0.0 {
            return Err(wiped_out(*ts));
        }
    }
    let equity_curve = build_equity_curve(
        config.initial_capital,
        dataset.timestamps(),
        &returns,
        labels.labels(),
    );

    let rebalance = RebalanceRecord {
        timestamp: dataset.timestamps()[0],
        weights: weights.clone(),
        turnover: 0.0,
        cost: 0.0,
        regime: None,
        estimation_observations: 0,
        fallback: false,
        regime_fallback: false,
    };

    finish_result(
        "static".to_string(),
        dataset,
        labels.labels(),
        config,
        returns,
        equity_curve,
        vec![rebalance],
        0.0,
        0,
    )
}

fn wiped_out(timestamp: DateTime<Utc>) -> PortfolioError {
    PortfolioError::InvalidWeights(format!(
        "portfolio equity fell to zero or below at {}",
        timestamp.format("%Y-%m-%d")
    ))
}

fn build_equity_curve(
    initial_capital: f64,
    timestamps: &[DateTime<Utc>],
    returns: &[f64],
    labels: &[Regime],
) -> Vec<EquityPoint> {
    let mut equity = initial_capital;
    let mut peak = initial_capital;
    returns
        .iter()
        .zip(timestamps)
        .zip(labels)
        .map(|((r, ts), regime)| {
            equity *= 1.0 + r;
            peak = peak.max(equity);
            EquityPoint {
                timestamp: *ts,
                equity,
                period_return: *r,
                drawdown_pct: (peak - equity) / peak * 100.0,
                regime: Some(*regime),
            }
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn finish_result(
    model_name: String,
    dataset: &ReturnsDataset,
    labels: &[Regime],
    config: &EvaluationConfig,
    returns: Vec<f64>,
    equity_curve: Vec<EquityPoint>,
    rebalances: Vec<RebalanceRecord>,
    total_costs: f64,
    failed_allocations: usize,
) -> Result<BacktestResult> {
    let ppy = dataset.periods_per_year();
    let metrics = PerformanceMetrics::from_returns(&returns, ppy, config.risk_free_rate)?;
    let regime_metrics =
        RegimePerformance::compute(&returns, labels, ppy, config.risk_free_rate)?;

    let offset = dataset.len() - returns.len();
    let benchmark = config.benchmark.as_ref().and_then(|name| {
        match dataset.asset_returns(name) {
            Some(bench) => BenchmarkMetrics::calculate(
                name.clone(),
                &returns,
                &bench[offset..],
                ppy,
                config.risk_free_rate,
            ),
            None => {
                warn!("Benchmark {} is not in the dataset, skipping comparison", name);
                None
            }
        }
    });

    let (start_time, end_time) = match (equity_curve.first(), equity_curve.last()) {
        (Some(first), Some(last)) => (first.timestamp, last.timestamp),
        _ => return Err(PortfolioError::NoData),
    };
    let final_equity = equity_curve
        .last()
        .map(|p| p.equity)
        .unwrap_or(config.initial_capital);

    Ok(BacktestResult {
        model_name,
        assets: dataset.assets().to_vec(),
        config: config.clone(),
        initial_capital: config.initial_capital,
        final_equity,
        start_time,
        end_time,
        metrics,
        regime_metrics,
        benchmark,
        total_turnover: rebalances.iter().map(|r| r.turnover).sum(),
        total_costs,
        failed_allocations,
        rebalances,
        equity_curve,
    })
}

/// Walk-forward evaluator for allocation models.
pub struct Backtester {
    config: EvaluationConfig,
    factors: Option<FactorTable>,
}

impl Backtester {
    pub fn new(config: EvaluationConfig) -> Self {
        Self {
            config,
            factors: None,
        }
    }

    /// Attach factor returns aligned to the dataset's timestamps.
    pub fn with_factors(mut self, factors: FactorTable) -> Self {
        self.factors = Some(factors);
        self
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Run one model over the dataset.
    ///
    /// At each rebalance the model only sees rows strictly before the
    /// rebalance date. Between rebalances the weights drift with returns.
    pub fn run(
        &self,
        dataset: &ReturnsDataset,
        labels: &RegimeLabels,
        model: &dyn AllocationModel,
    ) -> Result<BacktestResult> {
        let config = &self.config;
        config.validate()?;
        labels.ensure_covers(dataset.timestamps())?;

        let t_total = dataset.len();
        let start = config.min_history;
        if t_total <= start {
            return Err(PortfolioError::InsufficientData {
                required: start + 1,
                actual: t_total,
            });
        }
        let factors = self.factors_for(dataset, model)?;

        let model_name = model.name();
        info!(
            "Evaluating {} on {} assets, {} periods after {} warm-up",
            model_name,
            dataset.n_assets(),
            t_total - start,
            start
        );

        let progress = if config.show_progress {
            let pb = ProgressBar::new((t_total - start) as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
            Some(pb)
        } else {
            None
        };

        let assets = dataset.assets();
        let cost_rate = config.transaction_cost_bps / 10_000.0;
        let mut holdings: Option<Vec<f64>> = None;
        let mut equity = config.initial_capital;
        let mut total_costs = 0.0;
        let mut failed = 0;
        let mut rebalances = Vec::new();
        let mut returns = Vec::with_capacity(t_total - start);

        for t in start..t_total {
            let equity_before = equity;

            if (t - start) % config.rebalance_every == 0 {
                let window = self.estimation_rows(labels, t);
                let outcome = self.allocate(dataset, factors, &window.rows, model);

                let current = match &holdings {
                    Some(h) => WeightVector::from_slice(assets, h).ok(),
                    None => None,
                };
                let (target, fallback) = match outcome {
                    Ok(weights) => (weights, false),
                    Err(e) => {
                        failed += 1;
                        warn!(
                            "{} failed at {}: {}; keeping previous weights",
                            model_name,
                            dataset.timestamps()[t].format("%Y-%m-%d"),
                            e
                        );
                        match &current {
                            Some(c) => (c.clone(), true),
                            None => (WeightVector::equal(assets)?, true),
                        }
                    }
                };
                let target = match &current {
                    Some(c) => limit_turnover(c, target, config.constraints.max_turnover)?,
                    None => target,
                };

                // The first allocation buys from cash.
                let turnover = match &current {
                    Some(c) => c.turnover(&target),
                    None => target.iter().map(|(_, w)| w.abs()).sum::<f64>(),
                };
                let cost = equity * turnover * cost_rate;
                equity -= cost;
                total_costs += cost;

                debug!(
                    "Rebalance at {}: turnover {:.4}, cost {:.2}",
                    dataset.timestamps()[t].format("%Y-%m-%d"),
                    turnover,
                    cost
                );

                holdings = Some(target.to_vec(assets));
                rebalances.push(RebalanceRecord {
                    timestamp: dataset.timestamps()[t],
                    weights: target,
                    turnover,
                    cost,
                    regime: window.regime,
                    estimation_observations: window.rows.len(),
                    fallback,
                    regime_fallback: window.regime_fallback,
                });
            }

            let row = dataset.row(t);
            if let Some(h) = holdings.as_mut() {
                let gross = portfolio_return(h.as_slice(), row);
                equity *= 1.0 + gross;
                if equity <= 0.0 || 1.0 + gross <= 0.0 {
                    if let Some(ref pb) = progress {
                        pb.abandon();
                    }
                    return Err(wiped_out(dataset.timestamps()[t]));
                }
                for (w, r) in h.iter_mut().zip(row) {
                    *w *= (1.0 + r) / (1.0 + gross);
                }
            }
            returns.push(equity / equity_before - 1.0);

            if let Some(ref pb) = progress {
                pb.inc(1);
            }
        }

        if let Some(pb) = progress {
            pb.finish_with_message("Evaluation complete");
        }

        let equity_curve = build_equity_curve(
            config.initial_capital,
            &dataset.timestamps()[start..],
            &returns,
            &labels.labels()[start..],
        );

        let result = finish_result(
            model_name,
            dataset,
            &labels.labels()[start..],
            config,
            returns,
            equity_curve,
            rebalances,
            total_costs,
            failed,
        )?;

        info!(
            "{}: total return {:.2}%, Sharpe {:.2}, max drawdown {:.2}%",
            result.model_name,
            result.metrics.total_return * 100.0,
            result.metrics.sharpe_ratio,
            result.metrics.max_drawdown * 100.0
        );
        Ok(result)
    }

    /// Run several models in parallel. Models that fail are logged and left
    /// out of the result.
    pub fn run_many(
        &self,
        dataset: &ReturnsDataset,
        labels: &RegimeLabels,
        models: &[Box<dyn AllocationModel>],
    ) -> Vec<BacktestResult> {
        let mut quiet = self.config.clone();
        quiet.show_progress = false;
        let runner = Backtester {
            config: quiet,
            factors: self.factors.clone(),
        };

        let progress = if self.config.show_progress {
            let pb = ProgressBar::new(models.len() as u64);
            if let Ok(style) =
                ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} models")
            {
                pb.set_style(style);
            }
            Some(pb)
        } else {
            None
        };

        let results: Vec<BacktestResult> = models
            .par_iter()
            .filter_map(|model| {
                let result = runner.run(dataset, labels, model.as_ref());
                if let Some(ref pb) = progress {
                    pb.inc(1);
                }
                match result {
                    Ok(r) => Some(r),
                    Err(e) => {
                        warn!("Model {} failed: {}", model.name(), e);
                        None
                    }
                }
            })
            .collect();

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }
        results
    }

    /// Weights a model would set after the last row of the dataset.
    ///
    /// With `regime`, only rows carrying that label are used.
    pub fn snapshot(
        &self,
        dataset: &ReturnsDataset,
        labels: &RegimeLabels,
        model: &dyn AllocationModel,
        regime: Option<Regime>,
    ) -> Result<PortfolioSnapshot> {
        labels.ensure_covers(dataset.timestamps())?;
        let factors = self.factors_for(dataset, model)?;
        let rows: Vec<usize> = match regime {
            Some(r) => labels.indices_of(r),
            None => (0..dataset.len()).collect(),
        };
        if rows.is_empty() {
            return Err(PortfolioError::InsufficientData {
                required: self.config.estimation.min_observations,
                actual: 0,
            });
        }

        let sample = dataset.select_rows(&rows);
        let statistics = ReturnStatistics::estimate(&sample, &self.config.estimation)?;
        let weights = self.allocate(dataset, factors, &rows, model)?;

        let assets = dataset.assets();
        let w = weights.to_vec(assets);
        let covariance = statistics.annualized_covariance();
        let variance = covariance.portfolio_variance(&w);
        let contributions: Vec<f64> = risk_contributions(&w, &covariance)
            .into_iter()
            .map(|c| if variance > 0.0 { c / variance } else { 0.0 })
            .collect();
        Ok(PortfolioSnapshot {
            model_name: model.name(),
            regime,
            observations: rows.len(),
            expected_return: portfolio_return(&w, &statistics.annualized_means()),
            volatility: portfolio_volatility(&w, &covariance),
            risk_contributions: assets.iter().cloned().zip(contributions).collect(),
            weights,
        })
    }

    fn factors_for<'a>(
        &'a self,
        dataset: &ReturnsDataset,
        model: &dyn AllocationModel,
    ) -> Result<Option<&'a FactorTable>> {
        if !model.requires_factor_model() {
            return Ok(None);
        }
        let factors = self.factors.as_ref().ok_or_else(|| {
            PortfolioError::ConfigError(format!(
                "model {} needs factor returns but none were loaded",
                model.name()
            ))
        })?;
        if factors.timestamps.as_slice() != dataset.timestamps() {
            return Err(PortfolioError::DataError(
                "factor rows are not aligned with the return dates".to_string(),
            ));
        }
        Ok(Some(factors))
    }

    /// Row indices used for estimation at rebalance `t`.
    fn estimation_rows(&self, labels: &RegimeLabels, t: usize) -> EstimationRows {
        let first = match self.config.window {
            EstimationWindow::Expanding => 0,
            EstimationWindow::Rolling { periods } => t.saturating_sub(periods),
        };
        let window: Vec<usize> = (first..t).collect();
        let unconditioned = |rows: Vec<usize>, regime_fallback: bool| EstimationRows {
            rows,
            regime: None,
            regime_fallback,
        };
        if !self.config.regime_conditional {
            return unconditioned(window, false);
        }

        // The label at t is not known before t closes.
        let Some(current) = labels.get(t - 1) else {
            return unconditioned(window, true);
        };
        let same: Vec<usize> = window
            .iter()
            .copied()
            .filter(|&i| labels.get(i) == Some(current))
            .collect();
        if same.len() >= self.config.min_regime_observations {
            EstimationRows {
                rows: same,
                regime: Some(current),
                regime_fallback: false,
            }
        } else {
            debug!(
                "Only {} {} rows before index {}, using full window",
                same.len(),
                current,
                t
            );
            unconditioned(window, true)
        }
    }

    fn allocate(
        &self,
        dataset: &ReturnsDataset,
        factors: Option<&FactorTable>,
        rows: &[usize],
        model: &dyn AllocationModel,
    ) -> Result<WeightVector> {
        let sample = dataset.select_rows(rows);
        let statistics = ReturnStatistics::estimate(&sample, &self.config.estimation)?;
        let factor_model = match factors {
            Some(f) => Some(FactorModel::fit(&sample, &f.select_rows(rows))?),
            None => None,
        };

        let mut input = AllocationInput::new(&statistics, &self.config.constraints);
        if let Some(fm) = factor_model.as_ref() {
            input = input.with_factor_model(fm);
        }
        let weights = model.allocate(&input)?;
        self.config.constraints.validate(&weights)?;
        Ok(weights)
    }
}

/// Rows feeding one rebalance and the regime they were conditioned on.
struct EstimationRows {
    rows: Vec<usize>,
    regime: Option<Regime>,
    regime_fallback: bool,
}

/// Move part of the way toward `target` when the full trade would exceed
/// `max_turnover`.
fn limit_turnover(
    current: &WeightVector,
    target: WeightVector,
    max_turnover: Option<f64>,
) -> Result<WeightVector> {
    let Some(max) = max_turnover else {
        return Ok(target);
    };
    let turnover = current.turnover(&target);
    if turnover <= max + WEIGHT_TOLERANCE {
        return Ok(target);
    }
    let step = max / turnover;
    let assets: Vec<String> = current
        .assets()
        .chain(target.assets())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let blended: Vec<f64> = assets
        .iter()
        .map(|a| current.get(a) + step * (target.get(a) - current.get(a)))
        .collect();
    WeightVector::from_slice(&assets, &blended)
}
