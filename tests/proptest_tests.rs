//! Property-based tests for weight, covariance, optimizer and regime
//! invariants.

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

use regimefolio::allocation::{
    AllocationInput, AllocationModel, EqualWeight, InverseVolatility, MeanVariance,
    PortfolioConstraints, RiskParity,
};
use regimefolio::analytics::RegimePerformance;
use regimefolio::data::ReturnsDataset;
use regimefolio::engine::{evaluate_static, EvaluationConfig};
use regimefolio::optimizer::{risk_contributions, MeanVarianceOptimizer, WeightBounds};
use regimefolio::regime::{RegimeConfig, RegimeLabels, RuleBasedClassifier};
use regimefolio::stats::{
    ledoit_wolf_covariance, sample_covariance, CovarianceMatrix, EstimatorConfig, ReturnStatistics,
};
use regimefolio::types::WeightVector;

fn dates(n: usize) -> Vec<DateTime<Utc>> {
    let start = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
    (0..n).map(|i| start + Duration::days(i as i64)).collect()
}

fn asset_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("A{}", i)).collect()
}

/// Return matrices with `assets` columns and 30..60 rows.
fn returns_strategy(assets: usize) -> impl Strategy<Value = Vec<Vec<f64>>> {
    prop::collection::vec(prop::collection::vec(-0.05..0.05f64, assets), 30..60)
}

/// Well-conditioned covariance matrices `A A' + 0.01 I`.
fn covariance_strategy(n: usize) -> impl Strategy<Value = CovarianceMatrix> {
    prop::collection::vec(-0.3..0.3f64, n * n).prop_map(move |a| {
        let rows = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| {
                        let dot: f64 = (0..n).map(|k| a[i * n + k] * a[j * n + k]).sum();
                        dot + if i == j { 0.01 } else { 0.0 }
                    })
                    .collect()
            })
            .collect();
        CovarianceMatrix::new(rows).unwrap()
    })
}

// ============================================================================
// Weight Vector Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_normalized_weights_sum_to_one(raw in prop::collection::vec(0.01..10.0f64, 1..12)) {
        let assets = asset_names(raw.len());
        let weights = WeightVector::normalized(&assets, &raw).unwrap();
        prop_assert!((weights.sum() - 1.0).abs() < 1e-9);
        prop_assert!(weights.is_long_only());
    }

    #[test]
    fn prop_turnover_is_symmetric_and_bounded(
        a in prop::collection::vec(0.01..1.0f64, 4),
        b in prop::collection::vec(0.01..1.0f64, 4),
    ) {
        let assets = asset_names(4);
        let wa = WeightVector::normalized(&assets, &a).unwrap();
        let wb = WeightVector::normalized(&assets, &b).unwrap();
        let t = wa.turnover(&wb);
        prop_assert!((t - wb.turnover(&wa)).abs() < 1e-12);
        prop_assert!((0.0..=1.0 + 1e-12).contains(&t));
    }
}

// ============================================================================
// Covariance Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_covariance_estimates_are_symmetric_psd(rows in returns_strategy(4)) {
        let sample = CovarianceMatrix::from_matrix(sample_covariance(&rows).unwrap()).unwrap();
        let (lw, shrinkage) = ledoit_wolf_covariance(&rows).unwrap();
        let lw = CovarianceMatrix::from_matrix(lw).unwrap();

        prop_assert!((0.0..=1.0).contains(&shrinkage));
        for cov in [&sample, &lw] {
            prop_assert!(cov.is_positive_semidefinite());
            for i in 0..4 {
                for j in 0..4 {
                    prop_assert!((cov.get(i, j) - cov.get(j, i)).abs() < 1e-12);
                }
            }
        }
    }
}

// ============================================================================
// Allocation Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_every_model_returns_a_budgeted_long_only_portfolio(rows in returns_strategy(3)) {
        let n = rows.len();
        let dataset = ReturnsDataset::new(dates(n), asset_names(3), rows).unwrap();
        let stats = ReturnStatistics::estimate(&dataset, &EstimatorConfig::default()).unwrap();
        let constraints = PortfolioConstraints::default();
        let input = AllocationInput::new(&stats, &constraints);

        let models: Vec<Box<dyn AllocationModel>> = vec![
            Box::new(EqualWeight),
            Box::new(InverseVolatility),
            Box::new(MeanVariance::minimum_variance()),
            Box::new(RiskParity::default()),
        ];
        for model in &models {
            let w = model.allocate(&input).unwrap();
            prop_assert!((w.sum() - 1.0).abs() < 1e-6, "{} sums to {}", model.name(), w.sum());
            prop_assert!(w.is_long_only(), "{} shorts: {}", model.name(), w);
        }
    }

    #[test]
    fn prop_minimum_variance_beats_equal_weight(cov in covariance_strategy(4)) {
        let optimizer =
            MeanVarianceOptimizer::new(vec![0.05; 4], cov.clone(), WeightBounds::long_only()).unwrap();
        let w = optimizer.minimum_variance().unwrap();
        let ew_var = cov.portfolio_variance(&[0.25; 4]);
        prop_assert!(cov.portfolio_variance(&w) <= ew_var * (1.0 + 1e-6) + 1e-12);
        prop_assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn prop_risk_parity_equalizes_contributions(cov in covariance_strategy(4)) {
        let w = regimefolio::optimizer::risk_parity_weights(&cov, &[1.0; 4]).unwrap();
        let rc = risk_contributions(&w, &cov);
        let total: f64 = rc.iter().sum();
        for c in rc {
            prop_assert!((c / total - 0.25).abs() < 0.25 * 1e-6);
        }
    }
}

// ============================================================================
// Regime and Evaluation Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_labels_cover_every_period(returns in prop::collection::vec(-0.06..0.06f64, 2..300)) {
        let n = returns.len();
        let labels = RuleBasedClassifier::new(RegimeConfig::default())
            .classify(&returns, &dates(n), 252.0, None)
            .unwrap();
        prop_assert_eq!(labels.len(), n);
        prop_assert!(labels.ensure_covers(&dates(n)).is_ok());
        prop_assert_eq!(labels.counts().values().sum::<usize>(), n);
        let segment_total: usize = labels.segments().iter().map(|s| s.periods).sum();
        prop_assert_eq!(segment_total, n);
    }

    #[test]
    fn prop_regime_metrics_partition_observations(returns in prop::collection::vec(-0.06..0.06f64, 2..200)) {
        let n = returns.len();
        let labels = RuleBasedClassifier::new(RegimeConfig::default())
            .classify(&returns, &dates(n), 252.0, None)
            .unwrap();
        let rows = RegimePerformance::compute(&returns, labels.labels(), 252.0, 0.0).unwrap();
        let total: usize = rows.iter().map(|r| r.metrics.observations).sum();
        prop_assert_eq!(total, n);
        let share: f64 = rows.iter().map(|r| r.share).sum();
        prop_assert!((share - 1.0).abs() < 1e-9);
    }

    #[test]
    fn prop_single_asset_static_portfolio_compounds(returns in prop::collection::vec(-0.05..0.05f64, 2..120)) {
        let n = returns.len();
        let dataset = ReturnsDataset::new(
            dates(n),
            vec!["X".to_string(), "Y".to_string()],
            returns.iter().map(|r| vec![*r, 0.0]).collect(),
        )
        .unwrap();
        let labels = RuleBasedClassifier::new(RegimeConfig::default())
            .classify(&returns, &dates(n), 252.0, None)
            .unwrap();
        let weights = WeightVector::from_slice(&["X".to_string()], &[1.0]).unwrap();
        let result = evaluate_static(&dataset, &weights, &labels, &EvaluationConfig::default()).unwrap();

        let expected = returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0;
        prop_assert!((result.metrics.total_return - expected).abs() < 1e-10);
        prop_assert_eq!(result.equity_curve.len(), n);
    }
}

#[test]
fn labels_reject_mismatched_lengths() {
    let labels = RegimeLabels::new(dates(3), vec![regimefolio::regime::Regime::Bull; 2]);
    assert!(labels.is_err());
}
