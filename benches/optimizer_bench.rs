//! Performance benchmarks for estimation, optimization and evaluation.
//!
//! Run with: cargo bench

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use regimefolio::allocation::{MeanVariance, RiskParity};
use regimefolio::data::ReturnsDataset;
use regimefolio::engine::{Backtester, EvaluationConfig};
use regimefolio::optimizer::{risk_parity_weights, MeanVarianceOptimizer, WeightBounds};
use regimefolio::regime::{RegimeConfig, RuleBasedClassifier};
use regimefolio::stats::{ledoit_wolf_covariance, sample_covariance, CovarianceMatrix};

/// Generate deterministic returns for benchmarking.
fn generate_returns(periods: usize, assets: usize) -> ReturnsDataset {
    let start = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
    let timestamps = (0..periods).map(|i| start + Duration::days(i as i64)).collect();
    let names = (0..assets).map(|j| format!("A{}", j)).collect();
    let rows = (0..periods)
        .map(|i| {
            let market = 0.008 * (i as f64 * 0.7).sin();
            (0..assets)
                .map(|j| {
                    let beta = 0.5 + j as f64 / assets as f64;
                    0.0003 + beta * market + 0.004 * ((i * (j + 3)) as f64 * 0.13).cos()
                })
                .collect()
        })
        .collect();
    ReturnsDataset::new(timestamps, names, rows).unwrap()
}

fn bench_covariance(c: &mut Criterion) {
    let mut group = c.benchmark_group("covariance");
    for assets in [5, 20, 50].iter() {
        let dataset = generate_returns(1000, *assets);
        group.bench_with_input(BenchmarkId::new("sample", assets), assets, |b, _| {
            b.iter(|| sample_covariance(black_box(dataset.rows())))
        });
        group.bench_with_input(BenchmarkId::new("ledoit_wolf", assets), assets, |b, _| {
            b.iter(|| ledoit_wolf_covariance(black_box(dataset.rows())))
        });
    }
    group.finish();
}

fn bench_optimizers(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimizer");
    for assets in [5, 20, 50].iter() {
        let dataset = generate_returns(1000, *assets);
        let cov = CovarianceMatrix::from_matrix(ledoit_wolf_covariance(dataset.rows()).unwrap().0)
            .unwrap();
        let mu: Vec<f64> = (0..*assets).map(|j| 0.0002 + 0.00001 * j as f64).collect();
        let optimizer =
            MeanVarianceOptimizer::new(mu, cov.clone(), WeightBounds::long_only()).unwrap();

        group.bench_with_input(BenchmarkId::new("min_variance", assets), assets, |b, _| {
            b.iter(|| optimizer.minimum_variance())
        });
        group.bench_with_input(BenchmarkId::new("max_sharpe", assets), assets, |b, _| {
            b.iter(|| optimizer.maximum_sharpe_ratio(0.0))
        });
        group.bench_with_input(BenchmarkId::new("risk_parity", assets), assets, |b, &n| {
            b.iter(|| risk_parity_weights(black_box(&cov), &vec![1.0; n]))
        });
    }
    group.finish();
}

fn bench_walk_forward(c: &mut Criterion) {
    let dataset = generate_returns(1500, 10);
    let labels = RuleBasedClassifier::new(RegimeConfig::default())
        .classify_dataset(&dataset, None, None)
        .unwrap();
    let config = EvaluationConfig {
        min_history: 252,
        rebalance_every: 21,
        ..Default::default()
    };
    let backtester = Backtester::new(config.clone());
    let conditional = Backtester::new(EvaluationConfig {
        regime_conditional: true,
        ..config
    });

    let mut group = c.benchmark_group("walk_forward");
    group.sample_size(20);
    group.bench_function("risk_parity", |b| {
        b.iter(|| backtester.run(black_box(&dataset), &labels, &RiskParity::default()))
    });
    group.bench_function("min_variance", |b| {
        b.iter(|| backtester.run(black_box(&dataset), &labels, &MeanVariance::minimum_variance()))
    });
    group.bench_function("min_variance_regime_conditional", |b| {
        b.iter(|| conditional.run(black_box(&dataset), &labels, &MeanVariance::minimum_variance()))
    });
    group.finish();
}

criterion_group!(benches, bench_covariance, bench_optimizers, bench_walk_forward);
criterion_main!(benches);
