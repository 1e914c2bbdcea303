//! Performance analytics and reporting.

use crate::engine::BacktestResult;
use crate::error::{PortfolioError, Result};
use crate::factor::FactorExposure;
use crate::regime::{Regime, RegimeStats};
use crate::types::WeightVector;
use colored::Colorize;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tabled::{builder::Builder, settings::Style};

/// Confidence level of the historical VaR and CVaR.
pub const VAR_CONFIDENCE: f64 = 0.95;

/// Risk and return metrics of a periodic return series.
///
/// Ratios are annualized; `var_95`/`cvar_95` and the best/worst period are
/// per-period; drawdown is a positive fraction of the running peak.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub observations: usize,
    pub total_return: f64,
    pub cagr: f64,
    pub mean_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown: f64,
    /// Longest stretch below a previous peak, in periods.
    pub max_drawdown_duration: usize,
    pub calmar_ratio: f64,
    pub var_95: f64,
    pub cvar_95: f64,
    /// Share of periods with a positive return.
    pub hit_rate: f64,
    pub best_period: f64,
    pub worst_period: f64,
}

impl PerformanceMetrics {
    /// Compute metrics; `risk_free_rate` is annual.
    pub fn from_returns(
        returns: &[f64],
        periods_per_year: f64,
        risk_free_rate: f64,
    ) -> Result<Self> {
        if returns.is_empty() {
            return Err(PortfolioError::InsufficientData {
                required: 1,
                actual: 0,
            });
        }
        let n = returns.len() as f64;

        let growth = returns.iter().fold(1.0, |acc, r| acc * (1.0 + r));
        let total_return = growth - 1.0;
        let cagr = if growth > 0.0 {
            growth.powf(periods_per_year / n) - 1.0
        } else {
            -1.0
        };

        let mean_return = returns.iter().sum::<f64>() / n;
        let volatility = sample_std(returns) * periods_per_year.sqrt();

        let rf_period = (1.0 + risk_free_rate).powf(1.0 / periods_per_year) - 1.0;
        let excess: Vec<f64> = returns.iter().map(|r| r - rf_period).collect();
        let excess_mean = excess.iter().sum::<f64>() / n;
        let excess_std = sample_std(&excess);
        let sharpe_ratio = if excess_std > 0.0 {
            excess_mean / excess_std * periods_per_year.sqrt()
        } else {
            0.0
        };

        // Downside deviation over the full sample, not just losing periods
        let downside_dev = (excess.iter().map(|e| e.min(0.0).powi(2)).sum::<f64>() / n).sqrt();
        let sortino_ratio = if downside_dev > 0.0 {
            excess_mean / downside_dev * periods_per_year.sqrt()
        } else if excess_mean > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_duration) = drawdown_analysis(returns);
        let calmar_ratio = if max_drawdown > 0.0 {
            cagr / max_drawdown
        } else {
            0.0
        };

        let (var_95, cvar_95) = historical_var(returns, VAR_CONFIDENCE);
        let hit_rate = returns.iter().filter(|r| **r > 0.0).count() as f64 / n;
        let best_period = returns.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let worst_period = returns.iter().copied().fold(f64::INFINITY, f64::min);

        Ok(Self {
            observations: returns.len(),
            total_return,
            cagr,
            mean_return,
            volatility,
            sharpe_ratio,
            sortino_ratio,
            max_drawdown,
            max_drawdown_duration,
            calmar_ratio,
            var_95,
            cvar_95,
            hit_rate,
            best_period,
            worst_period,
        })
    }
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
}

/// Maximum drawdown (fraction) and the longest underwater stretch (periods).
pub fn drawdown_analysis(returns: &[f64]) -> (f64, usize) {
    let mut level = 1.0;
    let mut peak = 1.0_f64;
    let mut max_dd = 0.0_f64;
    let mut underwater = 0;
    let mut longest = 0;

    for r in returns {
        level *= 1.0 + r;
        if level >= peak {
            peak = level;
            underwater = 0;
        } else {
            underwater += 1;
            longest = longest.max(underwater);
            max_dd = max_dd.max(1.0 - level / peak);
        }
    }
    (max_dd, longest)
}

/// Historical VaR and CVaR as positive loss fractions.
pub fn historical_var(returns: &[f64], confidence: f64) -> (f64, f64) {
    if returns.is_empty() {
        return (0.0, 0.0);
    }
    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    // Tail size in basis points keeps ceil exact when n is a multiple of 20
    let tail_bp = ((1.0 - confidence) * 10_000.0).round() as usize;
    let tail = ((tail_bp * sorted.len()).div_ceil(10_000)).max(1);
    let var = -sorted[tail - 1];
    let cvar = -sorted[..tail].iter().sum::<f64>() / tail as f64;
    (var, cvar)
}

/// Metrics over the periods carrying one regime label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimePerformance {
    pub regime: Regime,
    /// Share of all periods spent in this regime.
    pub share: f64,
    pub metrics: PerformanceMetrics,
}

impl RegimePerformance {
    /// Split `returns` by label and compute metrics per regime in parallel.
    ///
    /// Periods of one regime are compounded as if they were contiguous.
    pub fn compute(
        returns: &[f64],
        labels: &[Regime],
        periods_per_year: f64,
        risk_free_rate: f64,
    ) -> Result<Vec<RegimePerformance>> {
        if returns.len() != labels.len() {
            return Err(PortfolioError::RegimeCoverage(format!(
                "{} returns but {} labels",
                returns.len(),
                labels.len()
            )));
        }
        let total = returns.len() as f64;

        Regime::ALL
            .par_iter()
            .filter_map(|regime| {
                let subset: Vec<f64> = returns
                    .iter()
                    .zip(labels)
                    .filter(|(_, l)| *l == regime)
                    .map(|(r, _)| *r)
                    .collect();
                if subset.is_empty() {
                    return None;
                }
                Some(
                    PerformanceMetrics::from_returns(&subset, periods_per_year, risk_free_rate)
                        .map(|metrics| RegimePerformance {
                            regime: *regime,
                            share: subset.len() as f64 / total,
                            metrics,
                        }),
                )
            })
            .collect()
    }
}

/// Benchmark comparison metrics.
/// These metrics compare portfolio performance against a benchmark asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkMetrics {
    /// Benchmark name (e.g., "SPY").
    pub benchmark_name: String,
    /// Jensen's alpha, annualized, in percent.
    pub alpha: f64,
    /// Portfolio beta - sensitivity to benchmark movements.
    pub beta: f64,
    /// Annualized tracking error in percent.
    pub tracking_error: f64,
    /// Annualized excess return per unit of tracking error.
    pub information_ratio: f64,
    /// Correlation coefficient with benchmark (-1 to 1).
    pub correlation: f64,
    /// Upside capture ratio in percent.
    pub up_capture: f64,
    /// Downside capture ratio in percent.
    pub down_capture: f64,
    /// Benchmark total return for the period.
    pub benchmark_return_pct: f64,
    /// Excess return (portfolio return - benchmark return).
    pub excess_return_pct: f64,
}

impl BenchmarkMetrics {
    /// Calculate benchmark comparison metrics from aligned return series.
    ///
    /// `risk_free_rate` is annual. Returns `None` for empty or mismatched
    /// series.
    pub fn calculate(
        benchmark_name: impl Into<String>,
        portfolio_returns: &[f64],
        benchmark_returns: &[f64],
        periods_per_year: f64,
        risk_free_rate: f64,
    ) -> Option<Self> {
        if portfolio_returns.is_empty()
            || benchmark_returns.is_empty()
            || portfolio_returns.len() != benchmark_returns.len()
        {
            return None;
        }

        let n = portfolio_returns.len() as f64;
        let port_mean: f64 = portfolio_returns.iter().sum::<f64>() / n;
        let bench_mean: f64 = benchmark_returns.iter().sum::<f64>() / n;

        let covariance: f64 = portfolio_returns
            .iter()
            .zip(benchmark_returns)
            .map(|(p, b)| (p - port_mean) * (b - bench_mean))
            .sum::<f64>()
            / n;
        let bench_variance: f64 =
            benchmark_returns.iter().map(|b| (b - bench_mean).powi(2)).sum::<f64>() / n;
        let port_variance: f64 =
            portfolio_returns.iter().map(|p| (p - port_mean).powi(2)).sum::<f64>() / n;

        let beta = if bench_variance > 0.0 {
            covariance / bench_variance
        } else {
            0.0
        };

        let annualized_port_return = (1.0 + port_mean).powf(periods_per_year) - 1.0;
        let annualized_bench_return = (1.0 + bench_mean).powf(periods_per_year) - 1.0;
        let alpha = (annualized_port_return - risk_free_rate)
            - beta * (annualized_bench_return - risk_free_rate);

        let port_std = port_variance.sqrt();
        let bench_std = bench_variance.sqrt();
        let correlation = if port_std > 0.0 && bench_std > 0.0 {
            covariance / (port_std * bench_std)
        } else {
            0.0
        };

        let excess_returns: Vec<f64> = portfolio_returns
            .iter()
            .zip(benchmark_returns)
            .map(|(p, b)| p - b)
            .collect();
        let excess_mean: f64 = excess_returns.iter().sum::<f64>() / n;
        let tracking_error_period: f64 = (excess_returns
            .iter()
            .map(|e| (e - excess_mean).powi(2))
            .sum::<f64>()
            / n)
            .sqrt();
        let tracking_error = tracking_error_period * periods_per_year.sqrt() * 100.0;

        let information_ratio = if tracking_error > 0.0 {
            (excess_mean * periods_per_year * 100.0) / tracking_error
        } else {
            0.0
        };

        let (up_capture, down_capture) =
            Self::calculate_capture_ratios(portfolio_returns, benchmark_returns);

        let portfolio_total_return: f64 =
            portfolio_returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0;
        let benchmark_total_return: f64 =
            benchmark_returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0;

        Some(Self {
            benchmark_name: benchmark_name.into(),
            alpha: alpha * 100.0,
            beta,
            tracking_error,
            information_ratio,
            correlation,
            up_capture,
            down_capture,
            benchmark_return_pct: benchmark_total_return * 100.0,
            excess_return_pct: (portfolio_total_return - benchmark_total_return) * 100.0,
        })
    }

    fn calculate_capture_ratios(
        portfolio_returns: &[f64],
        benchmark_returns: &[f64],
    ) -> (f64, f64) {
        let capture = |keep: fn(f64) -> bool| {
            let (port, bench) = portfolio_returns
                .iter()
                .zip(benchmark_returns)
                .filter(|(_, b)| keep(**b))
                .fold((0.0_f64, 0.0_f64), |(p_sum, b_sum), (p, b)| {
                    (p_sum + *p, b_sum + *b)
                });
            if bench != 0.0 {
                port / bench * 100.0
            } else {
                100.0
            }
        };
        (capture(|b| b > 0.0), capture(|b| b < 0.0))
    }
}

/// Format results for terminal display.
pub struct ResultFormatter;

impl ResultFormatter {
    /// Print a full report for one model.
    pub fn print_report(result: &BacktestResult) {
        let m = &result.metrics;

        println!();
        println!("{}", "═".repeat(60).blue());
        println!(
            "{}",
            format!(" {} ", result.model_name.to_uppercase()).bold().blue()
        );
        println!("{}", "═".repeat(60).blue());
        println!();

        println!("{}", "Overview".bold().underline());
        println!("  Assets:          {}", result.assets.join(", "));
        println!(
            "  Period:          {} to {}",
            result.start_time.format("%Y-%m-%d"),
            result.end_time.format("%Y-%m-%d")
        );
        println!("  Periods:         {}", m.observations);
        println!("  Rebalances:      {}", result.rebalances.len());
        if result.failed_allocations > 0 {
            println!(
                "  Failed:          {}",
                result.failed_allocations.to_string().yellow()
            );
        }
        println!();

        println!("{}", "Performance".bold().underline());
        println!("  Initial Capital: ${:>12.2}", result.initial_capital);
        println!(
            "  Final Equity:    ${:>12.2}  {}",
            result.final_equity,
            Self::format_pct_change(m.total_return * 100.0)
        );
        println!("  CAGR:            {:>12.2}%", m.cagr * 100.0);
        println!("  Hit Rate:        {:>12.1}%", m.hit_rate * 100.0);
        println!();

        println!("{}", "Risk Metrics".bold().underline());
        println!("  Volatility:      {:>12.2}%", m.volatility * 100.0);
        println!("  Max Drawdown:    {:>12.2}%", -m.max_drawdown * 100.0);
        println!("  DD Duration:     {:>12}", m.max_drawdown_duration);
        println!("  VaR 95%:         {:>12.2}%", m.var_95 * 100.0);
        println!("  CVaR 95%:        {:>12.2}%", m.cvar_95 * 100.0);
        println!("  Sharpe Ratio:    {:>12.2}", m.sharpe_ratio);
        println!("  Sortino Ratio:   {:>12.2}", m.sortino_ratio);
        println!("  Calmar Ratio:    {:>12.2}", m.calmar_ratio);
        println!();

        println!("{}", "Trading".bold().underline());
        println!("  Total Turnover:  {:>12.2}", result.total_turnover);
        println!("  Total Costs:     ${:>11.2}", result.total_costs);
        println!();

        if let Some(bm) = &result.benchmark {
            Self::print_benchmark_comparison(bm);
        }

        if !result.regime_metrics.is_empty() {
            println!("{}", "By Regime".bold().underline());
            Self::print_regime_table(&result.regime_metrics);
            println!();
        }

        if let Some(last) = result.rebalances.last() {
            Self::print_weights("Final Target Weights", &last.weights);
        }

        println!("{}", "═".repeat(60).blue());
    }

    /// Format percentage change with color.
    fn format_pct_change(pct: f64) -> String {
        if pct >= 0.0 {
            format!("(+{:.2}%)", pct).green().to_string()
        } else {
            format!("({:.2}%)", pct).red().to_string()
        }
    }

    /// Print benchmark comparison metrics.
    pub fn print_benchmark_comparison(metrics: &BenchmarkMetrics) {
        println!(
            "{}",
            format!("Benchmark Comparison ({})", metrics.benchmark_name)
                .bold()
                .underline()
        );
        println!(
            "  Benchmark Return: {:>10.2}%",
            metrics.benchmark_return_pct
        );
        println!(
            "  Excess Return:    {:>10.2}%  {}",
            metrics.excess_return_pct,
            Self::format_pct_change(metrics.excess_return_pct)
        );
        println!("  Alpha:            {:>10.2}%", metrics.alpha);
        println!("  Beta:             {:>10.2}", metrics.beta);
        println!("  Correlation:      {:>10.2}", metrics.correlation);
        println!("  Tracking Error:   {:>10.2}%", metrics.tracking_error);
        println!("  Information Ratio:{:>10.2}", metrics.information_ratio);
        println!("  Up Capture:       {:>10.2}%", metrics.up_capture);
        println!("  Down Capture:     {:>10.2}%", metrics.down_capture);
        println!();
    }

    pub fn print_regime_table(rows: &[RegimePerformance]) {
        let mut builder = Builder::new();
        builder.push_record([
            "Regime", "Share", "Periods", "Return %", "Ann. Vol %", "Sharpe", "Max DD %",
            "CVaR 95%",
        ]);
        for row in rows {
            let m = &row.metrics;
            builder.push_record([
                row.regime.to_string(),
                format!("{:.1}%", row.share * 100.0),
                m.observations.to_string(),
                format!("{:.2}", m.total_return * 100.0),
                format!("{:.2}", m.volatility * 100.0),
                format!("{:.2}", m.sharpe_ratio),
                format!("{:.2}", -m.max_drawdown * 100.0),
                format!("{:.2}", m.cvar_95 * 100.0),
            ]);
        }
        println!("{}", builder.build().with(Style::rounded()));
    }

    pub fn print_weights(title: &str, weights: &WeightVector) {
        println!("{}", title.bold().underline());
        for (asset, w) in weights.iter() {
            let bar = "█".repeat((w.max(0.0) * 40.0).round() as usize);
            println!("  {:<8} {:>7.2}%  {}", asset, w * 100.0, bar.cyan());
        }
        println!();
    }

    pub fn print_factor_exposures(exposures: &[FactorExposure]) {
        println!("{}", "Factor Exposures".bold().underline());
        println!("{}", Self::exposure_table(exposures));
    }

    /// One row per asset: per-period alpha, loadings, R² and residual volatility.
    pub fn exposure_table(exposures: &[FactorExposure]) -> String {
        let mut builder = Builder::new();
        let mut header = vec!["Asset".to_string(), "Alpha %".to_string()];
        if let Some(first) = exposures.first() {
            header.extend(first.betas.iter().map(|(name, _)| name.clone()));
        }
        header.extend(["R²".to_string(), "Resid Vol %".to_string()]);
        builder.push_record(header);

        for e in exposures {
            let mut row = vec![e.asset.clone(), format!("{:.4}", e.alpha * 100.0)];
            row.extend(e.betas.iter().map(|(_, b)| format!("{:.3}", b)));
            row.push(format!("{:.3}", e.r_squared));
            row.push(format!("{:.2}", e.residual_volatility * 100.0));
            builder.push_record(row);
        }
        builder.build().with(Style::rounded()).to_string()
    }

    pub fn print_regime_summary(stats: &RegimeStats) {
        let mut builder = Builder::new();
        builder.push_record(["Regime", "Periods", "Share", "Avg Run"]);
        for (regime, count) in &stats.counts {
            builder.push_record([
                regime.to_string(),
                count.to_string(),
                format!("{:.1}%", stats.percentages.get(regime).copied().unwrap_or(0.0)),
                format!("{:.1}", stats.avg_durations.get(regime).copied().unwrap_or(0.0)),
            ]);
        }
        println!("{}", builder.build().with(Style::rounded()));
        println!(
            "  {} regime changes, average run {:.1} periods",
            stats.num_changes, stats.avg_regime_duration
        );
    }

    /// Print a side-by-side comparison of several models.
    pub fn print_table(results: &[BacktestResult]) {
        let mut builder = Builder::new();
        builder.push_record([
            "Model", "Return %", "CAGR %", "Vol %", "Sharpe", "Sortino", "Max DD %", "Turnover",
        ]);

        for result in results {
            let m = &result.metrics;
            builder.push_record([
                result.model_name.clone(),
                format!("{:.2}", m.total_return * 100.0),
                format!("{:.2}", m.cagr * 100.0),
                format!("{:.2}", m.volatility * 100.0),
                format!("{:.2}", m.sharpe_ratio),
                format!("{:.2}", m.sortino_ratio),
                format!("{:.2}", -m.max_drawdown * 100.0),
                format!("{:.2}", result.total_turnover),
            ]);
        }

        let table = builder.build().with(Style::rounded()).to_string();
        println!("{}", table);
    }

    /// Serialize any result type as pretty JSON.
    pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
        Ok(serde_json::to_string_pretty(value)?)
    }

    /// Export one summary line per model and regime (regime empty = overall).
    pub fn to_csv(results: &[BacktestResult]) -> String {
        let mut out = String::from(Self::csv_header());
        out.push('\n');
        for result in results {
            out.push_str(&Self::csv_line(&result.model_name, "", &result.metrics));
            for row in &result.regime_metrics {
                out.push_str(&Self::csv_line(
                    &result.model_name,
                    row.regime.as_str(),
                    &row.metrics,
                ));
            }
        }
        out
    }

    fn csv_line(model: &str, regime: &str, m: &PerformanceMetrics) -> String {
        format!(
            "{},{},{},{:.6},{:.6},{:.6},{:.4},{:.4},{:.6},{},{:.6},{:.6},{:.4}\n",
            model,
            regime,
            m.observations,
            m.total_return,
            m.cagr,
            m.volatility,
            m.sharpe_ratio,
            m.sortino_ratio,
            m.max_drawdown,
            m.max_drawdown_duration,
            m.var_95,
            m.cvar_95,
            m.hit_rate
        )
    }

    /// Get CSV header.
    pub fn csv_header() -> &'static str {
        "model,regime,observations,total_return,cagr,volatility,sharpe,sortino,max_drawdown,max_drawdown_duration,var_95,cvar_95,hit_rate"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_metrics_basic() {
        let returns = vec![0.10, -0.05, 0.02, 0.03];
        let m = PerformanceMetrics::from_returns(&returns, 12.0, 0.0).unwrap();
        let growth = 1.10 * 0.95 * 1.02 * 1.03;
        assert_relative_eq!(m.total_return, growth - 1.0, epsilon = 1e-12);
        assert_relative_eq!(m.cagr, growth.powf(3.0) - 1.0, epsilon = 1e-12);
        assert_relative_eq!(m.hit_rate, 0.75);
        assert_relative_eq!(m.best_period, 0.10);
        assert_relative_eq!(m.worst_period, -0.05);
        assert_relative_eq!(m.max_drawdown, 0.05, epsilon = 1e-12);
        // 1.10 * 0.95 * 1.02 * 1.03 = 1.0979 is still below the 1.10 peak
        assert_eq!(m.max_drawdown_duration, 3);
        assert_eq!(m.observations, 4);
    }

    #[test]
    fn test_exposure_table_lists_factors() {
        let exposures = vec![FactorExposure {
            asset: "SPY".to_string(),
            alpha: 0.0001,
            betas: vec![("Mkt-RF".to_string(), 1.02), ("SMB".to_string(), -0.15)],
            r_squared: 0.97,
            residual_volatility: 0.02,
        }];
        let table = ResultFormatter::exposure_table(&exposures);
        assert!(table.contains("Mkt-RF"));
        assert!(table.contains("SMB"));
        assert!(table.contains("SPY"));
        assert!(table.contains("1.020"));
        assert!(table.contains("-0.150"));
    }

    #[test]
    fn test_metrics_empty_is_error() {
        assert!(PerformanceMetrics::from_returns(&[], 252.0, 0.0).is_err());
    }

    #[test]
    fn test_sharpe_and_sortino() {
        let returns = vec![0.01, -0.02, 0.015, 0.005, -0.01, 0.02];
        let m = PerformanceMetrics::from_returns(&returns, 252.0, 0.0).unwrap();
        let mean = 0.02 / 6.0;
        let std = sample_std(&returns);
        assert_relative_eq!(m.sharpe_ratio, mean / std * 252.0_f64.sqrt(), epsilon = 1e-12);
        let downside = ((0.0004 + 0.0001) / 6.0_f64).sqrt();
        assert_relative_eq!(
            m.sortino_ratio,
            mean / downside * 252.0_f64.sqrt(),
            epsilon = 1e-12
        );

        let all_up = PerformanceMetrics::from_returns(&[0.01, 0.02], 252.0, 0.0).unwrap();
        assert!(all_up.sortino_ratio.is_infinite());
        assert_eq!(all_up.max_drawdown, 0.0);
        assert_eq!(all_up.calmar_ratio, 0.0);
    }

    #[test]
    fn test_historical_var() {
        let returns: Vec<f64> = (1..=100).map(|i| (i as f64 - 50.0) / 1000.0).collect();
        let (var, cvar) = historical_var(&returns, 0.95);
        // Worst five returns are -0.049..-0.045
        assert_relative_eq!(var, 0.045, epsilon = 1e-12);
        assert_relative_eq!(cvar, 0.047, epsilon = 1e-12);
        assert!(cvar >= var);
    }

    #[test]
    fn test_historical_var_tail_of_twenty() {
        let returns: Vec<f64> = (1..=20).map(|i| -(i as f64) / 100.0).collect();
        let (var, cvar) = historical_var(&returns, 0.95);
        assert_relative_eq!(var, 0.20, epsilon = 1e-12);
        assert_relative_eq!(cvar, 0.20, epsilon = 1e-12);

        let (var, _) = historical_var(&returns[..19], 0.95);
        assert_relative_eq!(var, 0.19, epsilon = 1e-12);
    }

    #[test]
    fn test_regime_performance_partitions_periods() {
        let returns = vec![0.01, -0.03, 0.02, -0.01, 0.0];
        let labels = vec![
            Regime::Bull,
            Regime::Bear,
            Regime::Bull,
            Regime::Bear,
            Regime::HighVolatility,
        ];
        let rows = RegimePerformance::compute(&returns, &labels, 252.0, 0.0).unwrap();
        assert_eq!(rows.len(), 3);
        let total: usize = rows.iter().map(|r| r.metrics.observations).sum();
        assert_eq!(total, returns.len());
        let bear = rows.iter().find(|r| r.regime == Regime::Bear).unwrap();
        assert_relative_eq!(bear.metrics.total_return, 0.97 * 0.99 - 1.0, epsilon = 1e-12);
        assert_relative_eq!(bear.share, 0.4);

        assert!(RegimePerformance::compute(&returns, &labels[..2], 252.0, 0.0).is_err());
    }

    #[test]
    fn test_benchmark_metrics_calculation() {
        let portfolio_returns = vec![0.01, 0.02, -0.01, 0.015, -0.005];
        let benchmark_returns = vec![0.008, 0.015, -0.012, 0.01, -0.008];

        let metrics = BenchmarkMetrics::calculate(
            "SPY",
            &portfolio_returns,
            &benchmark_returns,
            252.0,
            0.02,
        )
        .unwrap();

        assert_eq!(metrics.benchmark_name, "SPY");
        assert!(metrics.beta > 0.0);
        assert!(metrics.correlation > 0.9);
        assert!(metrics.tracking_error > 0.0);
        assert!(metrics.up_capture > 100.0);
        assert!(metrics.down_capture < 100.0);
    }

    #[test]
    fn test_benchmark_metrics_perfect_correlation() {
        let returns = vec![0.01, 0.02, -0.01, 0.015, -0.005];
        let metrics = BenchmarkMetrics::calculate("SELF", &returns, &returns, 252.0, 0.0).unwrap();
        assert_relative_eq!(metrics.beta, 1.0, epsilon = 1e-10);
        assert_relative_eq!(metrics.correlation, 1.0, epsilon = 1e-10);
        assert_relative_eq!(metrics.tracking_error, 0.0, epsilon = 1e-10);
        assert_relative_eq!(metrics.up_capture, 100.0, epsilon = 1e-10);
    }

    #[test]
    fn test_benchmark_metrics_invalid_input() {
        assert!(BenchmarkMetrics::calculate("X", &[], &[], 252.0, 0.0).is_none());
        assert!(BenchmarkMetrics::calculate("X", &[0.01], &[0.01, 0.02], 252.0, 0.0).is_none());
    }
}
