//! regimefolio - portfolio construction evaluated across market regimes.
//!
//! # Overview
//!
//! regimefolio labels each period of a multi-asset return history with a
//! market regime (bull, bear, recovery, high volatility), builds portfolios
//! with several allocation models and evaluates them walk-forward, reporting
//! performance overall and within each regime:
//!
//! - **Regime classification**: drawdown, trend and volatility rules, with an
//!   optional stress indicator such as the VIX
//! - **Estimation**: sample, Ledoit-Wolf and EWMA covariance, per regime
//! - **Allocation**: equal weight, inverse volatility, Markowitz
//!   (min variance, max Sharpe, target return), risk parity, factor-based
//! - **Evaluation**: walk-forward rebalancing with transaction costs and
//!   regime-conditional estimation
//! - **Analytics**: Sharpe, Sortino, drawdown, VaR/CVaR and benchmark metrics
//!   sliced by regime
//!
//! # Quick Start
//!
//! ```no_run
//! use regimefolio::{
//!     allocation::RiskParity,
//!     data::{load_prices, DataConfig},
//!     engine::{Backtester, EvaluationConfig},
//!     regime::{RegimeConfig, RuleBasedClassifier},
//! };
//!
//! let dataset = load_prices("data/prices.csv", &DataConfig::default())
//!     .unwrap()
//!     .to_returns()
//!     .unwrap();
//! let labels = RuleBasedClassifier::new(RegimeConfig::default())
//!     .classify_dataset(&dataset, Some("SPY"), None)
//!     .unwrap();
//!
//! let backtester = Backtester::new(EvaluationConfig::default());
//! let result = backtester
//!     .run(&dataset, &labels, &RiskParity::default())
//!     .unwrap();
//!
//! println!("Sharpe: {:.2}", result.metrics.sharpe_ratio);
//! for row in &result.regime_metrics {
//!     println!("{}: {:.2}%", row.regime, row.metrics.total_return * 100.0);
//! }
//! ```
//!
//! # Modules
//!
//! - [`types`]: Weight vectors, frequencies and equity points
//! - [`data`]: CSV loading of prices, returns, indicators and factors
//! - [`regime`]: Regime labels and the rule-based classifier
//! - [`stats`]: Return statistics and covariance estimators
//! - [`factor`]: Linear factor model
//! - [`optimizer`]: Mean-variance QP and risk-parity solvers
//! - [`allocation`]: Allocation models and portfolio constraints
//! - [`engine`]: Walk-forward evaluation
//! - [`analytics`]: Performance metrics and reporting
//! - [`config`]: TOML configuration file support

pub mod allocation;
pub mod analytics;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod factor;
pub mod optimizer;
pub mod regime;
pub mod stats;
pub mod types;

// Re-exports for convenience
pub use allocation::{
    AllocationInput, AllocationModel, EqualWeight, FactorBased, InverseVolatility, MeanVariance,
    ModelSpec, PortfolioConstraints, RiskParity,
};
pub use analytics::{BenchmarkMetrics, PerformanceMetrics, RegimePerformance, ResultFormatter};
pub use config::AnalysisConfig;
pub use data::{FactorTable, IndicatorTable, ReturnsDataset};
pub use engine::{evaluate_static, BacktestResult, Backtester, EstimationWindow, EvaluationConfig};
pub use error::{ErrorHelp, PortfolioError, Result};
pub use regime::{Regime, RegimeConfig, RegimeLabels, RuleBasedClassifier};
pub use stats::{CovarianceEstimator, CovarianceMatrix, EstimatorConfig, ReturnStatistics};
pub use types::{EquityPoint, Frequency, WeightVector};
