//! Configuration file support for analyses.
//!
//! An analysis is described by one TOML file naming the data, the regime
//! classifier, the estimators, the evaluation settings and the models to
//! compare. Relative paths are resolved against the file's directory.

use crate::allocation::{AllocationModel, ModelSpec, PortfolioConstraints};
use crate::data::{
    load_factors, load_indicators, load_price_dir, load_prices, load_returns, parse_datetime,
    DataConfig, FactorTable, ReturnsDataset,
};
use crate::engine::{EstimationWindow, EvaluationConfig};
use crate::error::{PortfolioError, Result};
use crate::optimizer::MeanVarianceObjective;
use crate::regime::{RegimeConfig, RegimeLabels, RuleBasedClassifier};
use crate::stats::EstimatorConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Complete analysis configuration loaded from a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub data: DataSettings,
    #[serde(default)]
    pub regime: RegimeSettings,
    #[serde(default)]
    pub estimation: EstimationSettings,
    #[serde(default)]
    pub evaluation: EvaluationSettings,
    #[serde(default)]
    pub constraints: PortfolioConstraints,
    #[serde(default = "default_models")]
    pub models: Vec<ModelSpec>,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

fn default_models() -> Vec<ModelSpec> {
    vec![
        ModelSpec::EqualWeight,
        ModelSpec::InverseVolatility,
        ModelSpec::MeanVariance {
            objective: MeanVarianceObjective::MinimumVariance,
        },
        ModelSpec::MeanVariance {
            objective: MeanVarianceObjective::MaximumSharpe {
                risk_free_rate: 0.0,
            },
        },
        ModelSpec::RiskParity {
            budgets: Default::default(),
        },
    ]
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            data: DataSettings::default(),
            regime: RegimeSettings::default(),
            estimation: EstimationSettings::default(),
            evaluation: EvaluationSettings::default(),
            constraints: PortfolioConstraints::default(),
            models: default_models(),
            base_dir: None,
        }
    }
}

/// Data settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    /// Wide price file (`date,SPY,TLT,...`).
    pub prices: Option<String>,
    /// Directory with one OHLCV file per asset.
    pub price_dir: Option<String>,
    /// Wide file of periodic returns, used instead of prices.
    pub returns: Option<String>,
    /// Economic indicators (`date,VIX,...`).
    pub indicators: Option<String>,
    /// Factor returns (`date,Mkt-RF,SMB,HML,RF`).
    pub factors: Option<String>,
    /// Factor file values are percentages.
    #[serde(default = "default_true")]
    pub factors_in_percent: bool,
    /// Factor column removed before fitting (the risk-free rate).
    #[serde(default = "default_rf_column")]
    pub drop_factor: Option<String>,
    /// Restrict to these assets; empty keeps all.
    #[serde(default)]
    pub assets: Vec<String>,
    /// Start date (inclusive).
    pub start_date: Option<String>,
    /// End date (inclusive).
    pub end_date: Option<String>,
    /// Date format in CSV.
    pub date_format: Option<String>,
    /// CSV delimiter; auto-detected when unset.
    pub delimiter: Option<char>,
}

fn default_true() -> bool {
    true
}

fn default_rf_column() -> Option<String> {
    Some("RF".to_string())
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            prices: None,
            price_dir: None,
            returns: None,
            indicators: None,
            factors: None,
            factors_in_percent: true,
            drop_factor: default_rf_column(),
            assets: Vec::new(),
            start_date: None,
            end_date: None,
            date_format: None,
            delimiter: None,
        }
    }
}

/// Regime classification settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegimeSettings {
    #[serde(flatten)]
    pub classifier: RegimeConfig,
    /// Asset whose returns define the market; the equal-weight composite
    /// when unset.
    pub market: Option<String>,
    /// Indicator column compared against `indicator_threshold`.
    pub indicator: Option<String>,
    /// Precomputed `date,regime` labels, used instead of the classifier.
    pub labels_file: Option<String>,
}

/// Estimation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimationSettings {
    #[serde(flatten)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub window: EstimationWindow,
    #[serde(default = "default_min_history")]
    pub min_history: usize,
    #[serde(default)]
    pub regime_conditional: bool,
    #[serde(default = "default_min_regime_observations")]
    pub min_regime_observations: usize,
}

fn default_min_history() -> usize {
    252
}

fn default_min_regime_observations() -> usize {
    60
}

impl Default for EstimationSettings {
    fn default() -> Self {
        Self {
            estimator: EstimatorConfig::default(),
            window: EstimationWindow::Expanding,
            min_history: default_min_history(),
            regime_conditional: false,
            min_regime_observations: default_min_regime_observations(),
        }
    }
}

/// Evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSettings {
    #[serde(default = "default_capital")]
    pub initial_capital: f64,
    #[serde(default = "default_rebalance_every")]
    pub rebalance_every: usize,
    /// Cost per unit of turnover, in basis points.
    #[serde(default = "default_cost_bps")]
    pub transaction_cost_bps: f64,
    /// Annual risk-free rate.
    #[serde(default)]
    pub risk_free_rate: f64,
    /// Asset the results are compared against.
    pub benchmark: Option<String>,
}

fn default_capital() -> f64 {
    100_000.0
}

fn default_rebalance_every() -> usize {
    21
}

fn default_cost_bps() -> f64 {
    10.0
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            initial_capital: default_capital(),
            rebalance_every: default_rebalance_every(),
            transaction_cost_bps: default_cost_bps(),
            risk_free_rate: 0.0,
            benchmark: None,
        }
    }
}

/// Everything an analysis runs on, aligned to one set of timestamps.
#[derive(Debug, Clone)]
pub struct AnalysisInputs {
    pub dataset: ReturnsDataset,
    pub labels: RegimeLabels,
    pub factors: Option<FactorTable>,
}

impl AnalysisConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        let mut config: AnalysisConfig = toml::from_str(&content)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| PortfolioError::ConfigError(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let sources = [&self.data.prices, &self.data.price_dir, &self.data.returns]
            .iter()
            .filter(|s| s.is_some())
            .count();
        if sources != 1 {
            return Err(PortfolioError::ConfigError(
                "set exactly one of data.prices, data.price_dir or data.returns".to_string(),
            ));
        }
        if self.models.is_empty() {
            return Err(PortfolioError::ConfigError("no models configured".to_string()));
        }

        let mut names = BTreeSet::new();
        for model in self.build_models() {
            let name = model.name();
            if !names.insert(name.clone()) {
                return Err(PortfolioError::ConfigError(format!(
                    "model {} is configured twice",
                    name
                )));
            }
            if model.requires_factor_model() && self.data.factors.is_none() {
                return Err(PortfolioError::ConfigError(format!(
                    "model {} needs data.factors",
                    name
                )));
            }
        }

        self.regime.classifier.validate()?;
        self.to_evaluation_config().validate()
    }

    pub fn to_data_config(&self) -> DataConfig {
        DataConfig {
            date_format: self.data.date_format.clone(),
            delimiter: self.data.delimiter.map(|c| c as u8),
            ..Default::default()
        }
    }

    /// Convert to the engine's configuration.
    pub fn to_evaluation_config(&self) -> EvaluationConfig {
        EvaluationConfig {
            initial_capital: self.evaluation.initial_capital,
            rebalance_every: self.evaluation.rebalance_every,
            min_history: self.estimation.min_history,
            window: self.estimation.window,
            transaction_cost_bps: self.evaluation.transaction_cost_bps,
            risk_free_rate: self.evaluation.risk_free_rate,
            regime_conditional: self.estimation.regime_conditional,
            min_regime_observations: self.estimation.min_regime_observations,
            benchmark: self.evaluation.benchmark.clone(),
            show_progress: false,
            estimation: self.estimation.estimator.clone(),
            constraints: self.constraints.clone(),
        }
    }

    pub fn build_models(&self) -> Vec<Box<dyn AllocationModel>> {
        self.models.iter().map(ModelSpec::build).collect()
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        match &self.base_dir {
            Some(base) if p.is_relative() => base.join(p),
            _ => p,
        }
    }

    /// Load returns, restricted to the configured assets and dates.
    pub fn load_dataset(&self) -> Result<ReturnsDataset> {
        let cfg = self.to_data_config();
        let dataset = if let Some(p) = &self.data.returns {
            load_returns(self.resolve(p), &cfg)?
        } else if let Some(p) = &self.data.prices {
            load_prices(self.resolve(p), &cfg)?.to_returns()?
        } else if let Some(p) = &self.data.price_dir {
            load_price_dir(self.resolve(p), &cfg)?.to_returns()?
        } else {
            return Err(PortfolioError::ConfigError("no data source configured".to_string()));
        };

        let dataset = if self.data.assets.is_empty() {
            dataset
        } else {
            dataset.select_assets(&self.data.assets)?
        };

        let parse = |s: &Option<String>| -> Result<_> {
            s.as_deref()
                .map(|d| parse_datetime(d, self.data.date_format.as_deref()))
                .transpose()
        };
        let (start, end) = (parse(&self.data.start_date)?, parse(&self.data.end_date)?);
        if start.is_some() || end.is_some() {
            dataset.between(start, end)
        } else {
            Ok(dataset)
        }
    }

    /// Load or classify regime labels for the dataset.
    pub fn load_labels(&self, dataset: &ReturnsDataset) -> Result<RegimeLabels> {
        let cfg = self.to_data_config();
        if let Some(p) = &self.regime.labels_file {
            return RegimeLabels::from_csv(self.resolve(p), &cfg)?.align_to(dataset.timestamps());
        }

        let indicator = match (&self.data.indicators, &self.regime.indicator) {
            (Some(p), Some(column)) => {
                let table = load_indicators(self.resolve(p), &cfg)?.align_to(dataset.timestamps())?;
                Some(table.column(column).ok_or_else(|| {
                    PortfolioError::ConfigError(format!("indicator column {} not found", column))
                })?)
            }
            (None, Some(column)) => {
                return Err(PortfolioError::ConfigError(format!(
                    "regime.indicator = {} but data.indicators is not set",
                    column
                )))
            }
            _ => None,
        };

        RuleBasedClassifier::new(self.regime.classifier.clone()).classify_dataset(
            dataset,
            self.regime.market.as_deref(),
            indicator.as_deref(),
        )
    }

    /// Load factor returns aligned to the dataset, when configured.
    pub fn load_factors(&self, dataset: &ReturnsDataset) -> Result<Option<FactorTable>> {
        let Some(p) = &self.data.factors else {
            return Ok(None);
        };
        let table = load_factors(self.resolve(p), &self.to_data_config(), self.data.factors_in_percent)?;
        let table = match &self.data.drop_factor {
            Some(name) => table.without(name),
            None => table,
        };
        table
            .align_to(dataset.timestamps(), dataset.frequency())
            .map(Some)
    }

    /// Load every input of the analysis.
    pub fn load_inputs(&self) -> Result<AnalysisInputs> {
        let dataset = self.load_dataset()?;
        let labels = self.load_labels(&dataset)?;
        let factors = self.load_factors(&dataset)?;
        Ok(AnalysisInputs {
            dataset,
            labels,
            factors,
        })
    }

    /// Generate an example configuration file content.
    pub fn example() -> String {
        r#"# regimefolio analysis configuration

[data]
prices = "data/prices.csv"          # date,SPY,TLT,GLD,...
# price_dir = "data/prices"         # one OHLCV file per asset
# returns = "data/returns.csv"
indicators = "data/indicators.csv"  # date,VIX,T10Y2Y,...
# factors = "data/ff_factors.csv"   # date,Mkt-RF,SMB,HML,RF
factors_in_percent = true
drop_factor = "RF"
# assets = ["SPY", "TLT", "GLD"]
# start_date = "2010-01-01"
# end_date = "2023-12-31"

[regime]
market = "SPY"
indicator = "VIX"
indicator_threshold = 30.0
vol_lookback = 21
trend_lookback = 63
high_vol_threshold = 0.30
bear_drawdown = 0.20
recovery_exit_drawdown = 0.05
# labels_file = "data/regimes.csv"

[estimation]
covariance = { method = "ledoit_wolf" }  # sample | ledoit_wolf | ewma (decay)
min_observations = 20
min_history = 252
window = { type = "expanding" }          # or { type = "rolling", periods = 504 }
regime_conditional = true
min_regime_observations = 60

[evaluation]
initial_capital = 100000.0
rebalance_every = 21
transaction_cost_bps = 10.0
risk_free_rate = 0.02
benchmark = "SPY"

[constraints]
long_only = true
max_weight = 0.40
# min_weight = 0.0
# max_turnover = 0.50

[[models]]
type = "equal_weight"

[[models]]
type = "inverse_volatility"

[[models]]
type = "mean_variance"
objective = { type = "min_variance" }

[[models]]
type = "mean_variance"
objective = { type = "max_sharpe", risk_free_rate = 0.02 }

[[models]]
type = "risk_parity"

# [[models]]
# type = "factor_based"
# objective = { type = "min_variance" }
# include_alpha = false
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = AnalysisConfig::default();
        assert_eq!(config.evaluation.initial_capital, 100_000.0);
        assert_eq!(config.models.len(), 5);
        // No data source yet
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config() {
        let toml_content = r#"
[data]
returns = "returns.csv"

[regime]
market = "SPY"
bear_drawdown = 0.25

[estimation]
covariance = { method = "ewma", decay = 0.94 }
window = { type = "rolling", periods = 126 }
regime_conditional = true

[evaluation]
rebalance_every = 5
transaction_cost_bps = 2.5

[constraints]
max_weight = 0.5

[[models]]
type = "risk_parity"

[[models]]
type = "mean_variance"
objective = { type = "target_return", target = 0.08 }
"#;
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", toml_content).unwrap();

        let config = AnalysisConfig::load(file.path()).unwrap();
        assert_eq!(config.regime.market.as_deref(), Some("SPY"));
        assert_eq!(config.regime.classifier.bear_drawdown, 0.25);
        assert_eq!(config.regime.classifier.vol_lookback, 21);
        assert_eq!(config.models.len(), 2);
        assert!(config.base_dir.is_some());

        let eval = config.to_evaluation_config();
        assert_eq!(eval.rebalance_every, 5);
        assert_eq!(eval.window, EstimationWindow::Rolling { periods: 126 });
        assert!(eval.regime_conditional);
        assert_eq!(eval.constraints.max_weight, Some(0.5));
        assert!(matches!(
            eval.estimation.covariance,
            crate::stats::CovarianceEstimator::Ewma { decay } if (decay - 0.94).abs() < 1e-12
        ));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = AnalysisConfig::default();
        config.data.returns = Some("r.csv".into());
        assert!(config.validate().is_ok());

        config.data.prices = Some("p.csv".into());
        assert!(config.validate().is_err());
        config.data.prices = None;

        config.models.push(ModelSpec::EqualWeight);
        assert!(config.validate().is_err());
        config.models.pop();

        config.models.push(ModelSpec::FactorBased {
            objective: MeanVarianceObjective::MinimumVariance,
            include_alpha: false,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_config() {
        let mut config = AnalysisConfig::default();
        config.data.returns = Some("r.csv".into());
        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();

        let loaded = AnalysisConfig::load(file.path()).unwrap();
        assert_eq!(loaded.evaluation.initial_capital, config.evaluation.initial_capital);
        assert_eq!(loaded.models, config.models);
    }

    #[test]
    fn test_example_config_parses() {
        let example = AnalysisConfig::example();
        let config: AnalysisConfig = toml::from_str(&example).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.models.len(), 5);
        assert_eq!(config.constraints.max_weight, Some(0.40));
    }

    #[test]
    fn test_load_inputs_resolves_relative_paths() {
        let dir = TempDir::new().unwrap();
        let mut csv = String::from("date,A,B\n");
        for i in 0..28 {
            let a = 0.001 * ((i % 5) as f64 - 2.0);
            let b = 0.0005 * ((i % 3) as f64 - 1.0);
            csv.push_str(&format!("2024-01-{:02},{},{}\n", i + 1, a, b));
        }
        fs::write(dir.path().join("returns.csv"), csv).unwrap();
        let config_path = dir.path().join("analysis.toml");
        fs::write(
            &config_path,
            "[data]\nreturns = \"returns.csv\"\n[regime]\nvol_lookback = 5\ntrend_lookback = 5\nindicator_threshold = 30.0\n",
        )
        .unwrap();

        let config = AnalysisConfig::load(&config_path).unwrap();
        let inputs = config.load_inputs().unwrap();
        assert_eq!(inputs.dataset.n_assets(), 2);
        assert_eq!(inputs.labels.len(), inputs.dataset.len());
        assert!(inputs.factors.is_none());
    }
}
