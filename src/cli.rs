//! Command-line interface for regime-aware portfolio analysis.

use regimefolio::allocation::ModelSpec;
use regimefolio::analytics::ResultFormatter;
use regimefolio::config::AnalysisConfig;
use regimefolio::data::{load_prices, DataConfig};
use regimefolio::engine::{Backtester, PortfolioSnapshot};
use regimefolio::error::{PortfolioError, Result};
use regimefolio::factor::FactorModel;
use regimefolio::optimizer::MeanVarianceOptimizer;
use regimefolio::regime::{Regime, RegimeStats};
use regimefolio::stats::{EstimatorConfig, ReturnStatistics};

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::fs;
use std::path::PathBuf;
use tabled::{builder::Builder, settings::Style};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// regimefolio - portfolio construction evaluated across market regimes.
#[derive(Parser)]
#[command(name = "regimefolio")]
#[command(version)]
#[command(about = "Regime-aware portfolio construction and evaluation")]
#[command(long_about = None)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate an example configuration file
    Init {
        /// Output path for config file
        #[arg(short, long, default_value = "analysis.toml")]
        output: PathBuf,
    },

    /// Backtest every configured model and report per-regime performance
    Run {
        /// Path to TOML configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Show a progress bar
        #[arg(long)]
        progress: bool,
    },

    /// Label every period with a market regime
    Classify {
        /// Path to TOML configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Also list every contiguous regime run
        #[arg(long)]
        segments: bool,
    },

    /// Compute current weights for every configured model
    Optimize {
        /// Path to TOML configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Estimate only from periods in this regime
        #[arg(short, long)]
        regime: Option<Regime>,

        /// Also trace the efficient frontier with this many points
        #[arg(long)]
        frontier: Option<usize>,
    },

    /// Validate a price file
    Validate {
        /// Path to CSV price file
        #[arg(short, long)]
        data: PathBuf,
    },

    /// Show the available allocation models
    Models,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

impl Cli {
    /// Initialize logging based on verbosity level.
    pub fn init_logging(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .finish();

        if tracing::subscriber::set_global_default(subscriber).is_err() {
            eprintln!("warning: a tracing subscriber was already installed");
        }
    }
}

/// Run the CLI application.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    match &cli.command {
        Commands::Init { output } => init_config(output),
        Commands::Run { config, progress } => run_analysis(config, *progress, cli.output),
        Commands::Classify { config, segments } => classify(config, *segments, cli.output),
        Commands::Optimize {
            config,
            regime,
            frontier,
        } => optimize(config, *regime, *frontier, cli.output),
        Commands::Validate { data } => validate_data(data),
        Commands::Models => {
            print_models();
            Ok(())
        }
    }
}

fn init_config(output: &PathBuf) -> Result<()> {
    fs::write(output, AnalysisConfig::example())?;
    println!("Created example configuration file: {}", output.display());
    println!("\nEdit this file to point at your data, then run:");
    println!("  regimefolio run -c {}", output.display());
    Ok(())
}

fn run_analysis(config_path: &PathBuf, progress: bool, output: OutputFormat) -> Result<()> {
    let config = AnalysisConfig::load(config_path)?;
    let inputs = config.load_inputs()?;
    info!(
        "Loaded {} periods of {} assets",
        inputs.dataset.len(),
        inputs.dataset.n_assets()
    );

    let mut eval = config.to_evaluation_config();
    eval.show_progress = progress;
    let mut backtester = Backtester::new(eval);
    if let Some(factors) = inputs.factors {
        backtester = backtester.with_factors(factors);
    }

    let models = config.build_models();
    let results = backtester.run_many(&inputs.dataset, &inputs.labels, &models);
    if results.is_empty() {
        return Err(PortfolioError::OptimizationError(
            "every configured model failed".to_string(),
        ));
    }

    match output {
        OutputFormat::Text => {
            ResultFormatter::print_regime_summary(&RegimeStats::from_labels(&inputs.labels));
            for result in &results {
                ResultFormatter::print_report(result);
            }
            println!();
            println!("{}", "Model Comparison".bold().underline());
            ResultFormatter::print_table(&results);
        }
        OutputFormat::Json => println!("{}", ResultFormatter::to_json(&results)?),
        OutputFormat::Csv => print!("{}", ResultFormatter::to_csv(&results)),
    }
    Ok(())
}

fn classify(config_path: &PathBuf, segments: bool, output: OutputFormat) -> Result<()> {
    let config = AnalysisConfig::load(config_path)?;
    let dataset = config.load_dataset()?;
    let labels = config.load_labels(&dataset)?;
    let stats = RegimeStats::from_labels(&labels);

    match output {
        OutputFormat::Text => {
            println!(
                "{}",
                format!(
                    "Regimes over {} periods ({} to {})",
                    labels.len(),
                    dataset.timestamps()[0].format("%Y-%m-%d"),
                    dataset.timestamps()[dataset.len() - 1].format("%Y-%m-%d")
                )
                .bold()
            );
            ResultFormatter::print_regime_summary(&stats);
            if segments {
                let mut builder = Builder::new();
                builder.push_record(["Regime", "Start", "End", "Periods"]);
                for seg in labels.segments() {
                    builder.push_record([
                        seg.regime.to_string(),
                        seg.start_time.format("%Y-%m-%d").to_string(),
                        seg.end_time.format("%Y-%m-%d").to_string(),
                        seg.periods.to_string(),
                    ]);
                }
                println!("{}", builder.build().with(Style::rounded()));
            }
        }
        OutputFormat::Json => {
            let value = serde_json::json!({
                "stats": stats,
                "segments": labels.segments(),
            });
            println!("{}", ResultFormatter::to_json(&value)?);
        }
        OutputFormat::Csv => {
            println!("date,regime");
            for (ts, regime) in labels.timestamps().iter().zip(labels.labels()) {
                println!("{},{}", ts.format("%Y-%m-%d"), regime.as_str());
            }
        }
    }
    Ok(())
}

fn optimize(
    config_path: &PathBuf,
    regime: Option<Regime>,
    frontier: Option<usize>,
    output: OutputFormat,
) -> Result<()> {
    let config = AnalysisConfig::load(config_path)?;
    let inputs = config.load_inputs()?;

    let mut backtester = Backtester::new(config.to_evaluation_config());
    if let Some(factors) = inputs.factors.clone() {
        backtester = backtester.with_factors(factors);
    }

    let mut snapshots: Vec<PortfolioSnapshot> = Vec::new();
    for model in config.build_models() {
        match backtester.snapshot(&inputs.dataset, &inputs.labels, model.as_ref(), regime) {
            Ok(s) => snapshots.push(s),
            Err(e) => eprintln!("{} {}: {}", "skipped".yellow(), model.name(), e),
        }
    }

    match output {
        OutputFormat::Text => {
            for s in &snapshots {
                let scope = s
                    .regime
                    .map(|r| format!("{} periods only", r))
                    .unwrap_or_else(|| "full sample".to_string());
                ResultFormatter::print_weights(
                    &format!("{} ({}, {} obs)", s.model_name, scope, s.observations),
                    &s.weights,
                );
                println!(
                    "  Expected return {:.2}%, volatility {:.2}%\n",
                    s.expected_return * 100.0,
                    s.volatility * 100.0
                );
            }
        }
        OutputFormat::Json => println!("{}", ResultFormatter::to_json(&snapshots)?),
        OutputFormat::Csv => {
            println!("model,regime,asset,weight,risk_contribution");
            for s in &snapshots {
                let regime = s.regime.map(|r| r.as_str()).unwrap_or("");
                for (asset, rc) in &s.risk_contributions {
                    let w = s.weights.get(asset);
                    println!("{},{},{},{:.6},{:.6}", s.model_name, regime, asset, w, rc);
                }
            }
        }
    }

    if let (OutputFormat::Text, Some(factors)) = (output, inputs.factors.as_ref()) {
        let rows: Vec<usize> = match regime {
            Some(r) => inputs.labels.indices_of(r),
            None => (0..inputs.dataset.len()).collect(),
        };
        match FactorModel::fit(&inputs.dataset.select_rows(&rows), &factors.select_rows(&rows)) {
            Ok(model) => ResultFormatter::print_factor_exposures(&model.exposures()),
            Err(e) => eprintln!("{} factor exposures: {}", "skipped".yellow(), e),
        }
    }

    if let Some(points) = frontier {
        print_frontier(&config, &inputs.dataset, &inputs.labels, regime, points)?;
    }
    Ok(())
}

fn print_frontier(
    config: &AnalysisConfig,
    dataset: &regimefolio::data::ReturnsDataset,
    labels: &regimefolio::regime::RegimeLabels,
    regime: Option<Regime>,
    points: usize,
) -> Result<()> {
    let sample = match regime {
        Some(r) => dataset.select_rows(&labels.indices_of(r)),
        None => dataset.clone(),
    };
    let stats = ReturnStatistics::estimate(&sample, &config.estimation.estimator)?;
    let optimizer = MeanVarianceOptimizer::new(
        stats.annualized_means(),
        stats.annualized_covariance(),
        config.constraints.bounds(),
    )?;

    let mut builder = Builder::new();
    let mut header = vec!["Return %".to_string(), "Vol %".to_string()];
    header.extend(stats.assets.iter().cloned());
    builder.push_record(header);
    for point in optimizer.efficient_frontier(points)? {
        let mut row = vec![
            format!("{:.2}", point.expected_return * 100.0),
            format!("{:.2}", point.volatility * 100.0),
        ];
        row.extend(point.weights.iter().map(|w| format!("{:.1}", w * 100.0)));
        builder.push_record(row);
    }
    println!("{}", "Efficient Frontier".bold().underline());
    println!("{}", builder.build().with(Style::rounded()));
    Ok(())
}

fn validate_data(data_path: &PathBuf) -> Result<()> {
    println!("Validating data file: {}", data_path.display());

    let prices = load_prices(data_path, &DataConfig::default())?;
    let dataset = prices.to_returns()?;
    let estimator = EstimatorConfig {
        min_observations: 2,
        ..Default::default()
    };
    let stats = ReturnStatistics::estimate(&dataset, &estimator)?;

    println!("\nData Summary:");
    println!("  Rows:      {}", prices.timestamps.len());
    println!("  Assets:    {}", dataset.assets().join(", "));
    println!("  Frequency: {}", dataset.frequency());
    println!(
        "  Range:     {} to {}",
        prices.timestamps[0].format("%Y-%m-%d"),
        prices.timestamps[prices.timestamps.len() - 1].format("%Y-%m-%d")
    );

    let mut builder = Builder::new();
    builder.push_record(["Asset", "Ann. Return %", "Ann. Vol %", "Downside Dev %"]);
    let means = stats.annualized_means();
    let vols = stats.annualized_volatilities();
    let downside = stats.annualized_downside_deviations();
    for (j, asset) in stats.assets.iter().enumerate() {
        builder.push_record([
            asset.clone(),
            format!("{:.2}", means[j] * 100.0),
            format!("{:.2}", vols[j] * 100.0),
            format!("{:.2}", downside[j] * 100.0),
        ]);
    }
    println!("{}", builder.build().with(Style::rounded()));

    println!("\nValidation: {}", "PASSED".green());
    Ok(())
}

fn print_models() {
    println!("{}", "Allocation Models".bold().underline());
    for (name, description) in ModelSpec::catalog() {
        println!("  {:<20} {}", name.cyan(), description);
    }
    println!();
    println!("Configure them as [[models]] entries, e.g.:");
    println!("  [[models]]");
    println!("  type = \"mean_variance\"");
    println!("  objective = {{ type = \"max_sharpe\", risk_free_rate = 0.02 }}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse() {
        let cli = Cli::try_parse_from(["regimefolio", "-vv", "-o", "json", "run", "-c", "a.toml"]);
        let cli = cli.unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Run { progress: false, .. }));
    }

    #[test]
    fn test_optimize_regime_arg() {
        let cli =
            Cli::try_parse_from(["regimefolio", "optimize", "-c", "a.toml", "--regime", "bear"])
                .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Optimize {
                regime: Some(Regime::Bear),
                ..
            }
        ));
        assert!(Cli::try_parse_from(["regimefolio", "optimize", "-c", "a.toml", "-r", "sideways"])
            .is_err());
    }

    #[test]
    fn test_models_command() {
        let cli = Cli::try_parse_from(["regimefolio", "models"]);
        assert!(cli.is_ok());
    }
}
