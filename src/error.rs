//! Error types for portfolio analytics.

use thiserror::Error;

/// Main error type for data loading, estimation, optimization and evaluation.
#[derive(Error, Debug)]
pub enum PortfolioError {
    #[error("Data error: {0}")]
    DataError(String),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParseError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient data: need at least {required} observations, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("Invalid weights: {0}")]
    InvalidWeights(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Optimization error: {0}")]
    OptimizationError(String),

    #[error("Regime labels do not cover the series: {0}")]
    RegimeCoverage(String),

    #[error("No data loaded")]
    NoData,
}

/// Result type alias for portfolio operations.
pub type Result<T> = std::result::Result<T, PortfolioError>;

/// Short remediation hints shown by the command-line front end.
pub trait ErrorHelp {
    /// A one-line suggestion for resolving the error, if one applies.
    fn help(&self) -> Option<&'static str>;
}

impl ErrorHelp for PortfolioError {
    fn help(&self) -> Option<&'static str> {
        match self {
            PortfolioError::CsvError(_) | PortfolioError::DataError(_) => {
                Some("check that the file is a wide CSV: a date column followed by one column per asset")
            }
            PortfolioError::DateParseError(_) => {
                Some("set `date_format` in the [data] section, e.g. \"%Y-%m-%d\"")
            }
            PortfolioError::TomlError(_) | PortfolioError::ConfigError(_) => {
                Some("run `regimefolio init` to generate a valid example configuration")
            }
            PortfolioError::InsufficientData { .. } => {
                Some("lower `min_observations` or extend the date range of the input data")
            }
            PortfolioError::OptimizationError(_) => {
                Some("relax the constraints or choose a reachable target return")
            }
            PortfolioError::RegimeCoverage(_) => {
                Some("the labels file must contain one regime for every return date")
            }
            PortfolioError::NoData => Some("the input file contained no usable rows"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_data_message() {
        let err = PortfolioError::InsufficientData {
            required: 30,
            actual: 12,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient data: need at least 30 observations, got 12"
        );
        assert!(err.help().is_some());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: PortfolioError = io.into();
        assert!(matches!(err, PortfolioError::IoError(_)));
        assert!(err.help().is_none());
    }

    #[test]
    fn test_unparseable_date_suggests_format() {
        let err = crate::data::parse_datetime("31st of May", None).unwrap_err();
        assert!(matches!(err, PortfolioError::DateParseError(_)));
        assert!(err.help().unwrap().contains("date_format"));
    }
}
