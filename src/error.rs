/*!
Error types for the training and prediction pipeline
*/
use thiserror::Error;

/// Failures reported by a quote provider
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider rejected the request because of its rate limit
    #[error("API rate limit: {0}")]
    RateLimited(String),
    /// The provider does not know the requested symbol, or rejected the request parameters
    #[error("API error: {0}")]
    InvalidSymbol(String),
    /// The requested interval is not a supported intraday interval
    #[error("invalid interval '{0}', valid intervals: 1min, 5min, 15min, 30min, 60min")]
    InvalidInterval(String),
    /// The provider answered with something that is not a time series
    #[error("malformed provider response: {0}")]
    Malformed(String),
    /// No API key is configured for a provider which needs one
    #[error("quote provider API key not configured")]
    MissingApiKey,
    /// Transport failure talking to the provider
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// Failure reading or writing tick files
    #[error("tick file error: {0}")]
    Csv(#[from] csv::Error),
    /// Filesystem failure in a file-backed provider
    #[error("tick file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by the pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// The quote provider failed
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// Too few rows for the requested window and horizon
    #[error("not enough data: need at least {needed} rows, have {available}")]
    InsufficientData {
        /// Rows required
        needed: usize,
        /// Rows available
        available: usize,
    },
    /// A feature column required by name is not in the feature list
    #[error("feature column '{0}' not present")]
    MissingColumn(String),
    /// Feature rows and scaler disagree on width or column order
    #[error("feature mismatch: {0}")]
    FeatureMismatch(String),
    /// No trained model exists for the symbol
    #[error("no trained model found for symbol {0}")]
    ModelNotFound(String),
    /// The symbol's artifact bundle is missing required files
    #[error("model artifacts for {symbol} are incomplete, missing {missing:?}")]
    IncompleteArtifacts {
        /// The symbol
        symbol: String,
        /// The missing files
        missing: Vec<String>,
    },
    /// The symbol's artifacts kept changing while they were being loaded
    #[error("model artifacts for {0} are being replaced, retry shortly")]
    ArtifactsChanged(String),
    /// The symbol is already being trained
    #[error("model training already in progress for {0}")]
    TrainingConflict(String),
    /// The symbol's model is being deleted
    #[error("model deletion in progress for {0}")]
    DeletionInProgress(String),
    /// The optimizer produced a non-finite loss
    #[error("training diverged: non-finite loss at epoch {epoch}")]
    NonFiniteLoss {
        /// Epoch at which the loss became non-finite
        epoch: usize,
    },
    /// Evaluation produced a non-finite metric
    #[error("evaluation produced non-finite metrics: {0}")]
    NonFiniteMetrics(String),
    /// A request parameter is out of range
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// A technical indicator could not be constructed
    #[error("indicator error: {0}")]
    Indicator(String),
    /// Error from libtorch
    #[error("torch error: {0}")]
    Torch(#[from] tch::TchError),
    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Artifact (de)serialization error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// A background task panicked or was aborted
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<ta::errors::TaError> for Error {
    fn from(err: ta::errors::TaError) -> Self {
        Error::Indicator(format!("{:?}", err))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Task(err.to_string())
    }
}

/// Result type for the pipeline
pub type Result<T, E = Error> = std::result::Result<T, E>;
