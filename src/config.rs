/*!
Layered service settings: built-in defaults, then an optional TOML file, then `STOCKCAST__*`
environment variables (`STOCKCAST__SERVER__PORT=9000`, `STOCKCAST__PROVIDER__KIND=file`, ...).
The Alpha Vantage key may also come from `ALPHA_VANTAGE_API_KEY`.
*/
use crate::data::alpha_vantage::{AlphaVantage, DEFAULT_BASE_URL};
use crate::data::file::FileProvider;
use crate::data::QuoteProvider;
use crate::error::ProviderError;
use crate::pipeline::ServiceConfig;
use crate::store::ArtifactStore;
use crate::train::TrainConfig;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tch::Device;

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "STOCKCAST";
/// Fallback environment variable for the provider API key
pub const API_KEY_VAR: &str = "ALPHA_VANTAGE_API_KEY";
/// Settings file read when no path is given, if it exists
pub const DEFAULT_CONFIG_FILE: &str = "config/default";

/// All service settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// HTTP server
    pub server: ServerSettings,
    /// Quote provider
    pub provider: ProviderSettings,
    /// Artifact storage
    pub storage: StorageSettings,
    /// Training hyperparameters and device
    pub training: TrainingSettings,
}

/// HTTP server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Which quote provider to use
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// The Alpha Vantage HTTP API
    AlphaVantage,
    /// CSV files on disk
    File,
}

/// Quote provider settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Provider in use
    pub kind: ProviderKind,
    /// Alpha Vantage API key
    pub api_key: Option<String>,
    /// Alpha Vantage endpoint
    pub base_url: String,
    /// Directory of `<SYMBOL>_<interval>.csv` files for the file provider
    pub csv_dir: PathBuf,
    /// Per-request timeout; none by default
    pub timeout_secs: Option<u64>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: ProviderKind::AlphaVantage,
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            csv_dir: PathBuf::from("data"),
            timeout_secs: None,
        }
    }
}

/// Artifact storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root of the per-symbol model directories
    pub models_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
        }
    }
}

/// Training settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// Sequences per optimizer step
    pub batch_size: usize,
    /// Initial learning rate
    pub learning_rate: f64,
    /// Seed for reproducible runs
    pub seed: Option<u64>,
    /// `cpu`, `cuda` or `auto`
    pub device: String,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        let train = TrainConfig::default();
        Self {
            batch_size: train.batch_size,
            learning_rate: train.learning_rate,
            seed: None,
            device: "cpu".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from `config/default.toml` if it exists, overridden by the
    /// environment. Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let mut settings: Settings = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        if settings.provider.api_key.is_none() {
            settings.provider.api_key = std::env::var(API_KEY_VAR).ok();
        }
        settings.provider.api_key = settings.provider.api_key.filter(|key| !key.is_empty());
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.training.batch_size == 0 {
            return Err(ConfigError::Message(
                "training.batch_size must be at least 1".into(),
            ));
        }
        if self.training.learning_rate.is_nan() || self.training.learning_rate <= 0.0 {
            return Err(ConfigError::Message(
                "training.learning_rate must be positive".into(),
            ));
        }
        self.device()?;
        Ok(())
    }

    /// The address to bind
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// The configured device
    pub fn device(&self) -> Result<Device, ConfigError> {
        match self.training.device.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            "auto" => Ok(Device::cuda_if_available()),
            other => Err(ConfigError::Message(format!(
                "invalid training.device '{}', expected cpu, cuda or auto",
                other
            ))),
        }
    }

    /// Training hyperparameters
    pub fn train_config(&self) -> TrainConfig {
        TrainConfig {
            batch_size: self.training.batch_size,
            learning_rate: self.training.learning_rate,
            seed: self.training.seed,
            ..TrainConfig::default()
        }
    }

    /// Settings for a training service
    pub fn service_config(&self) -> Result<ServiceConfig, ConfigError> {
        Ok(ServiceConfig {
            train: self.train_config(),
            device: self.device()?,
        })
    }

    /// The artifact store
    pub fn store(&self) -> ArtifactStore {
        ArtifactStore::new(&self.storage.models_dir)
    }

    /// The configured quote provider
    pub fn provider(&self) -> Result<Arc<dyn QuoteProvider>, ProviderError> {
        let provider: Arc<dyn QuoteProvider> = match self.provider.kind {
            ProviderKind::AlphaVantage => Arc::new(AlphaVantage::new(
                self.provider.base_url.clone(),
                self.provider.api_key.clone(),
                self.provider.timeout_secs.map(Duration::from_secs),
            )?),
            ProviderKind::File => Arc::new(FileProvider::new(&self.provider.csv_dir)),
        };
        Ok(provider)
    }
}
