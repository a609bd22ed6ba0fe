/*!
Durable per-symbol model artifacts and their in-memory cache.

Each symbol owns a directory under the store root holding its weights, scaler, feature list,
metrics, a model summary, a training info record and optionally the last unscaled input window.
*/
use crate::data::scale::MinMaxScaler;
use crate::data::Interval;
use crate::error::{Error, Result};
use crate::evaluate::Metrics;
use crate::features::FeatureFrame;
use crate::lstm::{LstmModel, StockLstmDesc};
use crate::train::History;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;
use tch::Device;
use tracing::{debug, info, warn};

/// Model weights
pub const WEIGHTS: &str = "lstm_model.ot";
/// Fitted scaler
pub const SCALER: &str = "scaler.json";
/// Ordered feature column names
pub const FEATURES: &str = "feature_columns.json";
/// Evaluation metrics
pub const METRICS: &str = "metrics.json";
/// Human readable model summary
pub const SUMMARY: &str = "model_summary.txt";
/// Training info record
pub const INFO: &str = "training_info.json";
/// The last unscaled input window seen in training
pub const LAST_WINDOW: &str = "last_window.json";

/// Files without which a bundle cannot serve predictions
pub const REQUIRED: [&str; 4] = [WEIGHTS, SCALER, FEATURES, INFO];

/// How often a load is retried when a save replaces the bundle underneath it
const LOAD_ATTEMPTS: usize = 3;
/// Pause between load attempts
const LOAD_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Everything known about how a bundle was trained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingInfo {
    /// The symbol
    pub symbol: String,
    /// The bar interval of the training data
    pub interval: Interval,
    /// The feature columns, in order
    pub features: Vec<String>,
    /// A short description of the architecture
    pub architecture: String,
    /// The descriptor the network is rebuilt from
    pub model: StockLstmDesc,
    /// The requested epoch budget
    pub epochs: usize,
    /// Training history
    pub history: History,
    /// Evaluation metrics
    pub metrics: Metrics,
    /// Number of training sequences
    pub train_samples: usize,
    /// Number of held-out sequences
    pub test_samples: usize,
    /// When training finished
    pub trained_at: DateTime<Utc>,
}

impl TrainingInfo {
    /// The window length
    pub fn sequence_length(&self) -> usize {
        self.model.sequence_length
    }

    /// The forecast horizon
    pub fn prediction_horizon(&self) -> usize {
        self.model.prediction_horizon
    }
}

/// A trained model together with everything needed to use it
#[derive(Debug)]
pub struct ArtifactBundle {
    /// The model. Inference needs exclusive access
    pub model: Mutex<LstmModel>,
    /// The scaler fitted on the training data
    pub scaler: MinMaxScaler,
    /// The feature columns, in scaler order
    pub columns: Vec<String>,
    /// Evaluation metrics
    pub metrics: Metrics,
    /// Training info
    pub info: TrainingInfo,
    /// The last unscaled input window, if saved
    pub last_window: Option<FeatureFrame>,
}

impl ArtifactBundle {
    /// Assemble a bundle, checking that the scaler, columns, model and info agree
    pub fn new(
        model: LstmModel,
        scaler: MinMaxScaler,
        columns: Vec<String>,
        metrics: Metrics,
        info: TrainingInfo,
        last_window: Option<FeatureFrame>,
    ) -> Result<ArtifactBundle> {
        scaler.check_columns(&columns)?;
        if info.features != columns {
            return Err(Error::FeatureMismatch(format!(
                "training info lists {:?}, bundle has {:?}",
                info.features, columns
            )));
        }
        if model.desc().features != columns.len() {
            return Err(Error::FeatureMismatch(format!(
                "model takes {} features, bundle has {}",
                model.desc().features,
                columns.len()
            )));
        }
        if let Some(window) = &last_window {
            if window.columns != columns {
                return Err(Error::FeatureMismatch(
                    "last window columns differ from the bundle's".into(),
                ));
            }
        }
        Ok(ArtifactBundle {
            model: Mutex::new(model),
            scaler,
            columns,
            metrics,
            info,
            last_window,
        })
    }

    /// Run `f` with exclusive access to the model
    pub fn with_model<T, F: FnOnce(&LstmModel) -> T>(&self, f: F) -> T {
        let model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        f(&model)
    }
}

/// Whether a stored model can be used
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    /// All required files are present
    Ready,
    /// Some required file is missing or unreadable
    Incomplete,
}

/// One entry of a model listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// The symbol
    pub symbol: String,
    /// Whether the model is usable
    pub status: ModelState,
    /// Required files which are missing or unreadable
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub missing: Vec<String>,
    /// When training finished
    pub trained_at: Option<DateTime<Utc>>,
    /// The training interval
    pub interval: Option<Interval>,
    /// The window length
    pub sequence_length: Option<usize>,
    /// The forecast horizon
    pub prediction_horizon: Option<usize>,
    /// Evaluation metrics
    pub metrics: Option<Metrics>,
}

/// On-disk storage of artifact bundles, one directory per symbol
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// A store rooted at a directory, which is created lazily
    pub fn new(root: impl Into<PathBuf>) -> ArtifactStore {
        ArtifactStore { root: root.into() }
    }

    /// The store root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The artifact directory of a symbol
    pub fn dir(&self, symbol: &str) -> PathBuf {
        self.root.join(symbol)
    }

    /// Whether a symbol has a directory at all
    pub fn exists(&self, symbol: &str) -> bool {
        self.dir(symbol).is_dir()
    }

    /// Required files missing from a symbol's directory
    pub fn missing(&self, symbol: &str) -> Vec<String> {
        let dir = self.dir(symbol);
        REQUIRED
            .iter()
            .filter(|name| !dir.join(name).is_file())
            .map(|name| name.to_string())
            .collect()
    }

    /// Where the next bundle of a symbol is assembled before it replaces the current one
    pub fn staging_dir(&self, symbol: &str) -> PathBuf {
        self.root.join(format!(".{}.staging", symbol))
    }

    fn retired_dir(&self, symbol: &str) -> PathBuf {
        self.root.join(format!(".{}.old", symbol))
    }

    /// Create an empty staging directory for a symbol, discarding any leftover from an
    /// interrupted run
    pub fn prepare_staging(&self, symbol: &str) -> Result<PathBuf> {
        let staging = self.staging_dir(symbol);
        remove_dir_if_present(&staging)?;
        fs::create_dir_all(&staging)?;
        Ok(staging)
    }

    /// Drop a symbol's staging directory, returning whether there was one
    pub fn discard_staging(&self, symbol: &str) -> Result<bool> {
        remove_dir_if_present(&self.staging_dir(symbol))
    }

    /// Write every file of a bundle into the staging directory, then swap it in for the
    /// symbol's current directory. Files already staged, such as the trainer's checkpoint,
    /// are kept. Readers see either the old bundle or the new one, never a mix.
    pub fn save(&self, symbol: &str, bundle: &ArtifactBundle) -> Result<PathBuf> {
        let staging = self.staging_dir(symbol);
        fs::create_dir_all(&staging)?;
        bundle.with_model(|model| -> Result<()> {
            model.save(&staging.join(WEIGHTS))?;
            fs::write(staging.join(SUMMARY), model.summary())?;
            Ok(())
        })?;
        write_json(&staging.join(SCALER), &bundle.scaler)?;
        write_json(&staging.join(FEATURES), &bundle.columns)?;
        write_json(&staging.join(METRICS), &bundle.metrics)?;
        if let Some(window) = &bundle.last_window {
            write_json(&staging.join(LAST_WINDOW), window)?;
        }
        write_json(&staging.join(INFO), &bundle.info)?;
        let dir = self.commit(symbol)?;
        info!(symbol, dir = %dir.display(), "saved model artifacts");
        Ok(dir)
    }

    /// Swap the staging directory in, retiring the current one
    fn commit(&self, symbol: &str) -> Result<PathBuf> {
        let dir = self.dir(symbol);
        let staging = self.staging_dir(symbol);
        let retired = self.retired_dir(symbol);
        remove_dir_if_present(&retired)?;
        let had_previous = dir.is_dir();
        if had_previous {
            fs::rename(&dir, &retired)?;
        }
        if let Err(err) = fs::rename(&staging, &dir) {
            if had_previous {
                if let Err(restore) = fs::rename(&retired, &dir) {
                    warn!(symbol, %restore, "could not restore previous artifacts");
                }
            }
            return Err(err.into());
        }
        remove_dir_if_present(&retired)?;
        Ok(dir)
    }

    /// Load a symbol's bundle onto a device.
    ///
    /// The training info is read before and after the other files; if it changed, a save
    /// landed in between and the load is retried.
    pub fn load(&self, symbol: &str, device: Device) -> Result<ArtifactBundle> {
        for attempt in 1..=LOAD_ATTEMPTS {
            let last = attempt == LOAD_ATTEMPTS;
            match self.load_once(symbol, device) {
                Ok(Some(bundle)) => return Ok(bundle),
                Ok(None) => {}
                Err(Error::Io(err)) if err.kind() == ErrorKind::NotFound && !last => {}
                Err(Error::ModelNotFound(_)) if self.swapping(symbol) && !last => {}
                Err(err) => return Err(err),
            }
            debug!(symbol, attempt, "artifacts replaced while loading, retrying");
            thread::sleep(LOAD_RETRY_DELAY);
        }
        Err(Error::ArtifactsChanged(symbol.to_string()))
    }

    /// Whether a save is between retiring the old directory and installing the new one
    fn swapping(&self, symbol: &str) -> bool {
        self.retired_dir(symbol).is_dir()
    }

    fn load_once(&self, symbol: &str, device: Device) -> Result<Option<ArtifactBundle>> {
        let dir = self.dir(symbol);
        if !dir.is_dir() {
            return Err(Error::ModelNotFound(symbol.to_string()));
        }
        let missing = self.missing(symbol);
        if !missing.is_empty() {
            return Err(Error::IncompleteArtifacts {
                symbol: symbol.to_string(),
                missing,
            });
        }
        let info: TrainingInfo = read_json(&dir.join(INFO))?;
        let scaler: MinMaxScaler = read_json(&dir.join(SCALER))?;
        let columns: Vec<String> = read_json(&dir.join(FEATURES))?;
        let metrics = if dir.join(METRICS).is_file() {
            read_json(&dir.join(METRICS))?
        } else {
            info.metrics
        };
        let last_window = if dir.join(LAST_WINDOW).is_file() {
            Some(read_json(&dir.join(LAST_WINDOW))?)
        } else {
            None
        };
        let model = LstmModel::load(&info.model, &dir.join(WEIGHTS), device)?;
        let reread: TrainingInfo = read_json(&dir.join(INFO))?;
        if reread != info {
            return Ok(None);
        }
        debug!(symbol, "loaded model artifacts");
        ArtifactBundle::new(model, scaler, columns, metrics, info, last_window).map(Some)
    }

    /// Delete a symbol's directory and any staged bundle, returning whether the directory
    /// existed
    pub fn delete(&self, symbol: &str) -> Result<bool> {
        remove_dir_if_present(&self.staging_dir(symbol))?;
        remove_dir_if_present(&self.retired_dir(symbol))?;
        let removed = remove_dir_if_present(&self.dir(symbol))?;
        if removed {
            info!(symbol, "deleted model artifacts");
        }
        Ok(removed)
    }

    /// Describe every stored model, sorted by symbol. Directories missing required files are
    /// reported as incomplete; staging directories are skipped
    pub fn list(&self) -> Result<Vec<ModelEntry>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut models = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let symbol = entry.file_name().to_string_lossy().into_owned();
            if symbol.starts_with('.') {
                continue;
            }
            models.push(self.describe(&symbol));
        }
        models.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(models)
    }

    fn describe(&self, symbol: &str) -> ModelEntry {
        let mut missing = self.missing(symbol);
        let info = if missing.iter().any(|m| m == INFO) {
            None
        } else {
            match read_json::<TrainingInfo>(&self.dir(symbol).join(INFO)) {
                Ok(info) => Some(info),
                Err(err) => {
                    warn!(symbol, %err, "unreadable training info");
                    missing.push(INFO.to_string());
                    None
                }
            }
        };
        ModelEntry {
            symbol: symbol.to_string(),
            status: if missing.is_empty() {
                ModelState::Ready
            } else {
                ModelState::Incomplete
            },
            missing,
            trained_at: info.as_ref().map(|i| i.trained_at),
            interval: info.as_ref().map(|i| i.interval),
            sequence_length: info.as_ref().map(|i| i.sequence_length()),
            prediction_horizon: info.as_ref().map(|i| i.prediction_horizon()),
            metrics: info.as_ref().map(|i| i.metrics),
        }
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

/// Remove a directory tree, returning whether it existed
fn remove_dir_if_present(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[derive(Debug, Default)]
struct CacheSlots {
    bundles: HashMap<String, Arc<ArtifactBundle>>,
    generations: HashMap<String, u64>,
}

/// Loaded bundles, keyed by symbol.
///
/// Every eviction bumps the symbol's generation, so a load that started before a save
/// cannot cache the bundle it read once the save has evicted it.
#[derive(Debug, Default)]
pub struct ModelCache {
    slots: RwLock<CacheSlots>,
}

impl ModelCache {
    /// An empty cache
    pub fn new() -> ModelCache {
        ModelCache::default()
    }

    /// A cached bundle
    pub fn get(&self, symbol: &str) -> Option<Arc<ArtifactBundle>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .bundles
            .get(symbol)
            .cloned()
    }

    /// The current generation of a symbol
    pub fn generation(&self, symbol: &str) -> u64 {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generations
            .get(symbol)
            .copied()
            .unwrap_or(0)
    }

    /// Cache a bundle, replacing any previous one
    pub fn insert(&self, symbol: &str, bundle: Arc<ArtifactBundle>) {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .bundles
            .insert(symbol.to_string(), bundle);
    }

    /// Cache a bundle loaded at `generation`, unless the symbol was evicted since.
    /// Returns the cached bundle, or `bundle` itself when it was not cached
    pub fn insert_if_current(
        &self,
        symbol: &str,
        generation: u64,
        bundle: Arc<ArtifactBundle>,
    ) -> Arc<ArtifactBundle> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let current = slots.generations.get(symbol).copied().unwrap_or(0);
        if current != generation {
            debug!(symbol, generation, current, "not caching a stale load");
            return bundle;
        }
        slots
            .bundles
            .entry(symbol.to_string())
            .or_insert(bundle)
            .clone()
    }

    /// Drop a symbol's bundle, returning whether one was cached
    pub fn evict(&self, symbol: &str) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        *slots.generations.entry(symbol.to_string()).or_insert(0) += 1;
        let evicted = slots.bundles.remove(symbol).is_some();
        if evicted {
            debug!(symbol, "evicted cached model");
        }
        evicted
    }

    /// The number of cached bundles
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .bundles
            .len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A cached bundle, loading it from `store` on a miss
    pub fn get_or_load(
        &self,
        store: &ArtifactStore,
        symbol: &str,
        device: Device,
    ) -> Result<Arc<ArtifactBundle>> {
        if let Some(bundle) = self.get(symbol) {
            return Ok(bundle);
        }
        let generation = self.generation(symbol);
        let bundle = Arc::new(store.load(symbol, device)?);
        Ok(self.insert_if_current(symbol, generation, bundle))
    }
}
