/*!
Orchestration of training runs and forecasts.

[`train_from_ticks`] and [`forecast`] are the synchronous pipeline, used directly by the command
line. [`TrainingService`] wraps them for the server: training runs as a tracked background job
and models are served from the [`ModelCache`].
*/
use crate::data::{Interval, QuoteProvider, Tick};
use crate::error::{Error, Result};
use crate::evaluate::{evaluate, Metrics};
use crate::features::{create_indicators, engineer, FeatureFrame};
use crate::lstm::{LstmModel, StockLstmDesc};
use crate::predict::rollout;
use crate::sequence::{build_sequences, ensure_rows, SequenceSet};
use crate::status::{progress, StatusTracker, TrainingRecord};
use crate::store::{ArtifactBundle, ArtifactStore, ModelCache, ModelEntry, ModelState, TrainingInfo};
use crate::train::{EpochStats, TrainConfig, Trainer};
use crate::util::round_to;
use crate::CpuFloat;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tch::Device;
use tokio::sync::oneshot;
use tracing::{error, info, instrument, warn};

/// Default number of rows per input window
pub const DEFAULT_SEQUENCE_LENGTH: usize = 60;
/// Default number of future closes per forecast
pub const DEFAULT_PREDICTION_HORIZON: usize = 1;
/// Default epoch budget
pub const DEFAULT_EPOCHS: usize = 50;
/// Default number of rollout steps
pub const DEFAULT_STEPS: usize = 10;
/// Upper bound on rollout steps
pub const MAX_STEPS: usize = 500;

/// Trim, check and uppercase a ticker symbol
pub fn normalize_symbol(symbol: &str) -> Result<String> {
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return Err(Error::InvalidRequest("symbol must not be empty".into()));
    }
    if !symbol
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(Error::InvalidRequest(format!(
            "invalid symbol '{}': only letters, digits, '.' and '-' are allowed",
            symbol
        )));
    }
    Ok(symbol.to_ascii_uppercase())
}

/// Parameters of a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    /// The symbol to train on
    pub symbol: String,
    /// The bar interval to fetch
    #[serde(default)]
    pub interval: Interval,
    /// Rows per input window
    #[serde(default = "default_sequence_length")]
    pub sequence_length: usize,
    /// Future closes per forecast
    #[serde(default = "default_prediction_horizon")]
    pub prediction_horizon: usize,
    /// Epoch budget
    #[serde(default = "default_epochs")]
    pub epochs: usize,
}

fn default_sequence_length() -> usize {
    DEFAULT_SEQUENCE_LENGTH
}

fn default_prediction_horizon() -> usize {
    DEFAULT_PREDICTION_HORIZON
}

fn default_epochs() -> usize {
    DEFAULT_EPOCHS
}

impl TrainingParams {
    /// Default parameters for a symbol
    pub fn new(symbol: impl Into<String>) -> TrainingParams {
        TrainingParams {
            symbol: symbol.into(),
            interval: Interval::default(),
            sequence_length: DEFAULT_SEQUENCE_LENGTH,
            prediction_horizon: DEFAULT_PREDICTION_HORIZON,
            epochs: DEFAULT_EPOCHS,
        }
    }

    /// Check ranges and normalize the symbol
    pub fn validate(mut self) -> Result<TrainingParams> {
        self.symbol = normalize_symbol(&self.symbol)?;
        if self.sequence_length < 2 {
            return Err(Error::InvalidRequest(
                "sequence_length must be at least 2".into(),
            ));
        }
        if self.prediction_horizon < 1 {
            return Err(Error::InvalidRequest(
                "prediction_horizon must be at least 1".into(),
            ));
        }
        if self.epochs < 1 {
            return Err(Error::InvalidRequest("epochs must be at least 1".into()));
        }
        Ok(self)
    }
}

/// Progress reported by [`train_from_ticks`]
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingEvent {
    /// A pipeline milestone was reached
    Phase(u8, String),
    /// An epoch finished
    Epoch(EpochStats),
}

/// Train, evaluate and save a model for `params.symbol` from already fetched ticks.
///
/// Fails with [`Error::InsufficientData`] before any model is built if the cleaned feature rows
/// cannot hold one window plus its horizon.
pub fn train_from_ticks<O>(
    params: &TrainingParams,
    ticks: &[Tick],
    store: &ArtifactStore,
    config: &TrainConfig,
    device: Device,
    mut observer: O,
) -> Result<ArtifactBundle>
where
    O: FnMut(TrainingEvent),
{
    let symbol = params.symbol.as_str();
    let frame = engineer(ticks)?;
    observer(TrainingEvent::Phase(
        progress::FEATURES,
        format!("Engineered features for {} rows", frame.len()),
    ));

    ensure_rows(frame.len(), params.sequence_length, params.prediction_horizon)?;
    let set = build_sequences(&frame, params.sequence_length, params.prediction_horizon)?;
    observer(TrainingEvent::Phase(
        progress::PREPARED,
        format!(
            "Prepared {} training and {} test sequences",
            set.train.len(),
            set.test.len()
        ),
    ));

    if let Some(seed) = config.seed {
        tch::manual_seed(seed as i64);
    }
    let desc = StockLstmDesc::new(
        set.features(),
        params.sequence_length,
        params.prediction_horizon,
    );
    let model = LstmModel::new(&desc, device);
    observer(TrainingEvent::Phase(
        progress::MODEL_BUILT,
        "Built model".to_string(),
    ));

    store.prepare_staging(symbol)?;
    let saved = fit_and_save(params, &frame, set, model, store, config, &mut observer);
    if saved.is_err() {
        if let Err(err) = store.discard_staging(symbol) {
            warn!(symbol, %err, "could not discard staged artifacts");
        }
    }
    saved
}

/// Fit into the symbol's staging directory, evaluate, and commit the bundle to the store
fn fit_and_save<O>(
    params: &TrainingParams,
    frame: &FeatureFrame,
    set: SequenceSet,
    mut model: LstmModel,
    store: &ArtifactStore,
    config: &TrainConfig,
    observer: &mut O,
) -> Result<ArtifactBundle>
where
    O: FnMut(TrainingEvent),
{
    let symbol = params.symbol.as_str();
    let staging = store.staging_dir(symbol);
    let desc = model.desc().clone();
    let trainer = Trainer::new(TrainConfig {
        epochs: params.epochs,
        ..config.clone()
    });
    observer(TrainingEvent::Phase(
        progress::TRAINING,
        "Training model".to_string(),
    ));
    let outcome = trainer.fit(&mut model, &set, &staging, |stats| {
        observer(TrainingEvent::Epoch(*stats))
    })?;

    observer(TrainingEvent::Phase(
        progress::EVALUATING,
        "Evaluating model".to_string(),
    ));
    let metrics = evaluate(&model, &set.test, &set.scaler, &set.columns)?;
    info!(
        symbol,
        mse = metrics.mse,
        mae = metrics.mae,
        rmse = metrics.rmse,
        r2 = metrics.r2,
        "model evaluated"
    );

    let [h1, h2, h3] = desc.hidden;
    let info = TrainingInfo {
        symbol: symbol.to_string(),
        interval: params.interval,
        features: set.columns.clone(),
        architecture: format!(
            "LSTM({}) -> LSTM({}) -> LSTM({}) -> Dense({}) -> Dense({})",
            h1, h2, h3, desc.dense, desc.prediction_horizon
        ),
        model: desc,
        epochs: params.epochs,
        history: outcome.history,
        metrics,
        train_samples: set.train.len(),
        test_samples: set.test.len(),
        trained_at: Utc::now(),
    };
    let last_window = frame.tail(params.sequence_length);
    let bundle = ArtifactBundle::new(
        model,
        set.scaler,
        set.columns,
        metrics,
        info,
        Some(last_window),
    )?;
    store.save(symbol, &bundle)?;
    Ok(bundle)
}

/// One forecast step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// One-based step number
    pub step: usize,
    /// Forecast close, rounded to cents
    pub predicted_price: CpuFloat,
    /// Projected timestamp: the last observed row plus `step` bars
    pub timestamp: NaiveDateTime,
}

/// Roll a bundle's model forward `steps` bars from the end of an unscaled feature frame
pub fn forecast(
    bundle: &ArtifactBundle,
    frame: &FeatureFrame,
    steps: usize,
) -> Result<Vec<Prediction>> {
    let sequence_length = bundle.info.sequence_length();
    if frame.columns != bundle.columns {
        return Err(Error::FeatureMismatch(format!(
            "frame has columns {:?}, model expects {:?}",
            frame.columns, bundle.columns
        )));
    }
    ensure_rows(frame.len(), sequence_length, 0)?;
    let window = frame.tail(sequence_length);
    let last = window
        .index
        .last()
        .copied()
        .ok_or(Error::InsufficientData {
            needed: sequence_length,
            available: 0,
        })?;
    let scaled = bundle.scaler.transform_rows(&window.rows)?;
    let out = bundle.with_model(|model| {
        rollout(model, &bundle.scaler, &scaled, &bundle.columns, steps)
    })?;
    let bar = bundle.info.interval.duration();
    Ok(out
        .prices
        .iter()
        .enumerate()
        .map(|(i, &price)| Prediction {
            step: i + 1,
            predicted_price: round_to(price, 2),
            timestamp: last + bar * (i as i32 + 1),
        })
        .collect())
}

/// Parameters of a forecast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictParams {
    /// The symbol to forecast
    pub symbol: String,
    /// Number of bars to roll forward
    #[serde(default = "default_steps")]
    pub steps: usize,
    /// Fetch fresh data, rather than using the window saved at training time
    #[serde(default = "default_use_latest")]
    pub use_latest_data: bool,
}

fn default_steps() -> usize {
    DEFAULT_STEPS
}

fn default_use_latest() -> bool {
    true
}

impl PredictParams {
    /// Check ranges and normalize the symbol
    pub fn validate(mut self) -> Result<PredictParams> {
        self.symbol = normalize_symbol(&self.symbol)?;
        if self.steps < 1 || self.steps > MAX_STEPS {
            return Err(Error::InvalidRequest(format!(
                "steps must be between 1 and {}",
                MAX_STEPS
            )));
        }
        Ok(self)
    }
}

/// A multi-step forecast for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    /// The symbol
    pub symbol: String,
    /// The forecast, one entry per step
    pub predictions: Vec<Prediction>,
    /// Held-out metrics of the model used
    pub model_metrics: Option<Metrics>,
    /// When the forecast was made
    pub generated_at: DateTime<Utc>,
}

/// Recent ticks for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockData {
    /// The symbol
    pub symbol: String,
    /// The bar interval
    pub interval: Interval,
    /// The most recent ticks, oldest first
    pub data: Vec<Tick>,
    /// Number of ticks returned
    pub count: usize,
}

/// Service health figures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Whether the quote provider has its credentials
    pub api_key_configured: bool,
    /// Number of stored models which are ready to serve
    pub models_available: usize,
    /// Number of training runs in progress
    pub active_trainings: usize,
    /// Number of models held in memory
    pub cached_models: usize,
}

/// Settings of a [`TrainingService`]
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Hyperparameters other than the epoch budget
    pub train: TrainConfig,
    /// Device models are trained and served on
    pub device: Device,
}

impl Default for ServiceConfig {
    fn default() -> ServiceConfig {
        ServiceConfig {
            train: TrainConfig::default(),
            device: Device::Cpu,
        }
    }
}

/// A handle to a submitted training job
#[derive(Debug)]
pub struct JobHandle {
    /// The record created when the job was admitted
    pub record: TrainingRecord,
    done: oneshot::Receiver<Result<Metrics>>,
}

impl JobHandle {
    /// Wait for the job to finish. The status record is final by the time this returns
    pub async fn wait(self) -> Result<Metrics> {
        self.done
            .await
            .map_err(|_| Error::Task("training supervisor dropped".into()))?
    }
}

/// Training and forecasting over a quote provider, an artifact store and a model cache
pub struct TrainingService {
    provider: Arc<dyn QuoteProvider>,
    store: ArtifactStore,
    cache: ModelCache,
    tracker: StatusTracker,
    config: ServiceConfig,
}

impl std::fmt::Debug for TrainingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingService")
            .field("store", &self.store)
            .field("cache", &self.cache.len())
            .field("tracker", &self.tracker)
            .field("config", &self.config)
            .finish()
    }
}

impl TrainingService {
    /// Create a service
    pub fn new(
        provider: Arc<dyn QuoteProvider>,
        store: ArtifactStore,
        config: ServiceConfig,
    ) -> TrainingService {
        TrainingService {
            provider,
            store,
            cache: ModelCache::new(),
            tracker: StatusTracker::new(),
            config,
        }
    }

    /// The artifact store
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// The model cache
    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// The status tracker
    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    /// Admit a training run and start it in the background.
    ///
    /// Returns immediately with the `training` record, or [`Error::TrainingConflict`] if the
    /// symbol is already training. The job's outcome, including a panic, ends up in the status
    /// tracker before the returned handle resolves.
    pub fn submit(self: &Arc<Self>, params: TrainingParams) -> Result<JobHandle> {
        let params = params.validate()?;
        let symbol = params.symbol.clone();
        let record = self.tracker.try_begin(&symbol, params.epochs)?;
        info!(symbol = %symbol, epochs = params.epochs, "training job submitted");

        let job = tokio::spawn(Arc::clone(self).run_job(params));
        let service = Arc::clone(self);
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = match job.await {
                Ok(Ok(metrics)) => {
                    service.tracker.complete(&symbol, metrics);
                    info!(symbol = %symbol, "training job completed");
                    Ok(metrics)
                }
                Ok(Err(err)) => {
                    error!(symbol = %symbol, %err, "training job failed");
                    service.tracker.fail(&symbol, err.to_string());
                    Err(err)
                }
                Err(err) => {
                    error!(symbol = %symbol, %err, "training job panicked");
                    service.tracker.fail(&symbol, err.to_string());
                    Err(err.into())
                }
            };
            let _ = tx.send(outcome);
        });
        Ok(JobHandle { record, done: rx })
    }

    #[instrument(skip(self), fields(symbol = %params.symbol))]
    async fn run_job(self: Arc<Self>, params: TrainingParams) -> Result<Metrics> {
        let symbol = params.symbol.clone();
        self.cache.evict(&symbol);
        let ticks = self.provider.fetch_intraday(&symbol, params.interval).await?;
        self.tracker.update(
            &symbol,
            progress::FETCHED,
            format!("Fetched {} rows", ticks.len()),
        );
        let service = Arc::clone(&self);
        tokio::task::spawn_blocking(move || service.train_blocking(&params, &ticks)).await?
    }

    fn train_blocking(&self, params: &TrainingParams, ticks: &[Tick]) -> Result<Metrics> {
        let symbol = params.symbol.as_str();
        let bundle = train_from_ticks(
            params,
            ticks,
            &self.store,
            &self.config.train,
            self.config.device,
            |event| match event {
                TrainingEvent::Phase(percent, message) => {
                    self.tracker.update(symbol, percent, message)
                }
                TrainingEvent::Epoch(stats) => self.tracker.epoch(symbol, stats.epoch),
            },
        )?;
        self.cache.evict(symbol);
        Ok(bundle.metrics)
    }

    /// The latest training record of a symbol
    pub fn status(&self, symbol: &str) -> Result<TrainingRecord> {
        let symbol = normalize_symbol(symbol)?;
        self.tracker
            .get(&symbol)
            .ok_or(Error::ModelNotFound(symbol))
    }

    async fn bundle(self: &Arc<Self>, symbol: &str) -> Result<Arc<ArtifactBundle>> {
        if let Some(bundle) = self.cache.get(symbol) {
            return Ok(bundle);
        }
        let service = Arc::clone(self);
        let symbol = symbol.to_string();
        tokio::task::spawn_blocking(move || {
            service
                .cache
                .get_or_load(&service.store, &symbol, service.config.device)
        })
        .await?
    }

    /// Forecast a symbol with its trained model
    pub async fn predict(self: &Arc<Self>, params: PredictParams) -> Result<Forecast> {
        let params = params.validate()?;
        let symbol = params.symbol.clone();
        let bundle = self.bundle(&symbol).await?;

        let frame = if params.use_latest_data {
            let ticks = self
                .provider
                .fetch_intraday(&symbol, bundle.info.interval)
                .await?;
            FeatureFrame::select(&create_indicators(&ticks)?, &bundle.columns)
        } else {
            bundle.last_window.clone().ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "no stored input window for {}, use the latest data instead",
                    symbol
                ))
            })?
        };

        let steps = params.steps;
        let predictions = {
            let bundle = Arc::clone(&bundle);
            tokio::task::spawn_blocking(move || forecast(&bundle, &frame, steps)).await??
        };
        info!(symbol = %symbol, steps, "forecast generated");
        Ok(Forecast {
            symbol,
            predictions,
            model_metrics: Some(bundle.metrics),
            generated_at: Utc::now(),
        })
    }

    /// The latest `limit` ticks of a symbol
    pub async fn stock_data(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<StockData> {
        let symbol = normalize_symbol(symbol)?;
        if limit == 0 {
            return Err(Error::InvalidRequest("limit must be at least 1".into()));
        }
        let mut data = self.provider.fetch_intraday(&symbol, interval).await?;
        let start = data.len().saturating_sub(limit);
        data.drain(..start);
        Ok(StockData {
            symbol,
            interval,
            count: data.len(),
            data,
        })
    }

    /// Every stored model
    pub async fn list_models(&self) -> Result<Vec<ModelEntry>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.list()).await?
    }

    /// Delete a symbol's model, cache entry and status record. The symbol is marked as being
    /// deleted under the tracker's lock, so no run can be admitted until the deletion finishes
    pub async fn delete_model(&self, symbol: &str) -> Result<()> {
        let symbol = normalize_symbol(symbol)?;
        let deletion = self.tracker.begin_delete(&symbol)?;
        self.cache.evict(&symbol);
        let store = self.store.clone();
        let removed = {
            let symbol = symbol.clone();
            tokio::task::spawn_blocking(move || store.delete(&symbol)).await??
        };
        self.cache.evict(&symbol);
        deletion.finish();
        if !removed {
            return Err(Error::ModelNotFound(symbol));
        }
        Ok(())
    }

    /// Health figures
    pub async fn health(&self) -> Result<HealthReport> {
        let models = self.list_models().await?;
        Ok(HealthReport {
            api_key_configured: self.provider.is_configured(),
            models_available: models
                .iter()
                .filter(|m| m.status == ModelState::Ready)
                .count(),
            active_trainings: self.tracker.active(),
            cached_models: self.cache.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_are_normalized() {
        assert_eq!(normalize_symbol(" aapl ").unwrap(), "AAPL");
        assert_eq!(normalize_symbol("brk.b").unwrap(), "BRK.B");
        assert!(normalize_symbol("").is_err());
        assert!(normalize_symbol("../etc").is_err());
        assert!(normalize_symbol("A B").is_err());
    }

    #[test]
    fn training_params_defaults_and_ranges() {
        let params: TrainingParams = serde_json::from_str(r#"{"symbol": "msft"}"#).unwrap();
        assert_eq!(params.interval, Interval::Min5);
        assert_eq!(params.sequence_length, 60);
        assert_eq!(params.prediction_horizon, 1);
        assert_eq!(params.epochs, 50);
        assert_eq!(params.validate().unwrap().symbol, "MSFT");

        let bad = TrainingParams {
            sequence_length: 1,
            ..TrainingParams::new("AAPL")
        };
        assert!(bad.validate().is_err());
        let bad = TrainingParams {
            epochs: 0,
            ..TrainingParams::new("AAPL")
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn predict_params_ranges() {
        let params: PredictParams = serde_json::from_str(r#"{"symbol": "aapl"}"#).unwrap();
        assert_eq!(params.steps, 10);
        assert!(params.use_latest_data);
        for steps in [0, MAX_STEPS + 1] {
            let bad = PredictParams {
                symbol: "AAPL".into(),
                steps,
                use_latest_data: true,
            };
            assert!(matches!(bad.validate(), Err(Error::InvalidRequest(_))));
        }
    }

    #[test]
    fn insufficient_data_fails_before_training() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let ticks: Vec<Tick> = crate::data::fake::random_walk_ticks(2).take(50).collect();
        let mut events = Vec::new();
        let err = train_from_ticks(
            &TrainingParams::new("AAPL"),
            &ticks,
            &store,
            &TrainConfig::default(),
            Device::Cpu,
            |event| events.push(event),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InsufficientData { needed: 61, .. }));
        assert_eq!(events.len(), 1);
        assert!(!store.exists("AAPL"));
    }
}
