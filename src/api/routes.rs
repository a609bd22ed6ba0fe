/*!
Request handlers
*/
use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::data::Interval;
use crate::pipeline::{
    Forecast, HealthReport, PredictParams, StockData, TrainingParams, DEFAULT_EPOCHS,
    DEFAULT_PREDICTION_HORIZON, DEFAULT_SEQUENCE_LENGTH,
};
use crate::status::{TrainingRecord, TrainingState};
use crate::store::ModelEntry;
use crate::Error;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Default number of ticks returned by the stock data endpoint
pub const DEFAULT_LIMIT: usize = 100;

fn parse_interval(interval: Option<&str>) -> Result<Interval, Error> {
    match interval {
        Some(interval) => Ok(interval.parse()?),
        None => Ok(Interval::default()),
    }
}

/// `GET /health`
pub async fn liveness() -> Json<Value> {
    Json(json!({ "status": "healthy", "timestamp": Utc::now() }))
}

/// `GET /api/`
pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "Stock price prediction API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// The body of `GET /api/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `healthy` when the service answers
    pub status: String,
    /// Service figures
    #[serde(flatten)]
    pub report: HealthReport,
    /// Time of the check
    pub timestamp: DateTime<Utc>,
}

/// `GET /api/health`
pub async fn health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let report = state.service.health().await?;
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        report,
        timestamp: Utc::now(),
    }))
}

/// `GET /api/available-intervals`
pub async fn available_intervals() -> Json<Value> {
    let intervals: Vec<&str> = Interval::ALL.iter().map(|i| i.as_str()).collect();
    Json(json!({
        "intervals": intervals,
        "default": Interval::default().as_str(),
    }))
}

/// Query of `GET /api/stock-data/{symbol}`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StockDataQuery {
    /// Bar interval, `5min` if absent
    pub interval: Option<String>,
    /// Number of most recent ticks
    pub limit: Option<usize>,
}

/// `GET /api/stock-data/{symbol}`
pub async fn stock_data(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<StockDataQuery>,
) -> ApiResult<Json<StockData>> {
    let interval = parse_interval(query.interval.as_deref())?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    Ok(Json(
        state.service.stock_data(&symbol, interval, limit).await?,
    ))
}

/// Body of `POST /api/train`
#[derive(Debug, Clone, Deserialize)]
pub struct TrainRequest {
    /// Symbol to train
    pub symbol: String,
    /// Bar interval
    pub interval: Option<String>,
    /// Rows per input window
    pub sequence_length: Option<usize>,
    /// Future closes per forecast
    pub prediction_horizon: Option<usize>,
    /// Epoch budget
    pub epochs: Option<usize>,
}

impl TrainRequest {
    fn into_params(self) -> Result<TrainingParams, Error> {
        Ok(TrainingParams {
            interval: parse_interval(self.interval.as_deref())?,
            sequence_length: self.sequence_length.unwrap_or(DEFAULT_SEQUENCE_LENGTH),
            prediction_horizon: self
                .prediction_horizon
                .unwrap_or(DEFAULT_PREDICTION_HORIZON),
            epochs: self.epochs.unwrap_or(DEFAULT_EPOCHS),
            symbol: self.symbol,
        })
    }
}

/// Body of the `POST /api/train` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainResponse {
    /// Human readable acknowledgement
    pub message: String,
    /// Always `training`
    pub status: TrainingState,
    /// The normalized symbol
    pub symbol: String,
    /// Where to poll for progress
    pub check_status_url: String,
}

/// `POST /api/train`: admit a background training run
pub async fn train(
    State(state): State<AppState>,
    Json(request): Json<TrainRequest>,
) -> ApiResult<(StatusCode, Json<TrainResponse>)> {
    let params = request.into_params()?;
    let handle = state.service.submit(params)?;
    let symbol = handle.record.symbol.clone();
    Ok((
        StatusCode::ACCEPTED,
        Json(TrainResponse {
            message: format!("Training started for {}", symbol),
            status: handle.record.status,
            check_status_url: format!("/api/training-status/{}", symbol),
            symbol,
        }),
    ))
}

/// `GET /api/training-status/{symbol}`
pub async fn training_status(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> ApiResult<Json<TrainingRecord>> {
    let symbol = crate::pipeline::normalize_symbol(&symbol)?;
    state
        .service
        .tracker()
        .get(&symbol)
        .map(Json)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("no training status found for {}", symbol),
            )
        })
}

/// `POST /api/predict`
pub async fn predict(
    State(state): State<AppState>,
    Json(params): Json<PredictParams>,
) -> ApiResult<Json<Forecast>> {
    Ok(Json(state.service.predict(params).await?))
}

/// Body of `GET /api/models`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    /// Every stored model
    pub models: Vec<ModelEntry>,
    /// Number of models
    pub count: usize,
}

/// `GET /api/models`
pub async fn list_models(State(state): State<AppState>) -> ApiResult<Json<ModelList>> {
    let models = state.service.list_models().await?;
    Ok(Json(ModelList {
        count: models.len(),
        models,
    }))
}

/// `DELETE /api/models/{symbol}`
pub async fn delete_model(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> ApiResult<Json<Value>> {
    let symbol = crate::pipeline::normalize_symbol(&symbol)?;
    state.service.delete_model(&symbol).await?;
    Ok(Json(json!({
        "message": format!("Model for {} deleted", symbol),
        "symbol": symbol,
    })))
}
