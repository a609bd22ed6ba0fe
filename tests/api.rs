/*!
Test the HTTP API over a file-backed provider
*/
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use stockcast::api::{router, AppState};
use stockcast::data::fake::random_walk_ticks;
use stockcast::data::file::FileProvider;
use stockcast::data::{Interval, Tick};
use stockcast::pipeline::{ServiceConfig, TrainingService};
use stockcast::store::ArtifactStore;
use stockcast::train::TrainConfig;
use tower::ServiceExt;

fn app(dir: &std::path::Path) -> Router {
    let ticks: Vec<Tick> = random_walk_ticks(31).take(150).collect();
    let provider = FileProvider::new(dir.join("ticks"));
    provider
        .store("AAPL", Interval::Min5, &ticks)
        .expect("Storing ticks should not fail");
    let service = TrainingService::new(
        Arc::new(provider),
        ArtifactStore::new(dir.join("models")),
        ServiceConfig {
            train: TrainConfig {
                seed: Some(3),
                ..TrainConfig::default()
            },
            ..ServiceConfig::default()
        },
    );
    router(AppState::new(Arc::new(service)))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn informational_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path());

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = send(&app, "GET", "/api/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].is_string());

    let (status, body) = send(&app, "GET", "/api/available-intervals", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["intervals"],
        json!(["1min", "5min", "15min", "30min", "60min"])
    );
    assert_eq!(body["default"], "5min");

    let (status, body) = send(&app, "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["api_key_configured"], true);
    assert_eq!(body["models_available"], 0);
    assert_eq!(body["active_trainings"], 0);
}

#[tokio::test]
async fn stock_data_and_errors() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path());

    let (status, body) = send(&app, "GET", "/api/stock-data/aapl?limit=20", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["symbol"], "AAPL");
    assert_eq!(body["count"], 20);
    assert_eq!(body["data"].as_array().unwrap().len(), 20);

    let (status, body) = send(&app, "GET", "/api/stock-data/AAPL?interval=2min", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_INTERVAL");
    assert!(body["timestamp"].is_i64());

    let (status, body) = send(&app, "GET", "/api/stock-data/ZZZZ", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_SYMBOL");

    let (status, _) = send(&app, "GET", "/api/training-status/AAPL", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        "POST",
        "/api/predict",
        Some(json!({ "symbol": "AAPL" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, body) = send(
        &app,
        "POST",
        "/api/train",
        Some(json!({ "symbol": "AAPL", "epochs": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");

    let (status, _) = send(&app, "DELETE", "/api/models/AAPL", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn train_then_predict() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path());

    let (status, body) = send(
        &app,
        "POST",
        "/api/train",
        Some(json!({
            "symbol": "aapl",
            "sequence_length": 10,
            "prediction_horizon": 1,
            "epochs": 1
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "training");
    assert_eq!(body["symbol"], "AAPL");
    assert_eq!(body["check_status_url"], "/api/training-status/AAPL");

    let mut record = Value::Null;
    for _ in 0..600 {
        let (status, body) = send(&app, "GET", "/api/training-status/AAPL", None).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] != "training" {
            record = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(record["status"], "completed", "{}", record);
    assert_eq!(record["progress"], 100);
    assert_eq!(record["total_epochs"], 1);
    assert!(record["metrics"]["rmse"].is_f64());

    let (status, body) = send(
        &app,
        "POST",
        "/api/predict",
        Some(json!({ "symbol": "AAPL", "steps": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let predictions = body["predictions"].as_array().unwrap();
    assert_eq!(predictions.len(), 3);
    assert_eq!(predictions[2]["step"], 3);
    assert!(body["model_metrics"].is_object());

    let (status, body) = send(&app, "GET", "/api/models", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["models"][0]["status"], "ready");

    let (status, body) = send(&app, "DELETE", "/api/models/aapl", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["symbol"], "AAPL");
    let (status, _) = send(&app, "DELETE", "/api/models/AAPL", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
