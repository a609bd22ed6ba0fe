/*!
The `stockcast` command line: serve the HTTP API, or train, forecast and fetch data directly
*/
use anyhow::{format_err, Context};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use stockcast::api::{self, AppState};
use stockcast::config::Settings;
use stockcast::data::file::{read_ticks, FileProvider};
use stockcast::data::{normalize_ticks, Interval};
use stockcast::pipeline::{
    forecast, normalize_symbol, train_from_ticks, PredictParams, TrainingEvent, TrainingParams,
    TrainingService, DEFAULT_EPOCHS, DEFAULT_PREDICTION_HORIZON, DEFAULT_SEQUENCE_LENGTH,
    DEFAULT_STEPS,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "stockcast",
    version,
    about = "Per-symbol LSTM forecasting of intraday stock prices"
)]
struct Cli {
    /// Settings file (TOML); defaults to config/default.toml if present
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Device override: cpu, cuda or auto
    #[arg(short, long, global = true)]
    device: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API
    Serve,
    /// Train a model in the foreground and print a short forecast
    Train {
        /// Ticker symbol
        symbol: String,
        /// Bar interval
        #[arg(short, long, default_value = "5min")]
        interval: Interval,
        /// Rows per input window
        #[arg(long, default_value_t = DEFAULT_SEQUENCE_LENGTH)]
        sequence_length: usize,
        /// Future closes per forecast
        #[arg(long, default_value_t = DEFAULT_PREDICTION_HORIZON)]
        horizon: usize,
        /// Epoch budget
        #[arg(short, long, default_value_t = DEFAULT_EPOCHS)]
        epochs: usize,
        /// Train on a CSV tick file instead of the configured provider
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Forecast steps printed after training
        #[arg(long, default_value_t = DEFAULT_STEPS)]
        steps: usize,
    },
    /// Forecast with a trained model
    Predict {
        /// Ticker symbol
        symbol: String,
        /// Bars to roll forward
        #[arg(short, long, default_value_t = DEFAULT_STEPS)]
        steps: usize,
        /// Use the window saved at training time instead of fetching fresh data
        #[arg(long)]
        stored_window: bool,
    },
    /// Download ticks from the provider into a CSV file
    Fetch {
        /// Ticker symbol
        symbol: String,
        /// Bar interval
        #[arg(short, long, default_value = "5min")]
        interval: Interval,
        /// Output directory; defaults to the configured CSV directory
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

fn progress_style(template: &str) -> anyhow::Result<ProgressStyle> {
    ProgressStyle::with_template(template).map_err(|err| format_err!("bad progress style: {}", err))
}

async fn train(
    settings: &Settings,
    params: TrainingParams,
    csv: Option<PathBuf>,
    steps: usize,
) -> anyhow::Result<()> {
    let params = params.validate()?;
    let ticks = match csv {
        Some(path) => {
            let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
            normalize_ticks(read_ticks(file, None)?)
        }
        None => {
            settings
                .provider()?
                .fetch_intraday(&params.symbol, params.interval)
                .await?
        }
    };
    info!(symbol = %params.symbol, rows = ticks.len(), "loaded ticks");

    let store = settings.store();
    let config = settings.train_config();
    let device = settings.device()?;
    let epochs = params.epochs as u64;
    let bundle = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let bar = ProgressBar::new(epochs);
        bar.set_style(progress_style(
            "{msg:40} {wide_bar} {pos:>4}/{len:4} [{elapsed_precise}]",
        )?);
        let bundle = train_from_ticks(&params, &ticks, &store, &config, device, |event| {
            match event {
                TrainingEvent::Phase(_, message) => bar.set_message(message),
                TrainingEvent::Epoch(stats) => {
                    bar.set_position(stats.epoch as u64);
                    bar.set_message(format!(
                        "loss = {:.5}, val_loss = {:.5}",
                        stats.loss, stats.val_loss
                    ));
                }
            }
        })?;
        bar.finish_and_clear();
        Ok(bundle)
    })
    .await??;

    let metrics = bundle.metrics;
    println!("Model for {} saved", bundle.info.symbol);
    println!(
        "MSE = {:.4}, MAE = {:.4}, RMSE = {:.4}, R2 = {:.4}, MAPE = {}",
        metrics.mse,
        metrics.mae,
        metrics.rmse,
        metrics.r2,
        metrics
            .mape
            .map(|m| format!("{:.2}%", m))
            .unwrap_or_else(|| "n/a".to_string())
    );
    if let Some(window) = &bundle.last_window {
        for p in forecast(&bundle, window, steps)? {
            println!("{:>4}  {}  {:>10.2}", p.step, p.timestamp, p.predicted_price);
        }
    }
    Ok(())
}

async fn predict(
    settings: &Settings,
    symbol: String,
    steps: usize,
    stored_window: bool,
) -> anyhow::Result<()> {
    let service = Arc::new(TrainingService::new(
        settings.provider()?,
        settings.store(),
        settings.service_config()?,
    ));
    let out = service
        .predict(PredictParams {
            symbol,
            steps,
            use_latest_data: !stored_window,
        })
        .await?;
    for p in &out.predictions {
        println!("{:>4}  {}  {:>10.2}", p.step, p.timestamp, p.predicted_price);
    }
    Ok(())
}

async fn fetch(
    settings: &Settings,
    symbol: &str,
    interval: Interval,
    out: Option<PathBuf>,
) -> anyhow::Result<()> {
    let symbol = normalize_symbol(symbol)?;
    let ticks = settings
        .provider()?
        .fetch_intraday(&symbol, interval)
        .await?;
    let files = FileProvider::new(out.unwrap_or_else(|| settings.provider.csv_dir.clone()));
    let written = files.store(&symbol, interval, &ticks)?;
    println!(
        "Wrote {} ticks to {}",
        written,
        files.path_for(&symbol, interval).display()
    );
    Ok(())
}

async fn serve(settings: &Settings) -> anyhow::Result<()> {
    let service = Arc::new(TrainingService::new(
        settings.provider()?,
        settings.store(),
        settings.service_config()?,
    ));
    let app = api::router(AppState::new(service));
    let addr = settings.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stockcast=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(device) = cli.device {
        settings.training.device = device;
        settings.device()?;
    }

    match cli.command {
        Command::Serve => serve(&settings).await,
        Command::Train {
            symbol,
            interval,
            sequence_length,
            horizon,
            epochs,
            csv,
            steps,
        } => {
            let params = TrainingParams {
                symbol,
                interval,
                sequence_length,
                prediction_horizon: horizon,
                epochs,
            };
            train(&settings, params, csv, steps).await
        }
        Command::Predict {
            symbol,
            steps,
            stored_window,
        } => predict(&settings, symbol, steps, stored_window).await,
        Command::Fetch {
            symbol,
            interval,
            out,
        } => fetch(&settings, &symbol, interval, out).await,
    }
}
