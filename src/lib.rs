/*!
Per-symbol LSTM price forecasting for intraday stock data, written in Rust using PyTorch bindings.

Fetches intraday ticks from a quote provider (by default [Alpha Vantage](https://www.alphavantage.co/)),
derives technical indicators, windows them into fixed-length sequences and trains a stacked LSTM per
symbol. Trained artifacts are cached in memory and persisted per symbol; forecasts are produced by
rolling the model forward over its own predictions. The [`api`] module serves all of this over HTTP.
*/
#![forbid(missing_docs)]

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod features;
pub mod lstm;
pub mod pipeline;
pub mod predict;
pub mod sequence;
pub mod status;
pub mod store;
pub mod train;
pub mod util;

pub use error::{Error, Result};

/// The floating point type to be used for CPU calculations
pub type CpuFloat = f64;

/// The floating point type to be used for GPU calculations
pub type GpuFloat = f32;
