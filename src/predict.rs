/*!
Multi-step forecasting by rolling a model forward over its own predictions
*/
use crate::data::scale::MinMaxScaler;
use crate::error::{Error, Result};
use crate::features::{column_index, CLOSE};
use crate::CpuFloat;
use tracing::trace;

/// Anything which maps a window of scaled feature rows to a scaled close forecast
pub trait Forecaster {
    /// The number of future close values produced per window
    fn horizon(&self) -> usize;

    /// Forecast a batch of windows. Every window must have the same shape
    fn forecast_batch(&self, windows: &[&[Vec<CpuFloat>]]) -> Result<Vec<Vec<CpuFloat>>>;

    /// Forecast a single window
    fn forecast(&self, window: &[Vec<CpuFloat>]) -> Result<Vec<CpuFloat>> {
        self.forecast_batch(&[window])?
            .pop()
            .ok_or_else(|| Error::Task("forecaster returned no output".into()))
    }
}

/// The result of a rollout
#[derive(Debug, Clone, PartialEq)]
pub struct Rollout {
    /// Predicted close prices, in price units, one per step
    pub prices: Vec<CpuFloat>,
    /// The window after the final step, still scaled
    pub window: Vec<Vec<CpuFloat>>,
}

/// Roll a forecaster forward `steps` times from a scaled window.
///
/// At each step the first forecast value is inverse-scaled and recorded. The window's last row
/// is then copied with its close slot replaced by the scaled forecast and appended, while the
/// oldest row is dropped, so the window length never changes.
pub fn rollout<F: Forecaster + ?Sized>(
    model: &F,
    scaler: &MinMaxScaler,
    window: &[Vec<CpuFloat>],
    columns: &[String],
    steps: usize,
) -> Result<Rollout> {
    scaler.check_columns(columns)?;
    let close = column_index(columns, CLOSE)?;
    if window.is_empty() {
        return Err(Error::InsufficientData {
            needed: 1,
            available: 0,
        });
    }
    if let Some(row) = window.iter().find(|row| row.len() != columns.len()) {
        return Err(Error::FeatureMismatch(format!(
            "window row has {} values, expected {}",
            row.len(),
            columns.len()
        )));
    }

    let mut window = window.to_vec();
    let mut prices = Vec::with_capacity(steps);
    for step in 0..steps {
        let forecast = model.forecast(&window)?;
        let scaled = *forecast
            .first()
            .ok_or_else(|| Error::Task("forecaster returned an empty horizon".into()))?;
        let price = scaler.inverse_column(close, scaled)?;
        trace!(step, scaled, price, "rollout step");
        prices.push(price);

        let mut next = window[window.len() - 1].clone();
        next[close] = scaled;
        window.remove(0);
        window.push(next);
    }
    Ok(Rollout { prices, window })
}
