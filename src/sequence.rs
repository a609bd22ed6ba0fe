/*!
Sliding-window sequences for the LSTM, with a chronological train/test split
*/
use crate::data::scale::MinMaxScaler;
use crate::error::{Error, Result};
use crate::features::{FeatureFrame, CLOSE};
use crate::CpuFloat;
use chrono::NaiveDateTime;
use tracing::debug;

/// Share of sequences used for training; the rest are held out for validation
pub const TRAIN_FRACTION: f64 = 0.8;

/// One model input window and its forecast target
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    /// Timestamp of the last input row
    pub end: NaiveDateTime,
    /// `sequence_length` scaled feature rows
    pub inputs: Vec<Vec<CpuFloat>>,
    /// The next `prediction_horizon` scaled close values
    pub target: Vec<CpuFloat>,
}

/// Scaled, windowed training data
#[derive(Debug, Clone)]
pub struct SequenceSet {
    /// Training sequences, in time order
    pub train: Vec<Sequence>,
    /// Held-out sequences, all strictly after the training sequences
    pub test: Vec<Sequence>,
    /// The scaler fitted on the whole frame
    pub scaler: MinMaxScaler,
    /// The feature columns, in scaler order
    pub columns: Vec<String>,
    /// Window length
    pub sequence_length: usize,
    /// Forecast horizon
    pub prediction_horizon: usize,
}

impl SequenceSet {
    /// Total number of sequences
    pub fn len(&self) -> usize {
        self.train.len() + self.test.len()
    }

    /// Whether there are no sequences at all
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of input features per row
    pub fn features(&self) -> usize {
        self.columns.len()
    }
}

/// The number of sequences `rows` feature rows produce, if any
pub fn sequence_count(rows: usize, sequence_length: usize, prediction_horizon: usize) -> usize {
    (rows + 1).saturating_sub(sequence_length + prediction_horizon)
}

/// Check there are enough rows for one window plus its horizon
pub fn ensure_rows(rows: usize, sequence_length: usize, prediction_horizon: usize) -> Result<()> {
    let needed = sequence_length + prediction_horizon;
    if rows < needed {
        return Err(Error::InsufficientData {
            needed,
            available: rows,
        });
    }
    Ok(())
}

/// Scale a feature frame and cut it into stride-1 windows, split 80/20 in time order
pub fn build_sequences(
    frame: &FeatureFrame,
    sequence_length: usize,
    prediction_horizon: usize,
) -> Result<SequenceSet> {
    if sequence_length == 0 || prediction_horizon == 0 {
        return Err(Error::InvalidRequest(
            "sequence length and prediction horizon must be positive".into(),
        ));
    }
    ensure_rows(frame.len(), sequence_length, prediction_horizon)?;
    let close = frame.column_index(CLOSE)?;
    let scaler = MinMaxScaler::fit(&frame.columns, &frame.rows)?;
    let scaled = scaler.transform_rows(&frame.rows)?;

    let count = sequence_count(frame.len(), sequence_length, prediction_horizon);
    let mut sequences = Vec::with_capacity(count);
    for i in sequence_length..=(frame.len() - prediction_horizon) {
        sequences.push(Sequence {
            end: frame.index[i - 1],
            inputs: scaled[i - sequence_length..i].to_vec(),
            target: scaled[i..i + prediction_horizon]
                .iter()
                .map(|row| row[close])
                .collect(),
        });
    }
    debug_assert_eq!(sequences.len(), count);

    let train_size = (sequences.len() as f64 * TRAIN_FRACTION) as usize;
    if train_size == 0 || train_size == sequences.len() {
        return Err(Error::InsufficientData {
            needed: sequence_length + prediction_horizon + 1,
            available: frame.len(),
        });
    }
    let test = sequences.split_off(train_size);
    debug!(
        train = sequences.len(),
        test = test.len(),
        sequence_length,
        prediction_horizon,
        "built sequences"
    );
    Ok(SequenceSet {
        train: sequences,
        test,
        scaler,
        columns: frame.columns.clone(),
        sequence_length,
        prediction_horizon,
    })
}
