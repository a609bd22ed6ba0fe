/*!
Technical indicator features derived from OHLCV ticks.

Window-based indicators are `None` until their window is full; such rows are dropped when a
[`FeatureFrame`] is selected, never repaired.
*/
use crate::data::Tick;
use crate::error::{Error, Result};
use crate::CpuFloat;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use ta::indicators::SimpleMovingAverage;
use ta::{Next, Volume};

/// The column the model forecasts
pub const CLOSE: &str = "close";

/// The feature columns a model is trained on, in order
pub const FEATURE_COLUMNS: [&str; 16] = [
    "open",
    "high",
    "low",
    "close",
    "volume",
    "SMA_5",
    "SMA_20",
    "EMA_12",
    "RSI",
    "BB_upper",
    "BB_lower",
    "MACD",
    "MACD_signal",
    "volume_ratio",
    "volatility",
    "price_change",
];

/// The longest trailing window any indicator needs
pub const MAX_INDICATOR_WINDOW: usize = 20;

const RSI_PERIOD: usize = 14;
const BB_PERIOD: usize = 20;
const BB_WIDTH: f64 = 2.0;
const VOLATILITY_PERIOD: usize = 20;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;

/// The default feature columns as owned strings
pub fn default_columns() -> Vec<String> {
    FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect()
}

/// Resolve a column's position by name
pub fn column_index(columns: &[String], name: &str) -> Result<usize> {
    columns
        .iter()
        .position(|c| c == name)
        .ok_or_else(|| Error::MissingColumn(name.to_string()))
}

/// Indicator values for one tick; `None` where history is insufficient
#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Indicators {
    /// Mean close over the last 5 rows
    pub sma_5: Option<CpuFloat>,
    /// Mean close over the last 20 rows
    pub sma_20: Option<CpuFloat>,
    /// Bias-corrected EMA of close, span 12
    pub ema_12: Option<CpuFloat>,
    /// 14-row RSI over simple average gains and losses
    pub rsi: Option<CpuFloat>,
    /// Middle Bollinger band, the 20-row mean close
    pub bb_middle: Option<CpuFloat>,
    /// Middle band plus two sample standard deviations
    pub bb_upper: Option<CpuFloat>,
    /// Middle band minus two sample standard deviations
    pub bb_lower: Option<CpuFloat>,
    /// EMA(12) minus EMA(26) of close
    pub macd: Option<CpuFloat>,
    /// EMA(9) of the MACD line
    pub macd_signal: Option<CpuFloat>,
    /// Mean volume over the last 20 rows
    pub volume_sma: Option<CpuFloat>,
    /// Volume over its 20-row mean
    pub volume_ratio: Option<CpuFloat>,
    /// Sample standard deviation of close over the last 20 rows
    pub volatility: Option<CpuFloat>,
    /// Fractional change of close from the previous row
    pub price_change: Option<CpuFloat>,
}

/// A tick together with its indicators
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct FeatureRow {
    /// The underlying tick
    pub tick: Tick,
    /// The derived indicators
    pub indicators: Indicators,
}

impl FeatureRow {
    /// Look a feature up by column name. Unknown columns and non-finite values are `None`
    pub fn value(&self, column: &str) -> Option<CpuFloat> {
        let ind = &self.indicators;
        let value = match column {
            "open" => Some(self.tick.o),
            "high" => Some(self.tick.h),
            "low" => Some(self.tick.l),
            "close" => Some(self.tick.c),
            "volume" => Some(self.tick.volume()),
            "SMA_5" => ind.sma_5,
            "SMA_20" => ind.sma_20,
            "EMA_12" => ind.ema_12,
            "RSI" => ind.rsi,
            "BB_middle" => ind.bb_middle,
            "BB_upper" => ind.bb_upper,
            "BB_lower" => ind.bb_lower,
            "MACD" => ind.macd,
            "MACD_signal" => ind.macd_signal,
            "volume_sma" => ind.volume_sma,
            "volume_ratio" => ind.volume_ratio,
            "volatility" => ind.volatility,
            "price_change" => ind.price_change,
            _ => None,
        };
        value.filter(|x| x.is_finite())
    }
}

/// Keep a value only once `have` samples cover a window of `need`
#[inline]
fn when_full(have: usize, need: usize, value: CpuFloat) -> Option<CpuFloat> {
    if have >= need && value.is_finite() {
        Some(value)
    } else {
        None
    }
}

/// Rolling RSI over simple averages of the last `period` gains and losses.
///
/// Zero average loss gives 100 when there were gains, and 50 for a flat window.
#[derive(Debug, Clone)]
struct SimpleRsi {
    period: usize,
    deltas: VecDeque<CpuFloat>,
    prev: Option<CpuFloat>,
}

impl SimpleRsi {
    fn new(period: usize) -> SimpleRsi {
        SimpleRsi {
            period,
            deltas: VecDeque::with_capacity(period + 1),
            prev: None,
        }
    }

    fn next(&mut self, close: CpuFloat) -> Option<CpuFloat> {
        let prev = self.prev.replace(close)?;
        self.deltas.push_back(close - prev);
        if self.deltas.len() > self.period {
            self.deltas.pop_front();
        }
        if self.deltas.len() < self.period {
            return None;
        }
        let n = self.period as CpuFloat;
        let gain = self.deltas.iter().filter(|d| **d > 0.0).sum::<CpuFloat>() / n;
        let loss = -self.deltas.iter().filter(|d| **d < 0.0).sum::<CpuFloat>() / n;
        let rsi = if loss == 0.0 {
            if gain == 0.0 {
                50.0
            } else {
                100.0
            }
        } else {
            100.0 - 100.0 / (1.0 + gain / loss)
        };
        Some(rsi)
    }
}

/// Exponentially weighted mean with bias correction: every observation so far is weighted by
/// `(1 - alpha)^age` and the weights are normalized, so early values are not dominated by the
/// first observation.
#[derive(Debug, Clone)]
struct AdjustedEma {
    decay: CpuFloat,
    weighted_sum: CpuFloat,
    weight_total: CpuFloat,
}

impl AdjustedEma {
    fn new(span: usize) -> AdjustedEma {
        let alpha = 2.0 / (span as CpuFloat + 1.0);
        AdjustedEma {
            decay: 1.0 - alpha,
            weighted_sum: 0.0,
            weight_total: 0.0,
        }
    }
}

impl Next<CpuFloat> for AdjustedEma {
    type Output = CpuFloat;

    fn next(&mut self, input: CpuFloat) -> CpuFloat {
        self.weighted_sum = input + self.decay * self.weighted_sum;
        self.weight_total = 1.0 + self.decay * self.weight_total;
        self.weighted_sum / self.weight_total
    }
}

/// Rolling sample standard deviation (`n - 1` denominator), `None` until the window is full
#[derive(Debug, Clone)]
struct RollingStd {
    period: usize,
    window: VecDeque<CpuFloat>,
}

impl RollingStd {
    fn new(period: usize) -> RollingStd {
        RollingStd {
            period,
            window: VecDeque::with_capacity(period + 1),
        }
    }
}

impl Next<CpuFloat> for RollingStd {
    type Output = Option<CpuFloat>;

    fn next(&mut self, input: CpuFloat) -> Option<CpuFloat> {
        self.window.push_back(input);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        if self.window.len() < self.period || self.period < 2 {
            return None;
        }
        let n = self.period as CpuFloat;
        let mean = self.window.iter().sum::<CpuFloat>() / n;
        let sq = self
            .window
            .iter()
            .map(|x| (x - mean) * (x - mean))
            .sum::<CpuFloat>();
        Some((sq / (n - 1.0)).sqrt())
    }
}

/// Compute indicators for chronologically sorted ticks
pub fn create_indicators(ticks: &[Tick]) -> Result<Vec<FeatureRow>> {
    let mut sma_5 = SimpleMovingAverage::new(5)?;
    let mut sma_20 = SimpleMovingAverage::new(BB_PERIOD)?;
    let mut ema_fast = AdjustedEma::new(MACD_FAST);
    let mut ema_slow = AdjustedEma::new(MACD_SLOW);
    let mut macd_signal = AdjustedEma::new(MACD_SIGNAL);
    let mut band_std = RollingStd::new(BB_PERIOD);
    let mut volume_sma = SimpleMovingAverage::new(20)?;
    let mut volatility = RollingStd::new(VOLATILITY_PERIOD);
    let mut rsi = SimpleRsi::new(RSI_PERIOD);

    let mut rows = Vec::with_capacity(ticks.len());
    let mut prev_close: Option<CpuFloat> = None;
    for (i, tick) in ticks.iter().enumerate() {
        let seen = i + 1;
        let middle = when_full(seen, BB_PERIOD, sma_20.next(tick));
        let deviation = band_std.next(tick.c);
        let band = |sign: CpuFloat| {
            middle
                .zip(deviation)
                .map(|(mid, std)| mid + sign * BB_WIDTH * std)
                .filter(|x| x.is_finite())
        };
        let fast = ema_fast.next(tick.c);
        let macd = fast - ema_slow.next(tick.c);
        let signal = macd_signal.next(macd);
        let volume_mean = when_full(seen, 20, volume_sma.next(tick.volume()));
        let indicators = Indicators {
            sma_5: when_full(seen, 5, sma_5.next(tick)),
            sma_20: middle,
            ema_12: when_full(seen, 1, fast),
            rsi: rsi.next(tick.c),
            bb_middle: middle,
            bb_upper: band(1.0),
            bb_lower: band(-1.0),
            macd: when_full(seen, 1, macd),
            macd_signal: when_full(seen, 1, signal),
            volume_sma: volume_mean,
            volume_ratio: volume_mean
                .filter(|mean| *mean != 0.0)
                .map(|mean| tick.volume() / mean),
            volatility: volatility.next(tick.c).filter(|x| x.is_finite()),
            price_change: prev_close
                .filter(|prev| *prev != 0.0)
                .map(|prev| tick.c / prev - 1.0),
        };
        prev_close = Some(tick.c);
        rows.push(FeatureRow {
            tick: *tick,
            indicators,
        });
    }
    Ok(rows)
}

/// A NaN-free table of selected feature columns, indexed by timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFrame {
    /// Column names, in order
    pub columns: Vec<String>,
    /// Row timestamps, ascending
    pub index: Vec<NaiveDateTime>,
    /// Row values, one per column
    pub rows: Vec<Vec<CpuFloat>>,
}

impl FeatureFrame {
    /// Select columns by name, dropping every row where any of them is missing
    pub fn select(rows: &[FeatureRow], columns: &[String]) -> FeatureFrame {
        let mut index = Vec::with_capacity(rows.len());
        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            let selected: Option<Vec<CpuFloat>> = columns.iter().map(|c| row.value(c)).collect();
            if let Some(selected) = selected {
                index.push(row.tick.t);
                values.push(selected);
            }
        }
        FeatureFrame {
            columns: columns.to_vec(),
            index,
            rows: values,
        }
    }

    /// The number of rows
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no rows
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column by name
    pub fn column_index(&self, name: &str) -> Result<usize> {
        column_index(&self.columns, name)
    }

    /// The last `n` rows (or all, if fewer)
    pub fn tail(&self, n: usize) -> FeatureFrame {
        let start = self.len().saturating_sub(n);
        FeatureFrame {
            columns: self.columns.clone(),
            index: self.index[start..].to_vec(),
            rows: self.rows[start..].to_vec(),
        }
    }
}

/// Compute indicators and select the default feature columns
pub fn engineer(ticks: &[Tick]) -> Result<FeatureFrame> {
    Ok(FeatureFrame::select(
        &create_indicators(ticks)?,
        &default_columns(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fake::random_walk_ticks;
    use chrono::Duration;

    fn flat_ticks(closes: &[CpuFloat]) -> Vec<Tick> {
        let t0 = NaiveDateTime::parse_from_str("2024-01-02 09:30:00", crate::data::PROVIDER_DATETIME)
            .unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Tick {
                t: t0 + Duration::minutes(5 * i as i64),
                o: c,
                h: c,
                l: c,
                c,
                v: 100,
            })
            .collect()
    }

    #[test]
    fn warm_up_rows_are_dropped() {
        let ticks: Vec<Tick> = random_walk_ticks(1).take(100).collect();
        let frame = engineer(&ticks).unwrap();
        assert_eq!(frame.columns.len(), 16);
        // SMA_20, Bollinger, volume ratio and volatility need 20 rows
        assert_eq!(frame.len(), 100 - (MAX_INDICATOR_WINDOW - 1));
        assert_eq!(frame.index[0], ticks[MAX_INDICATOR_WINDOW - 1].t);
        assert!(frame.rows.iter().flatten().all(|x| x.is_finite()));
    }

    #[test]
    fn moving_averages_and_change() {
        let closes: Vec<CpuFloat> = (1..=30).map(|i| i as CpuFloat).collect();
        let rows = create_indicators(&flat_ticks(&closes)).unwrap();
        assert_eq!(rows[3].indicators.sma_5, None);
        assert_eq!(rows[4].indicators.sma_5, Some(3.0));
        assert_eq!(rows[19].indicators.sma_20, Some(10.5));
        assert_eq!(rows[0].indicators.price_change, None);
        assert_eq!(rows[1].indicators.price_change, Some(1.0));
        assert_eq!(rows[19].indicators.volume_ratio, Some(1.0));
        // Strictly rising prices: no losses at all
        assert_eq!(rows[13].indicators.rsi, None);
        assert_eq!(rows[14].indicators.rsi, Some(100.0));
    }

    #[test]
    fn rsi_policy_for_flat_and_mixed_windows() {
        let rows = create_indicators(&flat_ticks(&[10.0; 20])).unwrap();
        assert_eq!(rows[19].indicators.rsi, Some(50.0));
        assert_eq!(rows[19].indicators.volatility, Some(0.0));

        // Alternating +1, -1: equal average gain and loss
        let closes: Vec<CpuFloat> = (0..16).map(|i| 10.0 + (i % 2) as CpuFloat).collect();
        let rows = create_indicators(&flat_ticks(&closes)).unwrap();
        let rsi = rows[15].indicators.rsi.unwrap();
        assert!((rsi - 50.0).abs() < 1e-9);
    }

    #[test]
    fn matches_pandas_rolling_and_ewm() {
        // Reference values from pandas: rolling(20).std() and ewm(span=n).mean() on 1..=20
        let closes: Vec<CpuFloat> = (1..=20).map(|i| i as CpuFloat).collect();
        let rows = create_indicators(&flat_ticks(&closes)).unwrap();
        let close_enough = |a: Option<CpuFloat>, b: CpuFloat| {
            let a = a.unwrap();
            assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
        };
        close_enough(rows[19].indicators.volatility, 5.916079783099616);
        close_enough(rows[19].indicators.bb_upper, 10.5 + 2.0 * 35.0_f64.sqrt());
        close_enough(rows[19].indicators.bb_lower, 10.5 - 2.0 * 35.0_f64.sqrt());
        assert_eq!(rows[18].indicators.bb_upper, None);
        close_enough(rows[0].indicators.ema_12, 1.0);
        close_enough(rows[1].indicators.ema_12, 37.0 / 24.0);
        // EMA(12) - EMA(26) is 37/24 - 79/52 at the second row; the signal weighs it against 0
        close_enough(rows[0].indicators.macd, 0.0);
        close_enough(rows[1].indicators.macd, 7.0 / 312.0);
        close_enough(rows[1].indicators.macd_signal, 7.0 / 312.0 / 1.8);
    }

    #[test]
    fn lookup_by_name() {
        let frame = engineer(&random_walk_ticks(2).take(40).collect::<Vec<_>>()).unwrap();
        assert_eq!(frame.column_index(CLOSE).unwrap(), 3);
        assert!(matches!(
            frame.column_index("vwap"),
            Err(Error::MissingColumn(_))
        ));
        assert_eq!(frame.tail(5).len(), 5);
        assert_eq!(frame.tail(500).len(), frame.len());
    }
}
