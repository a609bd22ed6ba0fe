/*!
Data processing and IO functions
*/
use crate::error::ProviderError;
use crate::*;
use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;
use ta::{Close, High, Low, Open, Volume};

pub mod alpha_vantage;
pub mod fake;
pub mod file;
pub mod scale;

/// The provider DateTime format
pub const PROVIDER_DATETIME: &str = "%Y-%m-%d %H:%M:%S";

/// One OHLCV bar for a stock
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Tick {
    /// This tick's timestamp
    #[serde(rename = "timestamp")]
    pub t: NaiveDateTime,
    /// The opening price of this tick
    #[serde(rename = "open")]
    pub o: CpuFloat,
    /// The high price of this tick
    #[serde(rename = "high")]
    pub h: CpuFloat,
    /// The low price of this tick
    #[serde(rename = "low")]
    pub l: CpuFloat,
    /// The closing price of this tick
    #[serde(rename = "close")]
    pub c: CpuFloat,
    /// The volume traded this tick
    #[serde(rename = "volume")]
    pub v: u64,
}

impl Tick {
    /// Check that every price is a finite positive number
    pub fn validate(&self) -> Result<(), ProviderError> {
        let prices = [
            ("open", self.o),
            ("high", self.h),
            ("low", self.l),
            ("close", self.c),
        ];
        for (name, price) in prices {
            if !(price.is_finite() && price > 0.0) {
                return Err(ProviderError::Malformed(format!(
                    "{} price {} at {} is not a positive number",
                    name, price, self.t
                )));
            }
        }
        Ok(())
    }
}

/// Parse a volume field, accepting integral or fractional non-negative counts
pub fn parse_volume(field: &str) -> Option<u64> {
    let field = field.trim();
    field.parse::<u64>().ok().or_else(|| {
        field
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v as u64)
    })
}

impl Open for Tick {
    #[inline]
    fn open(&self) -> f64 {
        self.o
    }
}

impl High for Tick {
    #[inline]
    fn high(&self) -> f64 {
        self.h
    }
}

impl Low for Tick {
    #[inline]
    fn low(&self) -> f64 {
        self.l
    }
}

impl Close for Tick {
    #[inline]
    fn close(&self) -> f64 {
        self.c
    }
}

impl Volume for Tick {
    #[inline]
    fn volume(&self) -> f64 {
        self.v as f64
    }
}

/// Sampling granularity of intraday data
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Interval {
    /// One minute bars
    #[serde(rename = "1min")]
    Min1,
    /// Five minute bars
    #[serde(rename = "5min")]
    Min5,
    /// Fifteen minute bars
    #[serde(rename = "15min")]
    Min15,
    /// Thirty minute bars
    #[serde(rename = "30min")]
    Min30,
    /// Hourly bars
    #[serde(rename = "60min")]
    Min60,
}

impl Interval {
    /// Every supported interval, finest first
    pub const ALL: [Interval; 5] = [
        Interval::Min1,
        Interval::Min5,
        Interval::Min15,
        Interval::Min30,
        Interval::Min60,
    ];

    /// The provider's name for this interval
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Min1 => "1min",
            Interval::Min5 => "5min",
            Interval::Min15 => "15min",
            Interval::Min30 => "30min",
            Interval::Min60 => "60min",
        }
    }

    /// The length of one bar
    pub fn duration(&self) -> Duration {
        match self {
            Interval::Min1 => Duration::minutes(1),
            Interval::Min5 => Duration::minutes(5),
            Interval::Min15 => Duration::minutes(15),
            Interval::Min30 => Duration::minutes(30),
            Interval::Min60 => Duration::minutes(60),
        }
    }
}

impl Default for Interval {
    fn default() -> Interval {
        Interval::Min5
    }
}

impl Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Interval, ProviderError> {
        Interval::ALL
            .iter()
            .copied()
            .find(|interval| interval.as_str() == s)
            .ok_or_else(|| ProviderError::InvalidInterval(s.to_string()))
    }
}

/// A provider record before normalization: string fields, keyed by field name
pub type RawBar = BTreeMap<String, String>;

/// A provider time series before normalization, keyed by timestamp string
pub type RawSeries = BTreeMap<String, RawBar>;

/// Look up a raw field either by its bare name (`"open"`) or its numbered provider name (`"1. open"`)
fn raw_field<'a>(bar: &'a RawBar, name: &str) -> Option<&'a str> {
    bar.iter()
        .find(|(key, _)| {
            let key = key.as_str();
            key == name || key.split_once(". ").map(|(_, bare)| bare) == Some(name)
        })
        .map(|(_, value)| value.as_str())
}

/// Normalize raw provider records into chronologically sorted ticks with unique timestamps.
///
/// Records whose timestamp or fields cannot be parsed, whose prices are not finite and positive,
/// or whose volume is negative are rejected as malformed. Duplicate timestamps keep the last
/// record seen.
pub fn process_series(raw: &RawSeries) -> Result<Vec<Tick>, ProviderError> {
    let mut ticks = BTreeMap::new();
    for (stamp, bar) in raw {
        let t = NaiveDateTime::parse_from_str(stamp, PROVIDER_DATETIME)
            .map_err(|err| ProviderError::Malformed(format!("timestamp '{}': {}", stamp, err)))?;
        let price = |name: &str| -> Result<CpuFloat, ProviderError> {
            raw_field(bar, name)
                .and_then(|field| field.trim().parse::<CpuFloat>().ok())
                .ok_or_else(|| {
                    ProviderError::Malformed(format!("field '{}' missing at {}", name, stamp))
                })
        };
        let volume = raw_field(bar, "volume")
            .and_then(parse_volume)
            .ok_or_else(|| {
                ProviderError::Malformed(format!(
                    "field 'volume' missing or negative at {}",
                    stamp
                ))
            })?;
        let tick = Tick {
            t,
            o: price("open")?,
            h: price("high")?,
            l: price("low")?,
            c: price("close")?,
            v: volume,
        };
        tick.validate()?;
        ticks.insert(t, tick);
    }
    Ok(ticks.into_values().collect())
}

/// Sort ticks chronologically and drop duplicate timestamps, keeping the last occurrence
pub fn normalize_ticks(ticks: Vec<Tick>) -> Vec<Tick> {
    let mut by_time = BTreeMap::new();
    for tick in ticks {
        by_time.insert(tick.t, tick);
    }
    by_time.into_values().collect()
}

/// A source of intraday tick data
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    /// Fetch the full available intraday series for a symbol, sorted ascending by timestamp.
    /// Every tick has finite positive prices
    async fn fetch_intraday(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Result<Vec<Tick>, ProviderError>;

    /// Whether this provider has the credentials it needs
    fn is_configured(&self) -> bool {
        true
    }
}
