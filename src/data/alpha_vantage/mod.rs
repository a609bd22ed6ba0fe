/*!
[Alpha Vantage](https://www.alphavantage.co/)-specific data fetching code
*/
use super::{process_series, Interval, QuoteProvider, RawSeries, Tick};
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// The default Alpha Vantage endpoint
pub const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co";

/// Fetches intraday series from the Alpha Vantage `TIME_SERIES_INTRADAY` function
#[derive(Debug, Clone)]
pub struct AlphaVantage {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl AlphaVantage {
    /// Create a client against a base URL, with an optional per-request timeout
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<AlphaVantage, ProviderError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(AlphaVantage {
            client: builder.build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.is_empty()),
        })
    }
}

/// Classify a decoded provider response, extracting the time series for `interval`.
///
/// `"Error Message"` marks an invalid symbol, `"Note"` and `"Information"` mark rate limiting.
pub fn parse_response(body: &Value, interval: Interval) -> Result<RawSeries, ProviderError> {
    if let Some(message) = body.get("Error Message") {
        return Err(ProviderError::InvalidSymbol(text(message)));
    }
    if let Some(note) = body.get("Note").or_else(|| body.get("Information")) {
        return Err(ProviderError::RateLimited(text(note)));
    }
    let key = format!("Time Series ({})", interval);
    let series = match body.get(&key) {
        Some(series) => series,
        None => {
            let available: Vec<&str> = body
                .as_object()
                .map(|obj| obj.keys().map(String::as_str).collect())
                .unwrap_or_default();
            return Err(ProviderError::Malformed(format!(
                "failed to fetch data, available keys: {:?}",
                available
            )));
        }
    };
    serde_json::from_value(series.clone())
        .map_err(|err| ProviderError::Malformed(format!("bad time series: {}", err)))
}

fn text(value: &Value) -> String {
    value
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

#[async_trait]
impl QuoteProvider for AlphaVantage {
    async fn fetch_intraday(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Result<Vec<Tick>, ProviderError> {
        let api_key = self.api_key.as_deref().ok_or(ProviderError::MissingApiKey)?;
        let url = format!("{}/query", self.base_url);
        debug!(symbol, %interval, "fetching intraday series");
        let body: Value = self
            .client
            .get(&url)
            .query(&[
                ("function", "TIME_SERIES_INTRADAY"),
                ("symbol", symbol),
                ("interval", interval.as_str()),
                ("apikey", api_key),
                ("outputsize", "full"),
                ("datatype", "json"),
            ])
            .send()
            .await?
            .json()
            .await?;
        let raw = parse_response(&body, interval).map_err(|err| {
            warn!(symbol, error = %err, "provider rejected request");
            err
        })?;
        let ticks = process_series(&raw)?;
        debug!(symbol, rows = ticks.len(), "fetched intraday series");
        Ok(ticks)
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}
