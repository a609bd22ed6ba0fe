/*!
CSV tick files, and a quote provider that serves them
*/
use super::{normalize_ticks, parse_volume, Interval, QuoteProvider, Tick};
use crate::error::ProviderError;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Read tick data from a Reader.
///
/// Without a `date_format` rows are deserialized directly (ISO timestamps, as written by
/// [`write_ticks`]); with one, the first column is parsed using it and the rest are read
/// positionally as `open, high, low, close, volume`. Rows with prices that are not finite and
/// positive are rejected as malformed.
pub fn read_ticks<R: Read>(
    rdr: R,
    date_format: Option<&str>,
) -> Result<Vec<Tick>, ProviderError> {
    let date_format = if let Some(format) = date_format {
        format
    } else {
        let ticks = deserialize_ticks(rdr).collect::<Result<Vec<Tick>, csv::Error>>()?;
        for tick in &ticks {
            tick.validate()?;
        }
        return Ok(ticks);
    };
    let mut ticks = Vec::new();
    for (line, record) in csv::Reader::from_reader(rdr).into_records().enumerate() {
        let record = record?;
        let malformed =
            |what: &str| ProviderError::Malformed(format!("row {}: bad {}", line + 1, what));
        let mut fields = record.iter();
        let t = fields
            .next()
            .and_then(|first| NaiveDateTime::parse_from_str(first, date_format).ok())
            .ok_or_else(|| malformed("timestamp"))?;
        let mut price = |name: &str| {
            fields
                .next()
                .and_then(|field| f64::from_str(field.trim()).ok())
                .ok_or_else(|| malformed(name))
        };
        let o = price("open")?;
        let h = price("high")?;
        let l = price("low")?;
        let c = price("close")?;
        let v = fields
            .next()
            .and_then(parse_volume)
            .ok_or_else(|| malformed("volume"))?;
        let tick = Tick { t, o, h, l, c, v };
        tick.validate()?;
        ticks.push(tick);
    }
    Ok(ticks)
}

/// Deserialize tick data
pub fn deserialize_ticks<R: Read>(rdr: R) -> impl Iterator<Item = Result<Tick, csv::Error>> {
    csv::Reader::from_reader(rdr).into_deserialize()
}

/// Write tick data to a Writer
/// On success, return how many ticks were written
pub fn write_ticks<W, I>(wtr: W, ticks: I) -> Result<usize, csv::Error>
where
    W: Write,
    I: Iterator<Item = Tick>,
{
    let mut wtr = csv::Writer::from_writer(wtr);
    let mut written = 0;
    for tick in ticks {
        wtr.serialize(tick)?;
        written += 1;
    }
    wtr.flush()?;
    Ok(written)
}

/// Serves ticks from `<dir>/<SYMBOL>_<interval>.csv` files
#[derive(Debug, Clone)]
pub struct FileProvider {
    dir: PathBuf,
}

impl FileProvider {
    /// Create a provider over a directory of tick files
    pub fn new(dir: impl Into<PathBuf>) -> FileProvider {
        FileProvider { dir: dir.into() }
    }

    /// The file holding a symbol's ticks at an interval
    pub fn path_for(&self, symbol: &str, interval: Interval) -> PathBuf {
        self.dir.join(format!("{}_{}.csv", symbol, interval))
    }

    /// Store ticks for a symbol, replacing any existing file
    pub fn store(
        &self,
        symbol: &str,
        interval: Interval,
        ticks: &[Tick],
    ) -> Result<usize, ProviderError> {
        std::fs::create_dir_all(&self.dir)?;
        let file = File::create(self.path_for(symbol, interval))?;
        Ok(write_ticks(file, ticks.iter().copied())?)
    }
}

fn load(path: &Path, symbol: &str) -> Result<Vec<Tick>, ProviderError> {
    let file = File::open(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => {
            ProviderError::InvalidSymbol(format!("no tick file for symbol {}", symbol))
        }
        _ => ProviderError::Io(err),
    })?;
    Ok(normalize_ticks(read_ticks(file, None)?))
}

#[async_trait]
impl QuoteProvider for FileProvider {
    async fn fetch_intraday(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Result<Vec<Tick>, ProviderError> {
        let path = self.path_for(symbol, interval);
        let symbol = symbol.to_string();
        tokio::task::spawn_blocking(move || load(&path, &symbol))
            .await
            .map_err(|err| ProviderError::Malformed(format!("tick file reader failed: {}", err)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PROVIDER_DATETIME;

    #[test]
    fn reads_provider_formatted_rows() {
        let data = "timestamp,open,high,low,close,volume\n\
                    2024-01-05 10:00:00,180.0,181.0,179.5,181.1,900\n\
                    2024-01-05 10:05:00,181.1,181.5,180.9,181.2,1200\n";
        let ticks = read_ticks(data.as_bytes(), Some(PROVIDER_DATETIME)).unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[1].h, 181.5);
        assert_eq!(ticks[1].v, 1200);
    }

    #[test]
    fn bad_rows_are_errors() {
        let data = "timestamp,open,high,low,close,volume\n2024-01-05 10:00:00,abc,1,1,1,1\n";
        assert!(read_ticks(data.as_bytes(), Some(PROVIDER_DATETIME)).is_err());
    }

    #[test]
    fn impossible_prices_are_errors() {
        for row in [
            "2024-01-05 10:00:00,NaN,1,1,1,1",
            "2024-01-05 10:00:00,1,inf,1,1,1",
            "2024-01-05 10:00:00,1,1,0,1,1",
            "2024-01-05 10:00:00,1,1,1,-2,1",
            "2024-01-05 10:00:00,1,1,1,1,-7",
        ] {
            let data = format!("timestamp,open,high,low,close,volume\n{}\n", row);
            assert!(
                matches!(
                    read_ticks(data.as_bytes(), Some(PROVIDER_DATETIME)),
                    Err(ProviderError::Malformed(_))
                ),
                "{} should be rejected",
                row
            );
        }
        let data = "timestamp,open,high,low,close,volume\n\
                    2024-01-05T10:00:00,1.0,1.0,1.0,0.0,5\n";
        assert!(matches!(
            read_ticks(data.as_bytes(), None),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn missing_file_is_invalid_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileProvider::new(dir.path());
        assert!(matches!(
            provider.fetch_intraday("NOPE", Interval::Min5).await,
            Err(ProviderError::InvalidSymbol(_))
        ));
    }
}
