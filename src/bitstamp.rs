// =============================================================================
// Bitstamp Ticker Client — typed fetch of one public ticker snapshot
// =============================================================================
//
// The v2 ticker endpoint is public (no signing). Numeric fields arrive as
// JSON strings and are parsed eagerly; a missing or non-positive `last`
// rejects the whole payload. Every call carries a 10 s total deadline set on
// the underlying HTTP client. The client never retries; retry policy
// belongs to the ingestor.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

/// Total deadline applied to each ticker request.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Failure modes of a single ticker fetch.
#[derive(Debug, Error)]
pub enum TickerError {
    /// Transport failure, timeout, or a non-2xx response.
    #[error("ticker network failure: {0}")]
    Network(String),
    /// The response body did not decode into a usable snapshot.
    #[error("malformed ticker payload: {0}")]
    Malformed(String),
}

/// Raw wire shape of the Bitstamp v2 ticker. All numerics are strings.
#[derive(Debug, Deserialize)]
struct RawTicker {
    timestamp: String,
    last: String,
    open: String,
    high: String,
    low: String,
    vwap: String,
    volume: String,
    bid: String,
    ask: String,
    #[serde(default)]
    percent_change_24: Option<String>,
}

/// A validated ticker observation ready for normalization into a `Sample`.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerSnapshot {
    pub ts: DateTime<Utc>,
    pub last: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub vwap: f64,
    pub volume: f64,
    pub bid: f64,
    pub ask: f64,
    pub pct_change_24h: f64,
}

/// HTTP client for the Bitstamp public ticker endpoint.
#[derive(Debug, Clone)]
pub struct BitstampClient {
    http: reqwest::Client,
    url: String,
}

impl BitstampClient {
    /// Create a client for the given currency pair, e.g. `"xrpusd"`.
    pub fn new(pair: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            url: format!("https://www.bitstamp.net/api/v2/ticker/{pair}/"),
        }
    }

    /// Fetch and validate one ticker snapshot.
    #[instrument(skip(self), name = "bitstamp::fetch")]
    pub async fn fetch(&self) -> Result<TickerSnapshot, TickerError> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| TickerError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TickerError::Network(format!(
                "ticker endpoint returned {status}"
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| TickerError::Network(e.to_string()))?;

        let snapshot = parse_ticker(&body)?;
        debug!(last = snapshot.last, vwap = snapshot.vwap, "ticker fetched");
        Ok(snapshot)
    }
}

/// Decode and validate a raw ticker body.
fn parse_ticker(body: &str) -> Result<TickerSnapshot, TickerError> {
    let raw: RawTicker =
        serde_json::from_str(body).map_err(|e| TickerError::Malformed(e.to_string()))?;

    let secs: i64 = raw
        .timestamp
        .parse()
        .map_err(|_| TickerError::Malformed(format!("bad timestamp '{}'", raw.timestamp)))?;
    let ts = DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| TickerError::Malformed(format!("timestamp {secs} out of range")))?;

    let last = parse_price_field(&raw.last, "last")?;
    if last <= 0.0 {
        return Err(TickerError::Malformed(format!(
            "non-positive last price {last}"
        )));
    }

    Ok(TickerSnapshot {
        ts,
        last,
        open: parse_price_field(&raw.open, "open")?,
        high: parse_price_field(&raw.high, "high")?,
        low: parse_price_field(&raw.low, "low")?,
        vwap: parse_price_field(&raw.vwap, "vwap")?,
        volume: parse_price_field(&raw.volume, "volume")?,
        bid: parse_price_field(&raw.bid, "bid")?,
        ask: parse_price_field(&raw.ask, "ask")?,
        pct_change_24h: raw
            .percent_change_24
            .as_deref()
            .map(|s| parse_price_field(s, "percent_change_24"))
            .transpose()?
            .unwrap_or(0.0),
    })
}

/// Bitstamp sends numeric values as JSON strings.
fn parse_price_field(value: &str, name: &str) -> Result<f64, TickerError> {
    value
        .parse::<f64>()
        .map_err(|_| TickerError::Malformed(format!("failed to parse {name}='{value}' as f64")))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const VALID_BODY: &str = r#"{
        "timestamp": "1722500000",
        "open": "0.5712",
        "high": "0.5800",
        "low": "0.5650",
        "last": "0.5750",
        "volume": "12345678.90",
        "vwap": "0.5731",
        "bid": "0.5749",
        "ask": "0.5751",
        "side": "0",
        "open_24": "0.5712",
        "percent_change_24": "0.67"
    }"#;

    #[test]
    fn parse_valid_ticker() {
        let snap = parse_ticker(VALID_BODY).expect("should parse");
        assert_eq!(snap.ts.timestamp(), 1_722_500_000);
        assert!((snap.last - 0.5750).abs() < f64::EPSILON);
        assert!((snap.vwap - 0.5731).abs() < f64::EPSILON);
        assert!((snap.pct_change_24h - 0.67).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_field_is_malformed() {
        let body = r#"{"timestamp": "1722500000", "last": "0.5750"}"#;
        match parse_ticker(body) {
            Err(TickerError::Malformed(_)) => {}
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn non_numeric_last_is_malformed() {
        let body = VALID_BODY.replace("\"0.5750\"", "\"not-a-price\"");
        assert!(matches!(
            parse_ticker(&body),
            Err(TickerError::Malformed(_))
        ));
    }

    #[test]
    fn non_positive_last_is_malformed() {
        let body = VALID_BODY.replace("\"last\": \"0.5750\"", "\"last\": \"0.0\"");
        match parse_ticker(&body) {
            Err(TickerError::Malformed(msg)) => assert!(msg.contains("non-positive")),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn missing_percent_change_defaults_to_zero() {
        let body = VALID_BODY.replace("\"percent_change_24\": \"0.67\"", "\"trailing\": \"0\"");
        let snap = parse_ticker(&body).expect("should parse without 24h change");
        assert_eq!(snap.pct_change_24h, 0.0);
    }
}
