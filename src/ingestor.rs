// =============================================================================
// Ingestor — periodic ticker poller feeding the sample stream
// =============================================================================
//
// One logical worker. Every 60 s it fetches a ticker snapshot, normalizes it
// into a `Sample`, and appends it to the store. Failed fetches are retried
// inside the cycle with exponential backoff (base 2 s, jitter ±1 s, 5
// attempts); when the budget is exhausted the cycle is skipped and the loop
// resumes at the next tick. A snapshot whose exchange timestamp is at or
// before the latest stored sample is a duplicate and is discarded, which
// keeps the per-symbol stream monotonic.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bitstamp::{BitstampClient, TickerError, TickerSnapshot};
use crate::messaging::percent_change;
use crate::store::Store;
use crate::types::Sample;

/// Retry budget per poll cycle.
const MAX_FETCH_ATTEMPTS: u32 = 5;
/// Base backoff between retries.
const BACKOFF_BASE_SECS: f64 = 2.0;
/// Jitter applied to each backoff, in seconds (±).
const BACKOFF_JITTER_SECS: f64 = 1.0;

pub struct Ingestor {
    store: Arc<dyn Store>,
    client: BitstampClient,
    symbol: String,
    poll_period: Duration,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn Store>,
        client: BitstampClient,
        symbol: impl Into<String>,
        poll_period: Duration,
    ) -> Self {
        Self {
            store,
            client,
            symbol: symbol.into(),
            poll_period,
        }
    }

    /// Run the polling loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            symbol = %self.symbol,
            period_secs = self.poll_period.as_secs(),
            "ingestor started"
        );

        let mut ticker = tokio::time::interval(self.poll_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("ingestor stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.poll_once(&cancel).await {
                warn!(error = %e, "poll cycle skipped");
            }
        }
    }

    /// One full poll cycle: fetch (with retries), normalize, append.
    async fn poll_once(&self, cancel: &CancellationToken) -> Result<()> {
        let snapshot = self.fetch_with_retry(cancel).await?;

        let previous = self
            .store
            .latest_sample(&self.symbol)
            .await
            .context("reading latest sample")?;

        if !advances_stream(previous.as_ref(), &snapshot) {
            debug!(ts = %snapshot.ts, "stale snapshot discarded");
            return Ok(());
        }

        let sample = self.normalize(&snapshot, previous.as_ref());
        self.store
            .append_sample(&sample)
            .await
            .context("appending sample")?;

        debug!(
            ts = %sample.ts,
            last = sample.last,
            pct_change = ?sample.pct_change,
            "sample stored"
        );
        Ok(())
    }

    /// Turn a snapshot into a `Sample`, computing the percent change against
    /// the previously stored sample.
    fn normalize(&self, snapshot: &TickerSnapshot, previous: Option<&Sample>) -> Sample {
        let pct_change = previous.map(|prev| percent_change(prev.last, snapshot.last));
        Sample {
            ts: snapshot.ts,
            symbol: self.symbol.clone(),
            last: snapshot.last,
            open: snapshot.open,
            high: snapshot.high,
            low: snapshot.low,
            vwap: snapshot.vwap,
            volume: snapshot.volume,
            bid: snapshot.bid,
            ask: snapshot.ask,
            pct_change_24h: snapshot.pct_change_24h,
            pct_change,
        }
    }

    async fn fetch_with_retry(
        &self,
        cancel: &CancellationToken,
    ) -> Result<TickerSnapshot, TickerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.fetch().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if attempt >= MAX_FETCH_ATTEMPTS => {
                    warn!(attempt, error = %e, "fetch retry budget exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "ticker fetch failed — backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// A snapshot only enters the stream when its exchange timestamp is strictly
/// newer than the latest stored sample, keeping per-symbol order monotonic.
fn advances_stream(previous: Option<&Sample>, snapshot: &TickerSnapshot) -> bool {
    previous.map_or(true, |prev| snapshot.ts > prev.ts)
}

/// Exponential backoff with jitter: `2^(attempt-1) * base ± 1 s`.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_SECS * 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = rand::thread_rng().gen_range(-BACKOFF_JITTER_SECS..=BACKOFF_JITTER_SECS);
    Duration::from_secs_f64((exp + jitter).max(0.1))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::SYMBOL;
    use chrono::{DateTime, TimeZone, Utc};

    fn snapshot(ts: DateTime<Utc>, last: f64) -> TickerSnapshot {
        TickerSnapshot {
            ts,
            last,
            open: last,
            high: last,
            low: last,
            vwap: last,
            volume: 1000.0,
            bid: last,
            ask: last,
            pct_change_24h: 0.0,
        }
    }

    fn ingestor(store: Arc<MemoryStore>) -> Ingestor {
        Ingestor::new(
            store,
            BitstampClient::new("xrpusd"),
            SYMBOL,
            Duration::from_secs(60),
        )
    }

    #[test]
    fn backoff_grows_with_attempts_within_jitter() {
        for attempt in 1..=4u32 {
            let expected = BACKOFF_BASE_SECS * 2f64.powi(attempt as i32 - 1);
            for _ in 0..20 {
                let delay = backoff_delay(attempt).as_secs_f64();
                assert!(delay >= expected - BACKOFF_JITTER_SECS - 1e-9);
                assert!(delay <= expected + BACKOFF_JITTER_SECS + 1e-9);
            }
        }
    }

    #[tokio::test]
    async fn first_sample_has_no_pct_change() {
        let store = Arc::new(MemoryStore::new());
        let ing = ingestor(store);

        let ts = Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap();
        let sample = ing.normalize(&snapshot(ts, 0.57), None);
        assert!(sample.pct_change.is_none());
        assert_eq!(sample.symbol, SYMBOL);
    }

    #[test]
    fn stream_stays_monotonic_per_symbol() {
        let t0 = Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 9, 1, 12, 1, 0).unwrap();
        let prev = Sample {
            ts: t1,
            symbol: SYMBOL.to_string(),
            last: 0.57,
            open: 0.57,
            high: 0.57,
            low: 0.57,
            vwap: 0.57,
            volume: 0.0,
            bid: 0.57,
            ask: 0.57,
            pct_change_24h: 0.0,
            pct_change: None,
        };

        // No history: everything advances.
        assert!(advances_stream(None, &snapshot(t0, 0.57)));
        // Same or older exchange timestamp: duplicate, discarded.
        assert!(!advances_stream(Some(&prev), &snapshot(t1, 0.58)));
        assert!(!advances_stream(Some(&prev), &snapshot(t0, 0.58)));
        // Strictly newer: accepted.
        let t2 = Utc.with_ymd_and_hms(2024, 9, 1, 12, 2, 0).unwrap();
        assert!(advances_stream(Some(&prev), &snapshot(t2, 0.58)));
    }

    #[tokio::test]
    async fn pct_change_computed_against_previous_sample() {
        let store = Arc::new(MemoryStore::new());
        let ing = ingestor(store);

        let t0 = Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 9, 1, 12, 1, 0).unwrap();
        let prev = ing.normalize(&snapshot(t0, 0.50), None);
        let next = ing.normalize(&snapshot(t1, 0.51), Some(&prev));

        assert!((next.pct_change.unwrap() - 2.0).abs() < 1e-9);
    }
}
