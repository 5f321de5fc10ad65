// =============================================================================
// Event Router — scheduled + reactive publication fan-out
// =============================================================================
//
// The router's 60 s loop is the only caller of the strategy engine, so the
// engine state needs no lock. Each tick:
//
//   1. Read the latest sample and feed it to the strategy engine.
//   2. Forward any trade events to the chat channel (the trade itself is
//      already in the trade ledger; nothing else is persisted).
//   3. Evaluate the scheduled events (hourly update, N-hour summary,
//      volatility alert, daily summary) against the wall clock.
//
// Scheduled events are deduplicated through the activity ledger: a row whose
// timestamp falls in the same bucket (hour, 15-minute window, or day)
// suppresses the publication. The activity row is written only after the
// publish succeeded, so a publisher failure can cause a late post but never
// a phantom ledger entry.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Timelike, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chart::{self, PricePoint};
use crate::messaging::{self, percent_change};
use crate::publisher::{Chat, Microblog, PublishError};
use crate::store::Store;
use crate::strategy::StrategyEngine;
use crate::types::{ActivityKind, BotActivity, Sample, TradeEvent};

/// UTC hours at which the N-hour summary fires.
const SUMMARY_HOURS: [u32; 8] = [0, 3, 6, 9, 12, 15, 18, 21];
/// Look-back window for the N-hour summary.
const SUMMARY_LOOKBACK_HOURS: i64 = 3;
/// Minimum gap between volatility checks.
const VOLATILITY_CHECK_MINUTES: i64 = 15;
/// Absolute percent move that counts as volatility.
const VOLATILITY_THRESHOLD_PCT: f64 = 2.0;
/// UTC hour of the daily summary.
const DAILY_SUMMARY_HOUR: u32 = 20;
/// Fallback wait when a rate-limit response carries no reset time.
const RATE_LIMIT_FALLBACK_SECS: u64 = 15 * 60;

/// Per-feature enable flags.
#[derive(Debug, Clone)]
pub struct RouterFlags {
    pub hourly_update: bool,
    pub n_hour_summary: bool,
    pub volatility_alert: bool,
    pub daily_summary: bool,
}

impl Default for RouterFlags {
    fn default() -> Self {
        Self {
            hourly_update: true,
            n_hour_summary: true,
            volatility_alert: true,
            daily_summary: true,
        }
    }
}

// =============================================================================
// Scheduling predicates
// =============================================================================

/// Scheduled posts only go out in the first five minutes of their hour.
fn within_posting_window(now: DateTime<Utc>) -> bool {
    now.minute() < 5
}

/// Two instants share an hour bucket when date and hour both match.
fn same_hour_bucket(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.date_naive() == b.date_naive() && a.hour() == b.hour()
}

/// 15-minute bucket index of an instant.
fn quarter_bucket(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(900)
}

fn is_summary_hour(hour: u32) -> bool {
    SUMMARY_HOURS.contains(&hour)
}

/// Round to cents, the precision quoted in hourly posts.
fn round2(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

// =============================================================================
// Router
// =============================================================================

pub struct Router {
    store: Arc<dyn Store>,
    engine: StrategyEngine,
    microblog: Arc<dyn Microblog>,
    chat: Arc<dyn Chat>,
    chat_id: i64,
    symbol: String,
    chart_dir: PathBuf,
    flags: RouterFlags,
    tick_period: StdDuration,
    /// Rounded price quoted in the previous hourly post.
    last_posted_price: Option<f64>,
    /// Time and price of the previous volatility check.
    volatility_cursor: Option<(DateTime<Utc>, f64)>,
    cancel: CancellationToken,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        engine: StrategyEngine,
        microblog: Arc<dyn Microblog>,
        chat: Arc<dyn Chat>,
        chat_id: i64,
        symbol: impl Into<String>,
        chart_dir: PathBuf,
        flags: RouterFlags,
        tick_period: StdDuration,
    ) -> Self {
        Self {
            store,
            engine,
            microblog,
            chat,
            chat_id,
            symbol: symbol.into(),
            chart_dir,
            flags,
            tick_period,
            last_posted_price: None,
            volatility_cursor: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the routing loop until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        self.cancel = cancel.clone();
        info!(
            period_secs = self.tick_period.as_secs(),
            flags = ?self.flags,
            "event router started"
        );

        let mut ticker = tokio::time::interval(self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("event router stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.tick(Utc::now()).await {
                error!(error = %e, "router tick failed");
            }
        }
    }

    /// One routing pass at the given wall-clock instant.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        let Some(sample) = self
            .store
            .latest_sample(&self.symbol)
            .await
            .context("reading latest sample")?
        else {
            debug!("no samples yet — router idle");
            return Ok(());
        };

        let events = self
            .engine
            .process(&sample)
            .await
            .context("strategy processing")?;
        for event in &events {
            self.publish_trade_event(event).await;
        }

        if self.flags.hourly_update {
            self.maybe_hourly(&sample, now).await?;
        }
        if self.flags.n_hour_summary {
            self.maybe_n_hour_summary(&sample, now).await?;
        }
        if self.flags.volatility_alert {
            self.maybe_volatility(&sample, now).await?;
        }
        if self.flags.daily_summary {
            self.maybe_daily(&sample, now).await?;
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trade events
    // -------------------------------------------------------------------------

    /// Forward a buy/sell to the chat channel. The trade is already in the
    /// trade ledger, so a publish failure only costs the notification.
    async fn publish_trade_event(&self, event: &TradeEvent) {
        let body = match event {
            TradeEvent::Buy { ts, price, .. } => messaging::buy_signal(*price, *ts),
            TradeEvent::Sell {
                ts,
                price,
                pnl,
                time_held,
                updated_capital,
                ..
            } => messaging::sell_signal(*price, *pnl, *time_held, *updated_capital, *ts),
        };

        if let Err(e) = self
            .chat
            .send_message(self.chat_id, &body, Some("Markdown"))
            .await
        {
            error!(error = %e, "trade notification failed");
        }
    }

    // -------------------------------------------------------------------------
    // Scheduled events
    // -------------------------------------------------------------------------

    async fn maybe_hourly(&mut self, sample: &Sample, now: DateTime<Utc>) -> Result<()> {
        if !within_posting_window(now) {
            return Ok(());
        }

        let prev = self
            .store
            .latest_activity(ActivityKind::HourlyUpdate)
            .await
            .context("reading hourly ledger")?;
        if let Some(prev) = &prev {
            if same_hour_bucket(prev.ts, now) {
                return Ok(());
            }
        }

        let current = round2(sample.last);
        // The quoted percent change compares rounded post prices; the ledger
        // keeps the full-precision sample price.
        let reference = self
            .last_posted_price
            .or_else(|| prev.as_ref().map(|p| round2(p.price)));
        let Some(reference) = reference else {
            debug!(price = current, "seeding hourly reference price");
            self.last_posted_price = Some(current);
            return Ok(());
        };

        let text = messaging::hourly_update(reference, current, now);
        if self.publish_microblog(&text, None).await {
            self.store
                .append_activity(&BotActivity {
                    ts: now,
                    kind: ActivityKind::HourlyUpdate,
                    price: sample.last,
                    summary_text: Some(text),
                })
                .await
                .context("recording hourly activity")?;
            self.last_posted_price = Some(current);
        }
        Ok(())
    }

    async fn maybe_n_hour_summary(
        &mut self,
        sample: &Sample,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !is_summary_hour(now.hour()) || !within_posting_window(now) {
            return Ok(());
        }

        if let Some(prev) = self
            .store
            .latest_activity(ActivityKind::NHourSummary)
            .await
            .context("reading summary ledger")?
        {
            if same_hour_bucket(prev.ts, now) {
                return Ok(());
            }
        }

        let t0 = now - Duration::hours(SUMMARY_LOOKBACK_HOURS);
        let samples = self
            .store
            .samples_since(&self.symbol, t0)
            .await
            .context("reading summary window")?;
        if samples.len() < 2 {
            debug!(count = samples.len(), "too few samples for summary");
            return Ok(());
        }

        let support = samples.iter().map(|s| s.last).fold(f64::INFINITY, f64::min);
        let resistance = samples
            .iter()
            .map(|s| s.last)
            .fold(f64::NEG_INFINITY, f64::max);
        let pct = percent_change(samples[0].last, sample.last);
        let text = messaging::n_hour_summary(pct, support, resistance, sample.last, now);

        let points: Vec<PricePoint> = samples
            .iter()
            .map(|s| PricePoint {
                ts: s.ts,
                price: s.last,
                volume: s.volume,
            })
            .collect();
        let chart_path = match chart::render_candle_chart(&points, &self.chart_dir, now) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "chart rendering failed — posting text only");
                None
            }
        };

        let published = self.publish_microblog(&text, chart_path.as_deref()).await;
        if published {
            self.store
                .append_activity(&BotActivity {
                    ts: now,
                    kind: ActivityKind::NHourSummary,
                    price: sample.last,
                    summary_text: Some(text),
                })
                .await
                .context("recording summary activity")?;
        }
        Ok(())
    }

    async fn maybe_volatility(&mut self, sample: &Sample, now: DateTime<Utc>) -> Result<()> {
        let Some((checked_at, checked_price)) = self.volatility_cursor else {
            self.volatility_cursor = Some((now, sample.last));
            return Ok(());
        };
        if now - checked_at < Duration::minutes(VOLATILITY_CHECK_MINUTES) {
            return Ok(());
        }
        // The cursor advances on every completed check, alert or not.
        self.volatility_cursor = Some((now, sample.last));

        let pct = percent_change(checked_price, sample.last);
        if pct.abs() < VOLATILITY_THRESHOLD_PCT {
            return Ok(());
        }

        if let Some(prev) = self
            .store
            .latest_activity(ActivityKind::VolatilityAlert)
            .await
            .context("reading volatility ledger")?
        {
            if quarter_bucket(prev.ts) == quarter_bucket(now) {
                return Ok(());
            }
        }

        let text = messaging::volatility_alert(checked_price, sample.last, now);
        if self.publish_microblog(&text, None).await {
            self.store
                .append_activity(&BotActivity {
                    ts: now,
                    kind: ActivityKind::VolatilityAlert,
                    price: sample.last,
                    summary_text: Some(text),
                })
                .await
                .context("recording volatility activity")?;
        }
        Ok(())
    }

    async fn maybe_daily(&mut self, sample: &Sample, now: DateTime<Utc>) -> Result<()> {
        if now.hour() != DAILY_SUMMARY_HOUR || !within_posting_window(now) {
            return Ok(());
        }

        if let Some(prev) = self
            .store
            .latest_activity(ActivityKind::DailySummary)
            .await
            .context("reading daily ledger")?
        {
            if prev.ts.date_naive() == now.date_naive() {
                return Ok(());
            }
        }

        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(now);
        let samples = self
            .store
            .samples_since(&self.symbol, midnight)
            .await
            .context("reading daily window")?;
        if samples.is_empty() {
            return Ok(());
        }

        let high = samples.iter().map(|s| s.last).fold(f64::NEG_INFINITY, f64::max);
        let low = samples.iter().map(|s| s.last).fold(f64::INFINITY, f64::min);
        let text = messaging::daily_summary(high, low);

        if self.publish_microblog(&text, None).await {
            self.store
                .append_activity(&BotActivity {
                    ts: now,
                    kind: ActivityKind::DailySummary,
                    price: sample.last,
                    summary_text: Some(text),
                })
                .await
                .context("recording daily activity")?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Publishing
    // -------------------------------------------------------------------------

    /// Post to the microblog, honouring one rate-limit wait-and-retry.
    /// Returns whether the post went out.
    async fn publish_microblog(&self, body: &str, image: Option<&std::path::Path>) -> bool {
        match self.post_once(body, image).await {
            Ok(()) => true,
            Err(PublishError::RateLimited { reset_at }) => {
                // A reset already in the past clamps to an immediate retry.
                let wait = match reset_at {
                    Some(t) => (t - Utc::now()).to_std().unwrap_or(StdDuration::ZERO),
                    None => StdDuration::from_secs(RATE_LIMIT_FALLBACK_SECS),
                };
                warn!(wait_secs = wait.as_secs(), "rate limited — waiting for reset");
                tokio::select! {
                    _ = self.cancel.cancelled() => return false,
                    _ = tokio::time::sleep(wait) => {}
                }
                match self.post_once(body, image).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(error = %e, "microblog publish failed after rate-limit retry");
                        false
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "microblog publish failed");
                false
            }
        }
    }

    async fn post_once(
        &self,
        body: &str,
        image: Option<&std::path::Path>,
    ) -> Result<(), PublishError> {
        match image {
            Some(path) => self.microblog.post_with_image(body, path).await,
            None => self.microblog.post_text(body).await,
        }
    }
}
