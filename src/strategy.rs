// =============================================================================
// Strategy Engine — single-position VWAP-deviation state machine
// =============================================================================
//
// States: flat <-> long. One engine instance exists per process and is
// driven serially by the router, so its in-memory state needs no lock.
//
// Entry:  (last - vwap) / vwap <= oversold_threshold, outside the
//         post-loss cooldown window. The maker fee is charged on entry.
// Exit:   any of trailing stop / take profit / stop loss. The maker fee is
//         charged again against capital-at-entry on exit.
//
// Every mutation is persisted as a fresh BotState snapshot; recovery after
// a crash replays nothing because `last_processed_ts` guards reprocessing.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use tracing::{error, info, warn};

use crate::store::Store;
use crate::types::{
    BotState, PositionState, Sample, SignalKind, TradeEvent, TradeSignal,
};

// =============================================================================
// Parameters
// =============================================================================

/// Tunable strategy parameters. Defaults match the production signal set.
#[derive(Debug, Clone)]
pub struct StrategyParams {
    /// Buy when `(last - vwap) / vwap` is at or below this (negative) value.
    pub oversold_threshold: f64,
    /// Exit when `last >= entry * (1 + take_profit)`.
    pub take_profit: f64,
    /// Exit when `last <= entry * (1 + stop_loss)` (negative value).
    pub stop_loss: f64,
    /// Trailing distance below the highest price since entry.
    pub trail_pct: f64,
    /// Minimum gap after a losing exit before the next buy.
    pub loss_cooldown: Duration,
    /// Venue maker fee, charged on both sides of a round trip.
    pub fee_pct: f64,
    /// Capital used when no prior state or ledger exists.
    pub initial_capital: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            oversold_threshold: -0.019,
            take_profit: 0.015,
            stop_loss: -0.02,
            trail_pct: 0.005,
            loss_cooldown: Duration::minutes(30),
            fee_pct: 0.0025,
            initial_capital: 12_800.0,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct StrategyEngine {
    params: StrategyParams,
    store: Arc<dyn Store>,
    state: BotState,
}

impl StrategyEngine {
    // -------------------------------------------------------------------------
    // Cold start
    // -------------------------------------------------------------------------

    /// Build an engine from persisted state, falling back to ledger recovery
    /// and finally to a fresh flat state.
    pub async fn bootstrap(
        store: Arc<dyn Store>,
        params: StrategyParams,
        symbol: &str,
    ) -> Result<Self> {
        let state = match store.load_bot_state().await {
            Ok(Some(state)) if state.invariants_hold() => {
                info!(
                    capital = state.capital,
                    position = %state.position,
                    "bot state loaded from store"
                );
                state
            }
            Ok(Some(state)) => {
                error!(
                    position = %state.position,
                    "persisted bot state violates invariants — recovering from ledger"
                );
                Self::recover_from_ledger(store.as_ref(), &params, symbol).await?
            }
            Ok(None) => {
                info!("no bot state found — recovering from ledger");
                Self::recover_from_ledger(store.as_ref(), &params, symbol).await?
            }
            Err(e) => {
                error!(error = %e, "bot state unreadable — recovering from ledger");
                Self::recover_from_ledger(store.as_ref(), &params, symbol).await?
            }
        };

        let engine = Self {
            params,
            store,
            state,
        };
        engine.save_state().await?;
        Ok(engine)
    }

    /// Reconstruct state from the trade ledger: an open BUY resumes the long
    /// position; otherwise start flat with the ledger capital (or the
    /// configured initial capital on a completely empty ledger).
    async fn recover_from_ledger(
        store: &dyn Store,
        params: &StrategyParams,
        symbol: &str,
    ) -> Result<BotState> {
        let latest = store
            .latest_trade_signal()
            .await
            .context("reading trade ledger for recovery")?;

        match latest {
            Some(signal) if signal.kind == SignalKind::Buy => {
                // The trailing stop was lost with the state row; re-arm it
                // from the entry price.
                let trail = signal.price * (1.0 - params.trail_pct);
                info!(
                    entry_price = signal.price,
                    capital = signal.updated_capital,
                    "resuming open long position from ledger"
                );
                Ok(BotState {
                    capital: signal.updated_capital,
                    position: PositionState::Long,
                    entry_price: Some(signal.price),
                    trailing_stop: Some(trail),
                    highest_since_entry: Some(signal.price),
                    last_processed_ts: Some(signal.ts),
                    entry_time: Some(signal.ts),
                    last_loss_time: None,
                })
            }
            Some(signal) => {
                info!(
                    capital = signal.updated_capital,
                    "ledger ends with a closed position — starting flat"
                );
                let mut state = BotState::flat(signal.updated_capital);
                state.last_processed_ts = Some(signal.ts);
                Ok(state)
            }
            None => {
                // Fresh deployment: skip history so the first run does not
                // replay every stored sample.
                let latest_ts = store
                    .latest_sample(symbol)
                    .await
                    .context("reading latest sample for recovery")?
                    .map(|s| s.ts);
                info!(
                    capital = params.initial_capital,
                    "empty ledger — starting flat with configured capital"
                );
                let mut state = BotState::flat(params.initial_capital);
                state.last_processed_ts = latest_ts;
                Ok(state)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Processing
    // -------------------------------------------------------------------------

    /// Evaluate one sample against the state machine.
    ///
    /// Idempotent on `sample.ts`: a sample at or before `last_processed_ts`
    /// is a no-op. A buy and an exit can trigger on the same sample; the buy
    /// is evaluated first and the exit checks run against the just-opened
    /// position.
    pub async fn process(&mut self, sample: &Sample) -> Result<Vec<TradeEvent>> {
        if let Some(last_ts) = self.state.last_processed_ts {
            if sample.ts <= last_ts {
                return Ok(Vec::new());
            }
        }
        self.state.last_processed_ts = Some(sample.ts);

        let mut events = Vec::new();

        if self.state.position == PositionState::Flat {
            if let Some(event) = self.try_enter(sample).await? {
                events.push(event);
            }
        }

        if self.state.position == PositionState::Long {
            if let Some(event) = self.check_exit(sample).await? {
                events.push(event);
            }
        }

        // Persist the advanced timestamp even when nothing else changed.
        self.save_state().await?;

        for event in &events {
            self.apply_to_portfolios(event).await?;
        }

        Ok(events)
    }

    /// Current in-memory snapshot.
    pub fn state(&self) -> &BotState {
        &self.state
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    async fn try_enter(&mut self, sample: &Sample) -> Result<Option<TradeEvent>> {
        if sample.vwap <= 0.0 {
            warn!(vwap = sample.vwap, "sample has unusable vwap — skipping entry check");
            return Ok(None);
        }

        let dev = (sample.last - sample.vwap) / sample.vwap;
        if dev > self.params.oversold_threshold {
            return Ok(None);
        }

        if let Some(loss_time) = self.state.last_loss_time {
            let since_loss = sample.ts - loss_time;
            if since_loss < self.params.loss_cooldown {
                info!(
                    minutes_since_loss = since_loss.num_minutes(),
                    "oversold but inside loss cooldown — no entry"
                );
                return Ok(None);
            }
        }

        let price = sample.last;
        let fee = self.state.capital * self.params.fee_pct;
        self.state.capital -= fee;
        self.state.position = PositionState::Long;
        self.state.entry_price = Some(price);
        self.state.highest_since_entry = Some(price);
        self.state.trailing_stop = Some(price * (1.0 - self.params.trail_pct));
        self.state.entry_time = Some(sample.ts);

        info!(
            price,
            dev,
            fee,
            capital = self.state.capital,
            "buy signal — entering long"
        );

        self.store
            .append_trade_signal(&TradeSignal {
                ts: sample.ts,
                kind: SignalKind::Buy,
                price,
                pnl: None,
                pct_change: None,
                time_held_secs: None,
                updated_capital: self.state.capital,
            })
            .await
            .context("appending BUY signal")?;
        self.save_state().await?;

        Ok(Some(TradeEvent::Buy {
            ts: sample.ts,
            price,
            fee,
        }))
    }

    // -------------------------------------------------------------------------
    // Exit
    // -------------------------------------------------------------------------

    async fn check_exit(&mut self, sample: &Sample) -> Result<Option<TradeEvent>> {
        let (Some(entry), Some(entry_time)) = (self.state.entry_price, self.state.entry_time)
        else {
            error!("long position missing entry fields — resetting to flat");
            self.reset_to_flat();
            self.save_state().await?;
            return Ok(None);
        };

        let price = sample.last;

        // Ratchet the trailing stop upward with new highs.
        let highest = self.state.highest_since_entry.unwrap_or(entry);
        if price > highest {
            let trail = price * (1.0 - self.params.trail_pct);
            self.state.highest_since_entry = Some(price);
            self.state.trailing_stop = Some(trail);
            info!(highest = price, trailing_stop = trail, "trailing stop raised");
            self.save_state().await?;
        }

        let trail = self
            .state
            .trailing_stop
            .unwrap_or(entry * (1.0 - self.params.trail_pct));
        let take_profit_at = entry * (1.0 + self.params.take_profit);
        let stop_loss_at = entry * (1.0 + self.params.stop_loss);

        let should_exit =
            price <= trail || price >= take_profit_at || price <= stop_loss_at;
        if !should_exit {
            return Ok(None);
        }

        let capital_at_entry = self.state.capital;
        let pct = (price - entry) / entry;
        let gross = capital_at_entry * pct;
        let sell_fee = capital_at_entry * self.params.fee_pct;
        let pnl = gross - sell_fee;
        self.state.capital += pnl;
        self.state.last_loss_time = if pnl < 0.0 { Some(sample.ts) } else { None };

        let time_held = sample.ts - entry_time;

        info!(
            price,
            pnl,
            pct,
            held_mins = time_held.num_minutes(),
            capital = self.state.capital,
            "sell signal — exiting long"
        );

        self.reset_to_flat();

        self.store
            .append_trade_signal(&TradeSignal {
                ts: sample.ts,
                kind: SignalKind::Sell,
                price,
                pnl: Some(pnl),
                pct_change: Some(pct),
                time_held_secs: Some(time_held.num_seconds()),
                updated_capital: self.state.capital,
            })
            .await
            .context("appending SELL signal")?;
        self.save_state().await?;

        Ok(Some(TradeEvent::Sell {
            ts: sample.ts,
            price,
            pnl,
            pct_change: pct,
            time_held,
            updated_capital: self.state.capital,
        }))
    }

    fn reset_to_flat(&mut self) {
        self.state.position = PositionState::Flat;
        self.state.entry_price = None;
        self.state.trailing_stop = None;
        self.state.highest_since_entry = None;
        self.state.entry_time = None;
    }

    async fn save_state(&self) -> Result<()> {
        self.store
            .save_bot_state(&self.state)
            .await
            .context("persisting bot state")
    }

    // -------------------------------------------------------------------------
    // Per-user portfolios
    // -------------------------------------------------------------------------

    /// Mirror a trade event into every opted-in user portfolio. Users track
    /// the same percent move without fees.
    async fn apply_to_portfolios(&self, event: &TradeEvent) -> Result<()> {
        let portfolios = self
            .store
            .list_portfolios()
            .await
            .context("listing user portfolios")?;

        for (chat_id, mut portfolio) in portfolios {
            match event {
                TradeEvent::Buy { price, .. } => {
                    if portfolio.position == PositionState::Flat {
                        portfolio.position = PositionState::Long;
                        portfolio.entry_price = Some(*price);
                        self.store.put_portfolio(chat_id, &portfolio).await?;
                    }
                }
                TradeEvent::Sell { price, .. } => {
                    if portfolio.position == PositionState::Long {
                        let Some(entry) = portfolio.entry_price else {
                            warn!(chat_id, "portfolio long without entry price — flattening");
                            portfolio.position = PositionState::Flat;
                            self.store.put_portfolio(chat_id, &portfolio).await?;
                            continue;
                        };
                        let pct = (price - entry) / entry;
                        let pnl = portfolio.capital * pct;
                        portfolio.capital += pnl;
                        portfolio.cumulative_pnl += pnl;
                        portfolio.position = PositionState::Flat;
                        portfolio.entry_price = None;
                        self.store.put_portfolio(chat_id, &portfolio).await?;
                    }
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{Portfolio, SYMBOL};
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn sample(min: i64, last: f64, vwap: f64) -> Sample {
        Sample {
            ts: ts(min),
            symbol: SYMBOL.to_string(),
            last,
            open: last,
            high: last,
            low: last,
            vwap,
            volume: 1_000_000.0,
            bid: last,
            ask: last,
            pct_change_24h: 0.0,
            pct_change: None,
        }
    }

    /// Engine with zero fees so the boundary scenarios match the raw math.
    async fn feeless_engine(store: Arc<MemoryStore>) -> StrategyEngine {
        let params = StrategyParams {
            fee_pct: 0.0,
            initial_capital: 1000.0,
            ..StrategyParams::default()
        };
        StrategyEngine::bootstrap(store, params, SYMBOL)
            .await
            .expect("bootstrap")
    }

    async fn enter_at_0980(engine: &mut StrategyEngine) {
        // dev = (0.980 - 1.0) / 1.0 = -0.020 <= -0.019
        let events = engine.process(&sample(0, 1.000, 1.000)).await.unwrap();
        assert!(events.is_empty());
        let events = engine.process(&sample(1, 0.980, 1.000)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TradeEvent::Buy { .. }));
    }

    #[tokio::test]
    async fn basic_buy_sets_trailing_stop() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = feeless_engine(store.clone()).await;
        enter_at_0980(&mut engine).await;

        let state = engine.state();
        assert_eq!(state.position, PositionState::Long);
        assert_eq!(state.entry_price, Some(0.980));
        let trail = state.trailing_stop.unwrap();
        assert!((trail - 0.9751).abs() < 1e-9, "trail was {trail}");

        // BUY row landed in the ledger.
        let signal = store.latest_trade_signal().await.unwrap().unwrap();
        assert_eq!(signal.kind, SignalKind::Buy);
        assert!(signal.pnl.is_none());
    }

    #[tokio::test]
    async fn take_profit_exit() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = feeless_engine(store.clone()).await;
        enter_at_0980(&mut engine).await;

        // 0.995 >= 0.980 * 1.015 = 0.9947
        let events = engine.process(&sample(2, 0.995, 1.000)).await.unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            TradeEvent::Sell { pnl, pct_change, .. } => {
                assert!(*pnl > 0.0);
                assert!((pct_change - 0.0153061).abs() < 1e-4);
            }
            other => panic!("expected Sell, got {other:?}"),
        }
        assert_eq!(engine.state().position, PositionState::Flat);
        assert!(engine.state().last_loss_time.is_none());
    }

    #[tokio::test]
    async fn trailing_stop_exit_after_ratchet() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = feeless_engine(store.clone()).await;
        enter_at_0980(&mut engine).await;

        let capital_at_entry = engine.state().capital;

        engine.process(&sample(2, 0.990, 1.000)).await.unwrap();
        let trail_after_990 = engine.state().trailing_stop.unwrap();
        engine.process(&sample(3, 0.992, 1.000)).await.unwrap();
        let trail_after_992 = engine.state().trailing_stop.unwrap();

        // Trailing stop only moves up.
        assert!(trail_after_992 >= trail_after_990);
        assert!((trail_after_992 - 0.98704).abs() < 1e-9);

        // 0.9870 <= 0.98704 triggers the trail.
        let events = engine.process(&sample(4, 0.9870, 1.000)).await.unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            TradeEvent::Sell { pnl, .. } => {
                let expected = capital_at_entry * (0.9870 - 0.980) / 0.980;
                assert!((pnl - expected).abs() < 1e-9);
                assert!(*pnl > 0.0);
            }
            other => panic!("expected Sell, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_loss_exit_sets_loss_time() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = feeless_engine(store.clone()).await;
        enter_at_0980(&mut engine).await;

        // 0.9604 <= 0.980 * 0.98
        let events = engine.process(&sample(2, 0.9604, 1.000)).await.unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            TradeEvent::Sell { pnl, .. } => assert!(*pnl < 0.0),
            other => panic!("expected Sell, got {other:?}"),
        }
        assert_eq!(engine.state().last_loss_time, Some(ts(2)));
    }

    #[tokio::test]
    async fn cooldown_blocks_buy_until_elapsed() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = feeless_engine(store.clone()).await;
        enter_at_0980(&mut engine).await;
        engine.process(&sample(2, 0.9604, 1.000)).await.unwrap();

        // Oversold again 29 minutes after the loss: still cooling down.
        let events = engine.process(&sample(2 + 29, 0.980, 1.000)).await.unwrap();
        assert!(events.is_empty());
        assert_eq!(engine.state().position, PositionState::Flat);

        // 31 minutes after the loss: buy goes through.
        let events = engine.process(&sample(2 + 31, 0.980, 1.000)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TradeEvent::Buy { .. }));
    }

    #[tokio::test]
    async fn processing_is_idempotent_per_timestamp() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = feeless_engine(store.clone()).await;

        let s = sample(1, 0.980, 1.000);
        let first = engine.process(&s).await.unwrap();
        assert_eq!(first.len(), 1);
        let state_after = engine.state().clone();

        let second = engine.process(&s).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(engine.state().capital, state_after.capital);
        assert_eq!(engine.state().entry_price, state_after.entry_price);
    }

    #[tokio::test]
    async fn fees_apply_once_per_side() {
        let store = Arc::new(MemoryStore::new());
        let params = StrategyParams {
            fee_pct: 0.0025,
            initial_capital: 1000.0,
            ..StrategyParams::default()
        };
        let mut engine = StrategyEngine::bootstrap(store.clone(), params, SYMBOL)
            .await
            .unwrap();

        engine.process(&sample(1, 0.980, 1.000)).await.unwrap();
        let capital_at_entry = engine.state().capital;
        assert!((capital_at_entry - 997.5).abs() < 1e-9);

        let events = engine.process(&sample(2, 0.995, 1.000)).await.unwrap();
        let TradeEvent::Sell { pnl, .. } = &events[0] else {
            panic!("expected Sell");
        };
        let pct = (0.995 - 0.980) / 0.980;
        let expected_pnl = capital_at_entry * pct - capital_at_entry * 0.0025;
        assert!((pnl - expected_pnl).abs() < 1e-9);
        assert!((engine.state().capital - (capital_at_entry + expected_pnl)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn buy_and_exit_can_fire_on_same_sample() {
        let store = Arc::new(MemoryStore::new());
        // Absurd stop loss so the entry sample itself trips the exit:
        // with stop_loss = 0.0, price <= entry holds immediately.
        let params = StrategyParams {
            fee_pct: 0.0,
            stop_loss: 0.0,
            initial_capital: 1000.0,
            ..StrategyParams::default()
        };
        let mut engine = StrategyEngine::bootstrap(store, params, SYMBOL)
            .await
            .unwrap();

        let events = engine.process(&sample(1, 0.980, 1.000)).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TradeEvent::Buy { .. }));
        assert!(matches!(events[1], TradeEvent::Sell { .. }));
        assert_eq!(engine.state().position, PositionState::Flat);
    }

    #[tokio::test]
    async fn cold_start_resumes_open_buy_from_ledger() {
        let store = Arc::new(MemoryStore::new());
        store
            .append_trade_signal(&TradeSignal {
                ts: ts(0),
                kind: SignalKind::Buy,
                price: 0.9800,
                pnl: None,
                pct_change: None,
                time_held_secs: None,
                updated_capital: 997.5,
            })
            .await
            .unwrap();

        let engine = StrategyEngine::bootstrap(
            store,
            StrategyParams::default(),
            SYMBOL,
        )
        .await
        .unwrap();

        let state = engine.state();
        assert_eq!(state.position, PositionState::Long);
        assert_eq!(state.entry_price, Some(0.9800));
        assert_eq!(state.highest_since_entry, Some(0.9800));
        assert!((state.capital - 997.5).abs() < 1e-9);
        assert!((state.trailing_stop.unwrap() - 0.9800 * 0.995).abs() < 1e-12);
    }

    #[tokio::test]
    async fn cold_start_empty_ledger_skips_history() {
        let store = Arc::new(MemoryStore::new());
        store.append_sample(&sample(5, 0.970, 1.000)).await.unwrap();

        let mut engine = feeless_engine(store).await;
        assert_eq!(engine.state().position, PositionState::Flat);
        assert_eq!(engine.state().last_processed_ts, Some(ts(5)));

        // The already-stored oversold sample is not replayed.
        let events = engine.process(&sample(5, 0.970, 1.000)).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn portfolios_track_events_without_fees() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_portfolio(42, &Portfolio::with_capital(200.0))
            .await
            .unwrap();

        let mut engine = feeless_engine(store.clone()).await;
        engine.process(&sample(1, 0.980, 1.000)).await.unwrap();

        let opened = store.get_portfolio(42).await.unwrap().unwrap();
        assert_eq!(opened.position, PositionState::Long);
        assert_eq!(opened.entry_price, Some(0.980));

        engine.process(&sample(2, 0.995, 1.000)).await.unwrap();
        let closed = store.get_portfolio(42).await.unwrap().unwrap();
        assert_eq!(closed.position, PositionState::Flat);
        let pct = (0.995 - 0.980) / 0.980;
        assert!((closed.capital - (200.0 + 200.0 * pct)).abs() < 1e-9);
        assert!((closed.cumulative_pnl - 200.0 * pct).abs() < 1e-9);
    }
}
