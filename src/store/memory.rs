// =============================================================================
// In-memory Store — test backend
// =============================================================================
//
// Mirrors the SQLite backend's semantics (append-only ledgers, latest-wins
// bot state, keyed upserts) with plain collections behind
// `parking_lot::RwLock`. Never fails.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::{
    ActivityKind, BotActivity, BotState, Portfolio, Sample, SignalKind, TradeSignal,
};

use super::{Store, StoreResult};

/// In-memory [`Store`] used by tests.
#[derive(Default)]
pub struct MemoryStore {
    samples: RwLock<Vec<Sample>>,
    bot_states: RwLock<Vec<BotState>>,
    trade_signals: RwLock<Vec<TradeSignal>>,
    activities: RwLock<Vec<BotActivity>>,
    portfolios: RwLock<HashMap<i64, Portfolio>>,
    alerts: RwLock<HashMap<i64, f64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_sample(&self, sample: &Sample) -> StoreResult<()> {
        self.samples.write().push(sample.clone());
        Ok(())
    }

    async fn latest_sample(&self, symbol: &str) -> StoreResult<Option<Sample>> {
        let samples = self.samples.read();
        Ok(samples
            .iter()
            .filter(|s| s.symbol == symbol)
            .max_by_key(|s| s.ts)
            .cloned())
    }

    async fn samples_since(
        &self,
        symbol: &str,
        t0: DateTime<Utc>,
    ) -> StoreResult<Vec<Sample>> {
        let samples = self.samples.read();
        let mut result: Vec<Sample> = samples
            .iter()
            .filter(|s| s.symbol == symbol && s.ts >= t0)
            .cloned()
            .collect();
        result.sort_by_key(|s| s.ts);
        Ok(result)
    }

    async fn save_bot_state(&self, state: &BotState) -> StoreResult<()> {
        self.bot_states.write().push(state.clone());
        Ok(())
    }

    async fn load_bot_state(&self) -> StoreResult<Option<BotState>> {
        Ok(self.bot_states.read().last().cloned())
    }

    async fn append_trade_signal(&self, signal: &TradeSignal) -> StoreResult<()> {
        self.trade_signals.write().push(signal.clone());
        Ok(())
    }

    async fn latest_trade_signal(&self) -> StoreResult<Option<TradeSignal>> {
        let signals = self.trade_signals.read();
        Ok(signals
            .iter()
            .filter(|s| matches!(s.kind, SignalKind::Buy | SignalKind::Sell))
            .max_by_key(|s| s.ts)
            .cloned())
    }

    async fn latest_capital(&self) -> StoreResult<Option<f64>> {
        let signals = self.trade_signals.read();
        Ok(signals.iter().max_by_key(|s| s.ts).map(|s| s.updated_capital))
    }

    async fn append_activity(&self, activity: &BotActivity) -> StoreResult<()> {
        self.activities.write().push(activity.clone());
        Ok(())
    }

    async fn latest_activity(
        &self,
        kind: ActivityKind,
    ) -> StoreResult<Option<BotActivity>> {
        let activities = self.activities.read();
        Ok(activities
            .iter()
            .filter(|a| a.kind == kind)
            .max_by_key(|a| a.ts)
            .cloned())
    }

    async fn get_portfolio(&self, chat_id: i64) -> StoreResult<Option<Portfolio>> {
        Ok(self.portfolios.read().get(&chat_id).cloned())
    }

    async fn put_portfolio(&self, chat_id: i64, portfolio: &Portfolio) -> StoreResult<()> {
        self.portfolios.write().insert(chat_id, portfolio.clone());
        Ok(())
    }

    async fn list_portfolios(&self) -> StoreResult<Vec<(i64, Portfolio)>> {
        let portfolios = self.portfolios.read();
        let mut entries: Vec<(i64, Portfolio)> =
            portfolios.iter().map(|(k, v)| (*k, v.clone())).collect();
        entries.sort_by_key(|(k, _)| *k);
        Ok(entries)
    }

    async fn get_alert(&self, chat_id: i64) -> StoreResult<Option<f64>> {
        Ok(self.alerts.read().get(&chat_id).copied())
    }

    async fn put_alert(&self, chat_id: i64, target_price: f64) -> StoreResult<()> {
        self.alerts.write().insert(chat_id, target_price);
        Ok(())
    }
}
