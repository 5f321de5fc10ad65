// =============================================================================
// Store — durable persistence behind a capability trait
// =============================================================================
//
// The store is the single integration point between workers: the ingestor
// appends samples, the strategy engine owns bot state and the trade ledger,
// the router reads samples and writes the activity ledger, and the query
// responders read everything. The reference implementation is SQLite; the
// in-memory implementation backs tests.
//
// Writes are individually atomic. No cross-table transactions are required.
// =============================================================================

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{
    ActivityKind, BotActivity, BotState, Portfolio, Sample, TradeSignal,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Store failure modes.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A persisted row failed to decode back into its entity.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Capability set shared by every store backend.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Ticker samples ──────────────────────────────────────────────────
    async fn append_sample(&self, sample: &Sample) -> StoreResult<()>;
    async fn latest_sample(&self, symbol: &str) -> StoreResult<Option<Sample>>;
    /// All samples for `symbol` with `ts >= t0`, oldest first.
    async fn samples_since(&self, symbol: &str, t0: DateTime<Utc>)
        -> StoreResult<Vec<Sample>>;

    // ── Bot state ───────────────────────────────────────────────────────
    async fn save_bot_state(&self, state: &BotState) -> StoreResult<()>;
    /// Latest persisted snapshot, if any.
    async fn load_bot_state(&self) -> StoreResult<Option<BotState>>;

    // ── Trade ledger ────────────────────────────────────────────────────
    async fn append_trade_signal(&self, signal: &TradeSignal) -> StoreResult<()>;
    /// Most recent BUY or SELL row (capital UPDATE rows are skipped).
    async fn latest_trade_signal(&self) -> StoreResult<Option<TradeSignal>>;
    /// Most recent row of any kind, which carries the authoritative capital.
    async fn latest_capital(&self) -> StoreResult<Option<f64>>;

    // ── Activity ledger ─────────────────────────────────────────────────
    async fn append_activity(&self, activity: &BotActivity) -> StoreResult<()>;
    async fn latest_activity(&self, kind: ActivityKind)
        -> StoreResult<Option<BotActivity>>;

    // ── User portfolios & alerts ────────────────────────────────────────
    async fn get_portfolio(&self, chat_id: i64) -> StoreResult<Option<Portfolio>>;
    async fn put_portfolio(&self, chat_id: i64, portfolio: &Portfolio) -> StoreResult<()>;
    async fn list_portfolios(&self) -> StoreResult<Vec<(i64, Portfolio)>>;
    async fn get_alert(&self, chat_id: i64) -> StoreResult<Option<f64>>;
    async fn put_alert(&self, chat_id: i64, target_price: f64) -> StoreResult<()>;
}
