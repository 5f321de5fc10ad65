// =============================================================================
// SQLite Store — reference persistence backend
// =============================================================================
//
// Schema is created on open so a fresh deployment needs no migration step.
// Timestamps are stored as RFC 3339 TEXT; position states and ledger kinds
// as their canonical lowercase / uppercase strings. Bot state is append-only
// with latest-row-wins load, matching the crash-safety model: every strategy
// mutation lands as a new snapshot row.
// =============================================================================

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::types::{
    ActivityKind, BotActivity, BotState, Portfolio, PositionState, Sample, SignalKind,
    TradeSignal,
};

use super::{Store, StoreError, StoreResult};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS crypto_prices (
        ts TEXT NOT NULL,
        symbol TEXT NOT NULL,
        last_price REAL NOT NULL,
        open_price REAL NOT NULL,
        high_price REAL NOT NULL,
        low_price REAL NOT NULL,
        vwap REAL NOT NULL,
        volume REAL NOT NULL,
        bid REAL NOT NULL,
        ask REAL NOT NULL,
        percent_change_24h REAL NOT NULL,
        percent_change REAL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_crypto_prices_symbol_ts
        ON crypto_prices (symbol, ts)",
    "CREATE TABLE IF NOT EXISTS bot_state (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        capital REAL NOT NULL,
        position TEXT NOT NULL,
        entry_price REAL,
        trailing_stop_price REAL,
        highest_price REAL,
        last_timestamp TEXT,
        entry_time TEXT,
        last_loss_time TEXT
    )",
    "CREATE TABLE IF NOT EXISTS trade_signals (
        ts TEXT NOT NULL,
        signal_type TEXT NOT NULL,
        price REAL NOT NULL,
        profit_loss REAL,
        percent_change REAL,
        time_held_secs INTEGER,
        updated_capital REAL NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS bot_activity (
        ts TEXT NOT NULL,
        activity_type TEXT NOT NULL,
        price REAL NOT NULL,
        summary_text TEXT
    )",
    "CREATE TABLE IF NOT EXISTS user_portfolios (
        chat_id INTEGER PRIMARY KEY,
        capital REAL NOT NULL,
        position TEXT NOT NULL,
        entry_price REAL,
        cumulative_pnl REAL NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS price_alerts (
        chat_id INTEGER PRIMARY KEY,
        target_price REAL NOT NULL
    )",
];

/// SQLite-backed [`Store`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and ensure the
    /// schema exists.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&pool).await?;
        }

        info!(path = %path.display(), "sqlite store opened");
        Ok(Self { pool })
    }
}

fn parse_col<T: FromStr>(value: &str, column: &str) -> StoreResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| StoreError::Corrupt(format!("{column}='{value}': {e}")))
}

#[async_trait]
impl Store for SqliteStore {
    async fn append_sample(&self, sample: &Sample) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO crypto_prices
                (ts, symbol, last_price, open_price, high_price, low_price,
                 vwap, volume, bid, ask, percent_change_24h, percent_change)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(sample.ts)
        .bind(&sample.symbol)
        .bind(sample.last)
        .bind(sample.open)
        .bind(sample.high)
        .bind(sample.low)
        .bind(sample.vwap)
        .bind(sample.volume)
        .bind(sample.bid)
        .bind(sample.ask)
        .bind(sample.pct_change_24h)
        .bind(sample.pct_change)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_sample(&self, symbol: &str) -> StoreResult<Option<Sample>> {
        let row = sqlx::query(
            "SELECT * FROM crypto_prices WHERE symbol = ? ORDER BY ts DESC LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| sample_from_row(&r)).transpose()
    }

    async fn samples_since(
        &self,
        symbol: &str,
        t0: DateTime<Utc>,
    ) -> StoreResult<Vec<Sample>> {
        let rows = sqlx::query(
            "SELECT * FROM crypto_prices WHERE symbol = ? AND ts >= ? ORDER BY ts ASC",
        )
        .bind(symbol)
        .bind(t0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(sample_from_row).collect()
    }

    async fn save_bot_state(&self, state: &BotState) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO bot_state
                (capital, position, entry_price, trailing_stop_price,
                 highest_price, last_timestamp, entry_time, last_loss_time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(state.capital)
        .bind(state.position.to_string())
        .bind(state.entry_price)
        .bind(state.trailing_stop)
        .bind(state.highest_since_entry)
        .bind(state.last_processed_ts)
        .bind(state.entry_time)
        .bind(state.last_loss_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_bot_state(&self) -> StoreResult<Option<BotState>> {
        let row = sqlx::query("SELECT * FROM bot_state ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };

        let position: String = row.try_get("position")?;
        Ok(Some(BotState {
            capital: row.try_get("capital")?,
            position: parse_col::<PositionState>(&position, "position")?,
            entry_price: row.try_get("entry_price")?,
            trailing_stop: row.try_get("trailing_stop_price")?,
            highest_since_entry: row.try_get("highest_price")?,
            last_processed_ts: row.try_get("last_timestamp")?,
            entry_time: row.try_get("entry_time")?,
            last_loss_time: row.try_get("last_loss_time")?,
        }))
    }

    async fn append_trade_signal(&self, signal: &TradeSignal) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO trade_signals
                (ts, signal_type, price, profit_loss, percent_change,
                 time_held_secs, updated_capital)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(signal.ts)
        .bind(signal.kind.to_string())
        .bind(signal.price)
        .bind(signal.pnl)
        .bind(signal.pct_change)
        .bind(signal.time_held_secs)
        .bind(signal.updated_capital)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_trade_signal(&self) -> StoreResult<Option<TradeSignal>> {
        let row = sqlx::query(
            "SELECT * FROM trade_signals
             WHERE signal_type IN ('BUY', 'SELL', 'SELL_LOSS')
             ORDER BY ts DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| trade_signal_from_row(&r)).transpose()
    }

    async fn latest_capital(&self) -> StoreResult<Option<f64>> {
        let row = sqlx::query(
            "SELECT updated_capital FROM trade_signals ORDER BY ts DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(r) => Some(r.try_get("updated_capital")?),
            None => None,
        })
    }

    async fn append_activity(&self, activity: &BotActivity) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO bot_activity (ts, activity_type, price, summary_text)
             VALUES (?, ?, ?, ?)",
        )
        .bind(activity.ts)
        .bind(activity.kind.to_string())
        .bind(activity.price)
        .bind(&activity.summary_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_activity(
        &self,
        kind: ActivityKind,
    ) -> StoreResult<Option<BotActivity>> {
        let row = sqlx::query(
            "SELECT * FROM bot_activity WHERE activity_type = ? ORDER BY ts DESC LIMIT 1",
        )
        .bind(kind.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };

        let kind_text: String = row.try_get("activity_type")?;
        Ok(Some(BotActivity {
            ts: row.try_get("ts")?,
            kind: parse_col::<ActivityKind>(&kind_text, "activity_type")?,
            price: row.try_get("price")?,
            summary_text: row.try_get("summary_text")?,
        }))
    }

    async fn get_portfolio(&self, chat_id: i64) -> StoreResult<Option<Portfolio>> {
        let row = sqlx::query("SELECT * FROM user_portfolios WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };

        let position: String = row.try_get("position")?;
        Ok(Some(Portfolio {
            capital: row.try_get("capital")?,
            position: parse_col::<PositionState>(&position, "position")?,
            entry_price: row.try_get("entry_price")?,
            cumulative_pnl: row.try_get("cumulative_pnl")?,
        }))
    }

    async fn put_portfolio(&self, chat_id: i64, portfolio: &Portfolio) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO user_portfolios
                (chat_id, capital, position, entry_price, cumulative_pnl)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(chat_id) DO UPDATE SET
                capital = excluded.capital,
                position = excluded.position,
                entry_price = excluded.entry_price,
                cumulative_pnl = excluded.cumulative_pnl",
        )
        .bind(chat_id)
        .bind(portfolio.capital)
        .bind(portfolio.position.to_string())
        .bind(portfolio.entry_price)
        .bind(portfolio.cumulative_pnl)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_portfolios(&self) -> StoreResult<Vec<(i64, Portfolio)>> {
        let rows = sqlx::query("SELECT * FROM user_portfolios ORDER BY chat_id")
            .fetch_all(&self.pool)
            .await?;

        let mut portfolios = Vec::with_capacity(rows.len());
        for row in &rows {
            let position: String = row.try_get("position")?;
            portfolios.push((
                row.try_get("chat_id")?,
                Portfolio {
                    capital: row.try_get("capital")?,
                    position: parse_col::<PositionState>(&position, "position")?,
                    entry_price: row.try_get("entry_price")?,
                    cumulative_pnl: row.try_get("cumulative_pnl")?,
                },
            ));
        }
        Ok(portfolios)
    }

    async fn get_alert(&self, chat_id: i64) -> StoreResult<Option<f64>> {
        let row = sqlx::query("SELECT target_price FROM price_alerts WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(r) => Some(r.try_get("target_price")?),
            None => None,
        })
    }

    async fn put_alert(&self, chat_id: i64, target_price: f64) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO price_alerts (chat_id, target_price) VALUES (?, ?)
             ON CONFLICT(chat_id) DO UPDATE SET target_price = excluded.target_price",
        )
        .bind(chat_id)
        .bind(target_price)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn sample_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Sample> {
    Ok(Sample {
        ts: row.try_get("ts")?,
        symbol: row.try_get("symbol")?,
        last: row.try_get("last_price")?,
        open: row.try_get("open_price")?,
        high: row.try_get("high_price")?,
        low: row.try_get("low_price")?,
        vwap: row.try_get("vwap")?,
        volume: row.try_get("volume")?,
        bid: row.try_get("bid")?,
        ask: row.try_get("ask")?,
        pct_change_24h: row.try_get("percent_change_24h")?,
        pct_change: row.try_get("percent_change")?,
    })
}

fn trade_signal_from_row(row: &sqlx::sqlite::SqliteRow) -> StoreResult<TradeSignal> {
    let kind_text: String = row.try_get("signal_type")?;
    Ok(TradeSignal {
        ts: row.try_get("ts")?,
        kind: parse_col::<SignalKind>(&kind_text, "signal_type")?,
        price: row.try_get("price")?,
        pnl: row.try_get("profit_loss")?,
        pct_change: row.try_get("percent_change")?,
        time_held_secs: row.try_get("time_held_secs")?,
        updated_capital: row.try_get("updated_capital")?,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SYMBOL;
    use chrono::TimeZone;

    fn sample_at(ts: DateTime<Utc>, last: f64) -> Sample {
        Sample {
            ts,
            symbol: SYMBOL.to_string(),
            last,
            open: last,
            high: last + 0.01,
            low: last - 0.01,
            vwap: last,
            volume: 1_000_000.0,
            bid: last - 0.001,
            ask: last + 0.001,
            pct_change_24h: 0.5,
            pct_change: None,
        }
    }

    async fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(&dir.path().join("test.db"))
            .await
            .expect("open store");
        (dir, store)
    }

    #[tokio::test]
    async fn sample_roundtrip_and_latest() {
        let (_dir, store) = open_temp().await;
        let t0 = Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 9, 1, 12, 1, 0).unwrap();

        store.append_sample(&sample_at(t0, 0.57)).await.unwrap();
        store.append_sample(&sample_at(t1, 0.58)).await.unwrap();

        let latest = store.latest_sample(SYMBOL).await.unwrap().unwrap();
        assert_eq!(latest.ts, t1);
        assert!((latest.last - 0.58).abs() < f64::EPSILON);

        let since = store.samples_since(SYMBOL, t0).await.unwrap();
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].ts, t0);
    }

    #[tokio::test]
    async fn bot_state_latest_wins() {
        let (_dir, store) = open_temp().await;
        assert!(store.load_bot_state().await.unwrap().is_none());

        store.save_bot_state(&BotState::flat(1000.0)).await.unwrap();
        let mut second = BotState::flat(990.0);
        second.last_loss_time = Some(Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap());
        store.save_bot_state(&second).await.unwrap();

        let loaded = store.load_bot_state().await.unwrap().unwrap();
        assert!((loaded.capital - 990.0).abs() < f64::EPSILON);
        assert!(loaded.last_loss_time.is_some());
        assert_eq!(loaded.position, PositionState::Flat);
    }

    #[tokio::test]
    async fn trade_ledger_skips_update_rows() {
        let (_dir, store) = open_temp().await;
        let t0 = Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 9, 1, 13, 0, 0).unwrap();

        store
            .append_trade_signal(&TradeSignal {
                ts: t0,
                kind: SignalKind::Buy,
                price: 0.57,
                pnl: None,
                pct_change: None,
                time_held_secs: None,
                updated_capital: 997.5,
            })
            .await
            .unwrap();
        store
            .append_trade_signal(&TradeSignal {
                ts: t1,
                kind: SignalKind::Update,
                price: 0.0,
                pnl: None,
                pct_change: None,
                time_held_secs: None,
                updated_capital: 5000.0,
            })
            .await
            .unwrap();

        let latest = store.latest_trade_signal().await.unwrap().unwrap();
        assert_eq!(latest.kind, SignalKind::Buy);
        assert_eq!(latest.ts, t0);

        // Capital reads the newest row of any kind.
        let capital = store.latest_capital().await.unwrap().unwrap();
        assert!((capital - 5000.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn activity_ledger_by_kind() {
        let (_dir, store) = open_temp().await;
        let t0 = Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap();

        store
            .append_activity(&BotActivity {
                ts: t0,
                kind: ActivityKind::HourlyUpdate,
                price: 0.57,
                summary_text: Some("hourly".into()),
            })
            .await
            .unwrap();

        assert!(store
            .latest_activity(ActivityKind::DailySummary)
            .await
            .unwrap()
            .is_none());
        let hourly = store
            .latest_activity(ActivityKind::HourlyUpdate)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hourly.summary_text.as_deref(), Some("hourly"));
    }

    #[tokio::test]
    async fn portfolio_and_alert_upsert() {
        let (_dir, store) = open_temp().await;

        store
            .put_portfolio(42, &Portfolio::with_capital(500.0))
            .await
            .unwrap();
        store
            .put_portfolio(42, &Portfolio::with_capital(750.0))
            .await
            .unwrap();

        let portfolio = store.get_portfolio(42).await.unwrap().unwrap();
        assert!((portfolio.capital - 750.0).abs() < f64::EPSILON);
        assert_eq!(store.list_portfolios().await.unwrap().len(), 1);

        store.put_alert(42, 0.60).await.unwrap();
        store.put_alert(42, 0.65).await.unwrap();
        assert_eq!(store.get_alert(42).await.unwrap(), Some(0.65));
        assert_eq!(store.get_alert(7).await.unwrap(), None);
    }
}
