// =============================================================================
// Shared types used across the XRP Sentinel signal service
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The only symbol this service tracks.
pub const SYMBOL: &str = "XRP";

/// One normalized ticker observation, append-only in the store.
///
/// `pct_change` is the relative change (in percent) against the previously
/// stored sample for the same symbol; `None` for the very first row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub last: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub vwap: f64,
    pub volume: f64,
    pub bid: f64,
    pub ask: f64,
    pub pct_change_24h: f64,
    pub pct_change: Option<f64>,
}

/// Whether the strategy currently holds the asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Flat,
    Long,
}

impl Default for PositionState {
    fn default() -> Self {
        Self::Flat
    }
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flat => write!(f, "flat"),
            Self::Long => write!(f, "long"),
        }
    }
}

impl std::str::FromStr for PositionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flat" => Ok(Self::Flat),
            "long" => Ok(Self::Long),
            other => Err(format!("unknown position state: {other}")),
        }
    }
}

/// Crash-safe snapshot of the strategy engine, latest row wins on load.
///
/// Invariants: while flat every position field is `None`; while long
/// `entry_price <= highest_since_entry` and
/// `0 < trailing_stop <= highest_since_entry`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotState {
    pub capital: f64,
    pub position: PositionState,
    pub entry_price: Option<f64>,
    pub trailing_stop: Option<f64>,
    pub highest_since_entry: Option<f64>,
    pub last_processed_ts: Option<DateTime<Utc>>,
    pub entry_time: Option<DateTime<Utc>>,
    pub last_loss_time: Option<DateTime<Utc>>,
}

impl BotState {
    /// A fresh flat state with the given starting capital.
    pub fn flat(capital: f64) -> Self {
        Self {
            capital,
            ..Self::default()
        }
    }

    /// Check the flat/long field invariants.
    pub fn invariants_hold(&self) -> bool {
        match self.position {
            PositionState::Flat => {
                self.entry_price.is_none()
                    && self.trailing_stop.is_none()
                    && self.highest_since_entry.is_none()
                    && self.entry_time.is_none()
            }
            PositionState::Long => match (
                self.entry_price,
                self.trailing_stop,
                self.highest_since_entry,
            ) {
                (Some(entry), Some(trail), Some(highest)) => {
                    trail > 0.0 && trail <= highest && entry <= highest && self.entry_time.is_some()
                }
                _ => false,
            },
        }
    }
}

/// Trade ledger row kind. `Update` rows record manual capital adjustments
/// and are excluded from signal queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Buy,
    Sell,
    Update,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Update => write!(f, "UPDATE"),
        }
    }
}

impl std::str::FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Self::Buy),
            // Old ledgers wrote SELL_LOSS for losing exits.
            "SELL" | "SELL_LOSS" => Ok(Self::Sell),
            "UPDATE" => Ok(Self::Update),
            other => Err(format!("unknown signal kind: {other}")),
        }
    }
}

/// Append-only trade ledger row. Buy rows carry no pnl/pct/held fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub ts: DateTime<Utc>,
    pub kind: SignalKind,
    pub price: f64,
    pub pnl: Option<f64>,
    pub pct_change: Option<f64>,
    pub time_held_secs: Option<i64>,
    pub updated_capital: f64,
}

/// Kind of a non-trade publication recorded in the activity ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityKind {
    HourlyUpdate,
    NHourSummary,
    DailySummary,
    VolatilityAlert,
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HourlyUpdate => write!(f, "hourly_update"),
            Self::NHourSummary => write!(f, "n_hour_summary"),
            Self::DailySummary => write!(f, "daily_summary"),
            Self::VolatilityAlert => write!(f, "volatility_alert"),
        }
    }
}

impl std::str::FromStr for ActivityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly_update" => Ok(Self::HourlyUpdate),
            "n_hour_summary" => Ok(Self::NHourSummary),
            "daily_summary" => Ok(Self::DailySummary),
            "volatility_alert" => Ok(Self::VolatilityAlert),
            other => Err(format!("unknown activity kind: {other}")),
        }
    }
}

/// Append-only ledger row for a successful non-trade publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotActivity {
    pub ts: DateTime<Utc>,
    pub kind: ActivityKind,
    pub price: f64,
    pub summary_text: Option<String>,
}

/// Per-user notional portfolio, created on first `/setcapital` and mutated
/// only by the strategy engine on buy/sell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub capital: f64,
    pub position: PositionState,
    pub entry_price: Option<f64>,
    pub cumulative_pnl: f64,
}

impl Portfolio {
    /// A fresh flat portfolio with the given starting capital.
    pub fn with_capital(capital: f64) -> Self {
        Self {
            capital,
            position: PositionState::Flat,
            entry_price: None,
            cumulative_pnl: 0.0,
        }
    }
}

/// An event produced by the strategy engine for one processed sample.
#[derive(Debug, Clone)]
pub enum TradeEvent {
    Buy {
        ts: DateTime<Utc>,
        price: f64,
        fee: f64,
    },
    Sell {
        ts: DateTime<Utc>,
        price: f64,
        pnl: f64,
        pct_change: f64,
        time_held: Duration,
        updated_capital: f64,
    },
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_state_invariants() {
        let state = BotState::flat(1000.0);
        assert!(state.invariants_hold());

        let mut bad = BotState::flat(1000.0);
        bad.entry_price = Some(0.5);
        assert!(!bad.invariants_hold());
    }

    #[test]
    fn long_state_invariants() {
        let state = BotState {
            capital: 1000.0,
            position: PositionState::Long,
            entry_price: Some(0.98),
            trailing_stop: Some(0.9751),
            highest_since_entry: Some(0.98),
            last_processed_ts: Some(Utc::now()),
            entry_time: Some(Utc::now()),
            last_loss_time: None,
        };
        assert!(state.invariants_hold());

        let mut bad = state.clone();
        bad.trailing_stop = Some(1.5);
        assert!(!bad.invariants_hold());

        let mut missing = state;
        missing.entry_price = None;
        assert!(!missing.invariants_hold());
    }

    #[test]
    fn signal_kind_roundtrip() {
        for kind in [SignalKind::Buy, SignalKind::Sell, SignalKind::Update] {
            let parsed: SignalKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        // Legacy ledgers wrote SELL_LOSS for losing exits.
        assert_eq!("SELL_LOSS".parse::<SignalKind>().unwrap(), SignalKind::Sell);
        assert!("HOLD".parse::<SignalKind>().is_err());
    }

    #[test]
    fn activity_kind_roundtrip() {
        for kind in [
            ActivityKind::HourlyUpdate,
            ActivityKind::NHourSummary,
            ActivityKind::DailySummary,
            ActivityKind::VolatilityAlert,
        ] {
            let parsed: ActivityKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
