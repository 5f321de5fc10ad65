// =============================================================================
// Configuration — environment-driven settings with safe defaults
// =============================================================================
//
// Credentials come from the environment (via dotenv in main). Missing
// credentials or unparseable values are configuration errors, the only
// fatal class in the service: everything else is recovered locally.
// =============================================================================

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::router::RouterFlags;
use crate::strategy::StrategyParams;

/// Complete runtime configuration for the service.
#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_bot_token: String,
    pub telegram_chat_id: i64,
    pub twitter_bearer_token: String,
    pub database_path: PathBuf,
    pub chart_dir: PathBuf,
    pub chart_max_age_days: u64,
    /// Currency pair on the ticker endpoint, e.g. `xrpusd`.
    pub ticker_pair: String,
    pub poll_period: Duration,
    pub flags: RouterFlags,
    pub strategy: StrategyParams,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let telegram_bot_token = require("TELEGRAM_BOT_TOKEN")?;
        let telegram_chat_id: i64 = require("TELEGRAM_CHAT_ID")?
            .parse()
            .context("TELEGRAM_CHAT_ID must be a numeric chat id")?;
        let twitter_bearer_token = require("TWITTER_BEARER_TOKEN")?;

        let defaults = StrategyParams::default();
        let strategy = StrategyParams {
            oversold_threshold: env_parse("OVERSOLD_THRESHOLD", defaults.oversold_threshold)?,
            take_profit: env_parse("TAKE_PROFIT", defaults.take_profit)?,
            stop_loss: env_parse("STOP_LOSS", defaults.stop_loss)?,
            trail_pct: env_parse("TRAIL_PCT", defaults.trail_pct)?,
            loss_cooldown: chrono::Duration::minutes(env_parse(
                "LOSS_COOLDOWN_MINUTES",
                defaults.loss_cooldown.num_minutes(),
            )?),
            fee_pct: env_parse("FEE_PCT", defaults.fee_pct)?,
            initial_capital: env_parse("INITIAL_CAPITAL", defaults.initial_capital)?,
        };
        if strategy.initial_capital <= 0.0 {
            bail!("INITIAL_CAPITAL must be positive");
        }
        if strategy.fee_pct < 0.0 {
            bail!("FEE_PCT must not be negative");
        }

        let flags = RouterFlags {
            hourly_update: env_flag("ENABLE_HOURLY_TWEET", true)?,
            n_hour_summary: env_flag("ENABLE_N_HOUR_SUMMARY", true)?,
            volatility_alert: env_flag("ENABLE_VOLATILITY_ALERT", true)?,
            daily_summary: env_flag("ENABLE_DAILY_SUMMARY", true)?,
        };

        let config = Self {
            telegram_bot_token,
            telegram_chat_id,
            twitter_bearer_token,
            database_path: PathBuf::from(env_or("DATABASE_PATH", "xrp_sentinel.db")),
            chart_dir: PathBuf::from(env_or("CHART_DIR", "charts")),
            chart_max_age_days: env_parse("CHART_MAX_AGE_DAYS", 7u64)?,
            ticker_pair: env_or("TICKER_PAIR", "xrpusd"),
            poll_period: Duration::from_secs(env_parse("POLL_PERIOD_SECS", 60u64)?),
            flags,
            strategy,
        };

        info!(
            db = %config.database_path.display(),
            pair = %config.ticker_pair,
            poll_secs = config.poll_period.as_secs(),
            flags = ?config.flags,
            "configuration loaded"
        );
        Ok(config)
    }
}

fn require(key: &str) -> Result<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!("missing required environment variable {key}"),
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an optional env var, failing loudly on an unparseable value
/// (a silently ignored typo in a threshold is worse than a crash at boot).
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("invalid value for {key}: '{other}' (expected true/false)"),
        },
        Err(_) => Ok(default),
    }
}
