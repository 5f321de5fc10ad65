// =============================================================================
// XRP Sentinel — Main Entry Point
// =============================================================================
//
// Long-lived workers, all talking through the shared store:
//   - Ingestor: polls the ticker once a minute and appends samples.
//   - Event Router: drives the strategy engine and all outbound posts.
//   - Chat loop: answers interactive queries.
//   - Chart house-keeper: ages out old candle chart files.
//
// Shutdown: Ctrl+C / SIGTERM cancels every worker at its next suspension
// point; in-flight HTTP calls run out their own 10 s deadlines.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod bitstamp;
mod chart;
mod commands;
mod config;
mod ingestor;
mod lock;
mod messaging;
mod publisher;
mod router;
mod store;
mod strategy;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::commands::{run_chat_loop, CommandRegistry, QueryResponder};
use crate::config::Config;
use crate::ingestor::Ingestor;
use crate::lock::ProcessLock;
use crate::publisher::{TelegramClient, TwitterClient};
use crate::router::Router;
use crate::store::{SqliteStore, Store};
use crate::strategy::StrategyEngine;
use crate::types::SYMBOL;

/// Advisory lock guarding against a second instance on the same store.
const LOCK_FILE: &str = "trading_bot.lock";

/// Cadence of the chart house-keeping pass.
const HOUSEKEEPING_INTERVAL_SECS: u64 = 6 * 60 * 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("XRP Sentinel starting up");

    // Configuration problems are the only fatal class: bail with exit code 1.
    let config = Config::from_env().context("fatal: configuration error")?;

    let _lock = ProcessLock::acquire(LOCK_FILE).context("fatal: instance lock")?;

    // ── 2. Store & clients ───────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&config.database_path)
            .await
            .context("fatal: store unusable")?,
    );

    let ticker = bitstamp::BitstampClient::new(&config.ticker_pair);
    let microblog = Arc::new(TwitterClient::new(config.twitter_bearer_token.clone()));
    let telegram = Arc::new(TelegramClient::new(config.telegram_bot_token.clone()));

    // ── 3. Strategy engine (cold start / recovery) ───────────────────────
    let engine = StrategyEngine::bootstrap(store.clone(), config.strategy.clone(), SYMBOL)
        .await
        .context("fatal: strategy bootstrap")?;
    info!(
        position = %engine.state().position,
        capital = engine.state().capital,
        "strategy engine ready"
    );

    let cancel = CancellationToken::new();
    let mut workers = Vec::new();

    // ── 4. Ingestor ──────────────────────────────────────────────────────
    {
        let ingestor = Ingestor::new(
            store.clone(),
            ticker,
            SYMBOL,
            config.poll_period,
        );
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            ingestor.run(cancel).await;
        }));
    }

    // ── 5. Event router ──────────────────────────────────────────────────
    {
        let router = Router::new(
            store.clone(),
            engine,
            microblog.clone(),
            telegram.clone(),
            config.telegram_chat_id,
            SYMBOL,
            config.chart_dir.clone(),
            config.flags.clone(),
            config.poll_period,
        );
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            router.run(cancel).await;
        }));
    }

    // ── 6. Chat receive loop ─────────────────────────────────────────────
    {
        let responder = QueryResponder::new(store.clone(), config.telegram_chat_id);
        let registry = CommandRegistry::new();
        let client = telegram.clone();
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            run_chat_loop(client, registry, responder, cancel).await;
        }));
    }

    // ── 7. Chart house-keeping ───────────────────────────────────────────
    {
        let chart_dir = config.chart_dir.clone();
        let max_age_days = config.chart_max_age_days;
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                HOUSEKEEPING_INTERVAL_SECS,
            ));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match chart::cleanup_charts(&chart_dir, max_age_days, chrono::Utc::now()) {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "stale charts removed"),
                    Err(e) => warn!(error = %e, "chart house-keeping failed"),
                }
            }
        }));
    }

    info!("all workers running — press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    wait_for_shutdown().await;
    warn!("shutdown signal received — stopping workers");
    cancel.cancel();

    for worker in workers {
        if let Err(e) =
            tokio::time::timeout(std::time::Duration::from_secs(5), worker).await
        {
            error!(error = %e, "worker did not stop in time");
        }
    }

    info!("XRP Sentinel shut down complete");
    Ok(())
}

/// Wait for Ctrl+C or, on unix, SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
