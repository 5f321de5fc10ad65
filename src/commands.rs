// =============================================================================
// Query Responders — chat command handlers over the durable stores
// =============================================================================
//
// Commands are registered in a name -> kind map at startup; dispatch is a
// plain lookup, no reflection. Handlers only read the store (plus the two
// keyed upserts for /setcapital and /setalert) and never touch the network
// beyond the chat transport that carries the reply.
//
// `/setcapital` is dual-purpose: for the admin chat it writes a capital
// UPDATE row into the trade ledger; for everyone else it creates or resets
// that user's notional portfolio.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::messaging::format_utc;
use crate::publisher::telegram::TelegramClient;
use crate::publisher::Chat;
use crate::store::Store;
use crate::types::{Portfolio, PositionState, SignalKind, TradeSignal, SYMBOL};

/// Supported chat commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Start,
    Price,
    LastSignal,
    SetCapital,
    ViewPortfolio,
    SetAlert,
    ViewAlert,
    Capital,
    Help,
    About,
}

/// Name -> handler-kind map built once at startup.
pub struct CommandRegistry {
    commands: HashMap<&'static str, CommandKind>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut commands = HashMap::new();
        commands.insert("/start", CommandKind::Start);
        commands.insert("/price", CommandKind::Price);
        commands.insert("/lastsignal", CommandKind::LastSignal);
        commands.insert("/setcapital", CommandKind::SetCapital);
        commands.insert("/portfolio", CommandKind::ViewPortfolio);
        commands.insert("/setalert", CommandKind::SetAlert);
        commands.insert("/viewalert", CommandKind::ViewAlert);
        commands.insert("/capital", CommandKind::Capital);
        commands.insert("/help", CommandKind::Help);
        commands.insert("/about", CommandKind::About);
        Self { commands }
    }

    /// Parse a message into a command and its argument tail. Handles the
    /// `/cmd@BotName` form used in group chats.
    pub fn parse<'a>(&self, text: &'a str) -> Option<(CommandKind, Vec<&'a str>)> {
        let mut parts = text.split_whitespace();
        let head = parts.next()?;
        let name = head.split('@').next().unwrap_or(head);
        let kind = *self.commands.get(name)?;
        Some((kind, parts.collect()))
    }
}

/// Store-backed command handlers.
pub struct QueryResponder {
    store: Arc<dyn Store>,
    /// Chat id whose `/setcapital` writes the global ledger row.
    admin_chat_id: i64,
}

impl QueryResponder {
    pub fn new(store: Arc<dyn Store>, admin_chat_id: i64) -> Self {
        Self {
            store,
            admin_chat_id,
        }
    }

    /// Produce the reply for one parsed command.
    pub async fn respond(&self, kind: CommandKind, args: &[&str], chat_id: i64) -> String {
        match kind {
            CommandKind::Start => WELCOME_TEXT.to_string(),
            CommandKind::Price => self.price().await,
            CommandKind::LastSignal => self.last_signal().await,
            CommandKind::SetCapital => self.set_capital(args, chat_id).await,
            CommandKind::ViewPortfolio => self.view_portfolio(chat_id).await,
            CommandKind::SetAlert => self.set_alert(args, chat_id).await,
            CommandKind::ViewAlert => self.view_alert(chat_id).await,
            CommandKind::Capital => self.capital().await,
            CommandKind::Help => HELP_TEXT.to_string(),
            CommandKind::About => ABOUT_TEXT.to_string(),
        }
    }

    async fn price(&self) -> String {
        match self.store.latest_sample(SYMBOL).await {
            Ok(Some(sample)) => format!("The current XRP price is ${:.5}", sample.last),
            Ok(None) => "XRP price data not available.".to_string(),
            Err(e) => {
                error!(error = %e, "price lookup failed");
                "Error retrieving price.".to_string()
            }
        }
    }

    async fn last_signal(&self) -> String {
        let signal = match self.store.latest_trade_signal().await {
            Ok(Some(signal)) => signal,
            Ok(None) => return "No trading signals found.".to_string(),
            Err(e) => {
                error!(error = %e, "signal lookup failed");
                return "Error retrieving trading signal.".to_string();
            }
        };
        format!("Last Trading Signal:\n{}", format_signal(&signal))
    }

    async fn set_capital(&self, args: &[&str], chat_id: i64) -> String {
        let Some(amount) = args.first().and_then(|a| a.parse::<f64>().ok()) else {
            return "Please provide a valid number for the capital. Usage: /setcapital <amount>"
                .to_string();
        };
        if amount <= 0.0 {
            return "Capital must be a positive amount.".to_string();
        }

        if chat_id == self.admin_chat_id {
            // Admin path: record the adjusted global capital in the ledger.
            let row = TradeSignal {
                ts: Utc::now(),
                kind: SignalKind::Update,
                price: 0.0,
                pnl: None,
                pct_change: None,
                time_held_secs: None,
                updated_capital: amount,
            };
            return match self.store.append_trade_signal(&row).await {
                Ok(()) => {
                    info!(amount, "global capital updated");
                    format!("Capital updated to ${amount:.2}")
                }
                Err(e) => {
                    error!(error = %e, "capital update failed");
                    "Error updating capital.".to_string()
                }
            };
        }

        match self
            .store
            .put_portfolio(chat_id, &Portfolio::with_capital(amount))
            .await
        {
            Ok(()) => format!("Starting capital set to ${amount:.2}."),
            Err(e) => {
                error!(error = %e, chat_id, "portfolio upsert failed");
                "Error updating portfolio.".to_string()
            }
        }
    }

    async fn view_portfolio(&self, chat_id: i64) -> String {
        match self.store.get_portfolio(chat_id).await {
            Ok(Some(portfolio)) => {
                let position_info = match (portfolio.position, portfolio.entry_price) {
                    (PositionState::Long, Some(entry)) => {
                        format!("Open Position: long at ${entry:.3}")
                    }
                    _ => "No open positions.".to_string(),
                };
                format!(
                    "💼 *Your Portfolio*\nCapital: ${:.2}\nTotal Profit/Loss: ${:.2}\n{position_info}",
                    portfolio.capital, portfolio.cumulative_pnl
                )
            }
            Ok(None) => {
                "No portfolio found. Set your starting capital with /setcapital <amount>."
                    .to_string()
            }
            Err(e) => {
                error!(error = %e, chat_id, "portfolio lookup failed");
                "Error retrieving portfolio.".to_string()
            }
        }
    }

    async fn set_alert(&self, args: &[&str], chat_id: i64) -> String {
        let Some(target) = args.first().and_then(|a| a.parse::<f64>().ok()) else {
            return "Usage: /setalert <price>".to_string();
        };
        if target <= 0.0 {
            return "Alert price must be positive.".to_string();
        }
        match self.store.put_alert(chat_id, target).await {
            Ok(()) => format!("Alert set for XRP price at ${target:.3}."),
            Err(e) => {
                error!(error = %e, chat_id, "alert upsert failed");
                "Error setting alert.".to_string()
            }
        }
    }

    async fn view_alert(&self, chat_id: i64) -> String {
        match self.store.get_alert(chat_id).await {
            Ok(Some(target)) => format!("Your current price alert is set at ${target:.3}."),
            Ok(None) => {
                "You have no price alerts set. Use /setalert <price> to set one.".to_string()
            }
            Err(e) => {
                error!(error = %e, chat_id, "alert lookup failed");
                "Error retrieving alert.".to_string()
            }
        }
    }

    async fn capital(&self) -> String {
        match self.store.latest_capital().await {
            Ok(Some(capital)) => format!("Your current capital is ${capital:.2}"),
            Ok(None) => "Capital data not available.".to_string(),
            Err(e) => {
                error!(error = %e, "capital lookup failed");
                "Error retrieving capital.".to_string()
            }
        }
    }
}

/// Render a ledger row the way the signal push messages word it.
fn format_signal(signal: &TradeSignal) -> String {
    match signal.kind {
        SignalKind::Buy => format!(
            "⚠️ *Buy Signal Triggered*\nBought at: ${:.5}\nTime: {}\n#Ripple #XRP #XRPPriceAlerts",
            signal.price,
            format_utc(signal.ts)
        ),
        SignalKind::Sell => {
            let pnl = signal.pnl.unwrap_or(0.0);
            let pnl_line = if pnl >= 0.0 {
                format!("💰 Profit: ${pnl:.2}")
            } else {
                format!("🔻 Loss: ${:.2}", pnl.abs())
            };
            let held = signal
                .time_held_secs
                .map(|secs| crate::messaging::format_time_held(chrono::Duration::seconds(secs)))
                .unwrap_or_else(|| "n/a".to_string());
            format!(
                "🚨 *Sell Signal Triggered:*\nSold at: ${:.5}\n{pnl_line}\nUpdated Capital: ${:.2}\nTime Held: {held}\nTime: {}\n#Ripple #XRP #XRPPriceAlerts",
                signal.price,
                signal.updated_capital,
                format_utc(signal.ts)
            )
        }
        SignalKind::Update => "Unknown trading signal.".to_string(),
    }
}

const WELCOME_TEXT: &str = "Welcome to the XRP Price Alerts Bot! Use /price to get the latest XRP price or /lastsignal to get the last trading signal. See /help for everything else.";

const HELP_TEXT: &str = "Available Commands:\n\
/start - Start the bot and show available options\n\
/price - Get the latest XRP price\n\
/lastsignal - Get the last trading signal\n\
/setcapital <amount> - Set your starting capital\n\
/portfolio - View your portfolio\n\
/setalert <price> - Set a custom price alert\n\
/viewalert - View your current price alert\n\
/capital - Show the bot's current capital\n\
/about - Learn more about this bot\n\
/help - Show this help message";

const ABOUT_TEXT: &str = "XRP Price Alerts Bot:\n\
This bot provides real-time XRP price alerts and trading signals.\n\
You can query the current XRP price, view the last trading signal, track your portfolio, set custom price alerts, and receive updates directly in your chat.";

const UNKNOWN_TEXT: &str = "Unknown command. Use /help to see what I can do.";

// =============================================================================
// Receive loop
// =============================================================================

/// Long-poll for chat updates and dispatch commands until cancelled.
pub async fn run_chat_loop(
    client: Arc<TelegramClient>,
    registry: CommandRegistry,
    responder: QueryResponder,
    cancel: CancellationToken,
) {
    info!("chat receive loop started");
    let mut offset: i64 = 0;

    loop {
        let updates = tokio::select! {
            _ = cancel.cancelled() => {
                info!("chat receive loop stopping");
                return;
            }
            result = client.get_updates(offset) => result,
        };

        let updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                warn!(error = %e, "update poll failed — retrying in 5s");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
                }
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);

            let Some(message) = update.message else { continue };
            let Some(text) = message.text.as_deref() else { continue };
            if !text.starts_with('/') {
                continue;
            }

            let chat_id = message.chat.id;
            let reply = match registry.parse(text) {
                Some((kind, args)) => responder.respond(kind, &args, chat_id).await,
                None => UNKNOWN_TEXT.to_string(),
            };

            if let Err(e) = client.send_message(chat_id, &reply, Some("Markdown")).await {
                warn!(error = %e, chat_id, "reply failed");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::Sample;
    use chrono::{TimeZone, Utc};

    const ADMIN: i64 = 99;
    const USER: i64 = 42;

    fn responder(store: Arc<MemoryStore>) -> QueryResponder {
        QueryResponder::new(store, ADMIN)
    }

    fn sample(last: f64) -> Sample {
        Sample {
            ts: Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap(),
            symbol: SYMBOL.to_string(),
            last,
            open: last,
            high: last,
            low: last,
            vwap: last,
            volume: 0.0,
            bid: last,
            ask: last,
            pct_change_24h: 0.0,
            pct_change: None,
        }
    }

    #[test]
    fn registry_parses_commands_and_args() {
        let registry = CommandRegistry::new();

        let (kind, args) = registry.parse("/setcapital 1500.50").unwrap();
        assert_eq!(kind, CommandKind::SetCapital);
        assert_eq!(args, vec!["1500.50"]);

        let (kind, args) = registry.parse("/price").unwrap();
        assert_eq!(kind, CommandKind::Price);
        assert!(args.is_empty());

        // Group-chat form.
        let (kind, _) = registry.parse("/price@XrpSentinelBot").unwrap();
        assert_eq!(kind, CommandKind::Price);

        assert!(registry.parse("/unknown").is_none());
        assert!(registry.parse("").is_none());
    }

    #[tokio::test]
    async fn price_with_and_without_data() {
        let store = Arc::new(MemoryStore::new());
        let responder = responder(store.clone());

        let reply = responder.respond(CommandKind::Price, &[], USER).await;
        assert_eq!(reply, "XRP price data not available.");

        store.append_sample(&sample(0.57123)).await.unwrap();
        let reply = responder.respond(CommandKind::Price, &[], USER).await;
        assert_eq!(reply, "The current XRP price is $0.57123");
    }

    #[tokio::test]
    async fn last_signal_formats_sell() {
        let store = Arc::new(MemoryStore::new());
        store
            .append_trade_signal(&TradeSignal {
                ts: Utc.with_ymd_and_hms(2024, 9, 1, 14, 30, 0).unwrap(),
                kind: SignalKind::Sell,
                price: 0.59,
                pnl: Some(-4.25),
                pct_change: Some(-0.8),
                time_held_secs: Some(5400),
                updated_capital: 995.75,
            })
            .await
            .unwrap();
        let responder = responder(store);

        let reply = responder.respond(CommandKind::LastSignal, &[], USER).await;
        assert!(reply.contains("Sell Signal Triggered"));
        assert!(reply.contains("Loss: $4.25"));
        assert!(reply.contains("1h 30m 0s"));
        assert!(reply.contains("2024-09-01 14:30:00"));
    }

    #[tokio::test]
    async fn setcapital_user_creates_portfolio() {
        let store = Arc::new(MemoryStore::new());
        let responder = responder(store.clone());

        let reply = responder
            .respond(CommandKind::SetCapital, &["1500"], USER)
            .await;
        assert_eq!(reply, "Starting capital set to $1500.00.");

        let portfolio = store.get_portfolio(USER).await.unwrap().unwrap();
        assert!((portfolio.capital - 1500.0).abs() < f64::EPSILON);
        assert_eq!(portfolio.position, PositionState::Flat);

        // Ledger untouched for ordinary users.
        assert!(store.latest_capital().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn setcapital_admin_writes_ledger_row() {
        let store = Arc::new(MemoryStore::new());
        let responder = responder(store.clone());

        let reply = responder
            .respond(CommandKind::SetCapital, &["9000"], ADMIN)
            .await;
        assert_eq!(reply, "Capital updated to $9000.00");
        assert_eq!(store.latest_capital().await.unwrap(), Some(9000.0));
        // UPDATE rows stay invisible to /lastsignal.
        assert!(store.latest_trade_signal().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn setcapital_rejects_garbage() {
        let store = Arc::new(MemoryStore::new());
        let responder = responder(store);

        let reply = responder
            .respond(CommandKind::SetCapital, &["lots"], USER)
            .await;
        assert!(reply.contains("Usage: /setcapital"));

        let reply = responder.respond(CommandKind::SetCapital, &[], USER).await;
        assert!(reply.contains("Usage: /setcapital"));
    }

    #[tokio::test]
    async fn alert_set_and_view() {
        let store = Arc::new(MemoryStore::new());
        let responder = responder(store);

        let reply = responder.respond(CommandKind::ViewAlert, &[], USER).await;
        assert!(reply.contains("no price alerts"));

        let reply = responder
            .respond(CommandKind::SetAlert, &["0.625"], USER)
            .await;
        assert_eq!(reply, "Alert set for XRP price at $0.625.");

        let reply = responder.respond(CommandKind::ViewAlert, &[], USER).await;
        assert_eq!(reply, "Your current price alert is set at $0.625.");
    }

    #[tokio::test]
    async fn portfolio_view_reflects_open_position() {
        let store = Arc::new(MemoryStore::new());
        store
            .put_portfolio(
                USER,
                &Portfolio {
                    capital: 1100.0,
                    position: PositionState::Long,
                    entry_price: Some(0.571),
                    cumulative_pnl: 100.0,
                },
            )
            .await
            .unwrap();
        let responder = responder(store);

        let reply = responder
            .respond(CommandKind::ViewPortfolio, &[], USER)
            .await;
        assert!(reply.contains("Capital: $1100.00"));
        assert!(reply.contains("Total Profit/Loss: $100.00"));
        assert!(reply.contains("long at $0.571"));
    }

    #[tokio::test]
    async fn capital_reads_latest_ledger_row() {
        let store = Arc::new(MemoryStore::new());
        let responder = responder(store.clone());

        let reply = responder.respond(CommandKind::Capital, &[], USER).await;
        assert_eq!(reply, "Capital data not available.");

        store
            .append_trade_signal(&TradeSignal {
                ts: Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap(),
                kind: SignalKind::Sell,
                price: 0.59,
                pnl: Some(12.0),
                pct_change: Some(2.0),
                time_held_secs: Some(60),
                updated_capital: 1012.0,
            })
            .await
            .unwrap();
        let reply = responder.respond(CommandKind::Capital, &[], USER).await;
        assert_eq!(reply, "Your current capital is $1012.00");
    }
}
