// =============================================================================
// Message Templates — outbound post and chat bodies
// =============================================================================
//
// Every template stamps the wall-clock time as UTC `YYYY-MM-DD HH:MM:SS` and
// closes with a fixed hashtag footer. Microblog templates use plain text;
// chat templates use the bot API's Markdown flavour.
// =============================================================================

use chrono::{DateTime, Duration, Utc};

/// XRP all-time high; crossing it swaps the hourly template for the ATH one.
pub const ALL_TIME_HIGH: f64 = 3.65;

/// Footer shared by the regular price-alert posts.
const HASHTAGS: &str = "#Ripple #XRP #XRPPriceAlerts";

/// Wall-clock format used in every message body.
pub fn format_utc(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Percent change between two prices; zero when the base price is zero.
pub fn percent_change(old_price: f64, new_price: f64) -> f64 {
    if old_price != 0.0 {
        (new_price - old_price) / old_price * 100.0
    } else {
        0.0
    }
}

/// Render a held duration as `XhYmZs`.
pub fn format_time_held(held: Duration) -> String {
    let total = held.num_seconds().max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours}h {minutes}m {seconds}s")
}

// =============================================================================
// Microblog templates
// =============================================================================

/// Hourly price update. `last_posted` is the rounded price from the previous
/// hourly post; an ATH break overrides the up/same/down wording.
pub fn hourly_update(last_posted: f64, current: f64, now: DateTime<Utc>) -> String {
    let timestamp = format_utc(now);

    if current > ALL_TIME_HIGH {
        return format!(
            "🚀🔥 $XRP just shattered its all-time high, now at an incredible ${current:.2}!!! 🚀🔥\nTime: {timestamp}\n#Ripple #XRP #XRPATH #ToTheMoon"
        );
    }

    let pct = percent_change(last_posted, current);
    if current == last_posted {
        format!(
            "🔔❗️ $XRP has retained a value of ${current:.2} over the last hour.\nTime: {timestamp}\n{HASHTAGS}"
        )
    } else if current > last_posted {
        format!(
            "🔔📈 $XRP is UP {pct:.2}% over the last hour to ${current:.2}!\nTime: {timestamp}\n{HASHTAGS}"
        )
    } else {
        format!(
            "🔔📉 $XRP is DOWN -{:.2}% over the last hour to ${current:.2}!\nTime: {timestamp}\n{HASHTAGS}",
            pct.abs()
        )
    }
}

/// Volatility alert for a >= 2 % move inside the check window.
pub fn volatility_alert(reference: f64, current: f64, now: DateTime<Utc>) -> String {
    let pct = percent_change(reference, current);
    let (direction, emoji) = if current > reference {
        ("UP", "📈")
    } else {
        ("DOWN", "📉")
    };
    format!(
        "⚡️ $XRP is experiencing volatility! It's {direction} by {:.2}% to ${current:.2} {emoji}\nTime: {}\n#Ripple #XRP #XRPVolatility",
        pct.abs(),
        format_utc(now)
    )
}

/// Three-hour summary text attached to the candle chart.
pub fn n_hour_summary(
    pct: f64,
    support: f64,
    resistance: f64,
    current: f64,
    now: DateTime<Utc>,
) -> String {
    format!(
        "🔔🕒 #XRP Price in last 3 hours: {pct:+.2}% change\nSupport around ${support:.5}\nResistance around ${resistance:.5}\nLast $XRP Price: ${current:.5}\nTime: {}\n{HASHTAGS}",
        format_utc(now)
    )
}

/// End-of-day price range summary.
pub fn daily_summary(daily_high: f64, daily_low: f64) -> String {
    format!(
        "📊 Daily Summary: Today's XRP price ranged between ${daily_low:.5} and ${daily_high:.5}. \n{HASHTAGS}"
    )
}

// =============================================================================
// Chat templates (Markdown)
// =============================================================================

/// Buy notification pushed to the chat channel.
pub fn buy_signal(price: f64, ts: DateTime<Utc>) -> String {
    format!(
        "⚠️ *Buy Signal Triggered*\n\n📅 *Date/Time:* {}\n💰 *Bought at:* ${price:.5}\n💡 Stay tuned for the next update!\n#Ripple #XRP",
        format_utc(ts)
    )
}

/// Sell notification pushed to the chat channel.
pub fn sell_signal(
    price: f64,
    pnl: f64,
    time_held: Duration,
    updated_capital: f64,
    ts: DateTime<Utc>,
) -> String {
    let result_line = if pnl >= 0.0 {
        format!("💰 Profit: ${pnl:.2}")
    } else {
        format!("🔻 Loss: ${:.2}", pnl.abs())
    };
    format!(
        "🚨 *Sell Signal Triggered*\n\n📅 *Date/Time:* {}\n💸 *Sold at:* ${price:.5}\n{result_line}\n⏳ *Time Held:* {}\n💼 *Updated Capital:* ${updated_capital:.2}",
        format_utc(ts),
        format_time_held(time_held)
    )
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn percent_change_handles_zero_base() {
        assert_eq!(percent_change(0.0, 1.0), 0.0);
        assert!((percent_change(0.50, 0.51) - 2.0).abs() < 1e-9);
        assert!((percent_change(0.50, 0.49) + 2.0).abs() < 1e-9);
    }

    #[test]
    fn hourly_up_down_same() {
        let up = hourly_update(0.50, 0.51, at_noon());
        assert!(up.contains("UP 2.00%"));
        assert!(up.contains("$0.51"));
        assert!(up.contains("2024-09-01 12:00:00"));

        let down = hourly_update(0.51, 0.50, at_noon());
        assert!(down.contains("DOWN -1.96%"));

        let same = hourly_update(0.50, 0.50, at_noon());
        assert!(same.contains("retained a value of $0.50"));
    }

    #[test]
    fn ath_overrides_hourly() {
        let msg = hourly_update(3.60, 3.70, at_noon());
        assert!(msg.contains("all-time high"));
        assert!(msg.contains("#XRPATH"));
    }

    #[test]
    fn volatility_direction() {
        let up = volatility_alert(0.50, 0.52, at_noon());
        assert!(up.contains("UP by 4.00%"));
        let down = volatility_alert(0.52, 0.50, at_noon());
        assert!(down.contains("DOWN by 3.85%"));
    }

    #[test]
    fn summary_cites_all_levels() {
        let msg = n_hour_summary(1.25, 0.56100, 0.58200, 0.57900, at_noon());
        assert!(msg.contains("+1.25% change"));
        assert!(msg.contains("Support around $0.56100"));
        assert!(msg.contains("Resistance around $0.58200"));
        assert!(msg.contains("Last $XRP Price: $0.57900"));
    }

    #[test]
    fn time_held_formatting() {
        assert_eq!(format_time_held(Duration::seconds(3754)), "1h 2m 34s");
        assert_eq!(format_time_held(Duration::seconds(59)), "0h 0m 59s");
        assert_eq!(format_time_held(Duration::seconds(-5)), "0h 0m 0s");
    }

    #[test]
    fn sell_message_wording_follows_sign() {
        let profit = sell_signal(0.59, 12.5, Duration::minutes(90), 1012.5, at_noon());
        assert!(profit.contains("Profit: $12.50"));
        assert!(profit.contains("1h 30m 0s"));

        let loss = sell_signal(0.55, -8.25, Duration::minutes(10), 991.75, at_noon());
        assert!(loss.contains("Loss: $8.25"));
    }
}
