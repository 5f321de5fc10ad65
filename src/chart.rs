// =============================================================================
// Chart Renderer — candle chart PNG for the N-hour summary post
// =============================================================================
//
// Input is a time-ordered (ts, price, volume) series at arbitrary cadence.
// It is resampled into 15-minute OHLC candles aligned to UTC quarter-hour
// boundaries, overlaid with SMA-5 (solid) and EMA-21 (dashed) over closes,
// and rendered dark-themed to disk as
// `xrp_candlestick_chart_<YYYYMMDD_HHMMSS>.png`.
//
// The embedded timestamp in the file name is also what the house-keeper uses
// to age out old charts, so renaming breaks cleanup.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Once;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use plotters::prelude::*;
use plotters::series::DashedLineSeries;
use plotters::style::FontStyle;
use tracing::{debug, info, warn};

/// Embedded font for captions, labels, and the watermark, so rendering does
/// not depend on system font discovery. DejaVu Sans; see
/// `assets/DejaVuSans-LICENSE.txt`.
static FONT_BYTES: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");
static FONT_INIT: Once = Once::new();

fn ensure_fonts_registered() {
    FONT_INIT.call_once(|| {
        if plotters::style::register_font("sans-serif", FontStyle::Normal, FONT_BYTES).is_err()
        {
            warn!("embedded font failed to register — chart text will be missing");
        }
    });
}

/// Candle bucket width in seconds (15 minutes).
const BUCKET_SECS: i64 = 900;

/// Short moving average window over candle closes.
const SMA_PERIOD: usize = 5;
/// Long exponential moving average window over candle closes.
const EMA_PERIOD: usize = 21;

const FILE_PREFIX: &str = "xrp_candlestick_chart_";
const FILE_SUFFIX: &str = ".png";

const CHART_WIDTH: u32 = 1024;
const CHART_HEIGHT: u32 = 576;

/// One raw input observation.
#[derive(Debug, Clone, Copy)]
pub struct PricePoint {
    pub ts: DateTime<Utc>,
    pub price: f64,
    pub volume: f64,
}

/// One resampled 15-minute candle.
#[derive(Debug, Clone, PartialEq)]
pub struct OhlcCandle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// =============================================================================
// Resampling & overlays
// =============================================================================

/// Floor a timestamp to its UTC quarter-hour boundary.
fn quarter_hour_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let floored = secs - secs.rem_euclid(BUCKET_SECS);
    DateTime::from_timestamp(floored, 0).unwrap_or(ts)
}

/// Resample raw points into quarter-hour-aligned OHLC candles.
///
/// Points are bucketed in input order after a stable sort by timestamp, so
/// out-of-order input still produces correct open/close values.
pub fn resample_quarter_hour(points: &[PricePoint]) -> Vec<OhlcCandle> {
    let mut sorted: Vec<PricePoint> = points.to_vec();
    sorted.sort_by_key(|p| p.ts);

    let mut candles: Vec<OhlcCandle> = Vec::new();
    for point in sorted {
        let bucket = quarter_hour_floor(point.ts);
        match candles.last_mut() {
            Some(candle) if candle.open_time == bucket => {
                candle.high = candle.high.max(point.price);
                candle.low = candle.low.min(point.price);
                candle.close = point.price;
                candle.volume += point.volume;
            }
            _ => candles.push(OhlcCandle {
                open_time: bucket,
                open: point.price,
                high: point.price,
                low: point.price,
                close: point.price,
                volume: point.volume,
            }),
        }
    }
    candles
}

/// Simple moving average over `closes`; element `i` corresponds to close
/// index `i + period - 1`. Empty when the input is shorter than `period`.
pub fn sma(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }
    closes
        .windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .collect()
}

/// Exponential moving average seeded with the SMA of the first `period`
/// closes; same alignment as [`sma`].
pub fn ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let seed: f64 = closes[..period].iter().sum::<f64>() / period as f64;

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(seed);
    let mut prev = seed;
    for &close in &closes[period..] {
        let value = close * multiplier + prev * (1.0 - multiplier);
        result.push(value);
        prev = value;
    }
    result
}

// =============================================================================
// Rendering
// =============================================================================

/// Render the candle chart and return the written file path.
pub fn render_candle_chart(
    points: &[PricePoint],
    dir: &Path,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    ensure_fonts_registered();

    let candles = resample_quarter_hour(points);
    if candles.is_empty() {
        bail!("no samples to chart");
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating chart dir {}", dir.display()))?;
    let file = dir.join(format!(
        "{FILE_PREFIX}{}{FILE_SUFFIX}",
        now.format("%Y%m%d_%H%M%S")
    ));

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let sma_values = sma(&closes, SMA_PERIOD);
    let ema_values = ema(&closes, EMA_PERIOD);

    let y_min = candles.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let y_max = candles
        .iter()
        .map(|c| c.high)
        .fold(f64::NEG_INFINITY, f64::max);
    let pad = ((y_max - y_min) * 0.05).max(y_max * 0.001);
    let x_max = candles.len() as f64 - 0.5;

    let background = RGBColor(16, 18, 24);
    let grid = RGBColor(52, 56, 66);
    let text = RGBColor(200, 204, 212);
    let gain = RGBColor(38, 166, 91);
    let loss = RGBColor(214, 69, 65);
    let sma_color = RGBColor(240, 195, 48);
    let ema_color = RGBColor(80, 170, 240);

    {
        let root = BitMapBackend::new(&file, (CHART_WIDTH, CHART_HEIGHT)).into_drawing_area();
        root.fill(&background)
            .map_err(|e| anyhow::anyhow!("filling chart background: {e}"))?;

        let open_times: Vec<DateTime<Utc>> = candles.iter().map(|c| c.open_time).collect();

        let mut chart = ChartBuilder::on(&root)
            .caption(
                "XRP/USD 15m candles",
                ("sans-serif", 24).into_font().color(&text),
            )
            .margin(12)
            .x_label_area_size(34)
            .y_label_area_size(64)
            .build_cartesian_2d(-0.5f64..x_max, (y_min - pad)..(y_max + pad))
            .map_err(|e| anyhow::anyhow!("building chart axes: {e}"))?;

        chart
            .configure_mesh()
            .label_style(("sans-serif", 13).into_font().color(&text))
            .axis_style(grid)
            .light_line_style(background)
            .bold_line_style(grid)
            .x_label_formatter(&|x| {
                let idx = x.round() as i64;
                if idx >= 0 && (idx as usize) < open_times.len() {
                    open_times[idx as usize].format("%H:%M").to_string()
                } else {
                    String::new()
                }
            })
            .y_label_formatter(&|y| format!("{y:.4}"))
            .draw()
            .map_err(|e| anyhow::anyhow!("drawing chart mesh: {e}"))?;

        chart
            .draw_series(candles.iter().enumerate().map(|(i, c)| {
                CandleStick::new(
                    i as f64,
                    c.open,
                    c.high,
                    c.low,
                    c.close,
                    gain.filled(),
                    loss.filled(),
                    12,
                )
            }))
            .map_err(|e| anyhow::anyhow!("drawing candles: {e}"))?;

        if !sma_values.is_empty() {
            chart
                .draw_series(LineSeries::new(
                    sma_values
                        .iter()
                        .enumerate()
                        .map(|(i, v)| ((i + SMA_PERIOD - 1) as f64, *v)),
                    sma_color.stroke_width(2),
                ))
                .map_err(|e| anyhow::anyhow!("drawing SMA overlay: {e}"))?
                .label(format!("SMA-{SMA_PERIOD}"))
                .legend(move |(x, y)| {
                    PathElement::new(vec![(x, y), (x + 18, y)], sma_color.stroke_width(2))
                });
        }

        if !ema_values.is_empty() {
            chart
                .draw_series(DashedLineSeries::new(
                    ema_values
                        .iter()
                        .enumerate()
                        .map(|(i, v)| ((i + EMA_PERIOD - 1) as f64, *v)),
                    6,
                    4,
                    ema_color.stroke_width(2),
                ))
                .map_err(|e| anyhow::anyhow!("drawing EMA overlay: {e}"))?
                .label(format!("EMA-{EMA_PERIOD}"))
                .legend(move |(x, y)| {
                    PathElement::new(vec![(x, y), (x + 18, y)], ema_color.stroke_width(2))
                });
        }

        if !sma_values.is_empty() || !ema_values.is_empty() {
            chart
                .configure_series_labels()
                .background_style(background.mix(0.85))
                .border_style(grid)
                .label_font(("sans-serif", 13).into_font().color(&text))
                .position(SeriesLabelPosition::UpperLeft)
                .draw()
                .map_err(|e| anyhow::anyhow!("drawing chart legend: {e}"))?;
        }

        root.draw(&Text::new(
            "xrp-sentinel",
            (CHART_WIDTH as i32 - 110, CHART_HEIGHT as i32 - 22),
            ("sans-serif", 14).into_font().color(&grid),
        ))
        .map_err(|e| anyhow::anyhow!("drawing watermark: {e}"))?;

        root.present()
            .map_err(|e| anyhow::anyhow!("writing chart file: {e}"))?;
    }

    info!(file = %file.display(), candles = candles.len(), "chart rendered");
    Ok(file)
}

// =============================================================================
// House-keeping
// =============================================================================

/// Timestamp embedded in a convention-matching chart file name.
fn parse_chart_timestamp(file_name: &str) -> Option<DateTime<Utc>> {
    let stem = file_name
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?;
    NaiveDateTime::parse_from_str(stem, "%Y%m%d_%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Delete convention-matching chart files older than `max_age_days`.
/// Returns the number of files removed. Files deleted concurrently by
/// another party are silently skipped.
pub fn cleanup_charts(dir: &Path, max_age_days: u64, now: DateTime<Utc>) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("reading chart dir {}", dir.display())),
    };

    let cutoff = now - chrono::Duration::days(max_age_days as i64);
    let mut removed = 0;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stamp) = parse_chart_timestamp(name) else {
            continue;
        };
        if stamp >= cutoff {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!(file = name, "stale chart removed");
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file = name, error = %e, "failed to remove stale chart"),
        }
    }

    Ok(removed)
}
