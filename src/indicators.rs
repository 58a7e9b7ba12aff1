// src/indicators.rs
//! Technical indicators over daily candles. Values inside an indicator's
//! warm-up window are reported as `None` so charts and the dashboard can
//! render them as gaps.

use crate::models::Candle;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use ta::indicators::{
    BollingerBands, ExponentialMovingAverage, MovingAverageConvergenceDivergence,
    SimpleMovingAverage,
};
use ta::Next;

pub const RSI_PERIOD: usize = 14;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const BB_PERIOD: usize = 20;
pub const BB_STD: f64 = 2.0;
pub const ADX_PERIOD: usize = 14;
pub const ATR_PERIOD: usize = 14;
pub const STOCH_K: usize = 14;
pub const STOCH_SMOOTH: usize = 3;
pub const STOCH_D: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct IndicatorRow {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_hist: Option<f64>,
    pub bb_lower: Option<f64>,
    pub bb_middle: Option<f64>,
    pub bb_upper: Option<f64>,
    pub sma20: Option<f64>,
    pub sma50: Option<f64>,
    pub sma200: Option<f64>,
    pub vwap: Option<f64>,
    pub adx: Option<f64>,
    pub pivot: f64,
    pub r1: f64,
    pub s1: f64,
    pub day_high: f64,
    pub day_low: f64,
    pub stoch_k: Option<f64>,
    pub stoch_d: Option<f64>,
    pub atr: Option<f64>,
    pub ppo: Option<f64>,
    pub ppo_signal: Option<f64>,
    pub ppo_hist: Option<f64>,
    pub obv: f64,
}

pub fn add_technical_indicators(candles: &[Candle]) -> Vec<IndicatorRow> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let rsi = rsi(&closes, RSI_PERIOD);
    let (macd_line, macd_signal, macd_hist) = macd(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
    let (bb_lower, bb_middle, bb_upper) = bollinger(&closes, BB_PERIOD, BB_STD);
    let sma20 = sma(&closes, 20);
    let sma50 = sma(&closes, 50);
    let sma200 = sma(&closes, 200);
    let vwap = vwap(candles);
    let adx = adx(candles, ADX_PERIOD);
    let (stoch_k, stoch_d) = stochastic(candles, STOCH_K, STOCH_SMOOTH, STOCH_D);
    let atr = atr(candles, ATR_PERIOD);
    let (ppo_line, ppo_signal, ppo_hist) = ppo(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
    let obv = obv(candles);

    let mut day_high = f64::NEG_INFINITY;
    let mut day_low = f64::INFINITY;

    candles
        .iter()
        .enumerate()
        .map(|(i, c)| {
            day_high = day_high.max(c.high);
            day_low = day_low.min(c.low);
            let pivot = (c.high + c.low + c.close) / 3.0;
            IndicatorRow {
                timestamp: c.timestamp,
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
                volume: c.volume,
                rsi: rsi[i],
                macd: macd_line[i],
                macd_signal: macd_signal[i],
                macd_hist: macd_hist[i],
                bb_lower: bb_lower[i],
                bb_middle: bb_middle[i],
                bb_upper: bb_upper[i],
                sma20: sma20[i],
                sma50: sma50[i],
                sma200: sma200[i],
                vwap: vwap[i],
                adx: adx[i],
                pivot,
                r1: 2.0 * pivot - c.low,
                s1: 2.0 * pivot - c.high,
                day_high,
                day_low,
                stoch_k: stoch_k[i],
                stoch_d: stoch_d[i],
                atr: atr[i],
                ppo: ppo_line[i],
                ppo_signal: ppo_signal[i],
                ppo_hist: ppo_hist[i],
                obv: obv[i],
            }
        })
        .collect()
}

/// Blanks out the first `warmup` entries.
fn masked(values: Vec<f64>, warmup: usize) -> Vec<Option<f64>> {
    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| (i >= warmup && v.is_finite()).then_some(v))
        .collect()
}

pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    match SimpleMovingAverage::new(period) {
        Ok(mut ind) => masked(values.iter().map(|v| ind.next(*v)).collect(), period - 1),
        Err(_) => vec![None; values.len()],
    }
}

fn ema(values: &[f64], period: usize) -> Option<Vec<f64>> {
    let mut ind = ExponentialMovingAverage::new(period).ok()?;
    Some(values.iter().map(|v| ind.next(*v)).collect())
}

/// Wilder RSI: average gain and loss smoothed with alpha = 1/period. The
/// first value lands on close `period`; a window with no movement is `None`.
pub fn rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if closes.len() < 2 {
        return out;
    }
    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let gains: Vec<f64> = changes.iter().map(|c| c.max(0.0)).collect();
    let losses: Vec<f64> = changes.iter().map(|c| (-c).max(0.0)).collect();

    for (i, (gain, loss)) in rma(&gains, period).into_iter().zip(rma(&losses, period)).enumerate() {
        if let (Some(gain), Some(loss)) = (gain, loss) {
            let total = gain + loss;
            if total > 0.0 {
                out[i + 1] = Some(100.0 * gain / total);
            }
        }
    }
    out
}

type Triple = (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>);

fn empty_triple(len: usize) -> Triple {
    (vec![None; len], vec![None; len], vec![None; len])
}

pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Triple {
    let Ok(mut ind) = MovingAverageConvergenceDivergence::new(fast, slow, signal) else {
        return empty_triple(closes.len());
    };
    let outputs: Vec<_> = closes.iter().map(|v| ind.next(*v)).collect();
    let line_warmup = slow.saturating_sub(1);
    let signal_warmup = line_warmup + signal.saturating_sub(1);
    (
        masked(outputs.iter().map(|o| o.macd).collect(), line_warmup),
        masked(outputs.iter().map(|o| o.signal).collect(), signal_warmup),
        masked(outputs.iter().map(|o| o.histogram).collect(), signal_warmup),
    )
}

/// Returns (lower, middle, upper).
pub fn bollinger(closes: &[f64], period: usize, std_dev: f64) -> Triple {
    let Ok(mut ind) = BollingerBands::new(period, std_dev) else {
        return empty_triple(closes.len());
    };
    let outputs: Vec<_> = closes.iter().map(|v| ind.next(*v)).collect();
    let warmup = period - 1;
    (
        masked(outputs.iter().map(|o| o.lower).collect(), warmup),
        masked(outputs.iter().map(|o| o.average).collect(), warmup),
        masked(outputs.iter().map(|o| o.upper).collect(), warmup),
    )
}

/// Percentage price oscillator: (EMA fast − EMA slow) / EMA slow × 100.
pub fn ppo(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Triple {
    let (Some(fast_ema), Some(slow_ema)) = (ema(closes, fast), ema(closes, slow)) else {
        return empty_triple(closes.len());
    };
    let line: Vec<f64> = fast_ema
        .iter()
        .zip(&slow_ema)
        .map(|(f, s)| if *s != 0.0 { (f - s) / s * 100.0 } else { f64::NAN })
        .collect();
    let Some(signal_line) = ema(&line, signal) else {
        return empty_triple(closes.len());
    };
    let hist: Vec<f64> = line.iter().zip(&signal_line).map(|(l, s)| l - s).collect();

    let line_warmup = slow.saturating_sub(1);
    let signal_warmup = line_warmup + signal.saturating_sub(1);
    (
        masked(line, line_warmup),
        masked(signal_line, signal_warmup),
        masked(hist, signal_warmup),
    )
}

/// Wilder smoothing seeded with the simple mean of the first `period` values.
fn rma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let mut current = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(current);
    for i in period..values.len() {
        current += (values[i] - current) / period as f64;
        out[i] = Some(current);
    }
    out
}

fn true_range(candles: &[Candle]) -> Vec<f64> {
    candles
        .iter()
        .enumerate()
        .map(|(i, c)| match i {
            0 => c.high - c.low,
            _ => {
                let prev_close = candles[i - 1].close;
                (c.high - c.low)
                    .max((c.high - prev_close).abs())
                    .max((c.low - prev_close).abs())
            }
        })
        .collect()
}

pub fn atr(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    rma(&true_range(candles), period)
}

/// Average directional index (Wilder).
pub fn adx(candles: &[Candle], period: usize) -> Vec<Option<f64>> {
    let n = candles.len();
    let mut out = vec![None; n];
    if n < 2 || period == 0 {
        return out;
    }

    let tr = true_range(candles);
    let mut plus_dm = Vec::with_capacity(n - 1);
    let mut minus_dm = Vec::with_capacity(n - 1);
    for pair in candles.windows(2) {
        let up = pair[1].high - pair[0].high;
        let down = pair[0].low - pair[1].low;
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
    }

    // Directional movement starts at the second bar; offset everything by one.
    let tr_smooth = rma(&tr[1..], period);
    let plus_smooth = rma(&plus_dm, period);
    let minus_smooth = rma(&minus_dm, period);

    let mut dx = Vec::new();
    let mut dx_start = None;
    for k in 0..n - 1 {
        let (Some(range), Some(plus), Some(minus)) =
            (tr_smooth[k], plus_smooth[k], minus_smooth[k])
        else {
            continue;
        };
        dx_start.get_or_insert(k + 1);
        let value = if range > 0.0 {
            let plus_di = 100.0 * plus / range;
            let minus_di = 100.0 * minus / range;
            let sum = plus_di + minus_di;
            if sum > 0.0 {
                100.0 * (plus_di - minus_di).abs() / sum
            } else {
                0.0
            }
        } else {
            0.0
        };
        dx.push(value);
    }

    if let Some(start) = dx_start {
        for (k, value) in rma(&dx, period).into_iter().enumerate() {
            out[start + k] = value;
        }
    }
    out
}

fn rolling_mean(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if window == 0 || i + 1 < window {
                return None;
            }
            let slice = &values[i + 1 - window..=i];
            let sum: Option<f64> = slice.iter().copied().sum();
            sum.map(|s| s / window as f64)
        })
        .collect()
}

/// Slow stochastic: %K smoothed over `smooth` bars, %D as its moving average.
pub fn stochastic(
    candles: &[Candle],
    period: usize,
    smooth: usize,
    d_period: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let raw: Vec<Option<f64>> = (0..candles.len())
        .map(|i| {
            if period == 0 || i + 1 < period {
                return None;
            }
            let window = &candles[i + 1 - period..=i];
            let highest = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
            let lowest = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
            let range = highest - lowest;
            (range > 0.0).then(|| 100.0 * (candles[i].close - lowest) / range)
        })
        .collect();
    let k = rolling_mean(&raw, smooth);
    let d = rolling_mean(&k, d_period);
    (k, d)
}

/// Volume-weighted average price, re-anchored at each calendar day.
pub fn vwap(candles: &[Candle]) -> Vec<Option<f64>> {
    let mut day: Option<NaiveDate> = None;
    let mut pv = 0.0;
    let mut vol = 0.0;
    candles
        .iter()
        .map(|c| {
            let date = c.timestamp.date_naive();
            if day != Some(date) {
                day = Some(date);
                pv = 0.0;
                vol = 0.0;
            }
            pv += (c.high + c.low + c.close) / 3.0 * c.volume;
            vol += c.volume;
            (vol > 0.0).then(|| pv / vol)
        })
        .collect()
}

pub fn obv(candles: &[Candle]) -> Vec<f64> {
    let mut total = 0.0;
    candles
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let direction = match i {
                0 => 1.0,
                _ => {
                    let prev = candles[i - 1].close;
                    if c.close > prev {
                        1.0
                    } else if c.close < prev {
                        -1.0
                    } else {
                        0.0
                    }
                }
            };
            total += direction * c.volume;
            total
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TechSignal {
    #[serde(rename = "STRONG BUY")]
    StrongBuy,
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "HOLD")]
    Hold,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "STRONG SELL")]
    StrongSell,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl TechSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            TechSignal::StrongBuy => "STRONG BUY",
            TechSignal::Buy => "BUY",
            TechSignal::Hold => "HOLD",
            TechSignal::Sell => "SELL",
            TechSignal::StrongSell => "STRONG SELL",
            TechSignal::Unknown => "UNKNOWN",
        }
    }
}

pub const DEFAULT_RSI_BUY: f64 = 30.0;
pub const DEFAULT_RSI_SELL: f64 = 70.0;

pub fn generate_tech_signal(rsi: Option<f64>, rsi_buy: f64, rsi_sell: f64) -> TechSignal {
    match rsi {
        Some(v) if v.is_nan() => TechSignal::Unknown,
        None => TechSignal::Unknown,
        Some(v) if v < rsi_buy => TechSignal::StrongBuy,
        Some(v) if v < 45.0 => TechSignal::Buy,
        Some(v) if v > rsi_sell => TechSignal::StrongSell,
        Some(v) if v > 55.0 => TechSignal::Sell,
        Some(_) => TechSignal::Hold,
    }
}

/// Drawdown series relative to the running peak, and its minimum.
pub fn calculate_drawdown(equity_curve: &[f64]) -> (Vec<f64>, f64) {
    let mut peak = f64::NEG_INFINITY;
    let series: Vec<f64> = equity_curve
        .iter()
        .map(|v| {
            peak = peak.max(*v);
            if peak != 0.0 {
                (v - peak) / peak
            } else {
                0.0
            }
        })
        .collect();
    let max_dd = series.iter().copied().fold(0.0, f64::min);
    (series, max_dd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Candle {
                timestamp: start + Duration::days(i as i64),
                open: *close,
                high: close + 1.0,
                low: close - 1.0,
                close: *close,
                volume: 1000.0,
            })
            .collect()
    }

    fn approx(a: Option<f64>, b: f64) -> bool {
        a.map(|v| (v - b).abs() < 1e-9).unwrap_or(false)
    }

    #[test]
    fn sma_has_warmup_gap_then_exact_means() {
        let values: Vec<f64> = (1..=5).map(f64::from).collect();
        let out = sma(&values, 3);
        assert_eq!(out[0], None);
        assert_eq!(out[1], None);
        assert!(approx(out[2], 2.0));
        assert!(approx(out[4], 4.0));
    }

    #[test]
    fn rsi_of_rising_series_approaches_one_hundred() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let out = rsi(&closes, RSI_PERIOD);
        assert!(out[..RSI_PERIOD].iter().all(Option::is_none));
        let last = out[29].unwrap();
        assert!(last > 99.0 && last <= 100.0, "rsi {}", last);
    }

    #[test]
    fn rsi_uses_wilder_smoothing() {
        let closes = [
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            45.61, 46.28, 46.28, 46.00, 46.03, 46.41, 46.22, 45.64,
        ];
        let out = rsi(&closes, RSI_PERIOD);
        assert!(out[13].is_none());
        let close = |a: Option<f64>, b: f64| a.map(|v| (v - b).abs() < 1e-6).unwrap_or(false);
        assert!(close(out[14], 70.464135021), "rsi {:?}", out[14]);
        assert!(close(out[15], 66.249618554), "rsi {:?}", out[15]);
        assert!(close(out[19], 57.915020670), "rsi {:?}", out[19]);
    }

    #[test]
    fn rsi_of_flat_prices_is_undefined() {
        let out = rsi(&[50.0; 20], RSI_PERIOD);
        assert!(out.iter().all(Option::is_none));
    }

    #[test]
    fn flat_prices_collapse_bands_and_macd() {
        let closes = vec![50.0; 60];
        let (lower, middle, upper) = bollinger(&closes, BB_PERIOD, BB_STD);
        assert!(lower[18].is_none());
        assert!(approx(middle[19], 50.0));
        assert!(approx(lower[40], 50.0));
        assert!(approx(upper[40], 50.0));

        let (line, signal, hist) = macd(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
        assert!(line[24].is_none());
        assert!(approx(line[25], 0.0));
        assert!(signal[32].is_none());
        assert!(approx(signal[33], 0.0));
        assert!(approx(hist[59], 0.0));
    }

    #[test]
    fn atr_of_constant_range_equals_range() {
        let candles = candles_from_closes(&vec![10.0; 20]);
        let out = atr(&candles, ATR_PERIOD);
        assert!(out[12].is_none());
        assert!(approx(out[13], 2.0));
        assert!(approx(out[19], 2.0));
    }

    #[test]
    fn adx_of_steady_uptrend_is_one_hundred() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + 2.0 * i as f64).collect();
        let candles = candles_from_closes(&closes);
        let out = adx(&candles, ADX_PERIOD);
        assert!(out[26].is_none());
        assert!(approx(out[27], 100.0));
        assert!(approx(out[39], 100.0));
    }

    #[test]
    fn stochastic_at_top_of_range_is_high() {
        let closes: Vec<f64> = (0..25).map(|i| 100.0 + i as f64).collect();
        let candles = candles_from_closes(&closes);
        let (k, d) = stochastic(&candles, STOCH_K, STOCH_SMOOTH, STOCH_D);
        assert!(k[14].is_none());
        let last_k = k[24].unwrap();
        // close sits one point under the 14-bar high of a 15-point range
        assert!((last_k - 100.0 * 14.0 / 15.0).abs() < 1e-9);
        assert!(d[24].is_some());
    }

    #[test]
    fn obv_accumulates_signed_volume() {
        let mut candles = candles_from_closes(&[10.0, 11.0, 11.0, 9.0]);
        candles[1].volume = 500.0;
        candles[3].volume = 200.0;
        assert_eq!(obv(&candles), vec![1000.0, 1500.0, 1500.0, 1300.0]);
    }

    #[test]
    fn vwap_of_daily_bars_is_typical_price() {
        let candles = candles_from_closes(&[10.0, 20.0]);
        let out = vwap(&candles);
        assert!(approx(out[0], 10.0));
        assert!(approx(out[1], 20.0));
    }

    #[test]
    fn rows_carry_pivots_and_running_extremes() {
        let candles = candles_from_closes(&[10.0, 12.0, 8.0]);
        let rows = add_technical_indicators(&candles);
        assert_eq!(rows.len(), 3);
        assert!((rows[0].pivot - 10.0).abs() < 1e-9);
        assert!((rows[0].r1 - 11.0).abs() < 1e-9);
        assert!((rows[0].s1 - 9.0).abs() < 1e-9);
        assert_eq!(rows[2].day_high, 13.0);
        assert_eq!(rows[2].day_low, 7.0);
        assert!(rows[2].rsi.is_none());
    }

    #[test]
    fn empty_input_yields_no_rows() {
        assert!(add_technical_indicators(&[]).is_empty());
    }

    #[test]
    fn signal_thresholds() {
        assert_eq!(generate_tech_signal(None, 30.0, 70.0), TechSignal::Unknown);
        assert_eq!(generate_tech_signal(Some(f64::NAN), 30.0, 70.0), TechSignal::Unknown);
        assert_eq!(generate_tech_signal(Some(25.0), 30.0, 70.0), TechSignal::StrongBuy);
        assert_eq!(generate_tech_signal(Some(40.0), 30.0, 70.0), TechSignal::Buy);
        assert_eq!(generate_tech_signal(Some(50.0), 30.0, 70.0), TechSignal::Hold);
        assert_eq!(generate_tech_signal(Some(60.0), 30.0, 70.0), TechSignal::Sell);
        assert_eq!(generate_tech_signal(Some(75.0), 30.0, 70.0), TechSignal::StrongSell);
    }

    #[test]
    fn drawdown_tracks_running_peak() {
        let (series, max_dd) = calculate_drawdown(&[100.0, 120.0, 90.0, 130.0]);
        assert_eq!(series[0], 0.0);
        assert!((series[2] + 0.25).abs() < 1e-12);
        assert_eq!(series[3], 0.0);
        assert!((max_dd + 0.25).abs() < 1e-12);
    }
}
