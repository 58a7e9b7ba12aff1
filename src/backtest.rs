// src/backtest.rs
//! Signal-driven backtesting over daily candles.

use crate::indicators::{self, calculate_drawdown, MACD_FAST, MACD_SIGNAL, MACD_SLOW, RSI_PERIOD};
use crate::models::Candle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Distribution};

pub const DEFAULT_INITIAL_CAPITAL: f64 = 100_000.0;
pub const DEFAULT_COMMISSION: f64 = 0.001;
const TRADING_DAYS: f64 = 252.0;

/// Produces one signal per candle: `1.0` long, `-1.0` exit, `0.0` flat.
/// Orders are placed where the signal changes.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn signals(&self, candles: &[Candle]) -> Vec<f64>;
}

fn closes(candles: &[Candle]) -> Vec<f64> {
    candles.iter().map(|c| c.close).collect()
}

fn above(a: Option<f64>, b: Option<f64>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a > b)
}

fn below(a: Option<f64>, b: Option<f64>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a < b)
}

#[derive(Debug, Clone)]
pub struct MovingAverageCross {
    pub short_window: usize,
    pub long_window: usize,
}

impl Strategy for MovingAverageCross {
    fn name(&self) -> &'static str {
        "Moving Average Crossover"
    }

    fn signals(&self, candles: &[Candle]) -> Vec<f64> {
        let closes = closes(candles);
        let short = indicators::sma(&closes, self.short_window);
        let long = indicators::sma(&closes, self.long_window);
        (0..closes.len())
            .map(|i| {
                if i >= self.long_window && above(short[i], long[i]) {
                    1.0
                } else {
                    0.0
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct RsiStrategy {
    pub rsi_period: usize,
    pub overbought: f64,
    pub oversold: f64,
}

impl Strategy for RsiStrategy {
    fn name(&self) -> &'static str {
        "RSI Strategy"
    }

    fn signals(&self, candles: &[Candle]) -> Vec<f64> {
        indicators::rsi(&closes(candles), self.rsi_period)
            .into_iter()
            .map(|rsi| match rsi {
                Some(v) if v > self.overbought => -1.0,
                Some(v) if v < self.oversold => 1.0,
                _ => 0.0,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MacdCross;

impl Strategy for MacdCross {
    fn name(&self) -> &'static str {
        "MACD Strategy"
    }

    fn signals(&self, candles: &[Candle]) -> Vec<f64> {
        let (line, signal, _) = indicators::macd(&closes(candles), MACD_FAST, MACD_SLOW, MACD_SIGNAL);
        (0..line.len())
            .map(|i| {
                if i == 0 {
                    return 0.0;
                }
                let (Some(prev_line), Some(prev_signal)) = (line[i - 1], signal[i - 1]) else {
                    return 0.0;
                };
                let crossed_up = above(line[i], signal[i]) && prev_line <= prev_signal;
                let crossed_down = below(line[i], signal[i]) && prev_line >= prev_signal;
                if crossed_down {
                    -1.0
                } else if crossed_up {
                    1.0
                } else {
                    0.0
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct MaWithRsi {
    pub short_window: usize,
    pub long_window: usize,
    pub rsi_buy: f64,
    pub rsi_sell: f64,
}

impl Strategy for MaWithRsi {
    fn name(&self) -> &'static str {
        "MA with RSI Filter"
    }

    fn signals(&self, candles: &[Candle]) -> Vec<f64> {
        let closes = closes(candles);
        let short = indicators::sma(&closes, self.short_window);
        let long = indicators::sma(&closes, self.long_window);
        let rsi = indicators::rsi(&closes, RSI_PERIOD);
        (0..closes.len())
            .map(|i| {
                if below(short[i], long[i]) && matches!(rsi[i], Some(v) if v > self.rsi_sell) {
                    -1.0
                } else if above(short[i], long[i]) && matches!(rsi[i], Some(v) if v < self.rsi_buy) {
                    1.0
                } else {
                    0.0
                }
            })
            .collect()
    }
}

/// Strategy selection as submitted by the backtesting form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    MaCross {
        #[serde(default = "default_short_window")]
        short_window: usize,
        #[serde(default = "default_long_window")]
        long_window: usize,
    },
    Rsi {
        #[serde(default = "default_rsi_period")]
        rsi_period: usize,
        #[serde(default = "default_overbought")]
        overbought: f64,
        #[serde(default = "default_oversold")]
        oversold: f64,
    },
    Macd,
    MaRsi {
        #[serde(default = "default_short_window")]
        short_window: usize,
        #[serde(default = "default_long_window")]
        long_window: usize,
        #[serde(default = "default_oversold")]
        rsi_buy: f64,
        #[serde(default = "default_overbought")]
        rsi_sell: f64,
    },
}

fn default_short_window() -> usize {
    20
}

fn default_long_window() -> usize {
    50
}

fn default_rsi_period() -> usize {
    RSI_PERIOD
}

fn default_overbought() -> f64 {
    70.0
}

fn default_oversold() -> f64 {
    30.0
}

impl StrategyConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            StrategyConfig::MaCross { .. } => "ma_cross",
            StrategyConfig::Rsi { .. } => "rsi",
            StrategyConfig::Macd => "macd",
            StrategyConfig::MaRsi { .. } => "ma_rsi",
        }
    }

    pub fn build(&self) -> Result<Box<dyn Strategy>, String> {
        let check_windows = |short: usize, long: usize| {
            if short == 0 || long == 0 {
                Err("Moving average windows must be positive".to_string())
            } else if short >= long {
                Err("Short window must be smaller than long window".to_string())
            } else {
                Ok(())
            }
        };
        let check_band = |low: f64, high: f64| {
            if (0.0..=100.0).contains(&low) && (0.0..=100.0).contains(&high) && low < high {
                Ok(())
            } else {
                Err("RSI thresholds must lie in 0..=100 with buy below sell".to_string())
            }
        };

        match *self {
            StrategyConfig::MaCross {
                short_window,
                long_window,
            } => {
                check_windows(short_window, long_window)?;
                Ok(Box::new(MovingAverageCross {
                    short_window,
                    long_window,
                }))
            }
            StrategyConfig::Rsi {
                rsi_period,
                overbought,
                oversold,
            } => {
                if rsi_period == 0 {
                    return Err("RSI period must be positive".to_string());
                }
                check_band(oversold, overbought)?;
                Ok(Box::new(RsiStrategy {
                    rsi_period,
                    overbought,
                    oversold,
                }))
            }
            StrategyConfig::Macd => Ok(Box::new(MacdCross)),
            StrategyConfig::MaRsi {
                short_window,
                long_window,
                rsi_buy,
                rsi_sell,
            } => {
                check_windows(short_window, long_window)?;
                check_band(rsi_buy, rsi_sell)?;
                Ok(Box::new(MaWithRsi {
                    short_window,
                    long_window,
                    rsi_buy,
                    rsi_sell,
                }))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSizing {
    /// Fixed dollar amount per trade.
    #[default]
    FixedDollar,
    /// Percent of the previous day's equity.
    Percentage,
    /// Percent of equity put at risk; sized like `Percentage`.
    FixedRisk,
    FixedShares,
}

impl PositionSizing {
    /// Position value used when a run does not name one.
    pub fn default_value(&self) -> f64 {
        match self {
            PositionSizing::FixedDollar => 10_000.0,
            PositionSizing::Percentage | PositionSizing::FixedRisk => 10.0,
            PositionSizing::FixedShares => 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioRow {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    pub signal: f64,
    /// Change in signal since the previous bar; absent on the first bar.
    pub positions: Option<f64>,
    pub position: f64,
    pub holdings: f64,
    pub cash: f64,
    pub total: f64,
    pub returns: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Percent.
    pub return_pct: f64,
    pub profitable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedTradeStats {
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// `None` when there were no losing trades.
    pub profit_factor: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeMetrics {
    pub total_trades: usize,
    pub buy_trades: usize,
    pub sell_trades: usize,
    #[serde(flatten)]
    pub completed: Option<CompletedTradeStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub annualized_return: f64,
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown: f64,
    pub final_equity: f64,
    pub trade_metrics: TradeMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub strategy: &'static str,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub portfolio: Vec<PortfolioRow>,
    pub trades: Vec<Trade>,
    pub metrics: PerformanceMetrics,
}

pub struct Backtester {
    strategy: Box<dyn Strategy>,
    initial_capital: f64,
    commission: f64,
    sizing: PositionSizing,
    sizing_value: f64,
}

impl Backtester {
    pub fn new(strategy: Box<dyn Strategy>) -> Self {
        Backtester {
            strategy,
            initial_capital: DEFAULT_INITIAL_CAPITAL,
            commission: DEFAULT_COMMISSION,
            sizing: PositionSizing::FixedDollar,
            sizing_value: 10_000.0,
        }
    }

    pub fn initial_capital(mut self, capital: f64) -> Self {
        self.initial_capital = capital;
        self
    }

    pub fn commission(mut self, commission: f64) -> Self {
        self.commission = commission;
        self
    }

    pub fn position_sizing(mut self, method: PositionSizing, value: f64) -> Self {
        self.sizing = method;
        self.sizing_value = value;
        self
    }

    fn shares_for(&self, price: f64, previous_total: f64) -> f64 {
        match self.sizing {
            PositionSizing::FixedDollar => (self.sizing_value / price).trunc(),
            PositionSizing::Percentage | PositionSizing::FixedRisk => {
                (previous_total * self.sizing_value / 100.0 / price).trunc()
            }
            PositionSizing::FixedShares => self.sizing_value.trunc(),
        }
    }

    /// Runs the bar loop. Returns `None` for an empty candle series.
    pub fn run(&self, candles: &[Candle]) -> Option<BacktestReport> {
        let first = candles.first()?;
        let last = candles.last()?;
        let signals = self.strategy.signals(candles);

        let mut portfolio: Vec<PortfolioRow> = Vec::with_capacity(candles.len());
        portfolio.push(PortfolioRow {
            timestamp: first.timestamp,
            close: first.close,
            signal: signals[0],
            positions: None,
            position: 0.0,
            holdings: 0.0,
            cash: self.initial_capital,
            total: self.initial_capital,
            returns: 0.0,
        });

        for t in 1..candles.len() {
            let prev = &portfolio[t - 1];
            let price = candles[t].close;
            let diff = signals[t] - signals[t - 1];
            let mut position = prev.position;
            let mut cash = prev.cash;

            if diff != 0.0 {
                let shares = self.shares_for(price, prev.total);
                if diff > 0.0 {
                    position += shares;
                    cash -= shares * price * (1.0 + self.commission);
                } else if prev.position > 0.0 {
                    let sold = shares.min(prev.position);
                    position -= sold;
                    cash += sold * price * (1.0 - self.commission);
                }
            }

            let holdings = position * price;
            let total = holdings + cash;
            let returns = total / prev.total - 1.0;
            portfolio.push(PortfolioRow {
                timestamp: candles[t].timestamp,
                close: price,
                signal: signals[t],
                positions: Some(diff),
                position,
                holdings,
                cash,
                total,
                returns,
            });
        }

        let trades = pair_trades(&portfolio);
        let metrics = self.metrics(&portfolio, &trades);
        Some(BacktestReport {
            strategy: self.strategy.name(),
            start_date: first.timestamp,
            end_date: last.timestamp,
            portfolio,
            trades,
            metrics,
        })
    }

    fn metrics(&self, portfolio: &[PortfolioRow], trades: &[Trade]) -> PerformanceMetrics {
        let returns = Data::new(portfolio.iter().map(|r| r.returns).collect::<Vec<_>>());
        let sharpe_ratio = match (returns.mean(), returns.std_dev()) {
            (Some(mean), Some(std)) if std > 0.0 => Some(TRADING_DAYS.sqrt() * mean / std),
            _ => None,
        };

        let totals: Vec<f64> = portfolio.iter().map(|r| r.total).collect();
        let (_, max_drawdown) = calculate_drawdown(&totals);
        let final_equity = totals.last().copied().unwrap_or(self.initial_capital);
        let total_return = (final_equity / self.initial_capital - 1.0) * 100.0;

        let n_days = match (portfolio.first(), portfolio.last()) {
            (Some(a), Some(b)) => (b.timestamp - a.timestamp).num_days(),
            _ => 0,
        };
        let annualized_return = if n_days > 0 {
            ((1.0 + total_return / 100.0).powf(365.0 / n_days as f64) - 1.0) * 100.0
        } else {
            0.0
        };

        PerformanceMetrics {
            total_return,
            annualized_return,
            sharpe_ratio,
            max_drawdown: max_drawdown * 100.0,
            final_equity,
            trade_metrics: trade_metrics(portfolio, trades),
        }
    }
}

/// Pairs each buy with the next sell; overlapping buys are ignored.
fn pair_trades(portfolio: &[PortfolioRow]) -> Vec<Trade> {
    let mut trades = Vec::new();
    let mut entry: Option<&PortfolioRow> = None;
    for row in portfolio {
        match (row.positions, entry) {
            (Some(p), None) if p > 0.0 => entry = Some(row),
            (Some(p), Some(open)) if p < 0.0 => {
                let return_pct = (row.close / open.close - 1.0) * 100.0;
                trades.push(Trade {
                    entry_time: open.timestamp,
                    exit_time: row.timestamp,
                    entry_price: open.close,
                    exit_price: row.close,
                    return_pct,
                    profitable: return_pct > 0.0,
                });
                entry = None;
            }
            _ => {}
        }
    }
    trades
}

fn trade_metrics(portfolio: &[PortfolioRow], trades: &[Trade]) -> TradeMetrics {
    let buy_trades = portfolio
        .iter()
        .filter(|r| matches!(r.positions, Some(p) if p > 0.0))
        .count();
    let sell_trades = portfolio
        .iter()
        .filter(|r| matches!(r.positions, Some(p) if p < 0.0))
        .count();

    let completed = (buy_trades > 0 && sell_trades > 0 && !trades.is_empty()).then(|| {
        let wins: Vec<f64> = trades.iter().filter(|t| t.profitable).map(|t| t.return_pct).collect();
        let losses: Vec<f64> = trades.iter().filter(|t| !t.profitable).map(|t| t.return_pct).collect();
        let mean = |v: &[f64]| {
            if v.is_empty() {
                0.0
            } else {
                v.iter().sum::<f64>() / v.len() as f64
            }
        };
        let avg_win = mean(&wins);
        let avg_loss = mean(&losses);
        let profit_factor = (!losses.is_empty() && avg_loss < 0.0).then(|| {
            (avg_win * wins.len() as f64 / (avg_loss * losses.len() as f64)).abs()
        });
        CompletedTradeStats {
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate: wins.len() as f64 / trades.len() as f64 * 100.0,
            avg_win,
            avg_loss,
            profit_factor,
        }
    });

    TradeMetrics {
        total_trades: buy_trades + sell_trades,
        buy_trades,
        sell_trades,
        completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn candles(closes: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Candle {
                timestamp: start + Duration::days(i as i64),
                open: *c,
                high: *c,
                low: *c,
                close: *c,
                volume: 1_000.0,
            })
            .collect()
    }

    /// Emits a fixed signal series regardless of prices.
    struct Scripted(Vec<f64>);

    impl Strategy for Scripted {
        fn name(&self) -> &'static str {
            "Scripted"
        }

        fn signals(&self, _candles: &[Candle]) -> Vec<f64> {
            self.0.clone()
        }
    }

    #[test]
    fn buy_then_sell_realises_profit_net_of_commission() {
        let data = candles(&[100.0, 100.0, 110.0, 120.0]);
        let report = Backtester::new(Box::new(Scripted(vec![0.0, 1.0, 1.0, 0.0])))
            .position_sizing(PositionSizing::FixedShares, 10.0)
            .run(&data)
            .unwrap();

        let rows = &report.portfolio;
        assert_eq!(rows[1].position, 10.0);
        assert!((rows[1].cash - (100_000.0 - 1_000.0 * 1.001)).abs() < 1e-9);
        assert_eq!(rows[3].position, 0.0);
        let expected = 100_000.0 - 1_000.0 * 1.001 + 1_200.0 * 0.999;
        assert!((report.metrics.final_equity - expected).abs() < 1e-9);

        assert_eq!(report.trades.len(), 1);
        assert!((report.trades[0].return_pct - 20.0).abs() < 1e-9);
        let stats = report.metrics.trade_metrics.completed.as_ref().unwrap();
        assert_eq!(stats.winning_trades, 1);
        assert_eq!(stats.win_rate, 100.0);
        assert!(stats.profit_factor.is_none());
    }

    #[test]
    fn sells_are_capped_at_held_position() {
        let data = candles(&[50.0, 50.0, 50.0, 50.0]);
        let report = Backtester::new(Box::new(Scripted(vec![0.0, -1.0, 0.0, -1.0])))
            .position_sizing(PositionSizing::FixedShares, 5.0)
            .run(&data)
            .unwrap();
        // The first -1 arrives with nothing held, the rebound to 0 buys 5,
        // and the final -1 may only sell those 5.
        assert_eq!(report.portfolio[1].position, 0.0);
        assert_eq!(report.portfolio[2].position, 5.0);
        assert_eq!(report.portfolio[3].position, 0.0);
    }

    #[test]
    fn fixed_dollar_sizing_truncates_to_whole_shares() {
        let data = candles(&[300.0, 300.0]);
        let report = Backtester::new(Box::new(Scripted(vec![0.0, 1.0])))
            .run(&data)
            .unwrap();
        assert_eq!(report.portfolio[1].position, 33.0);
    }

    #[test]
    fn percentage_sizing_uses_previous_equity() {
        let data = candles(&[100.0, 100.0]);
        let report = Backtester::new(Box::new(Scripted(vec![0.0, 1.0])))
            .initial_capital(50_000.0)
            .position_sizing(PositionSizing::Percentage, 10.0)
            .run(&data)
            .unwrap();
        assert_eq!(report.portfolio[1].position, 50.0);
    }

    #[test]
    fn flat_run_has_no_sharpe_and_no_drawdown() {
        let data = candles(&[10.0; 30]);
        let report = Backtester::new(Box::new(Scripted(vec![0.0; 30])))
            .run(&data)
            .unwrap();
        assert!(report.metrics.sharpe_ratio.is_none());
        assert_eq!(report.metrics.max_drawdown, 0.0);
        assert_eq!(report.metrics.total_return, 0.0);
        assert_eq!(report.metrics.trade_metrics.total_trades, 0);
        assert!(report.metrics.trade_metrics.completed.is_none());
    }

    #[test]
    fn empty_series_yields_no_report() {
        assert!(Backtester::new(Box::new(MacdCross)).run(&[]).is_none());
    }

    #[test]
    fn moving_average_cross_is_flat_before_long_window() {
        let closes: Vec<f64> = (1..=60).map(f64::from).collect();
        let signals = MovingAverageCross {
            short_window: 5,
            long_window: 20,
        }
        .signals(&candles(&closes));
        assert!(signals[..20].iter().all(|s| *s == 0.0));
        assert!(signals[20..].iter().all(|s| *s == 1.0));
    }

    #[test]
    fn strategy_config_parses_and_validates() {
        let config: StrategyConfig =
            serde_json::from_str(r#"{"type":"ma_cross","short_window":10,"long_window":30}"#).unwrap();
        assert_eq!(config.type_name(), "ma_cross");
        assert!(config.build().is_ok());

        let bad: StrategyConfig =
            serde_json::from_str(r#"{"type":"ma_rsi","short_window":50,"long_window":20}"#).unwrap();
        assert!(bad.build().is_err());

        let macd: StrategyConfig = serde_json::from_str(r#"{"type":"macd"}"#).unwrap();
        assert_eq!(macd.build().unwrap().name(), "MACD Strategy");
    }
}
