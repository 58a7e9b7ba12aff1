// src/market_data.rs
use crate::db::{check_data_exists, insert_historical_data, last_fetch, query_historical_data, record_fetch};
use crate::indicators::{generate_tech_signal, rsi, DEFAULT_RSI_BUY, DEFAULT_RSI_SELL, RSI_PERIOD};
use crate::models::{Candle, Quote};
use crate::options::{build_option_chain, OptionChain, OptionContract, OptionType};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

const ALPHA_VANTAGE_URL: &str = "https://www.alphavantage.co/query";

/// Calendar days covered by the provider's compact (latest 100 bars) series.
const COMPACT_WINDOW_DAYS: i64 = 140;

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("market data request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("market data provider returned HTTP {0}")]
    Status(u16),

    #[error("market data provider error for {symbol}: {message}")]
    Provider { symbol: String, message: String },

    #[error("No data returned for ticker: {0}")]
    Empty(String),

    #[error("invalid ticker symbol: {0}")]
    InvalidSymbol(String),

    #[error("market data cache error: {0}")]
    Cache(#[from] sqlx::Error),
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Daily candles, oldest first. `full` asks for the entire history rather
    /// than the latest bars only.
    async fn daily_history(&self, symbol: &str, full: bool) -> Result<Vec<Candle>, MarketDataError>;

    async fn option_chain(&self, symbol: &str) -> Result<Vec<OptionContract>, MarketDataError>;
}

#[derive(Deserialize)]
struct TimeSeriesData {
    #[serde(rename = "1. open")]
    open: String,
    #[serde(rename = "2. high")]
    high: String,
    #[serde(rename = "3. low")]
    low: String,
    #[serde(rename = "4. close")]
    close: String,
    #[serde(rename = "5. volume")]
    volume: String,
}

#[derive(Deserialize)]
struct AlphaVantageResponse {
    #[serde(rename = "Time Series (Daily)")]
    time_series: HashMap<String, TimeSeriesData>,
}

#[derive(Deserialize)]
struct OptionsResponse {
    #[serde(default)]
    data: Vec<OptionRecord>,
}

#[derive(Deserialize)]
struct OptionRecord {
    #[serde(rename = "contractID")]
    contract_id: String,
    expiration: String,
    strike: String,
    #[serde(rename = "type")]
    option_type: String,
    last: Option<String>,
    bid: Option<String>,
    ask: Option<String>,
    volume: Option<String>,
    open_interest: Option<String>,
    implied_volatility: Option<String>,
}

fn number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Rejects the error, rate-limit and notice bodies the API returns with
/// HTTP 200.
fn check_api_message(symbol: &str, body: &Value) -> Result<(), MarketDataError> {
    for key in ["Error Message", "Note", "Information"] {
        if let Some(message) = body.get(key).and_then(Value::as_str) {
            return Err(MarketDataError::Provider {
                symbol: symbol.to_string(),
                message: message.to_string(),
            });
        }
    }
    Ok(())
}

pub fn parse_daily_series(symbol: &str, body: &str) -> Result<Vec<Candle>, MarketDataError> {
    let value: Value = serde_json::from_str(body).map_err(|e| MarketDataError::Provider {
        symbol: symbol.to_string(),
        message: e.to_string(),
    })?;
    check_api_message(symbol, &value)?;
    let response: AlphaVantageResponse =
        serde_json::from_value(value).map_err(|e| MarketDataError::Provider {
            symbol: symbol.to_string(),
            message: e.to_string(),
        })?;

    let mut candles: Vec<Candle> = response
        .time_series
        .into_iter()
        .filter_map(|(date_str, data)| {
            let date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d").ok()?;
            Some(Candle {
                timestamp: date.and_hms_opt(0, 0, 0)?.and_utc(),
                open: number(&data.open)?,
                high: number(&data.high)?,
                low: number(&data.low)?,
                close: number(&data.close)?,
                volume: number(&data.volume).unwrap_or(0.0),
            })
        })
        .collect();
    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

pub fn parse_option_chain(symbol: &str, body: &str) -> Result<Vec<OptionContract>, MarketDataError> {
    let value: Value = serde_json::from_str(body).map_err(|e| MarketDataError::Provider {
        symbol: symbol.to_string(),
        message: e.to_string(),
    })?;
    check_api_message(symbol, &value)?;
    let response: OptionsResponse =
        serde_json::from_value(value).map_err(|e| MarketDataError::Provider {
            symbol: symbol.to_string(),
            message: e.to_string(),
        })?;

    Ok(response
        .data
        .into_iter()
        .filter_map(|r| {
            Some(OptionContract {
                expiration: NaiveDate::parse_from_str(&r.expiration, "%Y-%m-%d").ok()?,
                strike: number(&r.strike)?,
                option_type: OptionType::from_str(&r.option_type).ok()?,
                last: r.last.as_deref().and_then(number),
                bid: r.bid.as_deref().and_then(number),
                ask: r.ask.as_deref().and_then(number),
                volume: r.volume.as_deref().and_then(number),
                open_interest: r.open_interest.as_deref().and_then(number),
                implied_volatility: r.implied_volatility.as_deref().and_then(number).filter(|iv| *iv > 0.0),
                contract_id: r.contract_id,
            })
        })
        .collect())
}

pub struct AlphaVantageProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AlphaVantageProvider {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        AlphaVantageProvider {
            client,
            api_key: api_key.into(),
            base_url: ALPHA_VANTAGE_URL.to_string(),
        }
    }

    async fn get(&self, params: &[(&str, &str)]) -> Result<String, MarketDataError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(params)
            .query(&[("apikey", self.api_key.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MarketDataError::Status(response.status().as_u16()));
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl MarketDataProvider for AlphaVantageProvider {
    async fn daily_history(&self, symbol: &str, full: bool) -> Result<Vec<Candle>, MarketDataError> {
        let outputsize = if full { "full" } else { "compact" };
        info!("Fetching {} daily series for {} from provider", outputsize, symbol);
        let body = self
            .get(&[
                ("function", "TIME_SERIES_DAILY"),
                ("symbol", symbol),
                ("outputsize", outputsize),
            ])
            .await?;
        parse_daily_series(symbol, &body)
    }

    async fn option_chain(&self, symbol: &str) -> Result<Vec<OptionContract>, MarketDataError> {
        info!("Fetching option chain for {} from provider", symbol);
        let body = self
            .get(&[("function", "HISTORICAL_OPTIONS"), ("symbol", symbol)])
            .await?;
        parse_option_chain(symbol, &body)
    }
}

/// Look-back window for historical data requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryRange {
    FiveDays,
    OneMonth,
    ThreeMonths,
    SixMonths,
    #[default]
    OneYear,
    TwoYears,
    FiveYears,
    TenYears,
    Max,
}

impl HistoryRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryRange::FiveDays => "5d",
            HistoryRange::OneMonth => "1mo",
            HistoryRange::ThreeMonths => "3mo",
            HistoryRange::SixMonths => "6mo",
            HistoryRange::OneYear => "1y",
            HistoryRange::TwoYears => "2y",
            HistoryRange::FiveYears => "5y",
            HistoryRange::TenYears => "10y",
            HistoryRange::Max => "max",
        }
    }

    fn days(&self) -> Option<i64> {
        match self {
            HistoryRange::FiveDays => Some(5),
            HistoryRange::OneMonth => Some(30),
            HistoryRange::ThreeMonths => Some(91),
            HistoryRange::SixMonths => Some(182),
            HistoryRange::OneYear => Some(365),
            HistoryRange::TwoYears => Some(730),
            HistoryRange::FiveYears => Some(1826),
            HistoryRange::TenYears => Some(3652),
            HistoryRange::Max => None,
        }
    }

    pub fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.days() {
            Some(days) => now - Duration::days(days),
            None => DateTime::<Utc>::default(),
        }
    }

    /// Whether the compact series is too short to cover this range.
    pub fn needs_full(&self) -> bool {
        !matches!(self.days(), Some(d) if d <= COMPACT_WINDOW_DAYS)
    }
}

impl FromStr for HistoryRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "5d" => Ok(HistoryRange::FiveDays),
            "1mo" => Ok(HistoryRange::OneMonth),
            "3mo" => Ok(HistoryRange::ThreeMonths),
            "6mo" => Ok(HistoryRange::SixMonths),
            "1y" => Ok(HistoryRange::OneYear),
            "2y" => Ok(HistoryRange::TwoYears),
            "5y" => Ok(HistoryRange::FiveYears),
            "10y" => Ok(HistoryRange::TenYears),
            "max" => Ok(HistoryRange::Max),
            other => Err(format!("unsupported period: {}", other)),
        }
    }
}

/// Upper-cases and validates a ticker such as `brk.b` or `^gspc`.
pub fn normalize_symbol(raw: &str) -> Result<String, MarketDataError> {
    let symbol = raw.trim().to_uppercase();
    let valid = !symbol.is_empty()
        && symbol.len() <= 20
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '='));
    if valid {
        Ok(symbol)
    } else {
        Err(MarketDataError::InvalidSymbol(raw.trim().to_string()))
    }
}

/// Provider access with a candle cache in the application database.
#[derive(Clone)]
pub struct MarketData {
    pool: SqlitePool,
    provider: Arc<dyn MarketDataProvider>,
    ttl: Duration,
}

impl MarketData {
    pub fn new(pool: SqlitePool, provider: Arc<dyn MarketDataProvider>, ttl: Duration) -> Self {
        MarketData { pool, provider, ttl }
    }

    async fn refresh_if_stale(&self, symbol: &str, full: bool) -> Result<(), MarketDataError> {
        let now = Utc::now();
        let fresh = match last_fetch(&self.pool, symbol).await? {
            Some((fetched_at, was_full)) => now - fetched_at < self.ttl && (was_full || !full),
            None => false,
        };
        if fresh && check_data_exists(&self.pool, symbol, DateTime::<Utc>::MIN_UTC, now).await? {
            debug!("Serving {} from cache", symbol);
            return Ok(());
        }

        let candles = self.provider.daily_history(symbol, full).await?;
        if candles.is_empty() {
            warn!("No data returned for ticker: {}", symbol);
            return Err(MarketDataError::Empty(symbol.to_string()));
        }
        insert_historical_data(&self.pool, symbol, &candles).await?;
        record_fetch(&self.pool, symbol, now, full).await?;
        Ok(())
    }

    /// Daily candles for `symbol` over `range`, oldest first.
    pub async fn history(&self, symbol: &str, range: HistoryRange) -> Result<Vec<Candle>, MarketDataError> {
        let symbol = normalize_symbol(symbol)?;
        self.refresh_if_stale(&symbol, range.needs_full()).await?;

        let now = Utc::now();
        let candles = query_historical_data(&self.pool, &symbol, range.start(now), now).await?;
        if candles.is_empty() {
            return Err(MarketDataError::Empty(symbol));
        }
        Ok(candles)
    }

    pub async fn try_quote(&self, symbol: &str) -> Result<Quote, MarketDataError> {
        let candles = self.history(symbol, HistoryRange::ThreeMonths).await?;
        Ok(quote_from_candles(&normalize_symbol(symbol)?, &candles))
    }

    /// Latest quote; failures are logged and yield a placeholder.
    pub async fn quote(&self, symbol: &str) -> Quote {
        match self.try_quote(symbol).await {
            Ok(quote) => quote,
            Err(e) => {
                warn!("Quote unavailable for {}: {}", symbol, e);
                Quote::unavailable(&symbol.trim().to_uppercase())
            }
        }
    }

    pub async fn option_chain(
        &self,
        symbol: &str,
        expiration: Option<NaiveDate>,
        risk_free_rate: f64,
    ) -> Result<OptionChain, MarketDataError> {
        let symbol = normalize_symbol(symbol)?;
        let underlying_price = self
            .try_quote(&symbol)
            .await?
            .price
            .ok_or_else(|| MarketDataError::Empty(symbol.clone()))?;
        let contracts = self.provider.option_chain(&symbol).await?;
        build_option_chain(
            &symbol,
            contracts,
            underlying_price,
            expiration,
            Utc::now().date_naive(),
            risk_free_rate,
        )
        .ok_or(MarketDataError::Empty(symbol))
    }
}

pub fn quote_from_candles(symbol: &str, candles: &[Candle]) -> Quote {
    let Some(last) = candles.last() else {
        return Quote::unavailable(symbol);
    };
    let previous_close = candles.len().checked_sub(2).map(|i| candles[i].close);
    let change = previous_close.map(|prev| last.close - prev);
    let change_pct = previous_close
        .filter(|prev| *prev != 0.0)
        .map(|prev| (last.close - prev) / prev * 100.0);

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let latest_rsi = rsi(&closes, RSI_PERIOD).last().copied().flatten();
    let signal = generate_tech_signal(latest_rsi, DEFAULT_RSI_BUY, DEFAULT_RSI_SELL);

    Quote {
        symbol: symbol.to_string(),
        price: Some(last.close),
        previous_close,
        change,
        change_pct,
        volume: Some(last.volume),
        rsi: latest_rsi,
        signal: Some(signal.as_str().to_string()),
        as_of: Some(last.timestamp),
    }
}

#[cfg(test)]
pub mod stub {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a synthetic daily series ending today; symbols starting with
    /// `FAIL` error out.
    #[derive(Default)]
    pub struct StubProvider {
        pub history_calls: AtomicUsize,
    }

    pub fn synthetic_candles(days: i64) -> Vec<Candle> {
        let today = Utc::now().date_naive();
        (0..days)
            .map(|i| {
                let date = today - Duration::days(days - 1 - i);
                let close = 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.1;
                Candle {
                    timestamp: date.and_hms_opt(0, 0, 0).unwrap().and_utc(),
                    open: close - 0.5,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 1_000_000.0,
                }
            })
            .collect()
    }

    #[async_trait]
    impl MarketDataProvider for StubProvider {
        async fn daily_history(&self, symbol: &str, full: bool) -> Result<Vec<Candle>, MarketDataError> {
            self.history_calls.fetch_add(1, Ordering::SeqCst);
            if symbol.starts_with("FAIL") {
                return Err(MarketDataError::Status(503));
            }
            Ok(synthetic_candles(if full { 400 } else { 100 }))
        }

        async fn option_chain(&self, symbol: &str) -> Result<Vec<OptionContract>, MarketDataError> {
            let expiration = Utc::now().date_naive() + Duration::days(30);
            Ok([95.0, 100.0, 105.0]
                .iter()
                .flat_map(|strike| {
                    [OptionType::Call, OptionType::Put].map(|option_type| OptionContract {
                        contract_id: format!("{}-{:?}-{}", symbol, option_type, strike),
                        expiration,
                        strike: *strike,
                        option_type,
                        last: Some(2.0),
                        bid: Some(1.9),
                        ask: Some(2.1),
                        volume: Some(10.0),
                        open_interest: Some(100.0),
                        implied_volatility: Some(0.25),
                    })
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::stub::StubProvider;
    use super::*;
    use crate::db::Database;
    use std::sync::atomic::Ordering;

    #[test]
    fn parses_daily_series_oldest_first() {
        let body = r#"{
            "Meta Data": {"2. Symbol": "IBM"},
            "Time Series (Daily)": {
                "2024-03-05": {"1. open": "2", "2. high": "3", "3. low": "1", "4. close": "2.5", "5. volume": "100"},
                "2024-03-04": {"1. open": "1", "2. high": "2", "3. low": "0.5", "4. close": "1.5", "5. volume": "200"}
            }
        }"#;
        let candles = parse_daily_series("IBM", body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 1.5);
        assert_eq!(candles[1].volume, 100.0);
        assert!(candles[0].timestamp < candles[1].timestamp);
    }

    #[test]
    fn api_notes_and_errors_become_provider_errors() {
        for body in [
            r#"{"Error Message": "Invalid API call."}"#,
            r#"{"Note": "Thank you for using Alpha Vantage! Our standard API call frequency is 5 calls per minute."}"#,
            r#"{"Information": "The **demo** API key is for demo purposes only."}"#,
        ] {
            match parse_daily_series("IBM", body) {
                Err(MarketDataError::Provider { symbol, .. }) => assert_eq!(symbol, "IBM"),
                other => panic!("expected provider error, got {:?}", other.map(|c| c.len())),
            }
        }
    }

    #[test]
    fn parses_option_records_and_skips_malformed_ones() {
        let body = r#"{"endpoint": "Historical Options", "message": "success", "data": [
            {"contractID": "IBM240119C00100000", "expiration": "2024-01-19", "strike": "100.00",
             "type": "call", "last": "5.10", "bid": "5.00", "ask": "5.20", "volume": "12",
             "open_interest": "340", "implied_volatility": "0.2512"},
            {"contractID": "IBM240119P00100000", "expiration": "2024-01-19", "strike": "100.00",
             "type": "put", "last": "0", "bid": "0", "ask": "0", "volume": "0",
             "open_interest": "0", "implied_volatility": "0"},
            {"contractID": "broken", "expiration": "soon", "strike": "x", "type": "call"}
        ]}"#;
        let contracts = parse_option_chain("IBM", body).unwrap();
        assert_eq!(contracts.len(), 2);
        assert_eq!(contracts[0].option_type, OptionType::Call);
        assert_eq!(contracts[0].implied_volatility, Some(0.2512));
        assert_eq!(contracts[1].implied_volatility, None);
    }

    #[test]
    fn history_ranges_parse_and_size_requests() {
        assert_eq!("6MO".parse::<HistoryRange>().unwrap(), HistoryRange::SixMonths);
        assert!("1d".parse::<HistoryRange>().is_err());
        assert!(!HistoryRange::ThreeMonths.needs_full());
        assert!(HistoryRange::SixMonths.needs_full());
        assert!(HistoryRange::Max.needs_full());
    }

    #[test]
    fn symbols_are_normalized() {
        assert_eq!(normalize_symbol(" brk.b ").unwrap(), "BRK.B");
        assert_eq!(normalize_symbol("^gspc").unwrap(), "^GSPC");
        assert!(normalize_symbol("").is_err());
        assert!(normalize_symbol("AAPL; DROP TABLE").is_err());
    }

    #[test]
    fn quote_reports_change_against_previous_close() {
        let candles = stub::synthetic_candles(30);
        let quote = quote_from_candles("AAPL", &candles);
        let last = candles[29].close;
        let prev = candles[28].close;
        assert_eq!(quote.price, Some(last));
        assert!((quote.change.unwrap() - (last - prev)).abs() < 1e-12);
        assert!(quote.rsi.is_some());
        assert!(quote.signal.is_some());
    }

    async fn service() -> (MarketData, Arc<StubProvider>) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let provider = Arc::new(StubProvider::default());
        let service = MarketData::new(db.pool, provider.clone(), Duration::seconds(3600));
        (service, provider)
    }

    #[tokio::test]
    async fn fresh_cache_skips_the_provider() {
        let (service, provider) = service().await;
        let first = service.history("aapl", HistoryRange::OneMonth).await.unwrap();
        let second = service.history("AAPL", HistoryRange::OneMonth).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.history_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn longer_range_upgrades_to_full_fetch() {
        let (service, provider) = service().await;
        service.history("MSFT", HistoryRange::OneMonth).await.unwrap();
        let year = service.history("MSFT", HistoryRange::OneYear).await.unwrap();
        assert_eq!(provider.history_calls.load(Ordering::SeqCst), 2);
        assert!(year.len() > 300);
        service.history("MSFT", HistoryRange::OneMonth).await.unwrap();
        assert_eq!(provider.history_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn provider_failure_yields_placeholder_quote() {
        let (service, _) = service().await;
        let quote = service.quote("failco").await;
        assert_eq!(quote.symbol, "FAILCO");
        assert!(quote.price.is_none());
        assert!(service.try_quote("failco").await.is_err());
    }

    #[tokio::test]
    async fn option_chain_prices_contracts_from_implied_volatility() {
        let (service, _) = service().await;
        let chain = service.option_chain("ibm", None, 0.01).await.unwrap();
        assert_eq!(chain.symbol, "IBM");
        assert_eq!(chain.calls.len(), 3);
        assert_eq!(chain.puts.len(), 3);
        assert!(chain.calls.iter().all(|c| c.greeks.is_some()));
    }
}
