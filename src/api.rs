// src/api.rs
use crate::auth::{require_user, Auth};
use crate::backtest::{
    Backtester, PositionSizing, StrategyConfig, DEFAULT_COMMISSION, DEFAULT_INITIAL_CAPITAL,
};
use crate::config::Config;
use crate::csrf::{check_csrf_header, Csrf};
use crate::db::{
    add_watchlist_item, create_watchlist, delete_backtest, delete_watchlist, get_watchlist,
    list_watchlist_items, list_watchlists, remove_watchlist_item, save_backtest, Database,
};
use crate::error::{handle_rejection, AppError};
use crate::indicators::add_technical_indicators;
use crate::mailer::Mailer;
use crate::market_data::{
    normalize_symbol, HistoryRange, MarketData, MarketDataError, MarketDataProvider,
};
use crate::models::{NewBacktest, User, Watchlist, WatchlistItem};
use crate::options::{analyze_option, black_scholes_greeks, OptionAnalysisRequest, OptionType};
use crate::pages;
use crate::risk::{calculate_risk_reward, RiskRewardRequest};
use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use log::info;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

const JSON_LIMIT: u64 = 1024 * 1024;
const WATCHLIST_NAME_MAX: usize = 64;

/// Everything a request handler needs, shared behind one `Arc`.
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub auth: Auth,
    pub csrf: Arc<Csrf>,
    pub market: MarketData,
    pub mailer: Arc<dyn Mailer>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: Database,
        provider: Arc<dyn MarketDataProvider>,
        mailer: Arc<dyn Mailer>,
    ) -> anyhow::Result<Self> {
        let csrf = Csrf::new(
            &config.csrf_secret_key,
            config.csrf_enabled,
            config.secure_cookies,
        )
        .map_err(|e| anyhow!("invalid CSRF secret key: {}", e))?;
        let market = MarketData::new(db.pool.clone(), provider, config.market_data_ttl);
        Ok(AppState {
            auth: Auth::new(&config),
            csrf: Arc::new(csrf),
            market,
            mailer,
            db,
            config,
        })
    }
}

pub fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// The complete route tree: HTML pages, JSON endpoints and error recovery.
pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    pages::routes(state.clone())
        .or(watchlist_routes(state.clone()))
        .unify()
        .or(market_routes(state.clone()))
        .unify()
        .or(trading_routes(state.clone()))
        .unify()
        .or(backtest_routes(state))
        .unify()
        .recover(handle_rejection)
}

fn json_body<T: DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(JSON_LIMIT).and(warp::body::json())
}

/// Login gate for handlers that do not need the user themselves.
fn logged_in(state: Arc<AppState>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    require_user(state).map(|_user: User| ()).untuple_one()
}

fn created(body: Value) -> Response {
    warp::reply::with_status(warp::reply::json(&body), StatusCode::CREATED).into_response()
}

fn success() -> Response {
    warp::reply::json(&json!({ "success": true })).into_response()
}

fn require_fields(body: &Value, fields: &[&str]) -> Result<(), AppError> {
    let Some(object) = body.as_object() else {
        return Err(AppError::BadRequest("No data provided".to_string()));
    };
    match fields.iter().find(|field| !object.contains_key(**field)) {
        Some(field) => Err(AppError::BadRequest(format!("Missing required field: {}", field))),
        None => Ok(()),
    }
}

fn number_field(body: &Value, field: &str) -> Result<f64, AppError> {
    body.get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| AppError::BadRequest(format!("Field {} must be a number", field)))
}

fn string_field<'a>(body: &'a Value, field: &str) -> Result<&'a str, AppError> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("Field {} must be a non-empty string", field)))
}

/// Accepts RFC 3339 timestamps and plain `YYYY-MM-DD` dates.
fn date_field(body: &Value, field: &str) -> Result<DateTime<Utc>, AppError> {
    let raw = string_field(body, field)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d").map(|d| d.and_time(NaiveTime::MIN).and_utc())
        })
        .map_err(|_| AppError::BadRequest(format!("Field {} must be an ISO date", field)))
}

// ---- watchlists ----

#[derive(Debug, Serialize)]
struct WatchlistWithItems {
    #[serde(flatten)]
    watchlist: Watchlist,
    items: Vec<WatchlistItem>,
}

fn watchlist_routes(state: Arc<AppState>) -> BoxedFilter<(Response,)> {
    let csrf = state.csrf.clone();

    let list = warp::path!("analysis" / "watchlists")
        .and(warp::get())
        .and(require_user(state.clone()))
        .and(with_state(state.clone()))
        .and_then(list_watchlists_handler);

    let create = warp::path!("analysis" / "watchlist" / "create")
        .and(warp::post())
        .and(require_user(state.clone()))
        .and(check_csrf_header(csrf.clone()))
        .and(with_state(state.clone()))
        .and(json_body::<Value>())
        .and_then(create_watchlist_handler);

    let add = warp::path!("analysis" / "watchlist" / i64 / "add")
        .and(warp::post())
        .and(require_user(state.clone()))
        .and(check_csrf_header(csrf.clone()))
        .and(with_state(state.clone()))
        .and(json_body::<Value>())
        .and_then(add_to_watchlist_handler);

    let remove = warp::path!("analysis" / "watchlist" / i64 / "remove" / i64)
        .and(warp::delete())
        .and(require_user(state.clone()))
        .and(check_csrf_header(csrf.clone()))
        .and(with_state(state.clone()))
        .and_then(remove_from_watchlist_handler);

    let delete = warp::path!("analysis" / "watchlist" / i64)
        .and(warp::delete())
        .and(require_user(state.clone()))
        .and(check_csrf_header(csrf))
        .and(with_state(state))
        .and_then(delete_watchlist_handler);

    list.or(create)
        .unify()
        .or(add)
        .unify()
        .or(remove)
        .unify()
        .or(delete)
        .unify()
        .boxed()
}

async fn list_watchlists_handler(user: User, state: Arc<AppState>) -> Result<Response, Rejection> {
    let pool = &state.db.pool;
    let mut out = Vec::new();
    for watchlist in list_watchlists(pool, user.id).await.map_err(AppError::from)? {
        let items = list_watchlist_items(pool, watchlist.id)
            .await
            .map_err(AppError::from)?;
        out.push(WatchlistWithItems { watchlist, items });
    }
    Ok(warp::reply::json(&out).into_response())
}

async fn create_watchlist_handler(
    user: User,
    state: Arc<AppState>,
    body: Value,
) -> Result<Response, Rejection> {
    let name = body
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::BadRequest("Name is required".to_string()))?;
    if name.chars().count() > WATCHLIST_NAME_MAX {
        return Err(AppError::BadRequest(format!(
            "Name must be at most {} characters",
            WATCHLIST_NAME_MAX
        ))
        .into());
    }

    let watchlist = create_watchlist(&state.db.pool, user.id, name)
        .await
        .map_err(AppError::from)?;
    info!("User {} created watchlist {}", user.username, watchlist.id);
    Ok(created(json!({
        "id": watchlist.id,
        "name": watchlist.name,
        "created_at": watchlist.created_at,
    })))
}

async fn add_to_watchlist_handler(
    watchlist_id: i64,
    user: User,
    state: Arc<AppState>,
    body: Value,
) -> Result<Response, Rejection> {
    let ticker = body
        .get("ticker")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|ticker| !ticker.is_empty())
        .ok_or_else(|| AppError::BadRequest("Ticker is required".to_string()))?;
    let ticker = normalize_symbol(ticker).map_err(AppError::from)?;
    let notes = body.get("notes").and_then(Value::as_str);

    let pool = &state.db.pool;
    get_watchlist(pool, watchlist_id, user.id)
        .await
        .map_err(AppError::from)?
        .ok_or(AppError::NotFound("watchlist"))?;
    let item = add_watchlist_item(pool, watchlist_id, &ticker, notes).await?;
    info!("Added {} to watchlist {}", item.ticker, watchlist_id);
    Ok(created(json!({
        "id": item.id,
        "ticker": item.ticker,
        "added_at": item.added_at,
        "notes": item.notes,
    })))
}

async fn remove_from_watchlist_handler(
    watchlist_id: i64,
    item_id: i64,
    user: User,
    state: Arc<AppState>,
) -> Result<Response, Rejection> {
    let pool = &state.db.pool;
    get_watchlist(pool, watchlist_id, user.id)
        .await
        .map_err(AppError::from)?
        .ok_or(AppError::NotFound("watchlist"))?;
    if !remove_watchlist_item(pool, watchlist_id, item_id)
        .await
        .map_err(AppError::from)?
    {
        return Err(AppError::NotFound("watchlist item").into());
    }
    Ok(success())
}

async fn delete_watchlist_handler(
    watchlist_id: i64,
    user: User,
    state: Arc<AppState>,
) -> Result<Response, Rejection> {
    if !delete_watchlist(&state.db.pool, watchlist_id, user.id)
        .await
        .map_err(AppError::from)?
    {
        return Err(AppError::NotFound("watchlist").into());
    }
    info!("User {} deleted watchlist {}", user.username, watchlist_id);
    Ok(success())
}

// ---- market data ----

#[derive(Debug, Deserialize)]
struct PeriodQuery {
    period: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChainQuery {
    expiration: Option<String>,
}

fn market_routes(state: Arc<AppState>) -> BoxedFilter<(Response,)> {
    let stock = warp::path!("analysis" / "api" / "stock" / String)
        .and(warp::get())
        .and(logged_in(state.clone()))
        .and(with_state(state.clone()))
        .and(warp::query::<PeriodQuery>())
        .and_then(stock_data_handler);

    let quote = warp::path!("analysis" / "api" / "quote" / String)
        .and(warp::get())
        .and(logged_in(state.clone()))
        .and(with_state(state.clone()))
        .and_then(quote_handler);

    let chain = warp::path!("trading" / "api" / "options-chain" / String)
        .and(warp::get())
        .and(logged_in(state.clone()))
        .and(with_state(state))
        .and(warp::query::<ChainQuery>())
        .and_then(option_chain_handler);

    stock.or(quote).unify().or(chain).unify().boxed()
}

async fn stock_data_handler(
    ticker: String,
    state: Arc<AppState>,
    query: PeriodQuery,
) -> Result<Response, Rejection> {
    let symbol = normalize_symbol(&ticker).map_err(AppError::from)?;
    let range = match query.period.as_deref() {
        Some(period) => period.parse::<HistoryRange>().map_err(AppError::BadRequest)?,
        None => HistoryRange::default(),
    };
    let candles = state
        .market
        .history(&symbol, range)
        .await
        .map_err(AppError::from)?;
    let rows = add_technical_indicators(&candles);
    Ok(warp::reply::json(&json!({
        "symbol": symbol,
        "period": range.as_str(),
        "data": rows,
    }))
    .into_response())
}

async fn quote_handler(ticker: String, state: Arc<AppState>) -> Result<Response, Rejection> {
    let quote = state.market.try_quote(&ticker).await.map_err(AppError::from)?;
    Ok(warp::reply::json(&quote).into_response())
}

async fn option_chain_handler(
    ticker: String,
    state: Arc<AppState>,
    query: ChainQuery,
) -> Result<Response, Rejection> {
    let expiration = query
        .expiration
        .as_deref()
        .filter(|raw| !raw.is_empty())
        .map(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .transpose()
        .map_err(|_| AppError::BadRequest("expiration must be YYYY-MM-DD".to_string()))?;
    let chain = state
        .market
        .option_chain(&ticker, expiration, state.config.risk_free_rate)
        .await
        .map_err(AppError::from)?;
    Ok(warp::reply::json(&chain).into_response())
}

// ---- trading calculators ----

const GREEKS_FIELDS: &[&str] = &["S", "K", "T", "r", "sigma", "option_type"];

fn trading_routes(state: Arc<AppState>) -> BoxedFilter<(Response,)> {
    let greeks = warp::path!("trading" / "api" / "calculate-greeks")
        .and(warp::post())
        .and(logged_in(state.clone()))
        .and(check_csrf_header(state.csrf.clone()))
        .and(json_body::<Value>())
        .and_then(greeks_handler);

    let analysis = warp::path!("trading" / "api" / "option-analysis")
        .and(warp::post())
        .and(logged_in(state.clone()))
        .and(check_csrf_header(state.csrf.clone()))
        .and(json_body::<OptionAnalysisRequest>())
        .and_then(option_analysis_handler);

    let risk = warp::path!("trading" / "api" / "risk-reward")
        .and(warp::post())
        .and(logged_in(state.clone()))
        .and(check_csrf_header(state.csrf.clone()))
        .and(json_body::<RiskRewardRequest>())
        .and_then(risk_reward_handler);

    greeks.or(analysis).unify().or(risk).unify().boxed()
}

async fn greeks_handler(body: Value) -> Result<Response, Rejection> {
    require_fields(&body, GREEKS_FIELDS)?;
    let option_type: OptionType = string_field(&body, "option_type")?
        .parse()
        .map_err(AppError::BadRequest)?;
    let greeks = black_scholes_greeks(
        number_field(&body, "S")?,
        number_field(&body, "K")?,
        number_field(&body, "T")?,
        number_field(&body, "r")?,
        number_field(&body, "sigma")?,
        option_type,
    )
    .ok_or_else(|| {
        AppError::BadRequest("S, K, T and sigma must all be positive".to_string())
    })?;
    Ok(warp::reply::json(&greeks).into_response())
}

async fn option_analysis_handler(req: OptionAnalysisRequest) -> Result<Response, Rejection> {
    let analysis = analyze_option(&req).ok_or_else(|| {
        AppError::BadRequest(
            "Stock price, strike, days and volatility must all be positive".to_string(),
        )
    })?;
    Ok(warp::reply::json(&analysis).into_response())
}

async fn risk_reward_handler(req: RiskRewardRequest) -> Result<Response, Rejection> {
    let result = calculate_risk_reward(&req)?;
    Ok(warp::reply::json(&result).into_response())
}

// ---- backtests ----

const BACKTEST_FIELDS: &[&str] = &[
    "name",
    "ticker",
    "start_date",
    "end_date",
    "strategy_type",
    "parameters",
    "results",
];

#[derive(Debug, Deserialize)]
pub struct RunBacktestRequest {
    pub ticker: String,
    pub period: Option<String>,
    pub strategy: StrategyConfig,
    pub initial_capital: Option<f64>,
    pub commission: Option<f64>,
    #[serde(default)]
    pub position_sizing: PositionSizing,
    pub position_value: Option<f64>,
}

fn backtest_routes(state: Arc<AppState>) -> BoxedFilter<(Response,)> {
    let run = warp::path!("backtesting" / "run")
        .and(warp::post())
        .and(logged_in(state.clone()))
        .and(check_csrf_header(state.csrf.clone()))
        .and(with_state(state.clone()))
        .and(json_body::<RunBacktestRequest>())
        .and_then(run_backtest_handler);

    let save = warp::path!("backtesting" / "save")
        .and(warp::post())
        .and(require_user(state.clone()))
        .and(check_csrf_header(state.csrf.clone()))
        .and(with_state(state.clone()))
        .and(json_body::<Value>())
        .and_then(save_backtest_handler);

    let delete = warp::path!("backtesting" / "delete" / i64)
        .and(warp::delete())
        .and(require_user(state.clone()))
        .and(check_csrf_header(state.csrf.clone()))
        .and(with_state(state))
        .and_then(delete_backtest_handler);

    run.or(save).unify().or(delete).unify().boxed()
}

async fn run_backtest_handler(
    state: Arc<AppState>,
    req: RunBacktestRequest,
) -> Result<Response, Rejection> {
    let symbol = normalize_symbol(&req.ticker).map_err(AppError::from)?;
    let range = match req.period.as_deref() {
        Some(period) => period.parse::<HistoryRange>().map_err(AppError::BadRequest)?,
        None => HistoryRange::default(),
    };
    let initial_capital = req.initial_capital.unwrap_or(DEFAULT_INITIAL_CAPITAL);
    if !initial_capital.is_finite() || initial_capital <= 0.0 {
        return Err(AppError::BadRequest("initial_capital must be positive".to_string()).into());
    }
    let commission = req.commission.unwrap_or(DEFAULT_COMMISSION);
    if !(0.0..1.0).contains(&commission) {
        return Err(AppError::BadRequest("commission must lie in [0, 1)".to_string()).into());
    }
    let position_value = req
        .position_value
        .unwrap_or_else(|| req.position_sizing.default_value());
    if !position_value.is_finite() || position_value <= 0.0 {
        return Err(AppError::BadRequest("position_value must be positive".to_string()).into());
    }
    let strategy = req.strategy.build().map_err(AppError::BadRequest)?;

    let candles = state
        .market
        .history(&symbol, range)
        .await
        .map_err(AppError::from)?;
    let report = Backtester::new(strategy)
        .initial_capital(initial_capital)
        .commission(commission)
        .position_sizing(req.position_sizing, position_value)
        .run(&candles)
        .ok_or_else(|| AppError::MarketData(MarketDataError::Empty(symbol.clone())))?;
    info!(
        "Backtested {} on {} ({} bars)",
        report.strategy,
        symbol,
        candles.len()
    );
    Ok(warp::reply::json(&json!({
        "ticker": symbol,
        "strategy_type": req.strategy.type_name(),
        "parameters": req.strategy,
        "report": report,
    }))
    .into_response())
}

async fn save_backtest_handler(
    user: User,
    state: Arc<AppState>,
    body: Value,
) -> Result<Response, Rejection> {
    require_fields(&body, BACKTEST_FIELDS)?;
    let backtest = NewBacktest {
        name: string_field(&body, "name")?.to_string(),
        ticker: normalize_symbol(string_field(&body, "ticker")?).map_err(AppError::from)?,
        start_date: date_field(&body, "start_date")?,
        end_date: date_field(&body, "end_date")?,
        strategy_type: string_field(&body, "strategy_type")?.to_string(),
        parameters: body["parameters"].clone(),
        results: Some(body["results"].clone()).filter(|r| !r.is_null()),
    };
    if backtest.end_date < backtest.start_date {
        return Err(AppError::BadRequest("end_date must not precede start_date".to_string()).into());
    }

    let saved = save_backtest(&state.db.pool, user.id, &backtest)
        .await
        .map_err(AppError::from)?;
    info!("User {} saved backtest {}", user.username, saved.id);
    Ok(created(json!({
        "id": saved.id,
        "name": saved.name,
        "created_at": saved.created_at,
    })))
}

async fn delete_backtest_handler(
    backtest_id: i64,
    user: User,
    state: Arc<AppState>,
) -> Result<Response, Rejection> {
    if !delete_backtest(&state.db.pool, backtest_id, user.id)
        .await
        .map_err(AppError::from)?
    {
        return Err(AppError::NotFound("backtest").into());
    }
    info!("User {} deleted backtest {}", user.username, backtest_id);
    Ok(success())
}
