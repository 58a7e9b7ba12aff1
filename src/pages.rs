// src/pages.rs
//! Browser-facing routes: the auth flows and every server-rendered page.

use crate::api::{with_state, AppState};
use crate::auth::{hash_password, optional_user, require_user, safe_next, verify_password};
use crate::backtest::Backtester;
use crate::csrf::{csrf_nonce, with_csrf_token, CsrfToken};
use crate::db::{
    create_user, email_taken, find_user_by_email, find_user_by_id, find_user_by_username,
    get_backtest, is_unique_violation, list_backtests, list_watchlist_items, list_watchlists,
    save_backtest, touch_last_login, update_password, update_profile, username_taken,
};
use crate::error::AppError;
use crate::forms::{
    BacktestForm, FormErrors, LoginForm, ProfileForm, RegistrationForm, ResetPasswordForm,
    ResetPasswordRequestForm,
};
use crate::indicators::add_technical_indicators;
use crate::mailer::password_reset_email;
use crate::market_data::{normalize_symbol, quote_from_candles, HistoryRange};
use crate::models::{NewBacktest, NewUser, Quote, SubscriptionLevel, User};
use crate::views::{self, clear_flash_cookie, flash_cookie, html, redirect, Flash, WatchlistView};
use chrono::Utc;
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::reply::Response;
use warp::{Filter, Rejection};

const FORM_LIMIT: u64 = 16 * 1024;
const INVALID_LOGIN: &str = "Invalid username or password";
const RECENT_BACKTESTS: i64 = 5;
const FORM_EXPIRED: &str = "The form has expired. Please submit it again.";

#[derive(Debug, Default, Deserialize)]
pub struct NextQuery {
    pub next: Option<String>,
}

fn form_body<T: DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(FORM_LIMIT).and(warp::body::form())
}

fn flash() -> impl Filter<Extract = (Option<Flash>,), Error = Infallible> + Clone {
    warp::cookie::optional::<String>(views::FLASH_COOKIE)
        .map(|code: Option<String>| code.as_deref().and_then(Flash::from_code))
}

/// Cookies every rendered page may need: a fresh CSRF nonce and the removal
/// of a flash message that has now been shown.
fn page_cookies(state: &AppState, csrf: &CsrfToken, shown: Option<Flash>) -> Vec<String> {
    let mut cookies = Vec::new();
    if let Some(cookie) = csrf.set_cookie() {
        cookies.push(cookie.to_string());
    }
    if shown.is_some() {
        cookies.push(clear_flash_cookie(state.auth.secure_cookies()));
    }
    cookies
}

/// Checks the posted `csrf_token` field. A failure is reported on the form
/// itself so the browser gets the page back with a fresh token.
fn check_form_token(state: &AppState, nonce: Option<&str>, token: Option<&str>) -> Result<(), FormErrors> {
    state.csrf.verify(nonce, token).map_err(|_| {
        warn!("Rejected form post with a missing or stale CSRF token");
        let mut errors = FormErrors::default();
        errors.add("csrf_token", FORM_EXPIRED);
        errors
    })
}

fn redirect_with_flash(state: &AppState, location: &str, flash: Flash) -> Response {
    redirect(location, &[flash_cookie(flash, state.auth.secure_cookies())])
}

pub fn routes(state: Arc<AppState>) -> BoxedFilter<(Response,)> {
    auth_routes(state.clone())
        .or(dashboard_routes(state.clone()))
        .unify()
        .or(education_routes(state.clone()))
        .unify()
        .or(analysis_routes(state.clone()))
        .unify()
        .or(backtest_routes(state))
        .unify()
        .boxed()
}

fn auth_routes(state: Arc<AppState>) -> BoxedFilter<(Response,)> {
    let csrf = state.csrf.clone();

    let login_form = warp::path!("auth" / "login")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(optional_user(state.clone()))
        .and(with_csrf_token(csrf.clone()))
        .and(flash())
        .and(warp::query::<NextQuery>())
        .and_then(login_form_handler);

    let login = warp::path!("auth" / "login")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(with_csrf_token(csrf.clone()))
        .and(csrf_nonce())
        .and(warp::query::<NextQuery>())
        .and(form_body::<LoginForm>())
        .and_then(login_handler);

    let logout = warp::path!("auth" / "logout")
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: Arc<AppState>| {
            let secure = state.auth.secure_cookies();
            redirect(
                "/auth/login",
                &[state.auth.logout_cookie(), flash_cookie(Flash::LoggedOut, secure)],
            )
        });

    let register_form = warp::path!("auth" / "register")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(optional_user(state.clone()))
        .and(with_csrf_token(csrf.clone()))
        .and_then(register_form_handler);

    let register = warp::path!("auth" / "register")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(with_csrf_token(csrf.clone()))
        .and(csrf_nonce())
        .and(form_body::<RegistrationForm>())
        .and_then(register_handler);

    let reset_request_form = warp::path!("auth" / "reset_password_request")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(optional_user(state.clone()))
        .and(with_csrf_token(csrf.clone()))
        .and_then(reset_request_form_handler);

    let reset_request = warp::path!("auth" / "reset_password_request")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(with_csrf_token(csrf.clone()))
        .and(csrf_nonce())
        .and(form_body::<ResetPasswordRequestForm>())
        .and_then(reset_request_handler);

    let reset_form = warp::path!("auth" / "reset_password" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(optional_user(state.clone()))
        .and(with_csrf_token(csrf.clone()))
        .and_then(reset_form_handler);

    let reset = warp::path!("auth" / "reset_password" / String)
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(with_csrf_token(csrf.clone()))
        .and(csrf_nonce())
        .and(form_body::<ResetPasswordForm>())
        .and_then(reset_handler);

    let profile_page = warp::path!("auth" / "profile")
        .and(warp::get())
        .and(require_user(state.clone()))
        .and(with_state(state.clone()))
        .and(with_csrf_token(csrf.clone()))
        .and(flash())
        .and_then(profile_page_handler);

    let profile = warp::path!("auth" / "profile")
        .and(warp::post())
        .and(require_user(state.clone()))
        .and(with_state(state))
        .and(with_csrf_token(csrf))
        .and(csrf_nonce())
        .and(form_body::<ProfileForm>())
        .and_then(profile_handler);

    login_form
        .or(login)
        .unify()
        .or(logout)
        .unify()
        .or(register_form)
        .unify()
        .or(register)
        .unify()
        .or(reset_request_form)
        .unify()
        .or(reset_request)
        .unify()
        .or(reset_form)
        .unify()
        .or(reset)
        .unify()
        .or(profile_page)
        .unify()
        .or(profile)
        .unify()
        .boxed()
}

async fn login_form_handler(
    state: Arc<AppState>,
    user: Option<User>,
    csrf: CsrfToken,
    shown: Option<Flash>,
    query: NextQuery,
) -> Result<Response, Rejection> {
    if user.is_some() {
        return Ok(redirect("/dashboard", &[]));
    }
    let body = views::login_page(
        &csrf.token,
        "",
        None,
        &FormErrors::default(),
        query.next.as_deref(),
        shown,
    );
    Ok(html(body, &page_cookies(&state, &csrf, shown)))
}

async fn login_handler(
    state: Arc<AppState>,
    csrf: CsrfToken,
    nonce: Option<String>,
    query: NextQuery,
    form: LoginForm,
) -> Result<Response, Rejection> {
    let mut cookies = page_cookies(&state, &csrf, None);
    let next = query.next.as_deref();

    let checked = check_form_token(&state, nonce.as_deref(), form.csrf_token.as_deref())
        .and_then(|()| form.validate());
    if let Err(errors) = checked {
        let body = views::login_page(&csrf.token, &form.username, None, &errors, next, None);
        return Ok(html(body, &cookies));
    }

    let user = find_user_by_username(&state.db.pool, form.username.trim())
        .await
        .map_err(AppError::from)?;
    let user = match user {
        Some(user) if user.is_active && verify_password(&user.password_hash, &form.password) => user,
        _ => {
            info!("Failed login for {}", form.username);
            let body = views::login_page(
                &csrf.token,
                &form.username,
                Some(INVALID_LOGIN),
                &FormErrors::default(),
                next,
                None,
            );
            return Ok(html(body, &cookies));
        }
    };

    // New users keep an empty last_login until onboarding is finished.
    if user.last_login.is_some() {
        touch_last_login(&state.db.pool, user.id, Utc::now())
            .await
            .map_err(AppError::from)?;
    }
    let token = state.auth.create_session_token(user.id)?;
    cookies.push(state.auth.login_cookie(&token, form.remember()));
    info!("User {} logged in", user.username);
    Ok(redirect(&safe_next(next), &cookies))
}

async fn register_form_handler(
    state: Arc<AppState>,
    user: Option<User>,
    csrf: CsrfToken,
) -> Result<Response, Rejection> {
    if user.is_some() {
        return Ok(redirect("/dashboard", &[]));
    }
    let body = views::register_page(&csrf.token, "", "", &FormErrors::default());
    Ok(html(body, &page_cookies(&state, &csrf, None)))
}

async fn register_handler(
    state: Arc<AppState>,
    csrf: CsrfToken,
    nonce: Option<String>,
    form: RegistrationForm,
) -> Result<Response, Rejection> {
    let cookies = page_cookies(&state, &csrf, None);
    let username = form.username.trim();
    let email = form.email.trim();

    let checked = check_form_token(&state, nonce.as_deref(), form.csrf_token.as_deref())
        .and_then(|()| form.validate());
    let errors = match checked {
        Ok(()) => {
            let pool = &state.db.pool;
            let username_taken = username_taken(pool, username).await.map_err(AppError::from)?;
            let email_taken = email_taken(pool, email).await.map_err(AppError::from)?;
            form.validate_unique(username_taken, email_taken).err()
        }
        Err(errors) => Some(errors),
    };
    if let Some(errors) = errors {
        let body = views::register_page(&csrf.token, &form.username, &form.email, &errors);
        return Ok(html(body, &cookies));
    }

    let password_hash = hash_password(&form.password)?;
    let created = create_user(
        &state.db.pool,
        NewUser {
            username,
            email,
            password_hash: &password_hash,
            subscription_level: SubscriptionLevel::Free,
        },
    )
    .await;
    match created {
        Ok(user) => {
            info!("Registered user {}", user.username);
            Ok(redirect_with_flash(&state, "/auth/login", Flash::Registered))
        }
        Err(e) if is_unique_violation(&e) => {
            warn!("Registration raced with another signup for {}", username);
            let mut errors = FormErrors::default();
            errors.add("username", "Please use a different username.");
            let body = views::register_page(&csrf.token, &form.username, &form.email, &errors);
            Ok(html(body, &cookies))
        }
        Err(e) => Err(AppError::from(e).into()),
    }
}

async fn reset_request_form_handler(
    state: Arc<AppState>,
    user: Option<User>,
    csrf: CsrfToken,
) -> Result<Response, Rejection> {
    if user.is_some() {
        return Ok(redirect("/dashboard", &[]));
    }
    let body = views::reset_request_page(&csrf.token, "", &FormErrors::default());
    Ok(html(body, &page_cookies(&state, &csrf, None)))
}

async fn reset_request_handler(
    state: Arc<AppState>,
    csrf: CsrfToken,
    nonce: Option<String>,
    form: ResetPasswordRequestForm,
) -> Result<Response, Rejection> {
    let checked = check_form_token(&state, nonce.as_deref(), form.csrf_token.as_deref())
        .and_then(|()| form.validate());
    if let Err(errors) = checked {
        let body = views::reset_request_page(&csrf.token, &form.email, &errors);
        return Ok(html(body, &page_cookies(&state, &csrf, None)));
    }

    let user = find_user_by_email(&state.db.pool, form.email.trim())
        .await
        .map_err(AppError::from)?;
    let Some(user) = user else {
        return Ok(redirect_with_flash(&state, "/auth/login", Flash::ResetUnknownEmail));
    };

    let token = state.auth.create_reset_token(&user)?;
    let link = format!(
        "{}/auth/reset_password/{}",
        state.config.public_url.trim_end_matches('/'),
        token
    );
    if let Err(e) = state
        .mailer
        .send(password_reset_email(&user.email, &user.username, &link))
        .await
    {
        error!("Failed to send password reset mail to {}: {}", user.email, e);
    }
    Ok(redirect_with_flash(&state, "/auth/login", Flash::ResetEmailSent))
}

/// The user a reset token was issued to, if it is still valid.
async fn reset_token_user(state: &AppState, token: &str) -> Result<Option<User>, AppError> {
    let Some(user_id) = state.auth.reset_token_user_id(token) else {
        return Ok(None);
    };
    let user = find_user_by_id(&state.db.pool, user_id).await?;
    Ok(user.filter(|u| state.auth.reset_token_matches(token, u)))
}

async fn reset_form_handler(
    token: String,
    state: Arc<AppState>,
    user: Option<User>,
    csrf: CsrfToken,
) -> Result<Response, Rejection> {
    if user.is_some() {
        return Ok(redirect("/dashboard", &[]));
    }
    if reset_token_user(&state, &token).await?.is_none() {
        return Ok(redirect_with_flash(&state, "/auth/login", Flash::ResetTokenInvalid));
    }
    let body = views::reset_password_page(&csrf.token, &token, &FormErrors::default());
    Ok(html(body, &page_cookies(&state, &csrf, None)))
}

async fn reset_handler(
    token: String,
    state: Arc<AppState>,
    csrf: CsrfToken,
    nonce: Option<String>,
    form: ResetPasswordForm,
) -> Result<Response, Rejection> {
    let Some(user) = reset_token_user(&state, &token).await? else {
        return Ok(redirect_with_flash(&state, "/auth/login", Flash::ResetTokenInvalid));
    };
    let checked = check_form_token(&state, nonce.as_deref(), form.csrf_token.as_deref())
        .and_then(|()| form.validate());
    if let Err(errors) = checked {
        let body = views::reset_password_page(&csrf.token, &token, &errors);
        return Ok(html(body, &page_cookies(&state, &csrf, None)));
    }

    let password_hash = hash_password(&form.password)?;
    update_password(&state.db.pool, user.id, &password_hash)
        .await
        .map_err(AppError::from)?;
    info!("Password reset for {}", user.username);
    Ok(redirect_with_flash(&state, "/auth/login", Flash::PasswordReset))
}

async fn profile_page_handler(
    user: User,
    state: Arc<AppState>,
    csrf: CsrfToken,
    shown: Option<Flash>,
) -> Result<Response, Rejection> {
    let body = views::profile_page(&user, &csrf.token, &FormErrors::default(), shown);
    Ok(html(body, &page_cookies(&state, &csrf, shown)))
}

async fn profile_handler(
    user: User,
    state: Arc<AppState>,
    csrf: CsrfToken,
    nonce: Option<String>,
    form: ProfileForm,
) -> Result<Response, Rejection> {
    let checked = check_form_token(&state, nonce.as_deref(), form.csrf_token.as_deref())
        .and_then(|()| form.validate());
    if let Err(errors) = checked {
        let body = views::profile_page(&user, &csrf.token, &errors, None);
        return Ok(html(body, &page_cookies(&state, &csrf, None)));
    }

    let pool = &state.db.pool;
    update_profile(pool, user.id, &form.first_name, &form.last_name)
        .await
        .map_err(AppError::from)?;
    if !form.password.is_empty() {
        let password_hash = hash_password(&form.password)?;
        update_password(pool, user.id, &password_hash)
            .await
            .map_err(AppError::from)?;
    }
    info!("Profile updated for {}", user.username);
    Ok(redirect_with_flash(&state, "/auth/profile", Flash::ProfileUpdated))
}

/// The user's watchlists with a quote for every ticker. Quote failures
/// render as placeholders.
pub async fn watchlist_views(state: &AppState, user_id: i64) -> Result<Vec<WatchlistView>, AppError> {
    let mut views = Vec::new();
    for watchlist in list_watchlists(&state.db.pool, user_id).await? {
        let mut items = Vec::new();
        for item in list_watchlist_items(&state.db.pool, watchlist.id).await? {
            let quote = state.market.quote(&item.ticker).await;
            items.push((item, quote));
        }
        views.push(WatchlistView { watchlist, items });
    }
    Ok(views)
}

fn dashboard_routes(state: Arc<AppState>) -> BoxedFilter<(Response,)> {
    let dashboard = warp::path::end()
        .or(warp::path!("dashboard"))
        .unify()
        .and(warp::get())
        .and(require_user(state.clone()))
        .and(with_state(state.clone()))
        .and_then(dashboard_handler);

    let quick_view = warp::path!("quick-view")
        .and(warp::get())
        .and(require_user(state.clone()))
        .and(with_state(state.clone()))
        .and_then(quick_view_handler);

    let settings = warp::path!("settings")
        .and(warp::get())
        .and(require_user(state))
        .map(|user: User| {
            let premium = user.is_premium(Utc::now());
            html(views::settings_page(&user, premium), &[])
        });

    dashboard
        .or(quick_view)
        .unify()
        .or(settings)
        .unify()
        .boxed()
}

async fn dashboard_handler(user: User, state: Arc<AppState>) -> Result<Response, Rejection> {
    if user.last_login.is_none() {
        return Ok(redirect("/education/onboarding", &[]));
    }
    let watchlists = watchlist_views(&state, user.id).await?;
    let recent = list_backtests(&state.db.pool, user.id, Some(RECENT_BACKTESTS))
        .await
        .map_err(AppError::from)?;
    Ok(html(views::dashboard_page(&user, &watchlists, &recent), &[]))
}

async fn quick_view_handler(user: User, state: Arc<AppState>) -> Result<Response, Rejection> {
    let mut market = Vec::with_capacity(state.config.prefetch_symbols.len());
    for symbol in &state.config.prefetch_symbols {
        market.push(state.market.quote(symbol).await);
    }

    let mut tickers = BTreeSet::new();
    for watchlist in list_watchlists(&state.db.pool, user.id)
        .await
        .map_err(AppError::from)?
    {
        for item in list_watchlist_items(&state.db.pool, watchlist.id)
            .await
            .map_err(AppError::from)?
        {
            tickers.insert(item.ticker);
        }
    }
    let mut tracked: Vec<Quote> = Vec::with_capacity(tickers.len());
    for ticker in &tickers {
        tracked.push(state.market.quote(ticker).await);
    }
    Ok(html(views::quick_view_page(&user, &market, &tracked), &[]))
}

fn education_routes(state: Arc<AppState>) -> BoxedFilter<(Response,)> {
    let first = warp::path!("education" / "onboarding")
        .and(warp::get())
        .and(require_user(state.clone()))
        .map(|user: User| html(views::onboarding_page(&user, 1), &[]));

    let step = warp::path!("education" / "onboarding" / usize)
        .and(warp::get())
        .and(require_user(state.clone()))
        .and(with_state(state))
        .and_then(onboarding_step_handler);

    first.or(step).unify().boxed()
}

async fn onboarding_step_handler(
    step: usize,
    mut user: User,
    state: Arc<AppState>,
) -> Result<Response, Rejection> {
    if views::onboarding_step_title(step).is_none() {
        return Ok(redirect("/education/onboarding", &[]));
    }
    if step == views::ONBOARDING_STEPS && user.last_login.is_none() {
        let now = Utc::now();
        touch_last_login(&state.db.pool, user.id, now)
            .await
            .map_err(AppError::from)?;
        user.last_login = Some(now);
        info!("User {} finished onboarding", user.username);
    }
    Ok(html(views::onboarding_page(&user, step), &[]))
}

fn analysis_routes(state: Arc<AppState>) -> BoxedFilter<(Response,)> {
    let index = warp::path!("analysis")
        .and(warp::get())
        .and(require_user(state.clone()))
        .and(with_state(state.clone()))
        .and(with_csrf_token(state.csrf.clone()))
        .and_then(analysis_handler);

    let charts = warp::path!("analysis" / "charts" / String)
        .and(warp::get())
        .and(require_user(state.clone()))
        .and(with_state(state))
        .and_then(chart_handler);

    index.or(charts).unify().boxed()
}

async fn analysis_handler(
    user: User,
    state: Arc<AppState>,
    csrf: CsrfToken,
) -> Result<Response, Rejection> {
    let watchlists = watchlist_views(&state, user.id).await?;
    let body = views::analysis_page(&user, &csrf.token, &watchlists);
    Ok(html(body, &page_cookies(&state, &csrf, None)))
}

async fn chart_handler(ticker: String, user: User, state: Arc<AppState>) -> Result<Response, Rejection> {
    let symbol = normalize_symbol(&ticker).map_err(|_| AppError::NotFound("ticker"))?;
    let body = match state.market.history(&symbol, HistoryRange::OneYear).await {
        Ok(candles) => {
            let quote = quote_from_candles(&symbol, &candles);
            let rows = add_technical_indicators(&candles);
            views::chart_page(&user, &symbol, &quote, rows.last())
        }
        Err(e) => {
            warn!("Chart data unavailable for {}: {}", symbol, e);
            views::chart_page(&user, &symbol, &Quote::unavailable(&symbol), None)
        }
    };
    Ok(html(body, &[]))
}

fn backtest_routes(state: Arc<AppState>) -> BoxedFilter<(Response,)> {
    let index = warp::path!("backtesting")
        .and(warp::get())
        .and(require_user(state.clone()))
        .and(with_state(state.clone()))
        .and(with_csrf_token(state.csrf.clone()))
        .and_then(backtests_handler);

    let run = warp::path!("backtesting")
        .and(warp::post())
        .and(require_user(state.clone()))
        .and(with_state(state.clone()))
        .and(with_csrf_token(state.csrf.clone()))
        .and(csrf_nonce())
        .and(form_body::<BacktestForm>())
        .and_then(run_backtest_handler);

    let results = warp::path!("backtesting" / "results" / i64)
        .and(warp::get())
        .and(require_user(state.clone()))
        .and(with_state(state))
        .and_then(backtest_results_handler);

    index.or(run).unify().or(results).unify().boxed()
}

async fn render_backtests(
    user: &User,
    state: &AppState,
    csrf: &CsrfToken,
    form: &BacktestForm,
    errors: &FormErrors,
) -> Result<Response, Rejection> {
    let backtests = list_backtests(&state.db.pool, user.id, None)
        .await
        .map_err(AppError::from)?;
    let body = views::backtests_page(user, &csrf.token, &backtests, form, errors);
    Ok(html(body, &page_cookies(state, csrf, None)))
}

async fn backtests_handler(
    user: User,
    state: Arc<AppState>,
    csrf: CsrfToken,
) -> Result<Response, Rejection> {
    render_backtests(&user, &state, &csrf, &BacktestForm::default(), &FormErrors::default()).await
}

/// Runs the posted strategy, stores the outcome and shows its results page.
async fn run_backtest_handler(
    user: User,
    state: Arc<AppState>,
    csrf: CsrfToken,
    nonce: Option<String>,
    form: BacktestForm,
) -> Result<Response, Rejection> {
    let checked = check_form_token(&state, nonce.as_deref(), form.csrf_token.as_deref())
        .and_then(|()| form.parse());
    let run = match checked {
        Ok(run) => run,
        Err(errors) => return render_backtests(&user, &state, &csrf, &form, &errors).await,
    };

    let candles = match state.market.history(&run.ticker, run.range).await {
        Ok(candles) => candles,
        Err(e) => {
            warn!("Backtest data unavailable for {}: {}", run.ticker, e);
            let mut errors = FormErrors::default();
            errors.add("ticker", format!("Market data unavailable: {}", e));
            return render_backtests(&user, &state, &csrf, &form, &errors).await;
        }
    };
    let strategy = run.strategy.build().map_err(AppError::BadRequest)?;
    let report = Backtester::new(strategy)
        .initial_capital(run.initial_capital)
        .commission(run.commission)
        .position_sizing(run.position_sizing, run.position_value)
        .run(&candles);
    let (Some(report), Some(first), Some(last)) = (report, candles.first(), candles.last()) else {
        let mut errors = FormErrors::default();
        errors.add("ticker", "Not enough price history to run this strategy.");
        return render_backtests(&user, &state, &csrf, &form, &errors).await;
    };

    let backtest = NewBacktest {
        name: run.name.clone(),
        ticker: run.ticker.clone(),
        start_date: first.timestamp,
        end_date: last.timestamp,
        strategy_type: run.strategy.type_name().to_string(),
        parameters: serde_json::to_value(&run.strategy)
            .map_err(|e| AppError::Internal(e.to_string()))?,
        results: Some(
            serde_json::to_value(&report).map_err(|e| AppError::Internal(e.to_string()))?,
        ),
    };
    let saved = save_backtest(&state.db.pool, user.id, &backtest)
        .await
        .map_err(AppError::from)?;
    info!(
        "User {} ran {} on {} as backtest {}",
        user.username,
        backtest.strategy_type,
        run.ticker,
        saved.id
    );
    Ok(redirect(&format!("/backtesting/results/{}", saved.id), &[]))
}

async fn backtest_results_handler(
    backtest_id: i64,
    user: User,
    state: Arc<AppState>,
) -> Result<Response, Rejection> {
    let backtest = get_backtest(&state.db.pool, backtest_id, user.id)
        .await
        .map_err(AppError::from)?
        .ok_or(AppError::NotFound("backtest"))?;
    Ok(html(views::backtest_results_page(&user, &backtest), &[]))
}
