// src/views.rs
//! Server-rendered HTML pages and the response helpers that carry cookies.

use crate::auth::build_cookie;
use crate::forms::{BacktestForm, FormErrors};
use crate::indicators::IndicatorRow;
use crate::models::{Backtest, Quote, User, Watchlist, WatchlistItem};
use chrono::{DateTime, Utc};
use warp::http::header::{HeaderValue, LOCATION, SET_COOKIE};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::Reply;

pub const FLASH_COOKIE: &str = "flash";
const PLACEHOLDER: &str = "—";

/// One-shot message carried across a redirect in the `flash` cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flash {
    Registered,
    ResetEmailSent,
    ResetUnknownEmail,
    ResetTokenInvalid,
    PasswordReset,
    ProfileUpdated,
    LoggedOut,
}

impl Flash {
    pub fn code(&self) -> &'static str {
        match self {
            Flash::Registered => "registered",
            Flash::ResetEmailSent => "reset-sent",
            Flash::ResetUnknownEmail => "reset-unknown",
            Flash::ResetTokenInvalid => "reset-invalid",
            Flash::PasswordReset => "password-reset",
            Flash::ProfileUpdated => "profile-updated",
            Flash::LoggedOut => "logged-out",
        }
    }

    pub fn from_code(code: &str) -> Option<Flash> {
        [
            Flash::Registered,
            Flash::ResetEmailSent,
            Flash::ResetUnknownEmail,
            Flash::ResetTokenInvalid,
            Flash::PasswordReset,
            Flash::ProfileUpdated,
            Flash::LoggedOut,
        ]
        .into_iter()
        .find(|f| f.code() == code)
    }

    pub fn message(&self) -> &'static str {
        match self {
            Flash::Registered => "Congratulations! Your account has been created. Please sign in.",
            Flash::ResetEmailSent => "Check your email for instructions to reset your password",
            Flash::ResetUnknownEmail => "Email not found in our database",
            Flash::ResetTokenInvalid => "Invalid or expired token",
            Flash::PasswordReset => "Your password has been reset",
            Flash::ProfileUpdated => "Your profile has been updated.",
            Flash::LoggedOut => "You have been logged out.",
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            Flash::Registered | Flash::PasswordReset | Flash::ProfileUpdated => "success",
            Flash::ResetEmailSent | Flash::LoggedOut => "info",
            Flash::ResetUnknownEmail | Flash::ResetTokenInvalid => "warning",
        }
    }
}

pub fn flash_cookie(flash: Flash, secure: bool) -> String {
    build_cookie(FLASH_COOKIE, flash.code(), None, secure)
}

pub fn clear_flash_cookie(secure: bool) -> String {
    build_cookie(FLASH_COOKIE, "", Some(0), secure)
}

pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn fmt_price(value: Option<f64>) -> String {
    value.map_or_else(|| PLACEHOLDER.to_string(), |v| format!("${:.2}", v))
}

pub fn fmt_pct(value: Option<f64>) -> String {
    value.map_or_else(|| PLACEHOLDER.to_string(), |v| format!("{:+.2}%", v))
}

pub fn fmt_num(value: Option<f64>, decimals: usize) -> String {
    value.map_or_else(|| PLACEHOLDER.to_string(), |v| format!("{:.*}", decimals, v))
}

fn push_line(out: &mut String, line: &str) {
    out.push_str(line);
    out.push('\n');
}

fn fmt_date(value: DateTime<Utc>) -> String {
    value.format("%Y-%m-%d").to_string()
}

fn append_cookies(response: &mut Response, cookies: &[String]) {
    for cookie in cookies {
        if let Ok(value) = HeaderValue::from_str(cookie) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
}

pub fn html(body: String, cookies: &[String]) -> Response {
    html_with_status(body, StatusCode::OK, cookies)
}

pub fn html_with_status(body: String, status: StatusCode, cookies: &[String]) -> Response {
    let mut response = warp::reply::with_status(warp::reply::html(body), status).into_response();
    append_cookies(&mut response, cookies);
    response
}

pub fn redirect(location: &str, cookies: &[String]) -> Response {
    let mut response = StatusCode::SEE_OTHER.into_response();
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(LOCATION, value);
    }
    append_cookies(&mut response, cookies);
    response
}

/// Shared page chrome.
pub struct Page<'a> {
    pub title: &'a str,
    pub user: Option<&'a User>,
    pub flash: Option<Flash>,
    pub csrf: Option<&'a str>,
}

impl<'a> Page<'a> {
    pub fn new(title: &'a str, user: Option<&'a User>) -> Self {
        Page {
            title,
            user,
            flash: None,
            csrf: None,
        }
    }

    pub fn flash(mut self, flash: Option<Flash>) -> Self {
        self.flash = flash;
        self
    }

    pub fn csrf(mut self, token: &'a str) -> Self {
        self.csrf = Some(token);
        self
    }

    pub fn render(&self, content: &str) -> String {
        let mut out = String::new();
        out.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
        push_line(&mut out, &format!("<title>{} - ToFu's Trading Platform</title>", escape(self.title)));
        if let Some(token) = self.csrf {
            push_line(&mut out, &format!("<meta name=\"csrf-token\" content=\"{}\">", escape(token)));
        }
        out.push_str("</head>\n<body>\n<nav>\n<a href=\"/\">ToFu's Trading Platform</a>\n");
        match self.user {
            Some(user) => {
                out.push_str(
                    "<a href=\"/dashboard\">Dashboard</a>\n<a href=\"/analysis/\">Stock Analysis</a>\n\
                     <a href=\"/backtesting/\">Backtesting</a>\n<a href=\"/quick-view\">Quick View</a>\n\
                     <a href=\"/education/onboarding\">Learn</a>\n",
                );
                push_line(
                    &mut out,
                    &format!(
                        "<a href=\"/auth/profile\">{}</a>\n<a href=\"/settings\">Settings</a>\n<a href=\"/auth/logout\">Logout</a>",
                        escape(&user.username),
                    ),
                );
            }
            None => out.push_str("<a href=\"/auth/login\">Login</a>\n<a href=\"/auth/register\">Register</a>\n"),
        }
        out.push_str("</nav>\n<main>\n");
        if let Some(flash) = self.flash {
            push_line(
                &mut out,
                &format!(
                    "<div class=\"alert alert-{}\">{}</div>",
                    flash.category(),
                    escape(flash.message()),
                ),
            );
        }
        push_line(&mut out, &format!("<h1>{}</h1>", escape(self.title)));
        out.push_str(content);
        out.push_str("\n</main>\n</body>\n</html>\n");
        out
    }
}

fn csrf_field(token: &str, errors: &FormErrors) -> String {
    format!(
        "<input type=\"hidden\" name=\"csrf_token\" value=\"{}\">\n{}",
        escape(token),
        field_errors(errors, "csrf_token")
    )
}

fn field_errors(errors: &FormErrors, field: &str) -> String {
    errors
        .field(field)
        .iter()
        .map(|e| format!("<span class=\"error\">{}</span>\n", escape(e)))
        .collect()
}

fn input(label: &str, name: &str, kind: &str, value: &str, errors: &FormErrors) -> String {
    format!(
        "<p><label for=\"{name}\">{label}</label>\n<input type=\"{kind}\" id=\"{name}\" name=\"{name}\" value=\"{value}\">\n{errs}</p>\n",
        name = name,
        label = escape(label),
        kind = kind,
        value = escape(value),
        errs = field_errors(errors, name),
    )
}

fn select(label: &str, name: &str, choices: &[(&str, &str)], selected: &str, errors: &FormErrors) -> String {
    let options: String = choices
        .iter()
        .map(|(value, text)| {
            format!(
                "<option value=\"{}\"{}>{}</option>\n",
                value,
                if *value == selected { " selected" } else { "" },
                escape(text)
            )
        })
        .collect();
    format!(
        "<p><label for=\"{name}\">{label}</label>\n<select id=\"{name}\" name=\"{name}\">\n{options}</select>\n{errs}</p>\n",
        name = name,
        label = escape(label),
        options = options,
        errs = field_errors(errors, name),
    )
}

pub fn login_page(
    csrf: &str,
    username: &str,
    error: Option<&str>,
    errors: &FormErrors,
    next: Option<&str>,
    flash: Option<Flash>,
) -> String {
    let mut content = String::new();
    if let Some(error) = error {
        push_line(&mut content, &format!("<div class=\"alert alert-danger\">{}</div>", escape(error)));
    }
    let action = match next {
        Some(next) => format!("/auth/login?next={}", escape(&crate::auth::encode_query_value(next))),
        None => "/auth/login".to_string(),
    };
    push_line(&mut content, &format!("<form method=\"post\" action=\"{}\">", action));
    content.push_str(&csrf_field(csrf, errors));
    content.push_str(&input("Username", "username", "text", username, errors));
    content.push_str(&input("Password", "password", "password", "", errors));
    content.push_str(
        "<p><label><input type=\"checkbox\" name=\"remember_me\" value=\"y\"> Remember Me</label></p>\n\
         <p><input type=\"submit\" value=\"Sign In\"></p>\n</form>\n\
         <p>New user? <a href=\"/auth/register\">Click to Register!</a></p>\n\
         <p>Forgot your password? <a href=\"/auth/reset_password_request\">Click to Reset It</a></p>\n",
    );
    Page::new("Sign In", None).flash(flash).csrf(csrf).render(&content)
}

pub fn register_page(csrf: &str, username: &str, email: &str, errors: &FormErrors) -> String {
    let mut content = String::from("<form method=\"post\" action=\"/auth/register\">\n");
    content.push_str(&csrf_field(csrf, errors));
    content.push_str(&input("Username", "username", "text", username, errors));
    content.push_str(&input("Email", "email", "email", email, errors));
    content.push_str(&input("Password", "password", "password", "", errors));
    content.push_str(&input("Repeat Password", "password2", "password", "", errors));
    content.push_str("<p><input type=\"submit\" value=\"Register\"></p>\n</form>\n");
    Page::new("Register", None).csrf(csrf).render(&content)
}

pub fn reset_request_page(csrf: &str, email: &str, errors: &FormErrors) -> String {
    let mut content = String::from("<form method=\"post\" action=\"/auth/reset_password_request\">\n");
    content.push_str(&csrf_field(csrf, errors));
    content.push_str(&input("Email", "email", "email", email, errors));
    content.push_str("<p><input type=\"submit\" value=\"Request Password Reset\"></p>\n</form>\n");
    Page::new("Reset Password", None).csrf(csrf).render(&content)
}

pub fn reset_password_page(csrf: &str, token: &str, errors: &FormErrors) -> String {
    let mut content = format!(
        "<form method=\"post\" action=\"/auth/reset_password/{}\">\n",
        escape(token)
    );
    content.push_str(&csrf_field(csrf, errors));
    content.push_str(&input("New Password", "password", "password", "", errors));
    content.push_str(&input("Repeat Password", "password2", "password", "", errors));
    content.push_str("<p><input type=\"submit\" value=\"Reset Password\"></p>\n</form>\n");
    Page::new("Reset Password", None).csrf(csrf).render(&content)
}

pub fn profile_page(user: &User, csrf: &str, errors: &FormErrors, flash: Option<Flash>) -> String {
    let mut content = String::new();
    push_line(
        &mut content,
        &format!(
            "<dl>\n<dt>Username</dt><dd>{}</dd>\n<dt>Email</dt><dd>{}</dd>\n<dt>Member since</dt><dd>{}</dd>\n\
             <dt>Last login</dt><dd>{}</dd>\n<dt>Subscription</dt><dd>{}</dd>\n</dl>",
            escape(&user.username),
            escape(&user.email),
            fmt_date(user.created_at),
            user.last_login.map_or_else(|| PLACEHOLDER.to_string(), |d| d.format("%Y-%m-%d %H:%M").to_string()),
            escape(&user.subscription().to_string()),
        ),
    );
    content.push_str("<form method=\"post\" action=\"/auth/profile\">\n");
    content.push_str(&csrf_field(csrf, errors));
    content.push_str(&input("First Name", "first_name", "text", user.first_name.as_deref().unwrap_or(""), errors));
    content.push_str(&input("Last Name", "last_name", "text", user.last_name.as_deref().unwrap_or(""), errors));
    content.push_str(&input("New Password", "password", "password", "", errors));
    content.push_str(&input("Repeat Password", "password2", "password", "", errors));
    content.push_str("<p><input type=\"submit\" value=\"Save\"></p>\n</form>\n");
    Page::new("User Profile", Some(user)).flash(flash).csrf(csrf).render(&content)
}

fn quote_row(quote: &Quote) -> String {
    format!(
        "<tr><td><a href=\"/analysis/charts/{sym}\">{sym}</a></td><td>{price}</td><td>{change}</td><td>{rsi}</td><td>{signal}</td></tr>\n",
        sym = escape(&quote.symbol),
        price = fmt_price(quote.price),
        change = fmt_pct(quote.change_pct),
        rsi = fmt_num(quote.rsi, 1),
        signal = escape(quote.signal.as_deref().unwrap_or(PLACEHOLDER)),
    )
}

fn quote_table(quotes: &[Quote]) -> String {
    let mut out = String::from(
        "<table class=\"quotes\">\n<tr><th>Ticker</th><th>Price</th><th>Change</th><th>RSI</th><th>Signal</th></tr>\n",
    );
    for quote in quotes {
        out.push_str(&quote_row(quote));
    }
    out.push_str("</table>\n");
    out
}

fn backtest_table(backtests: &[Backtest], with_actions: bool) -> String {
    if backtests.is_empty() {
        return "<p>No saved backtests yet.</p>\n".to_string();
    }
    let mut out = String::from(
        "<table class=\"backtests\">\n<tr><th>Name</th><th>Ticker</th><th>Strategy</th><th>Period</th><th>Created</th></tr>\n",
    );
    for b in backtests {
        out.push_str(&format!(
            "<tr id=\"backtest-{id}\"><td><a href=\"/backtesting/results/{id}\">{name}</a></td><td>{ticker}</td><td>{strategy}</td><td>{start} to {end}</td><td>{created}</td>",
            id = b.id,
            name = escape(&b.name),
            ticker = escape(&b.ticker),
            strategy = escape(&b.strategy_type),
            start = fmt_date(b.start_date),
            end = fmt_date(b.end_date),
            created = fmt_date(b.created_at),
        ));
        if with_actions {
            out.push_str(&format!(
                "<td><button class=\"delete-backtest\" data-id=\"{}\">Delete</button></td>",
                b.id,
            ));
        }
        out.push_str("</tr>\n");
    }
    out.push_str("</table>\n");
    out
}

/// A watchlist together with the latest quote of each of its tickers.
pub struct WatchlistView {
    pub watchlist: Watchlist,
    pub items: Vec<(WatchlistItem, Quote)>,
}

fn watchlist_section(view: &WatchlistView, with_actions: bool) -> String {
    let mut out = String::new();
    push_line(
        &mut out,
        &format!(
            "<section class=\"watchlist\" id=\"watchlist-{}\">\n<h3>{}</h3>",
            view.watchlist.id,
            escape(&view.watchlist.name),
        ),
    );
    if view.items.is_empty() {
        out.push_str("<p>No tickers in this watchlist.</p>\n");
    } else {
        out.push_str("<table>\n<tr><th>Ticker</th><th>Price</th><th>Change</th><th>RSI</th><th>Signal</th><th>Notes</th></tr>\n");
        for (item, quote) in &view.items {
            let row = quote_row(quote);
            let row = row.trim_end().trim_end_matches("</tr>");
            out.push_str(&format!("{}<td>{}</td>", row, escape(item.notes.as_deref().unwrap_or(""))));
            if with_actions {
                out.push_str(&format!(
                    "<td><button class=\"remove-item\" data-watchlist=\"{}\" data-item=\"{}\">Remove</button></td>",
                    view.watchlist.id, item.id,
                ));
            }
            out.push_str("</tr>\n");
        }
        out.push_str("</table>\n");
    }
    out.push_str("</section>\n");
    out
}

pub fn dashboard_page(user: &User, watchlists: &[WatchlistView], recent: &[Backtest]) -> String {
    let mut content = String::new();
    push_line(&mut content, &format!("<p>Welcome back, {}!</p>", escape(&user.username)));
    content.push_str("<h2>Your Watchlists</h2>\n");
    if watchlists.is_empty() {
        content.push_str("<p>You have no watchlists. <a href=\"/analysis/\">Create one</a>.</p>\n");
    }
    for view in watchlists {
        content.push_str(&watchlist_section(view, false));
    }
    content.push_str("<h2>Recent Backtests</h2>\n");
    content.push_str(&backtest_table(recent, false));
    Page::new("Dashboard", Some(user)).render(&content)
}

pub fn quick_view_page(user: &User, market: &[Quote], tracked: &[Quote]) -> String {
    let mut content = String::from("<h2>Market Overview</h2>\n");
    content.push_str(&quote_table(market));
    content.push_str("<h2>Your Tracked Stocks</h2>\n");
    if tracked.is_empty() {
        content.push_str("<p>Add tickers to a watchlist to track them here.</p>\n");
    } else {
        content.push_str(&quote_table(tracked));
    }
    Page::new("Market Quick View", Some(user)).render(&content)
}

pub fn settings_page(user: &User, premium: bool) -> String {
    let mut content = String::new();
    push_line(
        &mut content,
        &format!(
            "<h2>Account</h2>\n<p>Signed in as <strong>{}</strong> ({}).</p>\n<p><a href=\"/auth/profile\">Edit profile</a></p>",
            escape(&user.username),
            escape(&user.email),
        ),
    );
    let expires = user
        .subscription_expires
        .map_or_else(|| "never".to_string(), fmt_date);
    push_line(
        &mut content,
        &format!(
            "<h2>Subscription</h2>\n<p>Plan: {} ({})</p>\n<p>Expires: {}</p>",
            escape(&user.subscription().to_string()),
            if premium { "premium features active" } else { "free features" },
            expires,
        ),
    );
    Page::new("Settings", Some(user)).render(&content)
}

pub const ONBOARDING_STEPS: usize = 5;

pub fn onboarding_step_title(step: usize) -> Option<&'static str> {
    match step {
        1 => Some("Platform Overview"),
        2 => Some("Stock Analysis Basics"),
        3 => Some("Technical Indicators"),
        4 => Some("Backtesting Strategies"),
        5 => Some("Options & Trading"),
        _ => None,
    }
}

fn onboarding_body(step: usize) -> &'static str {
    match step {
        1 => "<p>Track stocks in watchlists, study their charts, test strategies against history and price options, all in one place.</p>",
        2 => "<p>Every ticker page shows the latest close, the change from the previous session and volume. Use the period selector to widen the window from five days to the full history.</p>",
        3 => "<p>RSI measures momentum between 0 and 100; readings below 30 suggest oversold and above 70 overbought. MACD, Bollinger Bands, moving averages, ADX, stochastics and ATR round out the toolkit.</p>",
        4 => "<p>Backtests replay a strategy (moving-average crossover, RSI, MACD or MA with an RSI filter) over past prices and report returns, drawdown, Sharpe ratio and trade statistics.</p>",
        _ => "<p>The options calculator prices calls and puts with Black-Scholes and a binomial tree, reports the greeks and plots profit and loss at expiry. The risk/reward tool sizes stop and target levels.</p>",
    }
}

pub fn onboarding_page(user: &User, step: usize) -> String {
    let step = step.clamp(1, ONBOARDING_STEPS);
    let title = match onboarding_step_title(step) {
        Some(t) if step > 1 => format!("Onboarding: {}", t),
        _ => "Welcome to ToFu's Trading Platform".to_string(),
    };
    let mut content = String::new();
    push_line(
        &mut content,
        &format!(
            "<p class=\"progress\">Step {} of {}: {}</p>\n{}",
            step,
            ONBOARDING_STEPS,
            onboarding_step_title(step).unwrap_or_default(),
            onboarding_body(step),
        ),
    );
    content.push_str("<p>");
    if step > 1 {
        content.push_str(&format!("<a href=\"/education/onboarding/{}\">Previous</a> ", step - 1));
    }
    if step < ONBOARDING_STEPS {
        content.push_str(&format!("<a href=\"/education/onboarding/{}\">Next</a>", step + 1));
    } else {
        content.push_str("<a href=\"/dashboard\">Go to your dashboard</a>");
    }
    content.push_str("</p>\n");
    Page::new(&title, Some(user)).render(&content)
}

const WATCHLIST_SCRIPT: &str = r#"<script>
const csrf = document.querySelector('meta[name="csrf-token"]').content;
const send = (method, url, body) => fetch(url, {
  method, headers: {'Content-Type': 'application/json', 'X-CSRF-Token': csrf},
  body: body ? JSON.stringify(body) : undefined,
}).then(() => location.reload());
document.getElementById('create-watchlist').addEventListener('submit', (e) => {
  e.preventDefault();
  send('POST', '/analysis/watchlist/create', {name: e.target.name.value});
});
document.querySelectorAll('form.add-ticker').forEach((f) => f.addEventListener('submit', (e) => {
  e.preventDefault();
  send('POST', `/analysis/watchlist/${f.dataset.watchlist}/add`, {ticker: f.ticker.value, notes: f.notes.value});
}));
document.querySelectorAll('button.remove-item').forEach((b) => b.addEventListener('click', () =>
  send('DELETE', `/analysis/watchlist/${b.dataset.watchlist}/remove/${b.dataset.item}`)));
document.querySelectorAll('button.delete-watchlist').forEach((b) => b.addEventListener('click', () =>
  send('DELETE', `/analysis/watchlist/${b.dataset.watchlist}`)));
</script>
"#;

pub fn analysis_page(user: &User, csrf: &str, watchlists: &[WatchlistView]) -> String {
    let mut content = String::from(
        "<form method=\"get\" action=\"/analysis/charts\" id=\"ticker-search\" \
         onsubmit=\"location.href='/analysis/charts/'+encodeURIComponent(this.ticker.value);return false;\">\n\
         <input type=\"text\" name=\"ticker\" placeholder=\"Ticker, e.g. AAPL\">\n\
         <input type=\"submit\" value=\"Analyze\">\n</form>\n<h2>Watchlists</h2>\n\
         <form id=\"create-watchlist\">\n<input type=\"text\" name=\"name\" placeholder=\"New watchlist name\">\n\
         <input type=\"submit\" value=\"Create\">\n</form>\n",
    );
    for view in watchlists {
        content.push_str(&watchlist_section(view, true));
        push_line(
            &mut content,
            &format!(
                "<form class=\"add-ticker\" data-watchlist=\"{id}\">\n<input type=\"text\" name=\"ticker\" placeholder=\"Ticker\">\n\
                 <input type=\"text\" name=\"notes\" placeholder=\"Notes\">\n<input type=\"submit\" value=\"Add\">\n</form>\n\
                 <button class=\"delete-watchlist\" data-watchlist=\"{id}\">Delete watchlist</button>",
                id = view.watchlist.id,
            ),
        );
    }
    content.push_str(WATCHLIST_SCRIPT);
    Page::new("Stock Analysis", Some(user)).csrf(csrf).render(&content)
}

pub fn chart_page(user: &User, ticker: &str, quote: &Quote, latest: Option<&IndicatorRow>) -> String {
    let title = format!("{} Charts", ticker);
    let mut content = String::new();
    push_line(
        &mut content,
        &format!(
            "<dl class=\"quote\">\n<dt>Last close</dt><dd>{}</dd>\n<dt>Change</dt><dd>{} ({})</dd>\n\
             <dt>Volume</dt><dd>{}</dd>\n<dt>RSI</dt><dd>{}</dd>\n<dt>Signal</dt><dd>{}</dd>\n</dl>",
            fmt_price(quote.price),
            fmt_num(quote.change, 2),
            fmt_pct(quote.change_pct),
            fmt_num(quote.volume, 0),
            fmt_num(quote.rsi, 1),
            escape(quote.signal.as_deref().unwrap_or(PLACEHOLDER)),
        ),
    );
    content.push_str("<h2>Indicators</h2>\n");
    match latest {
        Some(row) => {
            push_line(
                &mut content,
                &format!(
                    "<table class=\"indicators\">\n\
                     <tr><th>MACD</th><td>{}</td><th>Signal</th><td>{}</td><th>Histogram</th><td>{}</td></tr>\n\
                     <tr><th>BB lower</th><td>{}</td><th>BB middle</th><td>{}</td><th>BB upper</th><td>{}</td></tr>\n\
                     <tr><th>SMA 20</th><td>{}</td><th>SMA 50</th><td>{}</td><th>SMA 200</th><td>{}</td></tr>\n\
                     <tr><th>ADX</th><td>{}</td><th>ATR</th><td>{}</td><th>VWAP</th><td>{}</td></tr>\n\
                     <tr><th>%K</th><td>{}</td><th>%D</th><td>{}</td><th>PPO</th><td>{}</td></tr>\n\
                     <tr><th>Pivot</th><td>{:.2}</td><th>R1</th><td>{:.2}</td><th>S1</th><td>{:.2}</td></tr>\n</table>",
                    fmt_num(row.macd, 3),
                    fmt_num(row.macd_signal, 3),
                    fmt_num(row.macd_hist, 3),
                    fmt_num(row.bb_lower, 2),
                    fmt_num(row.bb_middle, 2),
                    fmt_num(row.bb_upper, 2),
                    fmt_num(row.sma20, 2),
                    fmt_num(row.sma50, 2),
                    fmt_num(row.sma200, 2),
                    fmt_num(row.adx, 1),
                    fmt_num(row.atr, 2),
                    fmt_num(row.vwap, 2),
                    fmt_num(row.stoch_k, 1),
                    fmt_num(row.stoch_d, 1),
                    fmt_num(row.ppo, 2),
                    row.pivot,
                    row.r1,
                    row.s1,
                ),
            );
        }
        None => {
            push_line(&mut content, &format!("<p>Indicator data is unavailable ({}).</p>", PLACEHOLDER));
        }
    }
    let sym = escape(ticker);
    push_line(
        &mut content,
        &format!(
            "<p>Chart data: <a href=\"/analysis/api/stock/{sym}?period=1y\">1 year</a> \
             <a href=\"/analysis/api/stock/{sym}?period=5y\">5 years</a> \
             <a href=\"/trading/api/options-chain/{sym}\">option chain</a></p>",
            sym = sym,
        ),
    );
    Page::new(&title, Some(user)).render(&content)
}

const BACKTEST_SCRIPT: &str = r#"<script>
const csrf = document.querySelector('meta[name="csrf-token"]').content;
document.querySelectorAll('button.delete-backtest').forEach((b) => b.addEventListener('click', () =>
  fetch(`/backtesting/delete/${b.dataset.id}`, {method: 'DELETE', headers: {'X-CSRF-Token': csrf}})
    .then(() => location.reload())));
</script>
"#;

const PERIODS: &[(&str, &str)] = &[
    ("6mo", "6 months"),
    ("1y", "1 year"),
    ("2y", "2 years"),
    ("5y", "5 years"),
    ("10y", "10 years"),
    ("max", "Max"),
];

const STRATEGIES: &[(&str, &str)] = &[
    ("ma_cross", "Moving Average Crossover"),
    ("rsi", "RSI"),
    ("macd", "MACD"),
    ("ma_rsi", "Moving Average with RSI filter"),
];

const SIZINGS: &[(&str, &str)] = &[
    ("fixed_dollar", "Fixed dollar amount"),
    ("percentage", "Percent of equity"),
    ("fixed_risk", "Percent of equity at risk"),
    ("fixed_shares", "Fixed number of shares"),
];

fn backtest_form(csrf: &str, form: &BacktestForm, errors: &FormErrors) -> String {
    let mut out = String::from("<h2>Run a Backtest</h2>\n<form method=\"post\" action=\"/backtesting\">\n");
    out.push_str(&csrf_field(csrf, errors));
    out.push_str(&input("Name", "name", "text", &form.name, errors));
    out.push_str(&input("Ticker", "ticker", "text", &form.ticker, errors));
    out.push_str(&select("Period", "period", PERIODS, &form.period, errors));
    out.push_str(&select("Strategy", "strategy_type", STRATEGIES, &form.strategy_type, errors));
    out.push_str(&input("Short window", "short_window", "number", &form.short_window, errors));
    out.push_str(&input("Long window", "long_window", "number", &form.long_window, errors));
    out.push_str(&input("RSI period", "rsi_period", "number", &form.rsi_period, errors));
    out.push_str(&input("RSI buy below", "oversold", "text", &form.oversold, errors));
    out.push_str(&input("RSI sell above", "overbought", "text", &form.overbought, errors));
    out.push_str(&input("Initial capital", "initial_capital", "text", &form.initial_capital, errors));
    out.push_str(&input("Commission", "commission", "text", &form.commission, errors));
    out.push_str(&select("Position sizing", "position_sizing", SIZINGS, &form.position_sizing, errors));
    out.push_str(&input("Position value", "position_value", "text", &form.position_value, errors));
    out.push_str("<p><input type=\"submit\" value=\"Run Backtest\"></p>\n</form>\n");
    out
}

pub fn backtests_page(
    user: &User,
    csrf: &str,
    backtests: &[Backtest],
    form: &BacktestForm,
    errors: &FormErrors,
) -> String {
    let mut content = backtest_form(csrf, form, errors);
    content.push_str("<h2>Saved Backtests</h2>\n");
    content.push_str(&backtest_table(backtests, true));
    content.push_str(BACKTEST_SCRIPT);
    Page::new("Backtesting", Some(user)).csrf(csrf).render(&content)
}

pub fn backtest_results_page(user: &User, backtest: &Backtest) -> String {
    let title = format!("Backtest Results: {}", backtest.name);
    let pretty = |value: &serde_json::Value| {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    };
    let mut content = String::new();
    push_line(
        &mut content,
        &format!(
            "<dl>\n<dt>Ticker</dt><dd>{}</dd>\n<dt>Strategy</dt><dd>{}</dd>\n<dt>Period</dt><dd>{} to {}</dd>\n</dl>",
            escape(&backtest.ticker),
            escape(&backtest.strategy_type),
            fmt_date(backtest.start_date),
            fmt_date(backtest.end_date),
        ),
    );
    push_line(
        &mut content,
        &format!(
            "<h2>Parameters</h2>\n<pre>{}</pre>",
            escape(&pretty(&backtest.parameters)),
        ),
    );
    let results = backtest
        .results
        .as_ref()
        .map_or_else(|| PLACEHOLDER.to_string(), pretty);
    push_line(&mut content, &format!("<h2>Results</h2>\n<pre>{}</pre>", escape(&results)));
    Page::new(&title, Some(user)).render(&content)
}

pub fn not_found_page() -> String {
    Page::new("Page not found", None).render("<p>The page you requested does not exist.</p>\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_neutralises_markup() {
        assert_eq!(
            escape("<script>alert('x') & \"y\"</script>"),
            "&lt;script&gt;alert(&#x27;x&#x27;) &amp; &quot;y&quot;&lt;/script&gt;"
        );
    }

    #[test]
    fn missing_values_render_as_placeholder() {
        assert_eq!(fmt_price(None), "—");
        assert_eq!(fmt_price(Some(12.345)), "$12.35");
        assert_eq!(fmt_pct(Some(1.5)), "+1.50%");
        assert_eq!(fmt_num(None, 2), "—");
    }

    #[test]
    fn flash_codes_round_trip() {
        for flash in [Flash::Registered, Flash::ResetTokenInvalid, Flash::LoggedOut] {
            assert_eq!(Flash::from_code(flash.code()), Some(flash));
        }
        assert_eq!(Flash::from_code("bogus"), None);
    }

    #[test]
    fn redirect_carries_location_and_cookies() {
        let response = redirect("/dashboard", &["a=1".to_string(), "b=2".to_string()]);
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[LOCATION], "/dashboard");
        assert_eq!(response.headers().get_all(SET_COOKIE).iter().count(), 2);
    }

    #[test]
    fn unavailable_quote_renders_placeholders() {
        let html = quote_row(&Quote::unavailable("AAPL"));
        assert!(html.contains("AAPL"));
        assert_eq!(html.matches(PLACEHOLDER).count(), 4);
    }

    #[test]
    fn backtest_form_keeps_input_and_shows_token_errors() {
        let form = BacktestForm {
            name: "<b>mine</b>".to_string(),
            strategy_type: "rsi".to_string(),
            ..BacktestForm::default()
        };
        let mut errors = FormErrors::default();
        errors.add("csrf_token", "The form has expired. Please submit it again.");
        let html = backtest_form("tok", &form, &errors);
        assert!(html.contains("<form method=\"post\" action=\"/backtesting\">"));
        assert!(html.contains("name=\"csrf_token\" value=\"tok\""));
        assert!(html.contains("The form has expired"));
        assert!(html.contains("value=\"&lt;b&gt;mine&lt;/b&gt;\""));
        assert!(html.contains("<option value=\"rsi\" selected>"));
        assert!(html.contains("<option value=\"ma_cross\">"));
    }

    #[test]
    fn layout_reflects_login_state() {
        let anonymous = Page::new("Home", None).render("");
        assert!(anonymous.contains("/auth/login"));
        assert!(!anonymous.contains("/auth/logout"));
    }
}
