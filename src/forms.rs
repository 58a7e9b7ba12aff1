// src/forms.rs
//! Posted HTML forms and their validation rules.

use crate::backtest::{PositionSizing, StrategyConfig, DEFAULT_COMMISSION, DEFAULT_INITIAL_CAPITAL};
use crate::market_data::{normalize_symbol, HistoryRange};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;

pub const USERNAME_MIN: usize = 3;
pub const USERNAME_MAX: usize = 64;
pub const PASSWORD_MIN: usize = 8;

/// Error messages per field, in field-name order.
#[derive(Debug, Default, Clone)]
pub struct FormErrors(BTreeMap<&'static str, Vec<String>>);

impl FormErrors {
    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.entry(field).or_default().push(message.into());
    }

    pub fn field(&self, field: &str) -> &[String] {
        self.0.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self) -> Result<(), FormErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

fn required(errors: &mut FormErrors, field: &'static str, value: &str) -> bool {
    if value.trim().is_empty() {
        errors.add(field, "This field is required.");
        false
    } else {
        true
    }
}

/// Shape check only: one `@`, a non-empty local part and a dotted domain.
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain.contains('.')
        && domain.split('.').all(|part| !part.is_empty())
}

fn check_new_password(errors: &mut FormErrors, password: &str, password2: &str) {
    if required(errors, "password", password) && password.chars().count() < PASSWORD_MIN {
        errors.add("password", "Password must be at least 8 characters long.");
    }
    if required(errors, "password2", password2) && password != password2 {
        errors.add("password2", "Passwords must match.");
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Checkbox: present when ticked.
    pub remember_me: Option<String>,
    pub csrf_token: Option<String>,
}

impl LoginForm {
    pub fn remember(&self) -> bool {
        self.remember_me.is_some()
    }

    pub fn validate(&self) -> Result<(), FormErrors> {
        let mut errors = FormErrors::default();
        required(&mut errors, "username", &self.username);
        required(&mut errors, "password", &self.password);
        errors.into_result()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RegistrationForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub password2: String,
    pub csrf_token: Option<String>,
}

impl RegistrationForm {
    /// Field rules only; uniqueness is checked against the database by
    /// [`RegistrationForm::validate_unique`].
    pub fn validate(&self) -> Result<(), FormErrors> {
        let mut errors = FormErrors::default();
        let username = self.username.trim();
        if required(&mut errors, "username", username) {
            let len = username.chars().count();
            if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
                errors.add(
                    "username",
                    format!(
                        "Field must be between {} and {} characters long.",
                        USERNAME_MIN, USERNAME_MAX
                    ),
                );
            }
        }
        if required(&mut errors, "email", &self.email) && !is_valid_email(self.email.trim()) {
            errors.add("email", "Invalid email address.");
        }
        check_new_password(&mut errors, &self.password, &self.password2);
        errors.into_result()
    }

    pub fn validate_unique(&self, username_taken: bool, email_taken: bool) -> Result<(), FormErrors> {
        let mut errors = FormErrors::default();
        if username_taken {
            errors.add("username", "Please use a different username.");
        }
        if email_taken {
            errors.add("email", "Email address already registered.");
        }
        errors.into_result()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetPasswordRequestForm {
    #[serde(default)]
    pub email: String,
    pub csrf_token: Option<String>,
}

impl ResetPasswordRequestForm {
    pub fn validate(&self) -> Result<(), FormErrors> {
        let mut errors = FormErrors::default();
        if required(&mut errors, "email", &self.email) && !is_valid_email(self.email.trim()) {
            errors.add("email", "Invalid email address.");
        }
        errors.into_result()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetPasswordForm {
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub password2: String,
    pub csrf_token: Option<String>,
}

impl ResetPasswordForm {
    pub fn validate(&self) -> Result<(), FormErrors> {
        let mut errors = FormErrors::default();
        check_new_password(&mut errors, &self.password, &self.password2);
        errors.into_result()
    }
}

/// Profile update: names and optionally a new password.
#[derive(Debug, Default, Deserialize)]
pub struct ProfileForm {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub password2: String,
    pub csrf_token: Option<String>,
}

impl ProfileForm {
    pub fn validate(&self) -> Result<(), FormErrors> {
        let mut errors = FormErrors::default();
        if self.first_name.chars().count() > 64 {
            errors.add("first_name", "Field cannot be longer than 64 characters.");
        }
        if self.last_name.chars().count() > 64 {
            errors.add("last_name", "Field cannot be longer than 64 characters.");
        }
        if !self.password.is_empty() || !self.password2.is_empty() {
            check_new_password(&mut errors, &self.password, &self.password2);
        }
        errors.into_result()
    }
}

/// Backtest run posted from the backtesting page. Every field arrives as
/// text so a rejected form can be shown again exactly as typed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BacktestForm {
    pub name: String,
    pub ticker: String,
    pub period: String,
    pub strategy_type: String,
    pub short_window: String,
    pub long_window: String,
    pub rsi_period: String,
    pub oversold: String,
    pub overbought: String,
    pub initial_capital: String,
    pub commission: String,
    pub position_sizing: String,
    pub position_value: String,
    pub csrf_token: Option<String>,
}

impl Default for BacktestForm {
    fn default() -> Self {
        BacktestForm {
            name: String::new(),
            ticker: String::new(),
            period: "1y".to_string(),
            strategy_type: "ma_cross".to_string(),
            short_window: "20".to_string(),
            long_window: "50".to_string(),
            rsi_period: "14".to_string(),
            oversold: "30".to_string(),
            overbought: "70".to_string(),
            initial_capital: DEFAULT_INITIAL_CAPITAL.to_string(),
            commission: DEFAULT_COMMISSION.to_string(),
            position_sizing: "fixed_dollar".to_string(),
            position_value: String::new(),
            csrf_token: None,
        }
    }
}

/// A validated backtest request.
#[derive(Debug, Clone)]
pub struct BacktestRun {
    pub name: String,
    pub ticker: String,
    pub range: HistoryRange,
    pub strategy: StrategyConfig,
    pub initial_capital: f64,
    pub commission: f64,
    pub position_sizing: PositionSizing,
    pub position_value: f64,
}

fn number<T: FromStr>(errors: &mut FormErrors, field: &'static str, raw: &str) -> Option<T> {
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            errors.add(field, "Not a valid number.");
            None
        }
    }
}

fn finite(errors: &mut FormErrors, field: &'static str, raw: &str) -> Option<f64> {
    let value = number::<f64>(errors, field, raw)?;
    if value.is_finite() {
        Some(value)
    } else {
        errors.add(field, "Not a valid number.");
        None
    }
}

impl BacktestForm {
    pub fn parse(&self) -> Result<BacktestRun, FormErrors> {
        let mut errors = FormErrors::default();

        let name = self.name.trim();
        if required(&mut errors, "name", name) && name.chars().count() > 100 {
            errors.add("name", "Field cannot be longer than 100 characters.");
        }
        let ticker = match normalize_symbol(&self.ticker) {
            Ok(ticker) => Some(ticker),
            Err(_) => {
                errors.add("ticker", "Enter a valid ticker symbol.");
                None
            }
        };
        let range = match self.period.parse::<HistoryRange>() {
            Ok(range) => Some(range),
            Err(e) => {
                errors.add("period", e);
                None
            }
        };

        let strategy = match self.strategy_type.as_str() {
            "ma_cross" => match (
                number(&mut errors, "short_window", &self.short_window),
                number(&mut errors, "long_window", &self.long_window),
            ) {
                (Some(short_window), Some(long_window)) => Some(StrategyConfig::MaCross {
                    short_window,
                    long_window,
                }),
                _ => None,
            },
            "rsi" => match (
                number(&mut errors, "rsi_period", &self.rsi_period),
                finite(&mut errors, "oversold", &self.oversold),
                finite(&mut errors, "overbought", &self.overbought),
            ) {
                (Some(rsi_period), Some(oversold), Some(overbought)) => Some(StrategyConfig::Rsi {
                    rsi_period,
                    overbought,
                    oversold,
                }),
                _ => None,
            },
            "macd" => Some(StrategyConfig::Macd),
            "ma_rsi" => match (
                number(&mut errors, "short_window", &self.short_window),
                number(&mut errors, "long_window", &self.long_window),
                finite(&mut errors, "oversold", &self.oversold),
                finite(&mut errors, "overbought", &self.overbought),
            ) {
                (Some(short_window), Some(long_window), Some(rsi_buy), Some(rsi_sell)) => {
                    Some(StrategyConfig::MaRsi {
                        short_window,
                        long_window,
                        rsi_buy,
                        rsi_sell,
                    })
                }
                _ => None,
            },
            _ => {
                errors.add("strategy_type", "Not a valid choice.");
                None
            }
        };
        if let Some(Err(message)) = strategy.as_ref().map(StrategyConfig::build) {
            errors.add("strategy_type", message);
        }

        let initial_capital = finite(&mut errors, "initial_capital", &self.initial_capital);
        if matches!(initial_capital, Some(v) if v <= 0.0) {
            errors.add("initial_capital", "Initial capital must be positive.");
        }
        let commission = finite(&mut errors, "commission", &self.commission);
        if matches!(commission, Some(v) if !(0.0..1.0).contains(&v)) {
            errors.add("commission", "Commission must lie between 0 and 1.");
        }

        let position_sizing = match self.position_sizing.as_str() {
            "fixed_dollar" => Some(PositionSizing::FixedDollar),
            "percentage" => Some(PositionSizing::Percentage),
            "fixed_risk" => Some(PositionSizing::FixedRisk),
            "fixed_shares" => Some(PositionSizing::FixedShares),
            _ => {
                errors.add("position_sizing", "Not a valid choice.");
                None
            }
        };
        let position_value = match (position_sizing, self.position_value.trim()) {
            (Some(sizing), "") => Some(sizing.default_value()),
            (_, raw) => finite(&mut errors, "position_value", raw),
        };
        if matches!(position_value, Some(v) if v <= 0.0) {
            errors.add("position_value", "Position value must be positive.");
        }

        match (
            ticker,
            range,
            strategy,
            initial_capital,
            commission,
            position_sizing,
            position_value,
        ) {
            (
                Some(ticker),
                Some(range),
                Some(strategy),
                Some(initial_capital),
                Some(commission),
                Some(position_sizing),
                Some(position_value),
            ) if errors.is_empty() => Ok(BacktestRun {
                name: name.to_string(),
                ticker,
                range,
                strategy,
                initial_capital,
                commission,
                position_sizing,
                position_value,
            }),
            _ => Err(errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(username: &str, email: &str, password: &str, password2: &str) -> RegistrationForm {
        RegistrationForm {
            username: username.into(),
            email: email.into(),
            password: password.into(),
            password2: password2.into(),
            csrf_token: None,
        }
    }

    #[test]
    fn login_requires_both_fields() {
        let errors = LoginForm::default().validate().unwrap_err();
        assert_eq!(errors.field("username"), ["This field is required."]);
        assert_eq!(errors.field("password"), ["This field is required."]);
    }

    #[test]
    fn registration_rules() {
        assert!(registration("alice", "alice@example.com", "password1", "password1")
            .validate()
            .is_ok());

        let errors = registration("al", "alice@", "short", "other").validate().unwrap_err();
        assert_eq!(errors.field("username").len(), 1);
        assert_eq!(errors.field("email"), ["Invalid email address."]);
        assert_eq!(errors.field("password"), ["Password must be at least 8 characters long."]);
        assert_eq!(errors.field("password2"), ["Passwords must match."]);
    }

    #[test]
    fn uniqueness_errors_use_form_messages() {
        let form = registration("alice", "alice@example.com", "password1", "password1");
        let errors = form.validate_unique(true, true).unwrap_err();
        assert_eq!(errors.field("username"), ["Please use a different username."]);
        assert_eq!(errors.field("email"), ["Email address already registered."]);
        assert!(form.validate_unique(false, false).is_ok());
    }

    #[test]
    fn email_shapes() {
        assert!(is_valid_email("a.b@mail.example.org"));
        assert!(!is_valid_email("no-at-sign"));
        assert!(!is_valid_email("a@b@c.com"));
        assert!(!is_valid_email("a@localhost"));
        assert!(!is_valid_email("a @example.com"));
        assert!(!is_valid_email("a@example..com"));
    }

    #[test]
    fn profile_password_is_optional() {
        let form = ProfileForm {
            first_name: "Ada".into(),
            ..Default::default()
        };
        assert!(form.validate().is_ok());

        let form = ProfileForm {
            password: "longenough".into(),
            password2: "different1".into(),
            ..Default::default()
        };
        assert_eq!(form.validate().unwrap_err().field("password2"), ["Passwords must match."]);
    }

    #[test]
    fn backtest_form_defaults_produce_a_run() {
        let form = BacktestForm {
            name: "Golden cross".into(),
            ticker: "msft".into(),
            ..Default::default()
        };
        let run = form.parse().unwrap();
        assert_eq!(run.ticker, "MSFT");
        assert_eq!(run.range, HistoryRange::OneYear);
        assert_eq!(run.strategy.type_name(), "ma_cross");
        assert_eq!(run.initial_capital, DEFAULT_INITIAL_CAPITAL);
        assert_eq!(run.position_sizing, PositionSizing::FixedDollar);
        assert_eq!(run.position_value, 10_000.0);
    }

    #[test]
    fn backtest_form_reports_each_bad_field() {
        let form = BacktestForm {
            ticker: "not a ticker".into(),
            period: "3w".into(),
            short_window: "50".into(),
            long_window: "20".into(),
            commission: "1.5".into(),
            position_sizing: "all_in".into(),
            ..Default::default()
        };
        let errors = form.parse().unwrap_err();
        assert_eq!(errors.field("name"), ["This field is required."]);
        assert_eq!(errors.field("ticker"), ["Enter a valid ticker symbol."]);
        assert_eq!(errors.field("period"), ["unsupported period: 3w"]);
        assert_eq!(
            errors.field("strategy_type"),
            ["Short window must be smaller than long window"]
        );
        assert_eq!(errors.field("commission"), ["Commission must lie between 0 and 1."]);
        assert_eq!(errors.field("position_sizing"), ["Not a valid choice."]);
    }

    #[test]
    fn backtest_form_rejects_non_numeric_thresholds() {
        let form = BacktestForm {
            name: "RSI".into(),
            ticker: "AAPL".into(),
            strategy_type: "rsi".into(),
            oversold: "low".into(),
            overbought: "NaN".into(),
            ..Default::default()
        };
        let errors = form.parse().unwrap_err();
        assert_eq!(errors.field("oversold"), ["Not a valid number."]);
        assert_eq!(errors.field("overbought"), ["Not a valid number."]);
    }

    #[tokio::test]
    async fn checkbox_presence_means_remember() {
        let form: LoginForm = warp::test::request()
            .method("POST")
            .body("username=a&password=b&remember_me=y")
            .filter(&warp::body::form())
            .await
            .unwrap();
        assert!(form.remember());

        let form: LoginForm = warp::test::request()
            .method("POST")
            .body("username=a&password=b")
            .filter(&warp::body::form())
            .await
            .unwrap();
        assert!(!form.remember());
    }
}
