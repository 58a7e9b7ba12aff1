// src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionLevel {
    Free,
    Premium,
    Admin,
}

impl SubscriptionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionLevel::Free => "free",
            SubscriptionLevel::Premium => "premium",
            SubscriptionLevel::Admin => "admin",
        }
    }
}

impl FromStr for SubscriptionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(SubscriptionLevel::Free),
            "premium" => Ok(SubscriptionLevel::Premium),
            "admin" => Ok(SubscriptionLevel::Admin),
            other => Err(format!("unknown subscription level: {}", other)),
        }
    }
}

impl fmt::Display for SubscriptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub subscription_level: String,
    pub subscription_expires: Option<DateTime<Utc>>,
}

impl User {
    /// Unknown levels stored in the database are treated as `free`.
    pub fn subscription(&self) -> SubscriptionLevel {
        self.subscription_level
            .parse()
            .unwrap_or(SubscriptionLevel::Free)
    }

    pub fn is_premium(&self, now: DateTime<Utc>) -> bool {
        if self.subscription() == SubscriptionLevel::Free {
            return false;
        }
        match self.subscription_expires {
            Some(expires) if expires < now => false,
            _ => true,
        }
    }
}

pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub subscription_level: SubscriptionLevel,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Watchlist {
    pub id: i64,
    pub name: String,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WatchlistItem {
    pub id: i64,
    pub watchlist_id: i64,
    pub ticker: String,
    pub added_at: DateTime<Utc>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Backtest {
    pub id: i64,
    pub name: String,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub ticker: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub strategy_type: String,
    pub parameters: serde_json::Value,
    pub results: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct NewBacktest {
    pub name: String,
    pub ticker: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub strategy_type: String,
    pub parameters: serde_json::Value,
    pub results: Option<serde_json::Value>,
}

/// One daily OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Latest price snapshot shown on the dashboard. Every field is optional so
/// that a failed upstream fetch still renders.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Quote {
    pub symbol: String,
    pub price: Option<f64>,
    pub previous_close: Option<f64>,
    pub change: Option<f64>,
    pub change_pct: Option<f64>,
    pub volume: Option<f64>,
    pub rsi: Option<f64>,
    pub signal: Option<String>,
    pub as_of: Option<DateTime<Utc>>,
}

impl Quote {
    pub fn unavailable(symbol: &str) -> Self {
        Quote {
            symbol: symbol.to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user(level: &str, expires: Option<DateTime<Utc>>) -> User {
        User {
            id: 1,
            username: "alice".into(),
            email: "alice@example.com".into(),
            password_hash: String::new(),
            created_at: Utc::now(),
            last_login: None,
            is_active: true,
            first_name: None,
            last_name: None,
            subscription_level: level.into(),
            subscription_expires: expires,
        }
    }

    #[test]
    fn free_users_are_never_premium() {
        assert!(!user("free", None).is_premium(Utc::now()));
    }

    #[test]
    fn expired_subscription_is_not_premium() {
        let now = Utc::now();
        assert!(!user("premium", Some(now - Duration::days(1))).is_premium(now));
        assert!(user("premium", Some(now + Duration::days(1))).is_premium(now));
        assert!(user("admin", None).is_premium(now));
    }

    #[test]
    fn unknown_level_falls_back_to_free() {
        assert_eq!(user("gold", None).subscription(), SubscriptionLevel::Free);
    }
}
