// src/db.rs
use crate::error::AppError;
use crate::models::{
    Backtest, Candle, NewBacktest, NewUser, User, Watchlist, WatchlistItem,
};
use chrono::{DateTime, Utc};
use log::{error, info};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        created_at TEXT NOT NULL,
        last_login TEXT,
        is_active BOOLEAN NOT NULL DEFAULT 1,
        first_name TEXT,
        last_name TEXT,
        subscription_level TEXT NOT NULL DEFAULT 'free',
        subscription_expires TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS watchlists (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_watchlists_user ON watchlists (user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS watchlist_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        watchlist_id INTEGER NOT NULL REFERENCES watchlists(id) ON DELETE CASCADE,
        ticker TEXT NOT NULL,
        added_at TEXT NOT NULL,
        notes TEXT,
        UNIQUE (watchlist_id, ticker)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS backtests (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL,
        ticker TEXT NOT NULL,
        start_date TEXT NOT NULL,
        end_date TEXT NOT NULL,
        strategy_type TEXT NOT NULL,
        parameters TEXT NOT NULL,
        results TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_backtests_user ON backtests (user_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS historical_data (
        symbol TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        open REAL NOT NULL,
        high REAL NOT NULL,
        low REAL NOT NULL,
        close REAL NOT NULL,
        volume REAL NOT NULL,
        PRIMARY KEY (symbol, timestamp)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS symbol_fetches (
        symbol TEXT PRIMARY KEY,
        fetched_at TEXT NOT NULL,
        full BOOLEAN NOT NULL
    )
    "#,
];

const DROP_ORDER: &[&str] = &[
    "symbol_fetches",
    "historical_data",
    "backtests",
    "watchlist_items",
    "watchlists",
    "users",
];

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to `:memory:` opens a fresh database, so the
        // in-memory pool is pinned to one connection that never expires.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;
        let db = Database { pool };
        db.init().await?;

        info!("Connected to database: {}", url);
        Ok(db)
    }

    async fn init(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Drops every table and recreates the schema.
    pub async fn reset(&self) -> Result<(), sqlx::Error> {
        for table in DROP_ORDER {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                .execute(&self.pool)
                .await?;
        }
        self.init().await
    }
}

// ---- users ----

pub async fn create_user(pool: &SqlitePool, user: NewUser<'_>) -> Result<User, sqlx::Error> {
    sqlx::query_as::<_, User>(
        "INSERT INTO users (username, email, password_hash, created_at, is_active, subscription_level)
         VALUES (?, ?, ?, ?, 1, ?)
         RETURNING *",
    )
    .bind(user.username)
    .bind(user.email)
    .bind(user.password_hash)
    .bind(Utc::now())
    .bind(user.subscription_level.as_str())
    .fetch_one(pool)
    .await
}

pub async fn find_user_by_id(pool: &SqlitePool, id: i64) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn find_user_by_username(
    pool: &SqlitePool,
    username: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await
}

pub async fn find_user_by_email(pool: &SqlitePool, email: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ? COLLATE NOCASE")
        .bind(email)
        .fetch_optional(pool)
        .await
}

pub async fn username_taken(pool: &SqlitePool, username: &str) -> Result<bool, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE username = ?")
        .bind(username)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

pub async fn email_taken(pool: &SqlitePool, email: &str) -> Result<bool, sqlx::Error> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM users WHERE email = ? COLLATE NOCASE")
            .bind(email)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

pub async fn touch_last_login(
    pool: &SqlitePool,
    user_id: i64,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
        .bind(at)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_password(
    pool: &SqlitePool,
    user_id: i64,
    password_hash: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
        .bind(password_hash)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Empty names are stored as NULL.
pub async fn update_profile(
    pool: &SqlitePool,
    user_id: i64,
    first_name: &str,
    last_name: &str,
) -> Result<(), sqlx::Error> {
    let blank_to_null = |s: &str| Some(s.trim().to_string()).filter(|s| !s.is_empty());
    sqlx::query("UPDATE users SET first_name = ?, last_name = ? WHERE id = ?")
        .bind(blank_to_null(first_name))
        .bind(blank_to_null(last_name))
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

// ---- watchlists ----

pub async fn create_watchlist(
    pool: &SqlitePool,
    user_id: i64,
    name: &str,
) -> Result<Watchlist, sqlx::Error> {
    sqlx::query_as::<_, Watchlist>(
        "INSERT INTO watchlists (name, user_id, created_at) VALUES (?, ?, ?) RETURNING *",
    )
    .bind(name)
    .bind(user_id)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
}

pub async fn list_watchlists(pool: &SqlitePool, user_id: i64) -> Result<Vec<Watchlist>, sqlx::Error> {
    sqlx::query_as::<_, Watchlist>("SELECT * FROM watchlists WHERE user_id = ? ORDER BY id")
        .bind(user_id)
        .fetch_all(pool)
        .await
}

pub async fn get_watchlist(
    pool: &SqlitePool,
    watchlist_id: i64,
    user_id: i64,
) -> Result<Option<Watchlist>, sqlx::Error> {
    sqlx::query_as::<_, Watchlist>("SELECT * FROM watchlists WHERE id = ? AND user_id = ?")
        .bind(watchlist_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
}

/// Returns `false` when the watchlist does not exist or belongs to someone else.
pub async fn delete_watchlist(
    pool: &SqlitePool,
    watchlist_id: i64,
    user_id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM watchlists WHERE id = ? AND user_id = ?")
        .bind(watchlist_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn add_watchlist_item(
    pool: &SqlitePool,
    watchlist_id: i64,
    ticker: &str,
    notes: Option<&str>,
) -> Result<WatchlistItem, AppError> {
    sqlx::query_as::<_, WatchlistItem>(
        "INSERT INTO watchlist_items (watchlist_id, ticker, added_at, notes)
         VALUES (?, ?, ?, ?)
         RETURNING *",
    )
    .bind(watchlist_id)
    .bind(ticker)
    .bind(Utc::now())
    .bind(notes)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            AppError::Conflict("Ticker already in watchlist".to_string())
        } else {
            AppError::Database(e)
        }
    })
}

pub async fn list_watchlist_items(
    pool: &SqlitePool,
    watchlist_id: i64,
) -> Result<Vec<WatchlistItem>, sqlx::Error> {
    sqlx::query_as::<_, WatchlistItem>(
        "SELECT * FROM watchlist_items WHERE watchlist_id = ? ORDER BY id",
    )
    .bind(watchlist_id)
    .fetch_all(pool)
    .await
}

pub async fn remove_watchlist_item(
    pool: &SqlitePool,
    watchlist_id: i64,
    item_id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM watchlist_items WHERE id = ? AND watchlist_id = ?")
        .bind(item_id)
        .bind(watchlist_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ---- backtests ----

#[derive(sqlx::FromRow)]
struct BacktestRow {
    id: i64,
    name: String,
    user_id: i64,
    created_at: DateTime<Utc>,
    ticker: String,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    strategy_type: String,
    parameters: String,
    results: Option<String>,
}

impl BacktestRow {
    fn into_backtest(self) -> Backtest {
        let parameters = serde_json::from_str(&self.parameters).unwrap_or_else(|e| {
            error!("Backtest {} has unreadable parameters: {}", self.id, e);
            serde_json::Value::Null
        });
        let results = self
            .results
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());
        Backtest {
            id: self.id,
            name: self.name,
            user_id: self.user_id,
            created_at: self.created_at,
            ticker: self.ticker,
            start_date: self.start_date,
            end_date: self.end_date,
            strategy_type: self.strategy_type,
            parameters,
            results,
        }
    }
}

pub async fn save_backtest(
    pool: &SqlitePool,
    user_id: i64,
    backtest: &NewBacktest,
) -> Result<Backtest, sqlx::Error> {
    let results = backtest.results.as_ref().map(|r| r.to_string());
    let row = sqlx::query_as::<_, BacktestRow>(
        "INSERT INTO backtests
            (name, user_id, created_at, ticker, start_date, end_date, strategy_type, parameters, results)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING *",
    )
    .bind(&backtest.name)
    .bind(user_id)
    .bind(Utc::now())
    .bind(backtest.ticker.to_uppercase())
    .bind(backtest.start_date)
    .bind(backtest.end_date)
    .bind(&backtest.strategy_type)
    .bind(backtest.parameters.to_string())
    .bind(results)
    .fetch_one(pool)
    .await?;
    Ok(row.into_backtest())
}

pub async fn list_backtests(
    pool: &SqlitePool,
    user_id: i64,
    limit: Option<i64>,
) -> Result<Vec<Backtest>, sqlx::Error> {
    let rows = sqlx::query_as::<_, BacktestRow>(
        "SELECT * FROM backtests WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
    )
    .bind(user_id)
    .bind(limit.unwrap_or(-1))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(BacktestRow::into_backtest).collect())
}

pub async fn get_backtest(
    pool: &SqlitePool,
    backtest_id: i64,
    user_id: i64,
) -> Result<Option<Backtest>, sqlx::Error> {
    let row = sqlx::query_as::<_, BacktestRow>(
        "SELECT * FROM backtests WHERE id = ? AND user_id = ?",
    )
    .bind(backtest_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(BacktestRow::into_backtest))
}

pub async fn delete_backtest(
    pool: &SqlitePool,
    backtest_id: i64,
    user_id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM backtests WHERE id = ? AND user_id = ?")
        .bind(backtest_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ---- market data cache ----

pub async fn check_data_exists(
    pool: &SqlitePool,
    symbol: &str,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM historical_data WHERE symbol = ? AND timestamp >= ? AND timestamp <= ?",
    )
    .bind(symbol)
    .bind(start_time.timestamp_millis())
    .bind(end_time.timestamp_millis())
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

pub async fn insert_historical_data(
    pool: &SqlitePool,
    symbol: &str,
    data: &[Candle],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for candle in data {
        sqlx::query(
            "INSERT OR REPLACE INTO historical_data
                (symbol, timestamp, open, high, low, close, volume)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(symbol)
        .bind(candle.timestamp.timestamp_millis())
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    info!("Stored {} candles for {}", data.len(), symbol);
    Ok(())
}

/// Candles for `symbol` in `[start_time, end_time]`, oldest first.
pub async fn query_historical_data(
    pool: &SqlitePool,
    symbol: &str,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
) -> Result<Vec<Candle>, sqlx::Error> {
    let rows: Vec<(i64, f64, f64, f64, f64, f64)> = sqlx::query_as(
        "SELECT timestamp, open, high, low, close, volume FROM historical_data
         WHERE symbol = ? AND timestamp >= ? AND timestamp <= ?
         ORDER BY timestamp ASC",
    )
    .bind(symbol)
    .bind(start_time.timestamp_millis())
    .bind(end_time.timestamp_millis())
    .fetch_all(pool)
    .await?;

    let data: Vec<Candle> = rows
        .into_iter()
        .filter_map(|(ts, open, high, low, close, volume)| {
            match DateTime::<Utc>::from_timestamp_millis(ts) {
                Some(timestamp) => Some(Candle {
                    timestamp,
                    open,
                    high,
                    low,
                    close,
                    volume,
                }),
                None => {
                    error!("Bad timestamp {} in cached data for {}", ts, symbol);
                    None
                }
            }
        })
        .collect();
    info!("Fetched {} records for symbol: {}", data.len(), symbol);
    Ok(data)
}

pub async fn record_fetch(
    pool: &SqlitePool,
    symbol: &str,
    fetched_at: DateTime<Utc>,
    full: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO symbol_fetches (symbol, fetched_at, full) VALUES (?, ?, ?)
         ON CONFLICT(symbol) DO UPDATE SET fetched_at = excluded.fetched_at, full = excluded.full",
    )
    .bind(symbol)
    .bind(fetched_at)
    .bind(full)
    .execute(pool)
    .await?;
    Ok(())
}

/// When `symbol` was last fetched from the provider, and whether that fetch
/// covered the full history.
pub async fn last_fetch(
    pool: &SqlitePool,
    symbol: &str,
) -> Result<Option<(DateTime<Utc>, bool)>, sqlx::Error> {
    sqlx::query_as("SELECT fetched_at, full FROM symbol_fetches WHERE symbol = ?")
        .bind(symbol)
        .fetch_optional(pool)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubscriptionLevel;
    use chrono::Duration;

    async fn memory_db() -> Database {
        Database::connect("sqlite::memory:").await.unwrap()
    }

    async fn add_user(pool: &SqlitePool, name: &str) -> User {
        create_user(
            pool,
            NewUser {
                username: name,
                email: &format!("{}@example.com", name),
                password_hash: "x",
                subscription_level: SubscriptionLevel::Free,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_username_is_a_unique_violation() {
        let db = memory_db().await;
        add_user(&db.pool, "alice").await;
        let err = create_user(
            &db.pool,
            NewUser {
                username: "alice",
                email: "other@example.com",
                password_hash: "x",
                subscription_level: SubscriptionLevel::Free,
            },
        )
        .await
        .unwrap_err();
        assert!(is_unique_violation(&err));
        assert!(username_taken(&db.pool, "alice").await.unwrap());
        assert!(email_taken(&db.pool, "ALICE@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn watchlists_are_scoped_to_their_owner() {
        let db = memory_db().await;
        let alice = add_user(&db.pool, "alice").await;
        let bob = add_user(&db.pool, "bob").await;

        let list = create_watchlist(&db.pool, alice.id, "Tech").await.unwrap();
        assert_eq!(list_watchlists(&db.pool, alice.id).await.unwrap().len(), 1);
        assert!(list_watchlists(&db.pool, bob.id).await.unwrap().is_empty());
        assert!(get_watchlist(&db.pool, list.id, bob.id).await.unwrap().is_none());
        assert!(!delete_watchlist(&db.pool, list.id, bob.id).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_ticker_is_a_conflict_and_items_cascade() {
        let db = memory_db().await;
        let alice = add_user(&db.pool, "alice").await;
        let list = create_watchlist(&db.pool, alice.id, "Tech").await.unwrap();

        add_watchlist_item(&db.pool, list.id, "AAPL", None).await.unwrap();
        let err = add_watchlist_item(&db.pool, list.id, "AAPL", Some("again"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        assert!(delete_watchlist(&db.pool, list.id, alice.id).await.unwrap());
        assert!(list_watchlist_items(&db.pool, list.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backtests_round_trip_json_columns() {
        let db = memory_db().await;
        let alice = add_user(&db.pool, "alice").await;
        let now = Utc::now();
        let saved = save_backtest(
            &db.pool,
            alice.id,
            &NewBacktest {
                name: "MA test".into(),
                ticker: "msft".into(),
                start_date: now - Duration::days(365),
                end_date: now,
                strategy_type: "ma_cross".into(),
                parameters: serde_json::json!({"short_window": 20, "long_window": 50}),
                results: Some(serde_json::json!({"total_return": 12.5})),
            },
        )
        .await
        .unwrap();

        let loaded = get_backtest(&db.pool, saved.id, alice.id).await.unwrap().unwrap();
        assert_eq!(loaded.ticker, "MSFT");
        assert_eq!(loaded.parameters["long_window"], 50);
        assert_eq!(loaded.results.unwrap()["total_return"], 12.5);
        assert_eq!(list_backtests(&db.pool, alice.id, Some(5)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn historical_data_is_returned_oldest_first() {
        let db = memory_db().await;
        let now = Utc::now();
        let candles: Vec<Candle> = (0..3)
            .map(|i| Candle {
                timestamp: now - Duration::days(i),
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5 + i as f64,
                volume: 100.0,
            })
            .collect();
        insert_historical_data(&db.pool, "AAPL", &candles).await.unwrap();

        let start = now - Duration::days(10);
        assert!(check_data_exists(&db.pool, "AAPL", start, now).await.unwrap());
        assert!(!check_data_exists(&db.pool, "MSFT", start, now).await.unwrap());

        let loaded = query_historical_data(&db.pool, "AAPL", start, now).await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].close, 3.5);
        assert_eq!(loaded[2].close, 1.5);
    }

    #[tokio::test]
    async fn fetch_log_is_upserted() {
        let db = memory_db().await;
        let now = Utc::now();
        assert!(last_fetch(&db.pool, "AAPL").await.unwrap().is_none());
        record_fetch(&db.pool, "AAPL", now, false).await.unwrap();
        record_fetch(&db.pool, "AAPL", now, true).await.unwrap();
        let (_, full) = last_fetch(&db.pool, "AAPL").await.unwrap().unwrap();
        assert!(full);
    }
}
