// src/config.rs
use chrono::Duration;
use log::LevelFilter;
use std::env;
use std::net::SocketAddr;
use thiserror::Error;

const DEFAULT_SECRET_KEY: &str = "dev-secret-key-change-in-production";
const DEFAULT_CSRF_SECRET_KEY: &str = "csrf-secret-key-change-in-production";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be set in production")]
    Missing { name: &'static str },

    #[error("{name} is still the development default")]
    InsecureDefault { name: &'static str },

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Testing,
    Production,
}

impl Environment {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_lowercase().as_str() {
            "" | "dev" | "development" => Ok(Environment::Development),
            "test" | "testing" => Ok(Environment::Testing),
            "prod" | "production" => Ok(Environment::Production),
            other => Err(ConfigError::Invalid {
                name: "APP_ENV",
                value: other.to_string(),
            }),
        }
    }

    pub fn log_level(self) -> LevelFilter {
        match self {
            Environment::Development => LevelFilter::Debug,
            Environment::Testing | Environment::Production => LevelFilter::Info,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub server: String,
    pub port: u16,
    pub use_tls: bool,
    pub username: String,
    pub password: String,
    pub default_sender: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub secret_key: String,
    pub csrf_secret_key: String,
    pub csrf_enabled: bool,
    pub secure_cookies: bool,
    pub session_lifetime: Duration,
    pub public_url: String,
    pub alpha_vantage_api_key: String,
    pub market_data_ttl: Duration,
    pub prefetch_symbols: Vec<String>,
    pub risk_free_rate: f64,
    pub mail: MailConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable source; `from_env` passes
    /// the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let environment = Environment::parse(&vars.or("APP_ENV", ""))?;

        let database_url = match environment {
            Environment::Development => vars.or("DEV_DATABASE_URL", "sqlite://dev-app.db"),
            Environment::Testing => "sqlite::memory:".to_string(),
            Environment::Production => vars.get("DATABASE_URL").ok_or(ConfigError::Missing {
                name: "DATABASE_URL",
            })?,
        };

        let secret_key = vars.or("SECRET_KEY", DEFAULT_SECRET_KEY);
        let csrf_secret_key = vars.or("WTF_CSRF_SECRET_KEY", DEFAULT_CSRF_SECRET_KEY);
        if environment == Environment::Production {
            if secret_key == DEFAULT_SECRET_KEY {
                return Err(ConfigError::InsecureDefault { name: "SECRET_KEY" });
            }
            if csrf_secret_key == DEFAULT_CSRF_SECRET_KEY {
                return Err(ConfigError::InsecureDefault {
                    name: "WTF_CSRF_SECRET_KEY",
                });
            }
        }

        let mut bind_addr: SocketAddr = vars.parse("BIND_ADDR", "127.0.0.1:5000")?;
        if let Some(port) = vars.get("PORT") {
            let port = port.trim().parse::<u16>().map_err(|_| ConfigError::Invalid {
                name: "PORT",
                value: port.clone(),
            })?;
            bind_addr.set_port(port);
        }

        let prefetch_symbols = vars
            .or("PREFETCH_SYMBOLS", "AAPL,GOOGL,MSFT")
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            environment,
            bind_addr,
            database_url,
            secret_key,
            csrf_secret_key,
            csrf_enabled: environment != Environment::Testing,
            secure_cookies: environment == Environment::Production,
            session_lifetime: Duration::days(31),
            public_url: vars.or("PUBLIC_URL", "http://localhost:5000"),
            alpha_vantage_api_key: vars.or("ALPHA_VANTAGE_API_KEY", ""),
            market_data_ttl: Duration::seconds(vars.parse("MARKET_DATA_TTL_SECS", "3600")?),
            prefetch_symbols,
            risk_free_rate: vars.parse("RISK_FREE_RATE", "0.01")?,
            mail: MailConfig {
                // Empty keeps outgoing mail in the log.
                server: vars.or("MAIL_SERVER", "").trim().to_string(),
                port: vars.parse("MAIL_PORT", "587")?,
                use_tls: matches!(
                    vars.or("MAIL_USE_TLS", "true").to_lowercase().as_str(),
                    "true" | "on" | "1"
                ),
                username: vars.or("MAIL_USERNAME", ""),
                password: vars.or("MAIL_PASSWORD", ""),
                default_sender: vars.or("MAIL_DEFAULT_SENDER", "noreply@example.com"),
            },
        })
    }

    /// Configuration used by the test suite: in-memory database, CSRF off.
    pub fn testing() -> Self {
        Config {
            environment: Environment::Testing,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            database_url: "sqlite::memory:".to_string(),
            secret_key: "test-secret-key".to_string(),
            csrf_secret_key: "test-csrf-secret-key".to_string(),
            csrf_enabled: false,
            secure_cookies: false,
            session_lifetime: Duration::days(31),
            public_url: "http://localhost:5000".to_string(),
            alpha_vantage_api_key: String::new(),
            market_data_ttl: Duration::seconds(3600),
            prefetch_symbols: Vec::new(),
            risk_free_rate: 0.01,
            mail: MailConfig {
                server: String::new(),
                port: 25,
                use_tls: false,
                username: String::new(),
                password: String::new(),
                default_sender: "noreply@example.com".to_string(),
            },
        }
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name)
    }

    fn or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: std::str::FromStr>(&self, name: &'static str, default: &str) -> Result<T, ConfigError> {
        let raw = self.or(name, default);
        raw.trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { name, value: raw })
    }
}
