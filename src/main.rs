// src/main.rs
mod api;
mod auth;
mod backtest;
mod config;
mod csrf;
mod db;
mod error;
mod forms;
mod indicators;
mod mailer;
mod market_data;
mod models;
mod options;
mod pages;
mod risk;
mod views;

use crate::api::AppState;
use crate::auth::hash_password;
use crate::config::{Config, Environment};
use crate::db::{create_user, Database};
use crate::market_data::{AlphaVantageProvider, HistoryRange, MarketData};
use crate::models::{NewUser, SubscriptionLevel};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Builder;
use log::{error, info, warn, LevelFilter};
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task;
use warp::Filter;

#[derive(Parser)]
#[command(author, version, about = "ToFu's Trading Platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the web server (default)
    Serve,
    /// Drop and recreate every table, then seed the admin and test users
    InitDb,
    /// Create a user with the admin subscription level
    CreateAdmin {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
}

async fn worker(market: MarketData, mut rx: mpsc::Receiver<String>) {
    while let Some(symbol) = rx.recv().await {
        match market.history(&symbol, HistoryRange::OneYear).await {
            Ok(candles) => info!("Prefetched {} bars for {}", candles.len(), symbol),
            Err(e) => error!("Error fetching data for {}: {}", symbol, e),
        }
    }
}

async fn serve(config: Config, db: Database) -> Result<()> {
    if config.alpha_vantage_api_key.is_empty() {
        warn!("ALPHA_VANTAGE_API_KEY is not set; market data requests will fail");
    }
    let provider = Arc::new(AlphaVantageProvider::new(
        Client::new(),
        config.alpha_vantage_api_key.clone(),
    ));
    if config.environment == Environment::Production && config.mail.server.is_empty() {
        warn!("MAIL_SERVER is not set; password reset mail will only be logged");
    }
    let mailer = mailer::from_config(&config.mail).context("failed to set up mail delivery")?;
    let bind_addr = config.bind_addr;
    let symbols = config.prefetch_symbols.clone();
    let state = Arc::new(AppState::new(config, db, provider, mailer)?);

    let (tx, rx) = mpsc::channel(100);
    task::spawn(worker(state.market.clone(), rx));
    for symbol in symbols {
        if tx.send(symbol).await.is_err() {
            break;
        }
    }

    let routes = api::routes(state).with(warp::log("tofu_trading"));
    info!("Server running on http://{}", bind_addr);
    warp::serve(routes).run(bind_addr).await;
    Ok(())
}

async fn add_user(
    db: &Database,
    username: &str,
    email: &str,
    password: &str,
    level: SubscriptionLevel,
) -> Result<()> {
    let password_hash = hash_password(password)?;
    let user = create_user(
        &db.pool,
        NewUser {
            username,
            email,
            password_hash: &password_hash,
            subscription_level: level,
        },
    )
    .await
    .with_context(|| format!("failed to create user {}", username))?;
    info!("Created {} user {}", level, user.username);
    Ok(())
}

async fn init_db(db: &Database) -> Result<()> {
    db.reset().await.context("failed to reset schema")?;
    add_user(db, "admin", "admin@example.com", "admin", SubscriptionLevel::Admin).await?;
    add_user(db, "test", "test@example.com", "test", SubscriptionLevel::Free).await?;
    info!("Database initialized");
    Ok(())
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let db = Database::connect(&config.database_url)
        .await
        .context("failed to initialize database")?;
    info!("Connected to database...");

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config, db).await,
        Commands::InitDb => init_db(&db).await,
        Commands::CreateAdmin {
            username,
            email,
            password,
        } => add_user(&db, &username, &email, &password, SubscriptionLevel::Admin).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_env();
    let level = config
        .as_ref()
        .map(|c| c.environment.log_level())
        .unwrap_or(LevelFilter::Info);
    Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    let result = match config {
        Ok(config) => run(cli, config).await,
        Err(e) => Err(anyhow::Error::new(e).context("failed to load configuration")),
    };
    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
