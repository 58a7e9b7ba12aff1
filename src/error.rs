// src/error.rs
use crate::auth::encode_query_value;
use crate::market_data::MarketDataError;
use crate::views::{html_with_status, not_found_page};
use log::{error, warn};
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;
use warp::{Rejection, Reply};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("login required to access {next}")]
    Unauthenticated { next: String },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("CSRF token missing or invalid")]
    Csrf,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    MarketData(#[from] MarketDataError),

    #[error("password hashing failed: {0}")]
    PasswordHash(String),

    #[error("{0}")]
    Internal(String),
}

impl Reject for AppError {}

fn json_error(message: &str, status: StatusCode) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status)
        .into_response()
}

fn not_found() -> warp::reply::Response {
    html_with_status(not_found_page(), StatusCode::NOT_FOUND, &[])
}

fn plain(message: &'static str, status: StatusCode) -> warp::reply::Response {
    warp::reply::with_status(message, status).into_response()
}

/// Single recovery point for every route: maps rejections onto the
/// redirect, plain-text and JSON responses the browser expects.
pub async fn handle_rejection(err: Rejection) -> Result<warp::reply::Response, Infallible> {
    if err.is_not_found() {
        return Ok(not_found());
    }

    if let Some(app_err) = err.find::<AppError>() {
        let response = match app_err {
            AppError::Unauthenticated { next } => {
                let location = format!("/auth/login?next={}", encode_query_value(next));
                warp::reply::with_status(
                    warp::reply::with_header(warp::reply(), "location", location),
                    StatusCode::SEE_OTHER,
                )
                .into_response()
            }
            AppError::NotFound(_) => not_found(),
            AppError::BadRequest(message) => json_error(message, StatusCode::BAD_REQUEST),
            AppError::Conflict(message) => json_error(message, StatusCode::CONFLICT),
            AppError::Csrf => {
                warn!("Rejected request with bad CSRF token");
                json_error(&app_err.to_string(), StatusCode::BAD_REQUEST)
            }
            AppError::MarketData(MarketDataError::InvalidSymbol(_)) => {
                json_error(&app_err.to_string(), StatusCode::BAD_REQUEST)
            }
            AppError::MarketData(MarketDataError::Empty(_)) => {
                json_error(&app_err.to_string(), StatusCode::NOT_FOUND)
            }
            AppError::MarketData(e) => {
                error!("Market data request failed: {}", e);
                json_error(&e.to_string(), StatusCode::BAD_GATEWAY)
            }
            AppError::Database(_) | AppError::PasswordHash(_) | AppError::Internal(_) => {
                error!("Request failed: {}", app_err);
                plain("Server error", StatusCode::INTERNAL_SERVER_ERROR)
            }
        };
        return Ok(response);
    }

    if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        return Ok(json_error(&e.to_string(), StatusCode::BAD_REQUEST));
    }
    if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        return Ok(plain("Method not allowed", StatusCode::METHOD_NOT_ALLOWED));
    }
    if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        return Ok(json_error(&e.to_string(), StatusCode::BAD_REQUEST));
    }
    if let Some(e) = err.find::<warp::reject::MissingCookie>() {
        return Ok(json_error(&e.to_string(), StatusCode::BAD_REQUEST));
    }

    error!("Unhandled rejection: {:?}", err);
    Ok(plain("Server error", StatusCode::INTERNAL_SERVER_ERROR))
}
