// src/auth.rs
use crate::api::{with_state, AppState};
use crate::config::Config;
use crate::db::find_user_by_id;
use crate::error::AppError;
use crate::models::User;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, warn};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::convert::Infallible;
use std::sync::Arc;
use warp::filters::path::FullPath;
use warp::{Filter, Rejection};

pub const SESSION_COOKIE: &str = "session";
const RESET_TOKEN_LIFETIME_MINUTES: i64 = 10;

const PURPOSE_SESSION: &str = "session";
const PURPOSE_RESET: &str = "reset";

pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::PasswordHash(e.to_string()))
}

/// A malformed stored hash counts as a mismatch.
pub fn verify_password(password_hash: &str, candidate: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(candidate.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!("Stored password hash could not be parsed: {}", e);
            false
        }
    }
}

/// Short digest of the stored hash; changes whenever the password does.
fn password_fingerprint(password_hash: &str) -> String {
    let digest = Sha256::digest(password_hash.as_bytes());
    hex::encode(&digest[..8])
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: usize,
    exp: usize,
    purpose: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fingerprint: Option<String>,
}

/// Signs and checks session and password-reset tokens.
pub struct Auth {
    secret: Vec<u8>,
    session_lifetime: Duration,
    secure_cookies: bool,
}

impl Auth {
    pub fn new(config: &Config) -> Self {
        Auth {
            secret: config.secret_key.as_bytes().to_vec(),
            session_lifetime: config.session_lifetime,
            secure_cookies: config.secure_cookies,
        }
    }

    fn sign(&self, claims: &Claims) -> Result<String, AppError> {
        encode(&Header::default(), claims, &EncodingKey::from_secret(&self.secret))
            .map_err(|e| AppError::Internal(format!("failed to sign token: {}", e)))
    }

    fn claims(&self, token: &str, purpose: &str) -> Option<Claims> {
        match decode::<Claims>(token, &DecodingKey::from_secret(&self.secret), &Validation::default()) {
            Ok(data) if data.claims.purpose == purpose => Some(data.claims),
            Ok(_) => None,
            Err(e) => {
                debug!("Rejected {} token: {}", purpose, e);
                None
            }
        }
    }

    pub fn create_session_token(&self, user_id: i64) -> Result<String, AppError> {
        let now = Utc::now();
        self.sign(&Claims {
            sub: user_id.to_string(),
            iat: now.timestamp() as usize,
            exp: (now + self.session_lifetime).timestamp() as usize,
            purpose: PURPOSE_SESSION.to_string(),
            fingerprint: None,
        })
    }

    pub fn session_user_id(&self, token: &str) -> Option<i64> {
        self.claims(token, PURPOSE_SESSION)?.sub.parse().ok()
    }

    pub fn create_reset_token(&self, user: &User) -> Result<String, AppError> {
        let now = Utc::now();
        self.sign(&Claims {
            sub: user.id.to_string(),
            iat: now.timestamp() as usize,
            exp: (now + Duration::minutes(RESET_TOKEN_LIFETIME_MINUTES)).timestamp() as usize,
            purpose: PURPOSE_RESET.to_string(),
            fingerprint: Some(password_fingerprint(&user.password_hash)),
        })
    }

    /// User id named by a reset token, if it is unexpired and was issued for
    /// the user's current password.
    pub fn reset_token_user_id(&self, token: &str) -> Option<i64> {
        self.claims(token, PURPOSE_RESET)?.sub.parse().ok()
    }

    pub fn reset_token_matches(&self, token: &str, user: &User) -> bool {
        match self.claims(token, PURPOSE_RESET) {
            Some(claims) => {
                claims.sub == user.id.to_string()
                    && claims.fingerprint.as_deref()
                        == Some(password_fingerprint(&user.password_hash).as_str())
            }
            None => false,
        }
    }

    /// Session cookie; persistent only when the user asked to be remembered.
    pub fn login_cookie(&self, token: &str, remember: bool) -> String {
        let max_age = remember.then(|| self.session_lifetime.num_seconds());
        build_cookie(SESSION_COOKIE, token, max_age, self.secure_cookies)
    }

    pub fn logout_cookie(&self) -> String {
        build_cookie(SESSION_COOKIE, "", Some(0), self.secure_cookies)
    }

    pub fn secure_cookies(&self) -> bool {
        self.secure_cookies
    }
}

pub fn build_cookie(name: &str, value: &str, max_age: Option<i64>, secure: bool) -> String {
    let mut cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", name, value);
    if let Some(seconds) = max_age {
        cookie.push_str(&format!("; Max-Age={}", seconds));
    }
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Local redirect target from a `next` parameter; anything that could leave
/// the site falls back to the dashboard.
pub fn safe_next(next: Option<&str>) -> String {
    match next {
        Some(path) if path.starts_with('/') && !path.starts_with("//") && !path.contains('\\') => {
            path.to_string()
        }
        _ => "/dashboard".to_string(),
    }
}

/// Percent-encodes the characters that would break a query parameter value.
pub fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Path and query of the current request, for the post-login redirect.
fn requested_path() -> impl Filter<Extract = (String,), Error = Infallible> + Clone {
    warp::path::full()
        .and(
            warp::query::raw()
                .or(warp::any().map(String::new))
                .unify(),
        )
        .map(|path: FullPath, query: String| {
            if query.is_empty() {
                path.as_str().to_string()
            } else {
                format!("{}?{}", path.as_str(), query)
            }
        })
}

/// The logged-in, active user, if any.
pub fn optional_user(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Option<User>,), Error = Rejection> + Clone {
    warp::cookie::optional::<String>(SESSION_COOKIE)
        .and(with_state(state))
        .and_then(|token: Option<String>, state: Arc<AppState>| async move {
            let Some(user_id) = token.and_then(|t| state.auth.session_user_id(&t)) else {
                return Ok::<_, Rejection>(None);
            };
            let user = find_user_by_id(&state.db.pool, user_id)
                .await
                .map_err(AppError::from)?;
            Ok(user.filter(|u| u.is_active))
        })
}

/// Rejects with a redirect to the login page when nobody is logged in.
pub fn require_user(state: Arc<AppState>) -> impl Filter<Extract = (User,), Error = Rejection> + Clone {
    requested_path()
        .and(optional_user(state))
        .and_then(|next: String, user: Option<User>| async move {
            user.ok_or_else(|| Rejection::from(AppError::Unauthenticated { next }))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> Auth {
        Auth::new(&Config::testing())
    }

    fn user(id: i64, password_hash: &str) -> User {
        User {
            id,
            username: "alice".into(),
            email: "alice@example.com".into(),
            password_hash: password_hash.into(),
            created_at: Utc::now(),
            last_login: None,
            is_active: true,
            first_name: None,
            last_name: None,
            subscription_level: "free".into(),
            subscription_expires: None,
        }
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password(&hash, "correct horse"));
        assert!(!verify_password(&hash, "wrong horse"));
        assert!(!verify_password("not-a-hash", "correct horse"));
    }

    #[test]
    fn session_tokens_identify_the_user() {
        let auth = auth();
        let token = auth.create_session_token(42).unwrap();
        assert_eq!(auth.session_user_id(&token), Some(42));
        assert_eq!(auth.session_user_id("garbage"), None);

        let mut other_config = Config::testing();
        other_config.secret_key = "another-secret".into();
        assert_eq!(Auth::new(&other_config).session_user_id(&token), None);
    }

    #[test]
    fn reset_tokens_are_not_session_tokens() {
        let auth = auth();
        let alice = user(7, "hash-one");
        let reset = auth.create_reset_token(&alice).unwrap();
        assert_eq!(auth.session_user_id(&reset), None);
        assert_eq!(auth.reset_token_user_id(&reset), Some(7));
        let session = auth.create_session_token(7).unwrap();
        assert_eq!(auth.reset_token_user_id(&session), None);
    }

    #[test]
    fn reset_token_dies_with_password_change() {
        let auth = auth();
        let before = user(7, "hash-one");
        let token = auth.create_reset_token(&before).unwrap();
        assert!(auth.reset_token_matches(&token, &before));
        assert!(!auth.reset_token_matches(&token, &user(7, "hash-two")));
        assert!(!auth.reset_token_matches(&token, &user(8, "hash-one")));
    }

    #[test]
    fn next_must_stay_on_site() {
        assert_eq!(safe_next(Some("/analysis/")), "/analysis/");
        assert_eq!(safe_next(Some("//evil.example")), "/dashboard");
        assert_eq!(safe_next(Some("https://evil.example")), "/dashboard");
        assert_eq!(safe_next(None), "/dashboard");
    }

    #[test]
    fn cookies_carry_expected_attributes() {
        let auth = auth();
        let session = auth.login_cookie("tok", false);
        assert_eq!(session, "session=tok; Path=/; HttpOnly; SameSite=Lax");
        assert!(auth.login_cookie("tok", true).contains("Max-Age=2678400"));
        assert!(auth.logout_cookie().contains("Max-Age=0"));
        assert!(build_cookie("a", "b", None, true).ends_with("; Secure"));
    }

    #[test]
    fn query_values_are_encoded() {
        assert_eq!(encode_query_value("/analysis/?period=1y&x"), "/analysis/%3Fperiod%3D1y%26x");
    }
}
