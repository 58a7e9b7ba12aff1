// src/csrf.rs
//! Double-submit CSRF protection. The browser holds a random nonce in the
//! `csrf` cookie; forms and XHR requests echo back the HMAC of that nonce.

use crate::auth::build_cookie;
use crate::error::AppError;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use std::convert::Infallible;
use std::sync::Arc;
use warp::{Filter, Rejection};

pub const CSRF_COOKIE: &str = "csrf";
pub const CSRF_HEADER: &str = "x-csrf-token";

type HmacSha256 = Hmac<Sha256>;

pub struct Csrf {
    mac: HmacSha256,
    enabled: bool,
    secure_cookies: bool,
}

/// Token to embed in a rendered page, plus the nonce cookie when the
/// browser does not have one yet.
#[derive(Debug, Clone)]
pub struct CsrfToken {
    pub token: String,
    set_cookie: Option<String>,
}

impl CsrfToken {
    pub fn set_cookie(&self) -> Option<&str> {
        self.set_cookie.as_deref()
    }
}

impl Csrf {
    pub fn new(
        secret: &str,
        enabled: bool,
        secure_cookies: bool,
    ) -> Result<Self, hmac::digest::InvalidLength> {
        Ok(Csrf {
            mac: HmacSha256::new_from_slice(secret.as_bytes())?,
            enabled,
            secure_cookies,
        })
    }

    fn sign(&self, nonce: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(nonce.as_bytes());
        mac
    }

    pub fn issue(&self, nonce: Option<String>) -> CsrfToken {
        match nonce.filter(|n| n.len() == 64 && n.chars().all(|c| c.is_ascii_hexdigit())) {
            Some(nonce) => CsrfToken {
                token: hex::encode(self.sign(&nonce).finalize().into_bytes()),
                set_cookie: None,
            },
            None => {
                let nonce = hex::encode(rand::thread_rng().gen::<[u8; 32]>());
                CsrfToken {
                    token: hex::encode(self.sign(&nonce).finalize().into_bytes()),
                    set_cookie: Some(build_cookie(CSRF_COOKIE, &nonce, None, self.secure_cookies)),
                }
            }
        }
    }

    pub fn verify(&self, nonce: Option<&str>, token: Option<&str>) -> Result<(), AppError> {
        if !self.enabled {
            return Ok(());
        }
        let (Some(nonce), Some(token)) = (nonce, token) else {
            return Err(AppError::Csrf);
        };
        let expected = hex::decode(token.trim()).map_err(|_| AppError::Csrf)?;
        self.sign(nonce)
            .verify_slice(&expected)
            .map_err(|_| AppError::Csrf)
    }
}

/// Extracts a token for rendering, minting a nonce cookie when needed.
pub fn with_csrf_token(
    csrf: Arc<Csrf>,
) -> impl Filter<Extract = (CsrfToken,), Error = Infallible> + Clone {
    warp::cookie::optional::<String>(CSRF_COOKIE).map(move |nonce| csrf.issue(nonce))
}

/// Rejects requests whose `X-CSRF-Token` header does not match the cookie.
pub fn check_csrf_header(csrf: Arc<Csrf>) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::cookie::optional::<String>(CSRF_COOKIE)
        .and(warp::header::optional::<String>(CSRF_HEADER))
        .and_then(move |nonce: Option<String>, token: Option<String>| {
            let csrf = csrf.clone();
            async move {
                csrf.verify(nonce.as_deref(), token.as_deref())
                    .map_err(Rejection::from)
            }
        })
        .untuple_one()
}

/// Nonce cookie value of the current request, for form handlers that verify
/// the posted `csrf_token` field themselves.
pub fn csrf_nonce() -> impl Filter<Extract = (Option<String>,), Error = Infallible> + Clone {
    warp::cookie::optional::<String>(CSRF_COOKIE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonce_from(cookie: &str) -> String {
        cookie
            .split(';')
            .next()
            .and_then(|kv| kv.split_once('='))
            .map(|(_, v)| v.to_string())
            .unwrap()
    }

    #[test]
    fn issued_token_verifies_against_its_nonce() {
        let csrf = Csrf::new("secret", true, false).unwrap();
        let issued = csrf.issue(None);
        let nonce = nonce_from(issued.set_cookie().unwrap());
        assert!(csrf.verify(Some(&nonce), Some(&issued.token)).is_ok());

        let again = csrf.issue(Some(nonce.clone()));
        assert!(again.set_cookie().is_none());
        assert_eq!(again.token, issued.token);
    }

    #[test]
    fn tampered_or_missing_tokens_are_rejected() {
        let csrf = Csrf::new("secret", true, false).unwrap();
        let issued = csrf.issue(None);
        let nonce = nonce_from(issued.set_cookie().unwrap());
        assert!(csrf.verify(Some(&nonce), Some("deadbeef")).is_err());
        assert!(csrf.verify(Some(&nonce), Some("not hex")).is_err());
        assert!(csrf.verify(None, Some(&issued.token)).is_err());
        assert!(csrf.verify(Some(&nonce), None).is_err());

        let other = Csrf::new("other-secret", true, false).unwrap();
        assert!(other.verify(Some(&nonce), Some(&issued.token)).is_err());
    }

    #[test]
    fn disabled_protection_accepts_anything() {
        let csrf = Csrf::new("secret", false, false).unwrap();
        assert!(csrf.verify(None, None).is_ok());
    }
}
