//! Signed app tokens
//!
//! A workspace app request carries a JWT signed with HS512 using the first 64
//! bytes of the deployment's app security key. The token names the exact
//! application it grants access to, so a token minted for one app cannot be
//! replayed against another app of the same workspace.

use crate::hostname::AppRoute;
use chrono::{Duration, Utc};
use hyper::Request;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Cookie and query parameter carrying the token
pub const APP_TOKEN_COOKIE: &str = "coder_signed_app_token";
/// Header carrying the token for non-browser clients
pub const APP_TOKEN_HEADER: &str = "Coder-Signed-App-Token";

/// Length of the signing part of the security key
const SIGNING_KEY_LEN: usize = 64;
/// Full key length when the key also carries an encryption part
const FULL_KEY_LEN: usize = 96;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("no app token in request")]
    Missing,
    #[error("malformed app token: {0}")]
    Malformed(String),
    #[error("app token signature is invalid")]
    InvalidSignature,
    #[error("app token has expired")]
    TokenExpired,
    #[error("app token was issued for a different application")]
    ScopeMismatch,
    #[error("invalid app security key: {0}")]
    InvalidKey(String),
}

/// Process-wide key used to sign and verify app tokens
#[derive(Clone, PartialEq, Eq)]
pub struct SecurityKey([u8; SIGNING_KEY_LEN]);

impl SecurityKey {
    pub fn from_bytes(bytes: [u8; SIGNING_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Random key for deployments that did not configure one
    pub fn generate() -> Self {
        let mut key = [0u8; SIGNING_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Parse a hex encoded key. Both the bare 64-byte signing key and the
    /// 96-byte signing + encryption key are accepted; only the first 64 bytes
    /// are used here.
    pub fn from_hex(encoded: &str) -> Result<Self, TokenError> {
        let raw = hex::decode(encoded.trim()).map_err(|e| TokenError::InvalidKey(e.to_string()))?;
        if raw.len() != SIGNING_KEY_LEN && raw.len() != FULL_KEY_LEN {
            return Err(TokenError::InvalidKey(format!(
                "expected {} or {} bytes, got {}",
                SIGNING_KEY_LEN,
                FULL_KEY_LEN,
                raw.len()
            )));
        }

        let mut key = [0u8; SIGNING_KEY_LEN];
        key.copy_from_slice(&raw[..SIGNING_KEY_LEN]);
        Ok(Self(key))
    }

    /// Sign claims with this key. Used by token issuers and tests.
    pub fn sign_token(&self, claims: &AppTokenClaims) -> Result<String, TokenError> {
        encode(
            &Header::new(Algorithm::HS512),
            claims,
            &EncodingKey::from_secret(&self.0),
        )
        .map_err(|e| TokenError::Malformed(e.to_string()))
    }
}

impl fmt::Debug for SecurityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecurityKey(<redacted>)")
    }
}

/// Source of the app security key. Kept behind a trait so deployments can
/// load the key from wherever they keep secrets and tests can inject a fixed
/// key.
pub trait KeyProvider: Send + Sync {
    fn security_key(&self) -> Result<SecurityKey, TokenError>;
}

#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    key: SecurityKey,
}

impl StaticKeyProvider {
    pub fn new(key: SecurityKey) -> Self {
        Self { key }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn security_key(&self) -> Result<SecurityKey, TokenError> {
        Ok(self.key.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppTokenClaims {
    pub workspace_id: Uuid,
    pub agent_id: Uuid,
    pub username: String,
    pub workspace_name: String,
    pub agent_name: String,
    pub app_slug_or_port: String,
    pub iat: i64,
    pub exp: i64,
}

impl AppTokenClaims {
    /// Claims for `route` on the given agent, valid for `ttl` from now
    pub fn new(workspace_id: Uuid, agent_id: Uuid, route: &AppRoute, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            workspace_id,
            agent_id,
            username: route.username.clone(),
            workspace_name: route.workspace_name.clone(),
            agent_name: route.agent_name.clone(),
            app_slug_or_port: route.app_slug_or_port.clone(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        }
    }

    pub fn matches_route(&self, route: &AppRoute) -> bool {
        self.app_slug_or_port.eq_ignore_ascii_case(&route.app_slug_or_port)
            && self.agent_name.eq_ignore_ascii_case(&route.agent_name)
            && self.workspace_name.eq_ignore_ascii_case(&route.workspace_name)
            && self.username.eq_ignore_ascii_case(&route.username)
    }

    /// Seconds until expiry, never negative
    pub fn remaining_secs(&self) -> i64 {
        (self.exp - Utc::now().timestamp()).max(0)
    }
}

/// Verifies app tokens against the security key. Pure: no I/O after
/// construction.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(keys: &dyn KeyProvider) -> Result<Self, TokenError> {
        let key = keys.security_key()?;

        let mut validation = Validation::new(Algorithm::HS512);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Ok(Self {
            decoding_key: DecodingKey::from_secret(&key.0),
            validation,
        })
    }

    /// Verify `raw` and, when `expected` is given, check that the token was
    /// issued for that application.
    pub fn verify(&self, raw: &str, expected: Option<&AppRoute>) -> Result<AppTokenClaims, TokenError> {
        let data = decode::<AppTokenClaims>(raw, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => TokenError::InvalidSignature,
                ErrorKind::ExpiredSignature => TokenError::TokenExpired,
                _ => TokenError::Malformed(e.to_string()),
            }
        })?;

        if let Some(route) = expected {
            if !data.claims.matches_route(route) {
                return Err(TokenError::ScopeMismatch);
            }
        }

        Ok(data.claims)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Cookie,
    Query,
    Header,
}

/// Find the app token in a request: cookie first, then query parameter, then
/// header.
pub fn extract_app_token<B>(req: &Request<B>) -> Option<(String, TokenSource)> {
    for cookie_header in req.headers().get_all(hyper::header::COOKIE) {
        let Ok(cookie_header) = cookie_header.to_str() else {
            continue;
        };
        if let Some(token) = token_from_cookie(cookie_header) {
            return Some((token, TokenSource::Cookie));
        }
    }

    if let Some(token) = req.uri().query().and_then(token_from_query) {
        return Some((token, TokenSource::Query));
    }

    req.headers()
        .get(APP_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| (v.to_string(), TokenSource::Header))
}

fn token_from_cookie(cookie_header: &str) -> Option<String> {
    let prefix = format!("{}=", APP_TOKEN_COOKIE);
    for cookie in cookie_header.split(';') {
        let cookie = cookie.trim();
        if let Some(value) = cookie.strip_prefix(&prefix) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name != APP_TOKEN_COOKIE || value.is_empty() {
            return None;
        }
        urlencoding::decode(value).ok().map(|v| v.into_owned())
    })
}

/// Query string with the token parameter removed, `None` when nothing is left
pub fn strip_token_from_query(query: &str) -> Option<String> {
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let name = pair.split_once('=').map(|(n, _)| n).unwrap_or(pair);
            !pair.is_empty() && name != APP_TOKEN_COOKIE
        })
        .collect();

    if kept.is_empty() {
        None
    } else {
        Some(kept.join("&"))
    }
}

/// Cookie header with the app token cookie removed, `None` when nothing is
/// left
pub fn strip_token_from_cookies(cookie_header: &str) -> Option<String> {
    let prefix = format!("{}=", APP_TOKEN_COOKIE);
    let kept: Vec<&str> = cookie_header
        .split(';')
        .map(str::trim)
        .filter(|cookie| !cookie.is_empty() && !cookie.starts_with(&prefix))
        .collect();

    if kept.is_empty() {
        None
    } else {
        Some(kept.join("; "))
    }
}

/// Set-Cookie value persisting a token that arrived in the query string
pub fn app_token_cookie(token: &str, max_age_secs: i64, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        APP_TOKEN_COOKIE, token, max_age_secs
    );

    if secure {
        cookie.push_str("; Secure");
    }

    cookie
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SecurityKey {
        SecurityKey::from_bytes([7u8; SIGNING_KEY_LEN])
    }

    fn test_route() -> AppRoute {
        AppRoute::parse("code-server--main--dev--alice").unwrap()
    }

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(&StaticKeyProvider::new(test_key())).unwrap()
    }

    #[test]
    fn test_security_key_from_hex() {
        let short = "ab".repeat(SIGNING_KEY_LEN);
        let full = format!("{}{}", short, "cd".repeat(32));

        assert_eq!(SecurityKey::from_hex(&short).unwrap(), SecurityKey::from_hex(&full).unwrap());
        assert!(matches!(SecurityKey::from_hex("abcd"), Err(TokenError::InvalidKey(_))));
        assert!(matches!(SecurityKey::from_hex("zz"), Err(TokenError::InvalidKey(_))));
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(SecurityKey::generate(), SecurityKey::generate());
    }

    #[test]
    fn test_security_key_debug_is_redacted() {
        assert_eq!(format!("{:?}", test_key()), "SecurityKey(<redacted>)");
    }

    #[test]
    fn test_verify_valid_token() {
        let claims = AppTokenClaims::new(Uuid::new_v4(), Uuid::new_v4(), &test_route(), Duration::minutes(5));
        let token = test_key().sign_token(&claims).unwrap();

        let verified = verifier().verify(&token, Some(&test_route())).unwrap();
        assert_eq!(verified, claims);
    }

    #[test]
    fn test_verify_without_expected_route() {
        let claims = AppTokenClaims::new(Uuid::new_v4(), Uuid::new_v4(), &test_route(), Duration::minutes(5));
        let token = test_key().sign_token(&claims).unwrap();

        assert!(verifier().verify(&token, None).is_ok());
    }

    #[test]
    fn test_tampered_token_is_rejected() {
        let claims = AppTokenClaims::new(Uuid::new_v4(), Uuid::new_v4(), &test_route(), Duration::minutes(5));
        let other_key = SecurityKey::from_bytes([9u8; SIGNING_KEY_LEN]);
        let token = other_key.sign_token(&claims).unwrap();

        assert_eq!(verifier().verify(&token, None), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let mut claims = AppTokenClaims::new(Uuid::new_v4(), Uuid::new_v4(), &test_route(), Duration::minutes(5));
        claims.iat -= 600;
        claims.exp = Utc::now().timestamp() - 60;
        let token = test_key().sign_token(&claims).unwrap();

        assert_eq!(verifier().verify(&token, None), Err(TokenError::TokenExpired));
    }

    #[test]
    fn test_expired_and_tampered_reports_signature() {
        let mut claims = AppTokenClaims::new(Uuid::new_v4(), Uuid::new_v4(), &test_route(), Duration::minutes(5));
        claims.exp = Utc::now().timestamp() - 60;
        let token = SecurityKey::from_bytes([1u8; SIGNING_KEY_LEN]).sign_token(&claims).unwrap();

        assert_eq!(verifier().verify(&token, None), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn test_scope_mismatch() {
        let claims = AppTokenClaims::new(Uuid::new_v4(), Uuid::new_v4(), &test_route(), Duration::minutes(5));
        let token = test_key().sign_token(&claims).unwrap();
        let other = AppRoute::parse("jupyter--main--dev--alice").unwrap();

        assert_eq!(verifier().verify(&token, Some(&other)), Err(TokenError::ScopeMismatch));
    }

    #[test]
    fn test_garbage_token_is_malformed() {
        assert!(matches!(verifier().verify("not-a-jwt", None), Err(TokenError::Malformed(_))));
    }

    #[test]
    fn test_extract_token_precedence() {
        let req = Request::builder()
            .uri("/path?coder_signed_app_token=from-query")
            .header("cookie", "other=1; coder_signed_app_token=from-cookie")
            .header(APP_TOKEN_HEADER, "from-header")
            .body(())
            .unwrap();
        assert_eq!(
            extract_app_token(&req),
            Some(("from-cookie".to_string(), TokenSource::Cookie))
        );

        let req = Request::builder()
            .uri("/path?a=1&coder_signed_app_token=from%2Dquery")
            .header(APP_TOKEN_HEADER, "from-header")
            .body(())
            .unwrap();
        assert_eq!(
            extract_app_token(&req),
            Some(("from-query".to_string(), TokenSource::Query))
        );

        let req = Request::builder()
            .uri("/path")
            .header(APP_TOKEN_HEADER, "from-header")
            .body(())
            .unwrap();
        assert_eq!(
            extract_app_token(&req),
            Some(("from-header".to_string(), TokenSource::Header))
        );

        let req = Request::builder().uri("/path").body(()).unwrap();
        assert_eq!(extract_app_token(&req), None);
    }

    #[test]
    fn test_strip_token_from_query() {
        assert_eq!(
            strip_token_from_query("a=1&coder_signed_app_token=xyz&b=2"),
            Some("a=1&b=2".to_string())
        );
        assert_eq!(strip_token_from_query("coder_signed_app_token=xyz"), None);
        assert_eq!(strip_token_from_query("a=1"), Some("a=1".to_string()));
    }

    #[test]
    fn test_strip_token_from_cookies() {
        assert_eq!(
            strip_token_from_cookies("theme=dark; coder_signed_app_token=xyz; lang=en"),
            Some("theme=dark; lang=en".to_string())
        );
        assert_eq!(strip_token_from_cookies("coder_signed_app_token=xyz"), None);
        assert_eq!(strip_token_from_cookies("session=1"), Some("session=1".to_string()));
    }

    #[test]
    fn test_app_token_cookie() {
        let cookie = app_token_cookie("abc", 300, false);
        assert!(cookie.starts_with("coder_signed_app_token=abc;"));
        assert!(cookie.contains("Max-Age=300"));
        assert!(cookie.contains("HttpOnly"));
        assert!(!cookie.contains("Secure"));

        assert!(app_token_cookie("abc", 300, true).contains("; Secure"));
    }
}
