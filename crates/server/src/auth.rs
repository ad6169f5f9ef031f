//! Request authentication.
//!
//! The `httpd.authentication` config names an ordered list of handlers; a
//! request is accepted by the first one that validates its `Authorization`
//! header. Positive validations are cached for a configurable TTL so the
//! credential check is off the hot path.

use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use irobot_core::config::HttpdConfig;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The identity attached to an authenticated request.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user: String,
}

/// One authentication handler.
pub trait Authenticator: Send + Sync {
    /// The `WWW-Authenticate` challenge this handler advertises.
    fn challenge(&self) -> String;

    /// Validate an `Authorization` header value.
    fn authenticate(&self, authorization: &str) -> Option<AuthenticatedUser>;
}

/// HTTP Basic authentication against a local credentials file.
///
/// The file holds one `user:sha256-hex` pair per line; blank lines and `#`
/// comments are skipped.
pub struct BasicAuthenticator {
    credentials: HashMap<String, String>,
    cache: Mutex<HashMap<String, CachedAuth>>,
    ttl: Duration,
}

struct CachedAuth {
    user: String,
    validated_at: Instant,
}

impl BasicAuthenticator {
    pub fn new(credentials: HashMap<String, String>, ttl: Duration) -> Self {
        Self {
            credentials,
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn from_file(path: &Path, ttl: Duration) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut credentials = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((user, hash)) = line.split_once(':') else {
                return Err(std::io::Error::other(format!(
                    "malformed credentials line: {line}"
                )));
            };
            credentials.insert(user.to_string(), hash.trim().to_ascii_lowercase());
        }
        Ok(Self::new(credentials, ttl))
    }
}

impl Authenticator for BasicAuthenticator {
    fn challenge(&self) -> String {
        "Basic realm=\"irobot\"".to_string()
    }

    fn authenticate(&self, authorization: &str) -> Option<AuthenticatedUser> {
        let encoded = authorization.strip_prefix("Basic ")?;

        {
            let cache = self.cache.lock().expect("auth cache lock");
            if let Some(hit) = cache.get(encoded)
                && hit.validated_at.elapsed() < self.ttl
            {
                return Some(AuthenticatedUser {
                    user: hit.user.clone(),
                });
            }
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;

        let expected = self.credentials.get(user)?;
        let offered = format!("{:x}", Sha256::digest(password.as_bytes()));
        if &offered != expected {
            return None;
        }

        self.cache.lock().expect("auth cache lock").insert(
            encoded.to_string(),
            CachedAuth {
                user: user.to_string(),
                validated_at: Instant::now(),
            },
        );
        Some(AuthenticatedUser {
            user: user.to_string(),
        })
    }
}

/// The ordered authentication chain.
#[derive(Default)]
pub struct AuthChain {
    authenticators: Vec<Box<dyn Authenticator>>,
}

impl AuthChain {
    /// Build the chain named by the configuration.
    pub fn from_config(config: &HttpdConfig) -> std::io::Result<Self> {
        let ttl = Duration::from_secs(config.auth_cache_secs);
        let mut authenticators: Vec<Box<dyn Authenticator>> = Vec::new();

        for handler in &config.authentication {
            match handler.as_str() {
                "basic" => {
                    let path = config.credentials.as_ref().ok_or_else(|| {
                        std::io::Error::other("basic authentication requires a credentials file")
                    })?;
                    authenticators.push(Box::new(BasicAuthenticator::from_file(path, ttl)?));
                }
                other => {
                    return Err(std::io::Error::other(format!(
                        "unknown authentication handler '{other}'"
                    )));
                }
            }
        }
        Ok(Self { authenticators })
    }

    pub fn is_enabled(&self) -> bool {
        !self.authenticators.is_empty()
    }

    /// Validate a request's `Authorization` header, `None` meaning absent.
    pub fn authenticate(&self, authorization: Option<&str>) -> Option<AuthenticatedUser> {
        let authorization = authorization?;
        self.authenticators
            .iter()
            .find_map(|authenticator| authenticator.authenticate(authorization))
    }

    fn challenges(&self) -> Vec<String> {
        self.authenticators.iter().map(|a| a.challenge()).collect()
    }
}

/// Middleware rejecting unauthenticated requests when a chain is configured.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    if !state.auth.is_enabled() {
        return next.run(req).await;
    }

    let authorization = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match state.auth.authenticate(authorization) {
        Some(user) => {
            tracing::debug!(user = %user.user, "request authenticated");
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        None => {
            let mut response = crate::error::ApiError::Unauthorized.into_response();
            debug_assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            for challenge in state.auth.challenges() {
                if let Ok(value) = HeaderValue::from_str(&challenge) {
                    response.headers_mut().append(WWW_AUTHENTICATE, value);
                }
            }
            response
        }
    }
}
