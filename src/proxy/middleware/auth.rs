//! Proxy authentication middleware
//!
//! Handles Basic authentication for the proxy server.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use http::request::Parts;
use hyper::header::{HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::{Response, StatusCode};
use tracing::{debug, warn};

use crate::proxy::body::{full, ProxyBody};

/// Realm announced in the 407 challenge
const REALM: &str = "Proxy";

/// Decision of an [`Authentication`] strategy
pub enum AuthOutcome {
    /// The request may proceed
    Allow,
    /// The request is refused; the response is complete and final
    Deny(Response<ProxyBody>),
}

impl AuthOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthOutcome::Allow)
    }
}

/// Gate run before any relay. A strategy that denies owns the whole
/// response: the caller sends it as-is and stops.
pub trait Authentication: Send + Sync {
    fn authenticate(&self, req: &Parts) -> AuthOutcome;
}

/// Basic authentication against a single username/password pair
#[derive(Clone)]
pub struct BasicAuth {
    /// Expected username
    username: String,
    /// Expected password
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Check the Proxy-Authorization header. Anything missing or malformed
    /// counts as a mismatch.
    pub fn validate(&self, req: &Parts) -> bool {
        let Some(auth_header) = req.headers.get(PROXY_AUTHORIZATION) else {
            debug!("Missing Proxy-Authorization header");
            return false;
        };

        let Ok(auth_str) = auth_header.to_str() else {
            return false;
        };

        // Parse "Basic <base64>"; the scheme name is case-insensitive.
        let Some((scheme, encoded)) = auth_str.trim().split_once(' ') else {
            return false;
        };
        if !scheme.eq_ignore_ascii_case("Basic") {
            warn!("Invalid auth scheme, expected Basic");
            return false;
        }

        let Ok(decoded) = BASE64.decode(encoded.trim()) else {
            return false;
        };
        let Ok(credentials) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, pass)) = credentials.split_once(':') else {
            return false;
        };

        if user == self.username && pass == self.password {
            debug!("Proxy authentication successful for user: {}", user);
            true
        } else {
            warn!("Proxy authentication failed for user: {}", user);
            false
        }
    }

    /// Create a 407 Proxy Authentication Required response
    pub fn challenge_response(&self) -> Response<ProxyBody> {
        let challenge = format!("Basic realm=\"{}\"", REALM);
        let mut response = Response::new(full(
            StatusCode::PROXY_AUTHENTICATION_REQUIRED
                .canonical_reason()
                .unwrap_or_default(),
        ));
        *response.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
        let challenge = HeaderValue::from_str(&challenge)
            .unwrap_or_else(|_| HeaderValue::from_static("Basic"));
        response.headers_mut().insert(PROXY_AUTHENTICATE, challenge);
        response
    }
}

impl Authentication for BasicAuth {
    fn authenticate(&self, req: &Parts) -> AuthOutcome {
        if self.validate(req) {
            AuthOutcome::Allow
        } else {
            AuthOutcome::Deny(self.challenge_response())
        }
    }
}

/// Encode `user:pass` as a Proxy-Authorization header value
pub fn basic_credentials(username: &str, password: &str) -> String {
    let credentials = format!("{}:{}", username, password);
    format!("Basic {}", BASE64.encode(credentials.as_bytes()))
}
