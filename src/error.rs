use thiserror::Error;

/// Boxed error used for HTTP bodies and connector errors
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Unified error type for the proxy and the CONNECT dialer
#[derive(Error, Debug)]
pub enum ProxyError {
    // Configuration errors
    #[error("unsupported protocol '{0}'")]
    UnsupportedProtocol(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Context errors
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    // Protocol errors
    #[error("failed proxying {status}: {reason}")]
    ConnectFailed { status: u16, reason: String },

    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    // Transport errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("TLS error: {0}")]
    Tls(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

// Convert from hyper errors
impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

// Convert from http builder errors
impl From<http::Error> for ProxyError {
    fn from(err: http::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for ProxyError {
    fn from(err: url::ParseError) -> Self {
        ProxyError::InvalidProxyAddress(err.to_string())
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

/// Render an error together with its source chain, `outer: inner: root`
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_failed_message() {
        let err = ProxyError::ConnectFailed {
            status: 403,
            reason: "403 Forbidden".to_string(),
        };
        assert_eq!(err.to_string(), "failed proxying 403: 403 Forbidden");
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let outer = ProxyError::Io(inner);
        assert_eq!(error_chain(&outer), "IO error: refused");
    }
}
