//! connect-proxy - HTTP proxy with CONNECT tunneling
//!
//! Building blocks for HTTP proxies and their clients.
//!
//! ## Features
//!
//! - `CONNECT` tunneling over HTTP/1.1 upgrades or HTTP/2 streams
//! - Forward relay of absolute-form requests, chainable through another proxy
//! - Client-side CONNECT dialer over plain TCP or TLS
//! - Pluggable authentication with a Basic implementation
//! - Read-deadline compatibility shim for listeners and connections

pub mod config;
pub mod context;
pub mod error;
pub mod proxy;


pub use config::Config;
pub use context::Context;
pub use error::{ProxyError, Result};
