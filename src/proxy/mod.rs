//! Proxy implementation
//!
//! This module provides:
//! - The request handler (CONNECT tunnels and the forward relay)
//! - The bidirectional tunnel primitive
//! - The client-side CONNECT dialer
//! - A standalone server and the read-deadline compatibility shim

pub mod body;
pub mod client;
pub mod deadline;
pub mod dialer;
pub mod handler;
pub mod logger;
pub mod middleware;
pub mod pool;
pub mod server;
pub mod tls;
pub mod transport;
pub mod tunnel;

pub use body::ProxyBody;
pub use client::{http_client, DialConnector, HttpClient};
pub use deadline::{
    compat_read_deadline, CompatListener, CompatReadDeadline, DeadlineConn, DeadlineListener,
    DeadlineStream, Listener, ReadDeadline, A_LONG_TIME_AGO,
};
pub use dialer::Dialer;
pub use handler::{Fallback, NotFound, ProxyHandler, ProxyHandlerBuilder};
pub use logger::{Logger, TracingLogger};
pub use middleware::{AuthOutcome, Authentication, BasicAuth};
pub use pool::{BufferPool, BytesPool};
pub use server::ProxyServer;
pub use transport::{dial_fn, BoxConnection, Dial, TcpDialer};
pub use tunnel::tunnel;
