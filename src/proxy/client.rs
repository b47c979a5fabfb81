//! Outbound HTTP client for the forward relay
//!
//! A pooled hyper client whose connector opens every connection through a
//! [`Dial`], so forwarded requests can be chained through another proxy.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::ClientConfig;
use tracing::debug;

use crate::error::BoxError;
use crate::proxy::body::ProxyBody;
use crate::proxy::tls;
use crate::proxy::transport::{join_host_port, BoxConnection, Dial};

/// Client used by the forward relay
pub type HttpClient = Client<DialConnector, ProxyBody>;

/// Build the default forward client on top of `dial`
pub fn http_client(dial: Arc<dyn Dial>, tls: Arc<ClientConfig>) -> HttpClient {
    Client::builder(TokioExecutor::new()).build(DialConnector::new(dial, tls))
}

/// Connector opening `http` and `https` origins through a [`Dial`]
#[derive(Clone)]
pub struct DialConnector {
    dial: Arc<dyn Dial>,
    tls: Arc<ClientConfig>,
}

impl DialConnector {
    pub fn new(dial: Arc<dyn Dial>, tls: Arc<ClientConfig>) -> Self {
        Self { dial, tls }
    }
}

impl tower::Service<Uri> for DialConnector {
    type Response = DialedStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let dial = self.dial.clone();
        let tls_config = self.tls.clone();

        Box::pin(async move {
            let https = match dst.scheme_str() {
                Some("http") => false,
                Some("https") => true,
                other => return Err(format!("unsupported scheme {:?}", other).into()),
            };
            let host = dst.host().ok_or("missing host in URI")?;
            let port = dst.port_u16().unwrap_or(if https { 443 } else { 80 });
            let host = host
                .strip_prefix('[')
                .and_then(|h| h.strip_suffix(']'))
                .unwrap_or(host);
            let address = join_host_port(host, port);

            debug!(%address, https, "Dialing forward target");
            let ctx = crate::context::Context::background();
            let conn = dial.dial(&ctx, "tcp", &address).await?;
            let conn = if https {
                tls::connect(tls_config, host, conn).await?
            } else {
                conn
            };
            Ok::<_, BoxError>(DialedStream::new(conn))
        })
    }
}

/// Connection produced by [`DialConnector`]
pub struct DialedStream {
    inner: TokioIo<BoxConnection>,
}

impl DialedStream {
    fn new(conn: BoxConnection) -> Self {
        Self {
            inner: TokioIo::new(conn),
        }
    }
}

impl Connection for DialedStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl Read for DialedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Write for DialedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
