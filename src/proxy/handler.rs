//! Proxy request handler
//!
//! Dispatches inbound requests: `CONNECT` opens a tunnel to the requested
//! authority, absolute-form requests are relayed upstream, and everything
//! else goes to a fallback handler.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context as TaskContext, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use http::request::Parts;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderName, CONNECTION};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::PollSender;
use tracing::{debug, instrument};

use crate::context::Context;
use crate::error::{error_chain, BoxError, Result};
use crate::proxy::body::{empty, text_response, ProxyBody};
use crate::proxy::client::{http_client, HttpClient};
use crate::proxy::logger::Logger;
use crate::proxy::middleware::{AuthOutcome, Authentication};
use crate::proxy::pool::{BytesPool, DEFAULT_BUFFER_SIZE};
use crate::proxy::tls;
use crate::proxy::transport::{BoxConnection, Dial, TcpDialer};
use crate::proxy::tunnel::tunnel;

/// Frames buffered toward the client on a flushed CONNECT stream
const FLUSH_CHANNEL_CAPACITY: usize = 16;

/// Handler for requests that are not proxy requests
#[async_trait]
pub trait Fallback: Send + Sync {
    async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody>;
}

/// Default fallback: `404 page not found`
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFound;

#[async_trait]
impl Fallback for NotFound {
    async fn handle(&self, _req: Request<ProxyBody>) -> Response<ProxyBody> {
        text_response(StatusCode::NOT_FOUND, "404 page not found")
    }
}

/// Builder for [`ProxyHandler`]; unset parts get their defaults in
/// [`build`](ProxyHandlerBuilder::build)
#[derive(Default)]
pub struct ProxyHandlerBuilder {
    client: Option<HttpClient>,
    dial: Option<Arc<dyn Dial>>,
    tls: Option<Arc<ClientConfig>>,
    authentication: Option<Arc<dyn Authentication>>,
    not_found: Option<Arc<dyn Fallback>>,
    logger: Option<Arc<dyn Logger>>,
    buffer_pool: Option<Arc<dyn BytesPool>>,
}

impl ProxyHandlerBuilder {
    /// Outbound client for the forward relay. Defaults to a pooled client
    /// dialing through [`dial`](Self::dial).
    pub fn client(mut self, client: HttpClient) -> Self {
        self.client = Some(client);
        self
    }

    /// How CONNECT targets and forwarded origins are reached. Defaults to
    /// plain TCP.
    pub fn dial(mut self, dial: Arc<dyn Dial>) -> Self {
        self.dial = Some(dial);
        self
    }

    /// TLS configuration of the default client for `https` targets
    pub fn tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn authentication(mut self, authentication: impl Authentication + 'static) -> Self {
        self.authentication = Some(Arc::new(authentication));
        self
    }

    pub fn not_found(mut self, fallback: impl Fallback + 'static) -> Self {
        self.not_found = Some(Arc::new(fallback));
        self
    }

    pub fn logger(mut self, logger: impl Logger + 'static) -> Self {
        self.logger = Some(Arc::new(logger));
        self
    }

    pub fn buffer_pool(mut self, pool: impl BytesPool + 'static) -> Self {
        self.buffer_pool = Some(Arc::new(pool));
        self
    }

    pub fn build(self) -> Result<ProxyHandler> {
        let dial = self.dial.unwrap_or_else(|| Arc::new(TcpDialer));
        let client = match self.client {
            Some(client) => client,
            None => {
                let tls = match self.tls {
                    Some(config) => config,
                    None => tls::default_client_config()?,
                };
                http_client(dial.clone(), tls)
            }
        };

        Ok(ProxyHandler {
            client,
            dial,
            authentication: self.authentication,
            not_found: self.not_found.unwrap_or_else(|| Arc::new(NotFound)),
            logger: self.logger,
            buffer_pool: self.buffer_pool,
        })
    }
}

/// HTTP proxy handler. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ProxyHandler {
    client: HttpClient,
    dial: Arc<dyn Dial>,
    authentication: Option<Arc<dyn Authentication>>,
    not_found: Arc<dyn Fallback>,
    logger: Option<Arc<dyn Logger>>,
    buffer_pool: Option<Arc<dyn BytesPool>>,
}

impl ProxyHandler {
    pub fn builder() -> ProxyHandlerBuilder {
        ProxyHandlerBuilder::default()
    }

    /// Handler with every default: TCP dials, no authentication, 404 fallback
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Handle one inbound request
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if req.method() == Method::CONNECT {
            let (parts, body) = req.into_parts();
            if let Some(denied) = self.authenticate(&parts) {
                return denied;
            }
            return self.handle_connect(parts, body).await;
        }

        if is_absolute_form(req.uri()) {
            let (parts, body) = req.into_parts();
            if let Some(denied) = self.authenticate(&parts) {
                return denied;
            }
            return self.handle_forward(parts, box_body(body)).await;
        }

        self.not_found.handle(req.map(box_body)).await
    }

    fn authenticate(&self, parts: &Parts) -> Option<Response<ProxyBody>> {
        match self.authentication.as_ref()?.authenticate(parts) {
            AuthOutcome::Allow => None,
            AuthOutcome::Deny(response) => {
                debug!("Request denied by authentication");
                Some(response)
            }
        }
    }

    /// Handle CONNECT: dial the target, then hand the client connection
    /// over to a tunnel
    async fn handle_connect<B>(&self, mut parts: Parts, body: B) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let takeover = Takeover::detect(&mut parts);
        if let Takeover::Unsupported = takeover {
            return self.not_supported();
        }

        let target = parts
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default();

        let target_conn = match self.dial.dial(&Context::background(), "tcp", &target).await {
            Ok(conn) => conn,
            Err(e) => {
                let message = format!("dial {:?} failed: {}", target, e);
                self.log(&message);
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, &message);
            }
        };
        debug!(%target, "CONNECT target reached");

        match takeover {
            Takeover::Hijack(on_upgrade) => {
                let handler = self.clone();
                tokio::spawn(async move {
                    match on_upgrade.await {
                        Ok(upgraded) => handler.run_tunnel(target_conn, TokioIo::new(upgraded)).await,
                        Err(e) => handler.log(&format!("hijack failed: {}", e)),
                    }
                });

                let mut response = Response::new(empty());
                response
                    .extensions_mut()
                    .insert(ReasonPhrase::from_static(b"Connection Established"));
                response
            }
            Takeover::Flush => {
                let (tx, rx) = mpsc::channel(FLUSH_CHANNEL_CAPACITY);
                let conn = FlushConn::new(box_body(body), tx);
                let handler = self.clone();
                tokio::spawn(async move { handler.run_tunnel(target_conn, conn).await });

                Response::new(StreamBody::new(ReceiverStream::new(rx)).boxed_unsync())
            }
            Takeover::Unsupported => self.not_supported(),
        }
    }

    fn not_supported(&self) -> Response<ProxyBody> {
        self.log(&"not supported");
        text_response(StatusCode::INTERNAL_SERVER_ERROR, "not supported")
    }

    async fn run_tunnel<C>(&self, target: BoxConnection, client: C)
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf_target = self.acquire_buffer();
        let mut buf_client = self.acquire_buffer();

        let result = tunnel(
            &Context::background(),
            target,
            client,
            &mut buf_target,
            &mut buf_client,
        )
        .await;

        self.release_buffer(buf_target);
        self.release_buffer(buf_client);

        match result {
            Ok(()) => debug!("Tunnel closed"),
            Err(e) => self.log(&e),
        }
    }

    /// Relay an absolute-form request upstream and stream the answer back
    async fn handle_forward(&self, parts: Parts, body: ProxyBody) -> Response<ProxyBody> {
        let request = match outbound_request(parts, body) {
            Ok(request) => request,
            Err(e) => {
                let message = e.to_string();
                self.log(&message);
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, &message);
            }
        };

        match self.client.request(request).await {
            Ok(response) => {
                debug!(status = %response.status(), "Upstream responded");
                self.relay_response(response)
            }
            Err(e) => {
                let message = error_chain(&e);
                self.log(&message);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, &message)
            }
        }
    }

    fn relay_response(&self, response: Response<Incoming>) -> Response<ProxyBody> {
        let logger = self.logger.clone();
        response.map(move |body| {
            body.map_err(move |e| {
                if let Some(logger) = &logger {
                    logger.log(&format!("copying response body failed: {}", e));
                }
                BoxError::from(e)
            })
            .boxed_unsync()
        })
    }

    fn acquire_buffer(&self) -> Vec<u8> {
        match &self.buffer_pool {
            Some(pool) => pool.get(),
            None => vec![0u8; DEFAULT_BUFFER_SIZE],
        }
    }

    fn release_buffer(&self, buf: Vec<u8>) {
        if let Some(pool) = &self.buffer_pool {
            pool.put(buf);
        }
    }

    fn log(&self, message: &dyn std::fmt::Display) {
        if let Some(logger) = &self.logger {
            logger.log(message);
        }
    }
}

/// How the client side of a CONNECT is taken over
enum Takeover {
    /// The server hands over the raw connection after the response head
    Hijack(OnUpgrade),
    /// HTTP/2 stream: the request body is the read side, the response body
    /// the write side
    Flush,
    Unsupported,
}

impl Takeover {
    fn detect(parts: &mut Parts) -> Self {
        if let Some(on_upgrade) = parts.extensions.remove::<OnUpgrade>() {
            Takeover::Hijack(on_upgrade)
        } else if parts.version == Version::HTTP_2 {
            Takeover::Flush
        } else {
            Takeover::Unsupported
        }
    }
}

/// Client side of a CONNECT carried over a single HTTP/2 stream
struct FlushConn {
    reader: StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>,
    writer: PollSender<std::result::Result<Frame<Bytes>, BoxError>>,
}

impl FlushConn {
    fn new(
        body: ProxyBody,
        tx: mpsc::Sender<std::result::Result<Frame<Bytes>, BoxError>>,
    ) -> Self {
        let stream = body.into_data_stream().map_err(io::Error::other).boxed();
        Self {
            reader: StreamReader::new(stream),
            writer: PollSender::new(tx),
        }
    }
}

fn response_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "response stream closed")
}

impl AsyncRead for FlushConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for FlushConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = &mut *self;
        ready!(this.writer.poll_reserve(cx)).map_err(|_| response_closed())?;
        // Each write goes out as its own data frame
        this.writer
            .send_item(Ok(Frame::data(Bytes::copy_from_slice(buf))))
            .map_err(|_| response_closed())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        self.writer.close();
        Poll::Ready(Ok(()))
    }
}

fn box_body<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

fn is_absolute_form(uri: &Uri) -> bool {
    uri.scheme().is_some() && uri.authority().is_some()
}

/// Build the upstream copy of a forwarded request
fn outbound_request(
    parts: Parts,
    body: ProxyBody,
) -> std::result::Result<Request<ProxyBody>, http::Error> {
    let mut builder = Request::builder()
        .method(parts.method)
        .uri(parts.uri)
        .version(Version::HTTP_11);

    // Headers listed in Connection are hop-by-hop too
    let listed: Vec<HeaderName> = parts
        .headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for (name, value) in &parts.headers {
        if !is_hop_by_hop_header(name) && !listed.contains(name) {
            builder = builder.header(name, value);
        }
    }

    builder.body(body)
}

/// Check if a header is a hop-by-hop header that should not be forwarded.
/// Header names are stored lowercase.
fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
