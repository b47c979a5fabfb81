//! Read deadlines for accepted connections, and the compatibility shim for
//! connections that outlive the HTTP server which accepted them.
//!
//! The server aborts a pending read by setting the read deadline to
//! [`A_LONG_TIME_AGO`]. Once a connection has been taken over as a tunnel leg
//! that same signal would kill a legitimate blocking read, so
//! [`CompatReadDeadline`] turns the sentinel into a short future deadline.
//! The sentinel must stay equal to the value [`ProxyServer`] uses; revisit
//! this module whenever that changes.
//!
//! [`ProxyServer`]: crate::proxy::server::ProxyServer

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, LazyLock};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, Sleep};

/// Non-zero time far in the past, used to abort a pending read immediately
pub static A_LONG_TIME_AGO: LazyLock<SystemTime> =
    LazyLock::new(|| UNIX_EPOCH + Duration::from_secs(1));

/// Deadline substituted for [`A_LONG_TIME_AGO`] on compat-wrapped connections
pub const COMPAT_READ_GRACE: Duration = Duration::from_secs(1);

/// Capability to move a connection's read deadline. `None` clears it.
pub trait ReadDeadline: Send + Sync {
    fn set_read_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()>;
}

/// A byte stream with a settable read deadline
pub trait DeadlineConn: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Handle that keeps working after the stream itself has been moved
    fn read_deadline(&self) -> Arc<dyn ReadDeadline>;

    fn set_read_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.read_deadline().set_read_deadline(deadline)
    }

    fn is_compat_read_deadline(&self) -> bool {
        false
    }
}

impl DeadlineConn for Box<dyn DeadlineConn> {
    fn read_deadline(&self) -> Arc<dyn ReadDeadline> {
        (**self).read_deadline()
    }

    fn set_read_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        (**self).set_read_deadline(deadline)
    }

    fn is_compat_read_deadline(&self) -> bool {
        (**self).is_compat_read_deadline()
    }
}

#[derive(Debug, Default)]
struct DeadlineState {
    deadline: Option<SystemTime>,
    generation: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<DeadlineState>,
    waker: AtomicWaker,
}

/// Cloneable handle to a [`DeadlineStream`]'s read deadline
#[derive(Debug, Clone, Default)]
pub struct ReadDeadlineHandle {
    shared: Arc<Shared>,
}

impl ReadDeadlineHandle {
    fn snapshot(&self) -> (Option<SystemTime>, u64) {
        let state = self.shared.state.lock();
        (state.deadline, state.generation)
    }
}

impl ReadDeadline for ReadDeadlineHandle {
    fn set_read_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        {
            let mut state = self.shared.state.lock();
            state.deadline = deadline;
            state.generation += 1;
        }
        // A reader parked on the old deadline must re-arm its timer.
        self.shared.waker.wake();
        Ok(())
    }
}

fn to_instant(deadline: SystemTime) -> Instant {
    match deadline.duration_since(SystemTime::now()) {
        Ok(remaining) => Instant::now() + remaining,
        Err(_) => Instant::now(),
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o timeout")
}

pin_project! {
    /// Stream wrapper enforcing a read deadline.
    ///
    /// A read fails with `TimedOut` once the deadline has passed, even if data
    /// is available, until the deadline is moved or cleared. Writes are not
    /// affected.
    pub struct DeadlineStream<S> {
        #[pin]
        inner: S,
        handle: ReadDeadlineHandle,
        seen: u64,
        timer: Option<Pin<Box<Sleep>>>,
    }
}

impl<S> DeadlineStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            handle: ReadDeadlineHandle::default(),
            seen: 0,
            timer: None,
        }
    }

    pub fn handle(&self) -> ReadDeadlineHandle {
        self.handle.clone()
    }

}

impl<S: AsyncRead> AsyncRead for DeadlineStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        this.handle.shared.waker.register(cx.waker());

        let (deadline, generation) = this.handle.snapshot();
        if generation != *this.seen {
            *this.seen = generation;
            *this.timer = deadline.map(|d| Box::pin(tokio::time::sleep_until(to_instant(d))));
        }

        let Some(timer) = this.timer.as_mut() else {
            return this.inner.poll_read(cx, buf);
        };
        if timer.deadline() <= Instant::now() {
            return Poll::Ready(Err(timed_out()));
        }

        match this.inner.poll_read(cx, buf) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => match timer.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Err(timed_out())),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for DeadlineStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

impl<S> DeadlineConn for DeadlineStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn read_deadline(&self) -> Arc<dyn ReadDeadline> {
        Arc::new(self.handle.clone())
    }
}

/// Replace the abort sentinel with a short future deadline
fn compat_deadline(deadline: Option<SystemTime>) -> Option<SystemTime> {
    match deadline {
        Some(t) if t == *A_LONG_TIME_AGO => Some(SystemTime::now() + COMPAT_READ_GRACE),
        other => other,
    }
}

struct CompatHandle(Arc<dyn ReadDeadline>);

impl ReadDeadline for CompatHandle {
    fn set_read_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.0.set_read_deadline(compat_deadline(deadline))
    }
}

/// Connection wrapper that keeps the abort sentinel from cancelling reads
/// on a connection that has been taken over. Any other deadline passes
/// through unchanged.
pub struct CompatReadDeadline<C> {
    inner: C,
}

impl<C: DeadlineConn> CompatReadDeadline<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

/// Wrap a boxed connection, returning it untouched if it is already wrapped
pub fn compat_read_deadline(conn: Box<dyn DeadlineConn>) -> Box<dyn DeadlineConn> {
    if conn.is_compat_read_deadline() {
        conn
    } else {
        Box::new(CompatReadDeadline::new(conn))
    }
}

impl<C: DeadlineConn> AsyncRead for CompatReadDeadline<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<C: DeadlineConn> AsyncWrite for CompatReadDeadline<C> {
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

impl<C: DeadlineConn> DeadlineConn for CompatReadDeadline<C> {
    fn read_deadline(&self) -> Arc<dyn ReadDeadline> {
        Arc::new(CompatHandle(self.inner.read_deadline()))
    }

    fn set_read_deadline(&self, deadline: Option<SystemTime>) -> io::Result<()> {
        self.inner.set_read_deadline(compat_deadline(deadline))
    }

    fn is_compat_read_deadline(&self) -> bool {
        true
    }
}

/// Source of inbound connections for [`ProxyServer`](crate::proxy::server::ProxyServer)
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    type Conn: DeadlineConn;

    async fn accept(&self) -> io::Result<(Self::Conn, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// TCP listener whose connections carry read deadlines
#[derive(Debug)]
pub struct DeadlineListener {
    inner: TcpListener,
}

impl DeadlineListener {
    pub fn new(inner: TcpListener) -> Self {
        Self { inner }
    }

    pub async fn bind(addr: &str) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?))
    }
}

#[async_trait]
impl Listener for DeadlineListener {
    type Conn = DeadlineStream<TcpStream>;

    async fn accept(&self) -> io::Result<(Self::Conn, SocketAddr)> {
        let (stream, addr) = self.inner.accept().await?;
        let _ = stream.set_nodelay(true);
        Ok((DeadlineStream::new(stream), addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Listener wrapper applying [`CompatReadDeadline`] to every accepted connection
#[derive(Debug)]
pub struct CompatListener<L> {
    inner: L,
}

impl<L: Listener> CompatListener<L> {
    pub fn new(inner: L) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<L: Listener> Listener for CompatListener<L> {
    type Conn = CompatReadDeadline<L::Conn>;

    async fn accept(&self) -> io::Result<(Self::Conn, SocketAddr)> {
        let (conn, addr) = self.inner.accept().await?;
        Ok((CompatReadDeadline::new(conn), addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
