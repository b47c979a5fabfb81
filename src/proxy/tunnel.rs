//! Bidirectional tunnel between two byte streams
//!
//! Both directions run concurrently until either one reaches end-of-stream or
//! fails. The first to finish cancels the other; both streams are then shut
//! down exactly once.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::context::Context;
use crate::error::{ProxyError, Result};
use crate::proxy::pool::DEFAULT_BUFFER_SIZE;

/// How one copy loop ended
enum Finish {
    /// The loop ran to completion: source EOF or an I/O error
    Done(io::Result<u64>),
    /// The shared scope ended first
    Stopped(ProxyError),
}

/// Relay `a` and `b` into each other until either side closes or errors.
///
/// `buf_a` carries data from `b` into `a`, `buf_b` from `a` into `b`. The
/// returned error is the first of: the copy into `a`, the copy into `b`,
/// closing `a`, closing `b`, and the context. A plain cancellation is not
/// reported; an elapsed context deadline is.
#[instrument(skip_all)]
pub async fn tunnel<A, B>(
    ctx: &Context,
    a: A,
    b: B,
    buf_a: &mut [u8],
    buf_b: &mut [u8],
) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let scope = ctx.with_cancel();
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let (into_a, into_b) = tokio::join!(
        relay(&scope, &mut b_read, &mut a_write, buf_a),
        relay(&scope, &mut a_read, &mut b_write, buf_b),
    );

    let mut a = a_read.unsplit(a_write);
    let mut b = b_read.unsplit(b_write);
    let close_a = close(&mut a).await;
    let close_b = close(&mut b).await;
    drop(a);
    drop(b);

    let mut stopped = None;
    let mut copy_errors = Vec::with_capacity(2);
    for finish in [into_a, into_b] {
        match finish {
            Finish::Done(Ok(bytes)) => debug!(bytes, "tunnel direction finished"),
            Finish::Done(Err(e)) => copy_errors.push(e),
            Finish::Stopped(ProxyError::Canceled) => {}
            Finish::Stopped(e) => {
                stopped.get_or_insert(e);
            }
        }
    }

    debug!("Tunnel closed");

    if let Some(e) = copy_errors.into_iter().next() {
        return Err(e.into());
    }
    close_a?;
    close_b?;
    match stopped {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn relay<R, W>(scope: &Context, reader: &mut R, writer: &mut W, buf: &mut [u8]) -> Finish
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let finish = tokio::select! {
        biased;
        err = scope.done() => Finish::Stopped(err),
        result = copy_buffer(reader, writer, buf) => Finish::Done(result),
    };
    scope.cancel();
    finish
}

/// Copy until EOF, flushing after every chunk so nothing lingers in
/// buffered writers
async fn copy_buffer<R, W>(reader: &mut R, writer: &mut W, buf: &mut [u8]) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut fallback;
    let buf = if buf.is_empty() {
        fallback = vec![0u8; DEFAULT_BUFFER_SIZE];
        &mut fallback[..]
    } else {
        buf
    };

    let mut total = 0u64;
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}

async fn close<S: AsyncWrite + Unpin>(stream: &mut S) -> io::Result<()> {
    match stream.shutdown().await {
        // The peer already tore the connection down.
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}
