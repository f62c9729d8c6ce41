//! Stream wrapper that replays bytes read ahead of the HTTP layer.
//!
//! The negotiator reads the first chunk itself to enforce the idle timeout,
//! then hands the connection to hyper with that chunk pushed back in front.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const PREFACE_BUF_LEN: usize = 4096;

pub struct Rewind<S> {
    inner: S,
    prefix: Vec<u8>,
    pos: usize,
}

impl<S> Rewind<S> {
    pub fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            prefix,
            pos: 0,
        }
    }
}

/// Outcome of waiting for the first application bytes on a connection.
pub enum Preface<S> {
    /// Data arrived; the stream replays it before reading further.
    Ready(Rewind<S>),
    /// Nothing arrived within the idle timeout.
    Idle,
    /// The peer closed or the read failed before sending anything.
    Closed,
}

/// Wait up to `idle_timeout` for the peer to send its first bytes.
pub async fn await_preface<S>(mut stream: S, idle_timeout: Duration) -> Preface<S>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; PREFACE_BUF_LEN];
    match tokio::time::timeout(idle_timeout, stream.read(&mut buf)).await {
        Err(_) => Preface::Idle,
        Ok(Ok(0)) | Ok(Err(_)) => Preface::Closed,
        Ok(Ok(n)) => {
            buf.truncate(n);
            Preface::Ready(Rewind::new(stream, buf))
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.pos += n;
            if self.pos == self.prefix.len() {
                self.prefix = Vec::new();
                self.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
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
