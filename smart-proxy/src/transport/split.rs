use super::BoxedStream;
use super::Dialer;
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::ready;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::ReadBuf;

/// Sends the first `prefix_len` bytes of the stream as their own write.
pub struct SplitDialer {
    inner: Arc<dyn Dialer>,
    prefix_len: usize,
}

impl SplitDialer {
    pub fn new(inner: Arc<dyn Dialer>, prefix_len: usize) -> Self {
        Self { inner, prefix_len }
    }
}

#[async_trait]
impl Dialer for SplitDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = self.inner.dial(host, port).await?;
        Ok(Box::new(SplitStream::new(stream, self.prefix_len)))
    }
}

pub(crate) struct SplitStream<S> {
    inner: S,
    remaining: usize,
}

impl<S> SplitStream<S> {
    pub(crate) fn new(inner: S, prefix_len: usize) -> Self {
        Self {
            inner,
            remaining: prefix_len,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SplitStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SplitStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.remaining == 0 || buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        let limit = this.remaining.min(buf.len());
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..limit]))?;
        this.remaining -= written;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
