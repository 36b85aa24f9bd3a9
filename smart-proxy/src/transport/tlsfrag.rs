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

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Splits the first TLS handshake record (the ClientHello) into two records.
pub struct TlsFragDialer {
    inner: Arc<dyn Dialer>,
    split_at: usize,
}

impl TlsFragDialer {
    pub fn new(inner: Arc<dyn Dialer>, split_at: usize) -> Self {
        Self { inner, split_at }
    }
}

#[async_trait]
impl Dialer for TlsFragDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = self.inner.dial(host, port).await?;
        Ok(Box::new(TlsFragStream::new(stream, self.split_at)))
    }
}

enum FragState {
    /// Buffering the first record until it is complete.
    Collecting(Vec<u8>),
    Draining { out: Vec<u8>, pos: usize },
    Passthrough,
}

pub(crate) struct TlsFragStream<S> {
    inner: S,
    split_at: usize,
    state: FragState,
}

impl<S> TlsFragStream<S> {
    pub(crate) fn new(inner: S, split_at: usize) -> Self {
        Self {
            inner,
            split_at,
            state: FragState::Collecting(Vec::new()),
        }
    }

    /// Gives up on fragmenting and emits whatever was buffered unchanged.
    fn release_partial(&mut self) {
        if let FragState::Collecting(head) = &mut self.state
            && !head.is_empty()
        {
            let out = std::mem::take(head);
            self.state = FragState::Draining { out, pos: 0 };
        }
    }
}

impl<S: AsyncWrite + Unpin> TlsFragStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            let FragState::Draining { out, pos } = &mut self.state else {
                return Poll::Ready(Ok(()));
            };
            if *pos >= out.len() {
                self.state = FragState::Passthrough;
                return Poll::Ready(Ok(()));
            }
            let written = ready!(Pin::new(&mut self.inner).poll_write(cx, &out[*pos..]))?;
            if written == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            *pos += written;
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TlsFragStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TlsFragStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        let FragState::Collecting(head) = &mut this.state else {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        };
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let consumed = collect_record(head, buf);
        if let Some(out) = finish_record(head, this.split_at) {
            this.state = FragState::Draining { out, pos: 0 };
            // The bytes are accepted either way; a pending drain resumes on the next call.
            if let Poll::Ready(Err(err)) = this.poll_drain(cx) {
                return Poll::Ready(Err(err));
            }
        }
        Poll::Ready(Ok(consumed))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.release_partial();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.release_partial();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Appends bytes of the first record from `buf` to `head`, returning how many were taken.
fn collect_record(head: &mut Vec<u8>, buf: &[u8]) -> usize {
    let mut consumed = 0;
    while consumed < buf.len() {
        let target = record_target_len(head);
        if head.len() >= target {
            break;
        }
        let take = (target - head.len()).min(buf.len() - consumed);
        head.extend_from_slice(&buf[consumed..consumed + take]);
        consumed += take;
        if head.len() == RECORD_HEADER_LEN && head[0] != CONTENT_TYPE_HANDSHAKE {
            break;
        }
    }
    consumed
}

fn record_target_len(head: &[u8]) -> usize {
    if head.len() < RECORD_HEADER_LEN {
        RECORD_HEADER_LEN
    } else {
        RECORD_HEADER_LEN + usize::from(u16::from_be_bytes([head[3], head[4]]))
    }
}

/// Returns the bytes to send once the first record is decided, or `None` while collecting.
fn finish_record(head: &mut Vec<u8>, split_at: usize) -> Option<Vec<u8>> {
    if head.len() < RECORD_HEADER_LEN {
        return None;
    }
    if head[0] != CONTENT_TYPE_HANDSHAKE {
        return Some(std::mem::take(head));
    }
    if head.len() < record_target_len(head) {
        return None;
    }
    let record = std::mem::take(head);
    Some(fragment_record(&record, split_at))
}

fn fragment_record(record: &[u8], split_at: usize) -> Vec<u8> {
    let payload = &record[RECORD_HEADER_LEN..];
    if split_at >= payload.len() {
        return record.to_vec();
    }
    let (first, second) = payload.split_at(split_at);
    let mut out = Vec::with_capacity(record.len() + RECORD_HEADER_LEN);
    for chunk in [first, second] {
        out.extend_from_slice(&record[..3]);
        // Each chunk is a slice of a u16-sized payload.
        out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
        out.extend_from_slice(chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::WriteRecorder;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;

    fn handshake_record(payload: &[u8]) -> Vec<u8> {
        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        record.extend_from_slice(payload);
        record
    }

    #[tokio::test]
    async fn splits_client_hello_across_two_records() {
        let payload = b"0123456789";
        let record = handshake_record(payload);

        let mut stream = TlsFragStream::new(WriteRecorder::default(), 3);
        stream.write_all(&record[..2]).await.unwrap();
        stream.write_all(&record[2..]).await.unwrap();
        stream.write_all(b"tail").await.unwrap();
        stream.flush().await.unwrap();

        let mut expected = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01, 0x00, 0x03];
        expected.extend_from_slice(b"012");
        expected.extend_from_slice(&[CONTENT_TYPE_HANDSHAKE, 0x03, 0x01, 0x00, 0x07]);
        expected.extend_from_slice(b"3456789");
        expected.extend_from_slice(b"tail");
        assert_eq!(stream.inner.concat(), expected);
    }

    #[tokio::test]
    async fn leaves_non_handshake_traffic_alone() {
        let mut data = vec![0x17, 0x03, 0x03, 0x00, 0x02, 0xaa, 0xbb];
        data.extend_from_slice(b"more");

        let mut stream = TlsFragStream::new(WriteRecorder::default(), 1);
        stream.write_all(&data).await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(stream.inner.concat(), data);
    }

    #[tokio::test]
    async fn split_beyond_payload_keeps_record_whole() {
        let record = handshake_record(b"abc");
        let mut stream = TlsFragStream::new(WriteRecorder::default(), 10);
        stream.write_all(&record).await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(stream.inner.concat(), record);
    }

    #[tokio::test]
    async fn flush_releases_partial_record() {
        let mut stream = TlsFragStream::new(WriteRecorder::default(), 1);
        stream.write_all(&[CONTENT_TYPE_HANDSHAKE, 0x03]).await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(
            stream.inner.concat(),
            vec![CONTENT_TYPE_HANDSHAKE, 0x03]
        );
    }
}
