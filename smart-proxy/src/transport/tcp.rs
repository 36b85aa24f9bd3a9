use super::BoxedStream;
use super::Dialer;
use async_trait::async_trait;
use std::io;
use tokio::net::TcpStream;

/// Plain TCP with Nagle disabled so wrapping transports control segment boundaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
