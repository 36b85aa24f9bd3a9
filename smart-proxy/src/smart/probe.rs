use crate::error::DialError;
use crate::tls;
use crate::transport::StreamDialer;
use async_trait::async_trait;

/// Port probed on each test domain.
pub const PROBE_PORT: u16 = 443;

/// Checks whether a candidate dialer can reach a test domain.
#[async_trait]
pub trait StrategyProber: Send + Sync {
    async fn probe(&self, dialer: &StreamDialer, domain: &str) -> Result<(), DialError>;
}

/// Dials `domain:443` through the candidate and completes a TLS handshake with SNI = domain.
#[derive(Debug, Clone, Copy)]
pub struct TlsProber {
    port: u16,
}

impl TlsProber {
    pub fn new() -> Self {
        Self { port: PROBE_PORT }
    }

    pub fn with_port(port: u16) -> Self {
        Self { port }
    }
}

impl Default for TlsProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StrategyProber for TlsProber {
    async fn probe(&self, dialer: &StreamDialer, domain: &str) -> Result<(), DialError> {
        let stream = dialer.dial_host(domain, self.port).await?;
        tls::connect(stream, domain)
            .await
            .map_err(|source| DialError::Handshake {
                host: domain.to_string(),
                source,
            })?;
        Ok(())
    }
}
