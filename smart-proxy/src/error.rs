use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// A transport or smart-dialer configuration could not be parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported transport `{0}`")]
    UnsupportedTransport(String),
    #[error("invalid transport part `{part}`: {reason}")]
    InvalidPart { part: String, reason: String },
    #[error("invalid smart dialer config: {0}")]
    InvalidSmartConfig(String),
}

impl ConfigError {
    pub(crate) fn invalid_part(part: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPart {
            part: part.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SmartDialerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("smart dialer requires at least one test domain")]
    NoTestDomains,
    #[error("could not find a working strategy: {attempted} candidate(s) failed for [{domains}]")]
    NoViableStrategy { attempted: usize, domains: String },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("address already in use: {addr}")]
    AddressInUse {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("invalid listen address `{addr}`: {reason}")]
    InvalidAddress { addr: String, reason: String },
    #[error("failed to bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl ServerError {
    pub(crate) fn invalid_address(addr: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            addr: addr.to_string(),
            reason: reason.into(),
        }
    }
}

/// Opening a connection to a remote address failed.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid dial address `{0}`")]
    InvalidAddress(String),
    #[error("failed to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("TLS handshake with {host} failed")]
    Handshake {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("dial timed out after {0:?}")]
    Timeout(Duration),
}

/// Mid-stream failure while relaying between a client and a remote.
#[derive(Debug, Error)]
#[error("relay to {target} failed")]
pub struct RelayError {
    pub target: String,
    #[source]
    pub source: io::Error,
}

/// Anything that can abort startup. These are never retried.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Smart(#[from] SmartDialerError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("failed to open strategy cache")]
    Cache(#[source] anyhow::Error),
}
