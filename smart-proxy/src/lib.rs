#![deny(clippy::print_stdout, clippy::print_stderr)]

mod cache;
mod config;
mod error;
mod file_cache;
mod http_proxy;
mod proxy;
mod relay;
mod responses;
mod server;
mod smart;
mod tls;
mod transport;
mod upstream;
mod url_proxy;

pub use cache::MemoryStrategyCache;
pub use cache::StrategyCache;
pub use config::Args;
pub use config::DEFAULT_LOCAL_ADDR;
pub use config::DEFAULT_PROXY_PATH;
pub use config::ProxyConfig;
pub use error::ConfigError;
pub use error::DialError;
pub use error::RelayError;
pub use error::ServerError;
pub use error::SmartDialerError;
pub use error::StartupError;
pub use file_cache::FileStrategyCache;
pub use proxy::SHUTDOWN_GRACE;
pub use proxy::SmartProxy;
pub use proxy::SmartProxyBuilder;
pub use proxy::build_stream_dialer;
pub use proxy::run_main;
pub use relay::RelayStats;
pub use relay::relay;
pub use server::ProxyServer;
pub use server::ServerState;
pub use smart::DEFAULT_PROBE_TIMEOUT;
pub use smart::DEFAULT_VARIATIONS;
pub use smart::DomainList;
pub use smart::PROBE_PORT;
pub use smart::SelectionPolicy;
pub use smart::SmartConfig;
pub use smart::SmartDialerOptions;
pub use smart::SmartDialerResolver;
pub use smart::StrategyProber;
pub use smart::TlsProber;
pub use transport::BoxedStream;
pub use transport::Dialer;
pub use transport::OverrideDialer;
pub use transport::ProxyStream;
pub use transport::Socks5Dialer;
pub use transport::SplitDialer;
pub use transport::StreamDialer;
pub use transport::TcpDialer;
pub use transport::TlsFragDialer;
pub use transport::TransportConfig;
