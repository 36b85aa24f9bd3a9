use crate::cache::MemoryStrategyCache;
use crate::cache::StrategyCache;
use crate::config::Args;
use crate::config::ProxyConfig;
use crate::error::StartupError;
use crate::file_cache::FileStrategyCache;
use crate::server::ProxyServer;
use crate::smart::SmartDialerOptions;
use crate::smart::StrategyProber;
use crate::transport::StreamDialer;
use anyhow::Context;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing::warn;

/// Grace period granted to in-flight connections when the process is asked to stop.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Default)]
pub struct SmartProxyBuilder {
    config: ProxyConfig,
    cache: Option<Arc<dyn StrategyCache>>,
    prober: Option<Arc<dyn StrategyProber>>,
}

impl SmartProxyBuilder {
    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `cache` instead of the one `config` would open.
    pub fn strategy_cache(mut self, cache: Arc<dyn StrategyCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn prober(mut self, prober: Arc<dyn StrategyProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Builds the dialer, binds the server and mounts the URL proxy.
    pub async fn start(self) -> Result<SmartProxy, StartupError> {
        let cache = match self.cache {
            Some(cache) => Some(cache),
            None => open_strategy_cache(&self.config)?,
        };
        let dialer = build_stream_dialer(&self.config, cache.clone(), self.prober).await?;
        let server = ProxyServer::start(&self.config.local_addr, dialer.clone()).await?;
        if self.config.proxy_path.trim().is_empty() {
            info!("URL proxy disabled");
        } else {
            server.add_url_proxy(&self.config.proxy_path, dialer.clone());
        }

        info!("transport: {}", dialer.transport_config());
        info!("proxy running on {}", server.address());
        Ok(SmartProxy {
            server,
            dialer,
            cache,
        })
    }
}

/// The running proxy: a [`ProxyServer`] bound to the dialer selected from configuration.
pub struct SmartProxy {
    server: ProxyServer,
    dialer: StreamDialer,
    cache: Option<Arc<dyn StrategyCache>>,
}

impl std::fmt::Debug for SmartProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartProxy")
            .field("server", &self.server)
            .field("dialer", &self.dialer)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl SmartProxy {
    pub fn builder() -> SmartProxyBuilder {
        SmartProxyBuilder::default()
    }

    pub async fn start(config: ProxyConfig) -> Result<Self, StartupError> {
        Self::builder().config(config).start().await
    }

    pub fn address(&self) -> SocketAddr {
        self.server.address()
    }

    pub fn dialer(&self) -> &StreamDialer {
        &self.dialer
    }

    pub fn server(&self) -> &ProxyServer {
        &self.server
    }

    pub fn strategy_cache(&self) -> Option<&Arc<dyn StrategyCache>> {
        self.cache.as_ref()
    }

    pub async fn shutdown(self, grace: Duration) {
        self.server.stop(grace).await;
    }
}

/// Builds the top-level dialer: parsed directly, or discovered by probing in smart mode.
pub async fn build_stream_dialer(
    config: &ProxyConfig,
    cache: Option<Arc<dyn StrategyCache>>,
    prober: Option<Arc<dyn StrategyProber>>,
) -> Result<StreamDialer, StartupError> {
    if !config.smart {
        if cache.is_some() {
            warn!("strategy cache has no effect without smart mode");
        }
        return Ok(StreamDialer::from_config(&config.transport)?);
    }

    let mut options = SmartDialerOptions::new(config.domain_list(), config.transport.clone());
    if let Some(cache) = cache {
        options.set_strategy_cache(cache);
    }
    if let Some(prober) = prober {
        options = options.with_prober(prober);
    }
    if let Some(timeout) = config.probe_timeout() {
        options = options.with_probe_timeout(timeout);
    }
    if let Some(selection) = config.selection {
        options = options.with_selection(selection);
    }
    Ok(options.new_stream_dialer().await?)
}

fn open_strategy_cache(
    config: &ProxyConfig,
) -> Result<Option<Arc<dyn StrategyCache>>, StartupError> {
    if !config.caching_enabled() {
        return Ok(None);
    }
    let cache: Arc<dyn StrategyCache> = match &config.cache_file {
        Some(path) => {
            let cache = FileStrategyCache::open(path).map_err(StartupError::Cache)?;
            info!("strategy cache: {}", cache.path().display());
            Arc::new(cache)
        }
        None => Arc::new(MemoryStrategyCache::new()),
    };
    Ok(Some(cache))
}

/// Runs the proxy until Ctrl-C (or SIGTERM on unix), then stops it with [`SHUTDOWN_GRACE`].
pub async fn run_main(args: Args) -> Result<()> {
    let config = ProxyConfig::from_args(&args)?;
    let proxy = SmartProxy::start(config)
        .await
        .context("failed to start smart proxy")?;
    wait_for_shutdown_signal().await?;
    info!("shutdown requested");
    proxy.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl-C"),
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")
}
