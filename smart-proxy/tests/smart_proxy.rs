#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use anyhow::Result;
use async_trait::async_trait;
use common::send_raw;
use common::spawn_origin;
use common::status_line;
use pretty_assertions::assert_eq;
use smart_proxy::ConfigError;
use smart_proxy::DialError;
use smart_proxy::FileStrategyCache;
use smart_proxy::ProxyConfig;
use smart_proxy::ServerError;
use smart_proxy::SmartDialerError;
use smart_proxy::SmartProxy;
use smart_proxy::StartupError;
use smart_proxy::StrategyCache;
use smart_proxy::StrategyProber;
use smart_proxy::StreamDialer;
use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Accepts a single candidate transport and counts every probe.
struct AcceptOnly {
    transport: &'static str,
    probes: AtomicUsize,
}

impl AcceptOnly {
    fn new(transport: &'static str) -> Arc<Self> {
        Arc::new(Self {
            transport,
            probes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl StrategyProber for AcceptOnly {
    async fn probe(&self, dialer: &StreamDialer, domain: &str) -> Result<(), DialError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if dialer.transport_config().as_str() == self.transport {
            Ok(())
        } else {
            Err(DialError::Connect {
                addr: format!("{domain}:443"),
                source: io::Error::from(io::ErrorKind::ConnectionReset),
            })
        }
    }
}

fn local_config() -> ProxyConfig {
    ProxyConfig {
        local_addr: "127.0.0.1:0".to_string(),
        ..ProxyConfig::default()
    }
}

fn smart_config(cache_file: &std::path::Path) -> ProxyConfig {
    ProxyConfig {
        transport: "tls: ['split:1', 'tlsfrag:1']".to_string(),
        domains: vec!["example.com".to_string()],
        smart: true,
        cache_file: Some(cache_file.to_path_buf()),
        ..local_config()
    }
}

#[tokio::test]
async fn direct_mode_serves_the_url_proxy_through_the_configured_transport() -> Result<()> {
    let (origin, request_head) = spawn_origin("through split").await;
    let proxy = SmartProxy::start(ProxyConfig {
        transport: "split:1".to_string(),
        ..local_config()
    })
    .await?;
    assert_eq!(proxy.dialer().transport_config().as_str(), "split:1");
    assert!(proxy.strategy_cache().is_none());

    let response = send_raw(
        proxy.address(),
        &format!("GET /proxy/http://{origin}/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"),
    )
    .await;
    assert_eq!(status_line(&response), "HTTP/1.1 200 OK");
    assert!(response.ends_with("through split"), "{response}");
    assert!(request_head.await?.starts_with("GET / HTTP/1.1\r\n"));

    proxy.shutdown(Duration::ZERO).await;
    Ok(())
}

#[tokio::test]
async fn empty_proxy_path_disables_the_url_proxy() -> Result<()> {
    let proxy = SmartProxy::start(ProxyConfig {
        proxy_path: String::new(),
        ..local_config()
    })
    .await?;

    let response = send_raw(
        proxy.address(),
        "GET /proxy/http://127.0.0.1:1/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(status_line(&response), "HTTP/1.1 404 Not Found");

    proxy.shutdown(Duration::ZERO).await;
    Ok(())
}

#[tokio::test]
async fn smart_mode_persists_the_winner_and_reuses_it() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache_path = dir.path().join("strategies.json");

    let prober = AcceptOnly::new("tlsfrag:1");
    let proxy = SmartProxy::builder()
        .config(smart_config(&cache_path))
        .prober(prober.clone())
        .start()
        .await?;
    assert_eq!(proxy.dialer().transport_config().as_str(), "tlsfrag:1");
    assert_eq!(prober.probes.load(Ordering::SeqCst), 2);
    proxy.shutdown(Duration::ZERO).await;

    let reopened = FileStrategyCache::open(&cache_path)?;
    assert_eq!(reopened.get("example.com"), "tlsfrag:1");

    let untouched = AcceptOnly::new("split:1");
    let proxy = SmartProxy::builder()
        .config(smart_config(&cache_path))
        .prober(untouched.clone())
        .start()
        .await?;
    assert_eq!(proxy.dialer().transport_config().as_str(), "tlsfrag:1");
    assert_eq!(untouched.probes.load(Ordering::SeqCst), 0);
    proxy.shutdown(Duration::ZERO).await;
    Ok(())
}

#[tokio::test]
async fn smart_mode_without_a_viable_strategy_fails_startup() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache_path = dir.path().join("strategies.json");

    let err = SmartProxy::builder()
        .config(smart_config(&cache_path))
        .prober(AcceptOnly::new("override:port=1"))
        .start()
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            StartupError::Smart(SmartDialerError::NoViableStrategy { attempted: 2, .. })
        ),
        "{err:?}"
    );
    assert!(!cache_path.exists());
    Ok(())
}

#[tokio::test]
async fn unsupported_transport_fails_startup() {
    let err = SmartProxy::start(ProxyConfig {
        transport: "ss://YWVzLTEyOC1nY206c2VjcmV0@127.0.0.1:8388".to_string(),
        ..local_config()
    })
    .await
    .unwrap_err();
    assert!(
        matches!(err, StartupError::Config(ConfigError::UnsupportedTransport(_))),
        "{err:?}"
    );
}

#[tokio::test]
async fn bind_failure_fails_startup() -> Result<()> {
    let first = SmartProxy::start(local_config()).await?;
    let err = SmartProxy::start(ProxyConfig {
        local_addr: first.address().to_string(),
        ..local_config()
    })
    .await
    .unwrap_err();
    assert!(
        matches!(err, StartupError::Server(ServerError::AddressInUse { .. })),
        "{err:?}"
    );
    first.shutdown(Duration::ZERO).await;
    Ok(())
}
