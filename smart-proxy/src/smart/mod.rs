//! Discovers a transport that reaches a set of test domains.
//!
//! Candidates come from a [`SmartConfig`]. A cached strategy for any test domain is trusted
//! without probing; otherwise candidates are probed with a [`StrategyProber`] and the winner is
//! remembered under every domain it reached.

mod config;
mod probe;

use crate::cache::StrategyCache;
use crate::cache::StrategyMemo;
use crate::error::ConfigError;
use crate::error::SmartDialerError;
use crate::transport::StreamDialer;
use crate::transport::TransportConfig;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use config::DEFAULT_VARIATIONS;
pub use config::DomainList;
pub use config::SelectionPolicy;
pub use config::SmartConfig;
pub use probe::PROBE_PORT;
pub use probe::StrategyProber;
pub use probe::TlsProber;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Inputs for building a smart [`StreamDialer`].
///
/// Timeout and selection set here take precedence over the values in the smart config.
#[derive(Clone)]
pub struct SmartDialerOptions {
    test_domains: DomainList,
    config: String,
    cache: Option<Arc<dyn StrategyCache>>,
    prober: Arc<dyn StrategyProber>,
    probe_timeout: Option<Duration>,
    selection: Option<SelectionPolicy>,
}

impl std::fmt::Debug for SmartDialerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartDialerOptions")
            .field("test_domains", &self.test_domains)
            .field("config", &self.config)
            .field("cache", &self.cache.is_some())
            .field("probe_timeout", &self.probe_timeout)
            .field("selection", &self.selection)
            .finish_non_exhaustive()
    }
}

impl SmartDialerOptions {
    pub fn new(test_domains: DomainList, config: impl Into<String>) -> Self {
        Self {
            test_domains,
            config: config.into(),
            cache: None,
            prober: Arc::new(TlsProber::new()),
            probe_timeout: None,
            selection: None,
        }
    }

    pub fn set_strategy_cache(&mut self, cache: Arc<dyn StrategyCache>) {
        self.cache = Some(cache);
    }

    pub fn with_strategy_cache(mut self, cache: Arc<dyn StrategyCache>) -> Self {
        self.set_strategy_cache(cache);
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn StrategyProber>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    pub fn with_selection(mut self, selection: SelectionPolicy) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn test_domains(&self) -> &DomainList {
        &self.test_domains
    }

    /// Parses the smart config into a resolver without probing anything.
    pub fn resolver(&self) -> Result<SmartDialerResolver, ConfigError> {
        let config = SmartConfig::parse(&self.config)?;
        let candidates = config.candidates()?;
        Ok(SmartDialerResolver {
            candidates,
            memo: self.cache.clone().map(StrategyMemo::new),
            prober: Arc::clone(&self.prober),
            probe_timeout: self
                .probe_timeout
                .or_else(|| config.probe_timeout())
                .unwrap_or(DEFAULT_PROBE_TIMEOUT),
            selection: self.selection.or(config.selection).unwrap_or_default(),
        })
    }

    /// Resolves a dialer that reaches at least one of the test domains.
    pub async fn new_stream_dialer(&self) -> Result<StreamDialer, SmartDialerError> {
        let resolver = self.resolver()?;
        resolver.resolve_any(self.test_domains.as_slice()).await
    }
}

pub struct SmartDialerResolver {
    candidates: Vec<TransportConfig>,
    memo: Option<StrategyMemo>,
    prober: Arc<dyn StrategyProber>,
    probe_timeout: Duration,
    selection: SelectionPolicy,
}

impl std::fmt::Debug for SmartDialerResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartDialerResolver")
            .field("candidates", &self.candidates)
            .field("probe_timeout", &self.probe_timeout)
            .field("selection", &self.selection)
            .finish_non_exhaustive()
    }
}

struct ProbeOutcome {
    dialer: StreamDialer,
    reached: Vec<String>,
    latency: Duration,
}

impl SmartDialerResolver {
    pub fn candidates(&self) -> &[TransportConfig] {
        &self.candidates
    }

    pub fn selection(&self) -> SelectionPolicy {
        self.selection
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    pub async fn resolve(&self, domain: &str) -> Result<StreamDialer, SmartDialerError> {
        self.resolve_any(&[domain]).await
    }

    /// Returns a dialer for the first domain with a usable cached strategy, or the best
    /// candidate found by probing all `domains`.
    pub async fn resolve_any<S: AsRef<str>>(
        &self,
        domains: &[S],
    ) -> Result<StreamDialer, SmartDialerError> {
        let domains: Vec<&str> = domains
            .iter()
            .map(|domain| domain.as_ref().trim())
            .filter(|domain| !domain.is_empty())
            .collect();
        if domains.is_empty() {
            return Err(SmartDialerError::NoTestDomains);
        }

        let mut stale = Vec::new();
        if let Some(dialer) = self.cached_dialer(&domains, &mut stale) {
            self.update_cache(stale, None).await;
            return Ok(dialer);
        }

        let winner = match self.selection {
            SelectionPolicy::FirstSuccess => self.first_success(&domains).await,
            SelectionPolicy::LowestLatency => self.lowest_latency(&domains).await,
        };
        let Some(winner) = winner else {
            return Err(SmartDialerError::NoViableStrategy {
                attempted: self.candidates.len(),
                domains: domains.join(", "),
            });
        };

        let transport = winner.dialer.transport_config();
        info!(
            "selected transport {transport} in {:?} (reached {})",
            winner.latency,
            winner.reached.join(", ")
        );
        let persisted = transport.persisted().to_string();
        self.update_cache(stale, Some((winner.reached, persisted))).await;
        Ok(winner.dialer)
    }

    /// Unparseable entries are collected into `stale` and left in place; the cache is only
    /// touched once resolution has succeeded.
    fn cached_dialer(&self, domains: &[&str], stale: &mut Vec<String>) -> Option<StreamDialer> {
        let memo = self.memo.as_ref()?;
        for domain in domains {
            let Some(cached) = memo.lookup(domain) else {
                continue;
            };
            match StreamDialer::from_config(&cached) {
                Ok(dialer) => {
                    info!("using cached transport for {domain}: {cached}");
                    return Some(dialer);
                }
                Err(err) => {
                    warn!("ignoring unusable cached transport for {domain} ({cached}): {err}");
                    stale.push((*domain).to_string());
                }
            }
        }
        None
    }

    /// Stores `winner` under the domains it reached and evicts the remaining `stale` entries.
    ///
    /// Cache writes may hit the disk, so they run on the blocking pool.
    async fn update_cache(&self, stale: Vec<String>, winner: Option<(Vec<String>, String)>) {
        let Some(memo) = self.memo.clone() else {
            return;
        };
        if stale.is_empty() && winner.is_none() {
            return;
        }
        let update = tokio::task::spawn_blocking(move || {
            let (reached, transport) = winner.unwrap_or_default();
            for domain in &reached {
                memo.remember(domain, &transport);
            }
            for domain in stale.iter().filter(|domain| !reached.contains(domain)) {
                debug!("evicting unusable cached transport for {domain}");
                memo.forget(domain);
            }
        });
        if let Err(err) = update.await {
            warn!("strategy cache update failed: {err}");
        }
    }

    async fn first_success(&self, domains: &[&str]) -> Option<ProbeOutcome> {
        for candidate in &self.candidates {
            if let Some(outcome) = self.probe_candidate(candidate, domains).await {
                return Some(outcome);
            }
        }
        None
    }

    async fn lowest_latency(&self, domains: &[&str]) -> Option<ProbeOutcome> {
        let outcomes = join_all(
            self.candidates
                .iter()
                .map(|candidate| self.probe_candidate(candidate, domains)),
        )
        .await;
        fastest(outcomes)
    }

    async fn probe_candidate(
        &self,
        candidate: &TransportConfig,
        domains: &[&str],
    ) -> Option<ProbeOutcome> {
        let dialer = match StreamDialer::from_config(candidate.as_str()) {
            Ok(dialer) => dialer,
            Err(err) => {
                warn!("skipping candidate {candidate}: {err}");
                return None;
            }
        };

        let probes = domains.iter().map(|domain| {
            let dialer = &dialer;
            async move {
                let started = Instant::now();
                let result =
                    tokio::time::timeout(self.probe_timeout, self.prober.probe(dialer, domain))
                        .await;
                (*domain, result, started.elapsed())
            }
        });

        let mut reached = Vec::new();
        let mut latency = Duration::ZERO;
        for (domain, result, elapsed) in join_all(probes).await {
            match result {
                Ok(Ok(())) => {
                    debug!("candidate {candidate} reached {domain} in {elapsed:?}");
                    reached.push(domain.to_string());
                    latency = latency.max(elapsed);
                }
                Ok(Err(err)) => debug!("candidate {candidate} failed for {domain}: {err}"),
                Err(_) => debug!(
                    "candidate {candidate} timed out for {domain} after {:?}",
                    self.probe_timeout
                ),
            }
        }

        if reached.is_empty() {
            None
        } else {
            Some(ProbeOutcome {
                dialer,
                reached,
                latency,
            })
        }
    }
}

/// Ties go to the earlier candidate.
fn fastest(outcomes: Vec<Option<ProbeOutcome>>) -> Option<ProbeOutcome> {
    outcomes
        .into_iter()
        .flatten()
        .min_by_key(|outcome| outcome.latency)
}
