use crate::error::ConfigError;
use crate::transport::TransportConfig;
use crate::transport::parse_transport;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

/// Variations tried against a plain base template.
pub const DEFAULT_VARIATIONS: [&str; 4] = ["", "split:1", "split:2", "tlsfrag:1"];

/// How the resolver picks among viable candidates.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Probe candidates in order and take the first one that reaches a test domain.
    #[default]
    FirstSuccess,
    /// Probe every candidate and take the fastest viable one.
    LowestLatency,
}

/// Structured form of a smart transport string.
///
/// ```yaml
/// base: "override:port=443"
/// tls: ["", "split:1", "tlsfrag:1"]
/// fallback: ["socks5://127.0.0.1:1080"]
/// selection: lowest-latency
/// probe_timeout_ms: 3000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SmartConfig {
    pub base: String,
    /// `None` means [`DEFAULT_VARIATIONS`]; an explicit empty list probes the base alone.
    pub tls: Option<Vec<String>>,
    pub fallback: Vec<String>,
    pub selection: Option<SelectionPolicy>,
    pub probe_timeout_ms: Option<u64>,
    /// DNS strategies are accepted for compatibility but resolution always uses the system
    /// resolver.
    dns: Option<serde_yaml::Value>,
}

impl SmartConfig {
    /// Parses YAML or JSON. Anything that is not a mapping is taken as the base template.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let value = match serde_yaml::from_str::<serde_yaml::Value>(trimmed) {
            Ok(value) => value,
            Err(_) => return Ok(Self::from_base(trimmed)),
        };
        let config = match value {
            serde_yaml::Value::Mapping(_) => serde_yaml::from_value::<Self>(value)
                .map_err(|err| ConfigError::InvalidSmartConfig(err.to_string()))?,
            serde_yaml::Value::Null => Self::default(),
            serde_yaml::Value::String(base) => Self::from_base(&base),
            _ => {
                return Err(ConfigError::InvalidSmartConfig(
                    "expected a mapping or a transport string".to_string(),
                ));
            }
        };
        if config.dns.is_some() {
            warn!("smart config `dns` entries are ignored; the system resolver is used");
        }
        Ok(config)
    }

    pub fn from_base(base: &str) -> Self {
        Self {
            base: base.trim().to_string(),
            ..Self::default()
        }
    }

    pub fn probe_timeout(&self) -> Option<Duration> {
        self.probe_timeout_ms.map(Duration::from_millis)
    }

    /// Expands the config into validated, de-duplicated candidates in probe order.
    pub fn candidates(&self) -> Result<Vec<TransportConfig>, ConfigError> {
        let variations: Vec<&str> = match &self.tls {
            Some(tls) if tls.is_empty() => vec![""],
            Some(tls) => tls.iter().map(String::as_str).collect(),
            None => DEFAULT_VARIATIONS.to_vec(),
        };

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let combined = variations
            .into_iter()
            .map(|variation| join_parts(&self.base, variation));
        let fallbacks = self.fallback.iter().map(|fallback| fallback.trim().to_string());
        for config in combined.chain(fallbacks) {
            parse_transport(&config)?;
            let candidate = TransportConfig::new(config);
            if seen.insert(candidate.clone()) {
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }
}

fn join_parts(base: &str, variation: &str) -> String {
    [base.trim(), variation.trim()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("|")
}

/// Ordered, de-duplicated set of domains used to test candidate strategies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainList(Vec<String>);

impl DomainList {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for domain in domains {
            let domain = domain.as_ref().trim();
            if !domain.is_empty() && seen.insert(domain.to_string()) {
                out.push(domain.to_string());
            }
        }
        Self(out)
    }

    /// Builds a list from newline-delimited text, ignoring blank lines.
    pub fn from_lines(text: &str) -> Self {
        Self::new(text.lines())
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
