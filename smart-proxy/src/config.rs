use crate::smart::DomainList;
use crate::smart::SelectionPolicy;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LOCAL_ADDR: &str = "localhost:8080";
pub const DEFAULT_PROXY_PATH: &str = "/proxy";

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "smart-proxy",
    about = "Local forwarding proxy that discovers a working transport"
)]
pub struct Args {
    /// Transport config, or a YAML/JSON smart config when `--smart` is set.
    #[arg(long)]
    pub transport: Option<String>,

    /// Newline-separated domains used to test strategies in smart mode.
    #[arg(long)]
    pub domain: Option<String>,

    /// Discover a working transport by probing the test domains.
    #[arg(long)]
    pub smart: bool,

    /// Remember discovered strategies in memory.
    #[arg(long)]
    pub cache: bool,

    /// Remember discovered strategies in a JSON file. Implies `--cache`.
    #[arg(long, value_name = "PATH")]
    pub cache_file: Option<PathBuf>,

    /// Listen address; an empty port picks an ephemeral one.
    #[arg(long, visible_alias = "localAddr", value_name = "HOST:PORT")]
    pub local_addr: Option<String>,

    /// Mount path of the URL proxy; empty disables it.
    #[arg(long, visible_alias = "proxyPath", value_name = "PATH")]
    pub proxy_path: Option<String>,

    /// Per-probe timeout in smart mode.
    #[arg(long, value_name = "MS")]
    pub probe_timeout_ms: Option<u64>,

    #[arg(long, value_enum)]
    pub selection: Option<SelectionPolicy>,

    /// TOML file with defaults for every flag above.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

/// Runtime configuration: the optional TOML file with CLI flags layered on top.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    pub transport: String,
    pub domains: Vec<String>,
    pub smart: bool,
    pub cache: bool,
    pub cache_file: Option<PathBuf>,
    pub local_addr: String,
    pub proxy_path: String,
    pub probe_timeout_ms: Option<u64>,
    pub selection: Option<SelectionPolicy>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            transport: String::new(),
            domains: Vec::new(),
            smart: false,
            cache: false,
            cache_file: None,
            local_addr: DEFAULT_LOCAL_ADDR.to_string(),
            proxy_path: DEFAULT_PROXY_PATH.to_string(),
            probe_timeout_ms: None,
            selection: None,
        }
    }
}

impl ProxyConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_args(args);
        Ok(config)
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(transport) = &args.transport {
            self.transport = transport.clone();
        }
        if let Some(domain) = &args.domain {
            self.domains = DomainList::from_lines(domain).as_slice().to_vec();
        }
        self.smart |= args.smart;
        self.cache |= args.cache;
        if let Some(cache_file) = &args.cache_file {
            self.cache_file = Some(cache_file.clone());
        }
        if let Some(local_addr) = &args.local_addr {
            self.local_addr = local_addr.clone();
        }
        if let Some(proxy_path) = &args.proxy_path {
            self.proxy_path = proxy_path.clone();
        }
        if args.probe_timeout_ms.is_some() {
            self.probe_timeout_ms = args.probe_timeout_ms;
        }
        if args.selection.is_some() {
            self.selection = args.selection;
        }
    }

    pub fn domain_list(&self) -> DomainList {
        DomainList::new(&self.domains)
    }

    pub fn caching_enabled(&self) -> bool {
        self.cache || self.cache_file.is_some()
    }

    pub fn probe_timeout(&self) -> Option<Duration> {
        self.probe_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_cli_conventions() {
        let config = ProxyConfig::from_args(&Args::default()).unwrap();
        assert_eq!(config.local_addr, "localhost:8080");
        assert_eq!(config.proxy_path, "/proxy");
        assert!(!config.smart);
        assert!(!config.caching_enabled());
        assert_eq!(config.probe_timeout(), None);
    }

    #[test]
    fn cli_flags_override_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smart-proxy.toml");
        std::fs::write(
            &path,
            r#"
transport = "split:2"
domains = ["example.com", "example.org"]
local_addr = "127.0.0.1:9000"
selection = "lowest-latency"
probe_timeout_ms = 1500
"#,
        )
        .unwrap();

        let args = Args::parse_from([
            "smart-proxy",
            "--config",
            path.to_str().unwrap(),
            "--domain",
            "example.net\n\nexample.net\n",
            "--smart",
            "--localAddr",
            "127.0.0.1:0",
            "--proxy-path",
            "",
        ]);
        let config = ProxyConfig::from_args(&args).unwrap();

        assert_eq!(
            config,
            ProxyConfig {
                transport: "split:2".to_string(),
                domains: vec!["example.net".to_string()],
                smart: true,
                cache: false,
                cache_file: None,
                local_addr: "127.0.0.1:0".to_string(),
                proxy_path: String::new(),
                probe_timeout_ms: Some(1500),
                selection: Some(SelectionPolicy::LowestLatency),
            }
        );
    }

    #[test]
    fn cache_file_implies_caching() {
        let args = Args::parse_from(["smart-proxy", "--cache-file", "/tmp/strategies.json"]);
        let config = ProxyConfig::from_args(&args).unwrap();
        assert!(config.caching_enabled());
        assert!(!config.cache);
    }

    #[test]
    fn unreadable_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "local_addr = [").unwrap();
        let err = ProxyConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config"), "{err}");
    }
}
