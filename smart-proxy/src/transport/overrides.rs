use super::BoxedStream;
use super::Dialer;
use super::TransportPart;
use crate::error::ConfigError;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;

/// Rewrites the dialed host and/or port before handing off to the inner dialer.
pub struct OverrideDialer {
    inner: Arc<dyn Dialer>,
    host: Option<String>,
    port: Option<u16>,
}

impl OverrideDialer {
    pub fn new(inner: Arc<dyn Dialer>, host: Option<String>, port: Option<u16>) -> Self {
        Self { inner, host, port }
    }
}

#[async_trait]
impl Dialer for OverrideDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let host = self.host.as_deref().unwrap_or(host);
        let port = self.port.unwrap_or(port);
        self.inner.dial(host, port).await
    }
}

pub(super) fn parse_override(part: &str, params: &str) -> Result<TransportPart, ConfigError> {
    let mut host = None;
    let mut port = None;
    for (key, value) in url::form_urlencoded::parse(params.trim().as_bytes()) {
        match key.as_ref() {
            "host" => {
                if value.is_empty() {
                    return Err(ConfigError::invalid_part(part, "empty host"));
                }
                host = Some(value.into_owned());
            }
            "port" => {
                let parsed = value
                    .parse::<u16>()
                    .ok()
                    .filter(|port| *port != 0)
                    .ok_or_else(|| ConfigError::invalid_part(part, "invalid port"))?;
                port = Some(parsed);
            }
            other => {
                return Err(ConfigError::invalid_part(
                    part,
                    format!("unexpected override key `{other}`"),
                ));
            }
        }
    }
    if host.is_none() && port.is_none() {
        return Err(ConfigError::invalid_part(
            part,
            "override needs `host` and/or `port`",
        ));
    }
    Ok(TransportPart::Override { host, port })
}
