use super::BoxedStream;
use super::Dialer;
use crate::error::ConfigError;
use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use url::Url;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const USER_PASS_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Socks5Endpoint {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) credentials: Option<(String, String)>,
}

pub(super) fn parse_endpoint(part: &str) -> Result<Socks5Endpoint, ConfigError> {
    let url = Url::parse(part).map_err(|err| ConfigError::invalid_part(part, err.to_string()))?;
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ConfigError::invalid_part(part, "missing proxy host"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = url
        .port()
        .ok_or_else(|| ConfigError::invalid_part(part, "missing proxy port"))?;
    let credentials = if url.username().is_empty() {
        None
    } else {
        let username = percent_decode(url.username());
        let password = percent_decode(url.password().unwrap_or_default());
        if username.len() > 255 || password.len() > 255 {
            return Err(ConfigError::invalid_part(
                part,
                "credentials longer than 255 bytes",
            ));
        }
        Some((username, password))
    };
    Ok(Socks5Endpoint {
        host,
        port,
        credentials,
    })
}

fn percent_decode(value: &str) -> String {
    // Userinfo has no `+`-means-space rule, so protect literal pluses first.
    let value = value.replace('+', "%2B");
    url::form_urlencoded::parse(format!("v={value}").as_bytes())
        .next()
        .map(|(_, decoded)| decoded.into_owned())
        .unwrap_or_default()
}

/// Reaches the target through a SOCKS5 proxy dialed with the inner dialer.
pub struct Socks5Dialer {
    inner: Arc<dyn Dialer>,
    endpoint: Socks5Endpoint,
}

impl Socks5Dialer {
    pub(crate) fn new(inner: Arc<dyn Dialer>, endpoint: Socks5Endpoint) -> Self {
        Self { inner, endpoint }
    }

    /// Builds a dialer from `socks5://[user:pass@]host:port`.
    pub fn from_url(inner: Arc<dyn Dialer>, url: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(inner, parse_endpoint(url.trim())?))
    }
}

#[async_trait]
impl Dialer for Socks5Dialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let mut stream = self
            .inner
            .dial(&self.endpoint.host, self.endpoint.port)
            .await?;
        negotiate(&mut stream, self.endpoint.credentials.as_ref()).await?;
        connect(&mut stream, host, port).await?;
        Ok(stream)
    }
}

async fn negotiate<S>(stream: &mut S, credentials: Option<&(String, String)>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = match credentials {
        Some(_) => &[SOCKS_VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS],
        None => &[SOCKS_VERSION, 1, METHOD_NO_AUTH],
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(protocol_error(format!(
            "unexpected SOCKS version {}",
            choice[0]
        )));
    }
    match (choice[1], credentials) {
        (METHOD_NO_AUTH, _) => Ok(()),
        (METHOD_USER_PASS, Some((username, password))) => {
            let mut auth = Vec::with_capacity(3 + username.len() + password.len());
            auth.push(USER_PASS_VERSION);
            auth.push(username.len() as u8);
            auth.extend_from_slice(username.as_bytes());
            auth.push(password.len() as u8);
            auth.extend_from_slice(password.as_bytes());
            stream.write_all(&auth).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "SOCKS5 authentication rejected",
                ));
            }
            Ok(())
        }
        (METHOD_NONE_ACCEPTABLE, _) => Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "SOCKS5 proxy accepted none of the offered auth methods",
        )),
        (method, _) => Err(protocol_error(format!(
            "SOCKS5 proxy selected unsupported auth method {method}"
        ))),
    }
}

async fn connect<S>(stream: &mut S, host: &str, port: u16) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "hostname too long for SOCKS5")
            })?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(protocol_error(format!(
            "unexpected SOCKS version {}",
            reply[0]
        )));
    }
    if reply[1] != REPLY_SUCCEEDED {
        return Err(reply_error(reply[1]));
    }
    // Skip the bound address; callers only need the tunnel.
    let addr_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => usize::from(stream.read_u8().await?),
        other => {
            return Err(protocol_error(format!(
                "unknown SOCKS5 address type {other}"
            )));
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

fn reply_error(code: u8) -> io::Error {
    let (kind, message) = match code {
        0x02 => (io::ErrorKind::PermissionDenied, "connection not allowed by ruleset"),
        0x03 => (io::ErrorKind::Other, "network unreachable"),
        0x04 => (io::ErrorKind::Other, "host unreachable"),
        0x05 => (io::ErrorKind::ConnectionRefused, "connection refused"),
        0x06 => (io::ErrorKind::TimedOut, "TTL expired"),
        0x07 => (io::ErrorKind::Unsupported, "command not supported"),
        0x08 => (io::ErrorKind::Unsupported, "address type not supported"),
        _ => (io::ErrorKind::Other, "general SOCKS server failure"),
    };
    io::Error::new(kind, format!("SOCKS5 connect failed: {message}"))
}

fn protocol_error(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
