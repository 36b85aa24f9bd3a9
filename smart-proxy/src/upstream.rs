use crate::error::DialError;
use crate::responses::ProxyBody;
use crate::responses::strip_hop_by_hop;
use crate::server::ConnectionTasks;
use crate::tls;
use crate::transport::BoxedStream;
use crate::transport::StreamDialer;
use http::HeaderValue;
use http::Request;
use http::Response;
use http::Uri;
use http::Version;
use http::header;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tracing::debug;
use url::Position;
use url::Url;

#[derive(Debug, Error)]
pub(crate) enum UpstreamError {
    #[error("target URL `{0}` has no host")]
    MissingHost(String),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
    #[error("upstream HTTP exchange failed")]
    Http(#[from] hyper::Error),
}

/// Sends `req` to `target` over a fresh connection from `dialer`, adding TLS for `https`.
///
/// The client connection is driven on `tasks`, so it is drained or force-closed with the server.
///
/// The request keeps its method, headers and body. Its URI becomes origin-form, `Host` is set
/// from `target`, and hop-by-hop headers are dropped in both directions.
pub(crate) async fn forward(
    dialer: &StreamDialer,
    target: &Url,
    req: Request<Incoming>,
    tasks: &ConnectionTasks,
) -> Result<Response<ProxyBody>, UpstreamError> {
    let missing_host = || UpstreamError::MissingHost(target.to_string());
    let host = target
        .host_str()
        .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
        .ok_or_else(missing_host)?;
    let port = target.port_or_known_default().ok_or_else(missing_host)?;

    let req = upstream_request(target, req)?;
    let stream = dialer.dial_host(host, port).await?;
    let stream: BoxedStream = if target.scheme() == "https" {
        let tls_stream = tls::connect(stream, host)
            .await
            .map_err(|source| DialError::Handshake {
                host: host.to_string(),
                source,
            })?;
        Box::new(tls_stream)
    } else {
        stream
    };

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    let authority = target[Position::BeforeHost..Position::AfterPort].to_string();
    tasks.spawn(async move {
        if let Err(err) = conn.await {
            debug!("upstream connection to {authority} closed: {err}");
        }
    });

    let response = sender.send_request(req).await?;
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, body.boxed()))
}

fn upstream_request(
    target: &Url,
    req: Request<Incoming>,
) -> Result<Request<Incoming>, UpstreamError> {
    let (mut parts, body) = req.into_parts();
    let path = &target[Position::BeforePath..Position::AfterQuery];
    let path = if path.is_empty() { "/" } else { path };
    parts.uri = path
        .parse::<Uri>()
        .map_err(|err| UpstreamError::InvalidRequest(format!("{path}: {err}")))?;
    parts.version = Version::HTTP_11;
    strip_hop_by_hop(&mut parts.headers);

    let authority = &target[Position::BeforeHost..Position::AfterPort];
    let host = HeaderValue::from_str(authority)
        .map_err(|err| UpstreamError::InvalidRequest(format!("{authority}: {err}")))?;
    parts.headers.insert(header::HOST, host);
    Ok(Request::from_parts(parts, body))
}
