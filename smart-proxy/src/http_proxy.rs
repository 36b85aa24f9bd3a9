use crate::relay::relay;
use crate::responses::ProxyBody;
use crate::responses::empty_response;
use crate::responses::text_response;
use crate::server::ConnectionTasks;
use crate::transport::StreamDialer;
use crate::transport::join_host_port;
use crate::upstream;
use crate::url_proxy;
use crate::url_proxy::UrlProxyRoutes;
use http::Method;
use http::Request;
use http::Response;
use http::StatusCode;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tracing::debug;
use tracing::info;
use tracing::warn;
use url::Url;

/// Per-server request handler shared by every accepted connection.
#[derive(Clone)]
pub(crate) struct ProxyHandler {
    dialer: StreamDialer,
    routes: UrlProxyRoutes,
    tasks: ConnectionTasks,
}

impl ProxyHandler {
    pub(crate) fn new(
        dialer: StreamDialer,
        routes: UrlProxyRoutes,
        tasks: ConnectionTasks,
    ) -> Self {
        Self {
            dialer,
            routes,
            tasks,
        }
    }

    pub(crate) async fn handle(
        self,
        client: SocketAddr,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, Infallible> {
        if req.method() == Method::CONNECT {
            return Ok(self.connect(client, req).await);
        }
        if req.uri().scheme().is_some() && req.uri().authority().is_some() {
            return Ok(self.forward_absolute(client, req).await);
        }
        if let Some((prefix, dialer)) = self.routes.find(req.uri().path()) {
            return Ok(url_proxy::serve(req, &prefix, &dialer, &self.tasks).await);
        }
        debug!(
            "no handler for {} {} (client={client})",
            req.method(),
            req.uri().path()
        );
        Ok(text_response(StatusCode::NOT_FOUND, "not found"))
    }

    async fn connect(&self, client: SocketAddr, req: Request<Incoming>) -> Response<ProxyBody> {
        let (Some(host), Some(port)) = (req.uri().host(), req.uri().port_u16()) else {
            warn!("CONNECT missing authority (client={client})");
            return text_response(StatusCode::BAD_REQUEST, "missing authority");
        };
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let authority = join_host_port(&host, port);

        let mut remote = match self.dialer.dial_host(&host, port).await {
            Ok(remote) => remote,
            Err(err) => {
                warn!("CONNECT to {authority} failed (client={client}): {err}");
                return text_response(StatusCode::BAD_GATEWAY, "dial failed");
            }
        };
        info!("CONNECT {authority} (client={client})");

        self.tasks.spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(err) => {
                    warn!("CONNECT upgrade for {authority} failed: {err}");
                    return;
                }
            };
            let mut upgraded = TokioIo::new(upgraded);
            match relay(&mut upgraded, &mut remote, &authority).await {
                Ok(stats) => debug!(
                    "tunnel to {authority} closed ({} bytes up, {} bytes down)",
                    stats.client_to_remote, stats.remote_to_client
                ),
                Err(err) => debug!("tunnel error: {err}"),
            }
        });
        empty_response(StatusCode::OK)
    }

    async fn forward_absolute(
        &self,
        client: SocketAddr,
        req: Request<Incoming>,
    ) -> Response<ProxyBody> {
        let target = match Url::parse(&req.uri().to_string()) {
            Ok(target) if matches!(target.scheme(), "http" | "https") => target,
            Ok(target) => {
                warn!("unsupported scheme {} (client={client})", target.scheme());
                return text_response(StatusCode::BAD_REQUEST, "unsupported scheme");
            }
            Err(err) => {
                warn!("invalid request target {} (client={client}): {err}", req.uri());
                return text_response(StatusCode::BAD_REQUEST, "invalid request target");
            }
        };
        let method = req.method().clone();
        match upstream::forward(&self.dialer, &target, req, &self.tasks).await {
            Ok(response) => {
                debug!("{method} {target} -> {} (client={client})", response.status());
                response
            }
            Err(err) => {
                warn!("{method} {target} failed (client={client}): {err}");
                text_response(StatusCode::BAD_GATEWAY, "upstream request failed")
            }
        }
    }
}
