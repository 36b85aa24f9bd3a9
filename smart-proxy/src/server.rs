use crate::error::ServerError;
use crate::http_proxy::ProxyHandler;
use crate::transport::StreamDialer;
use crate::url_proxy::UrlProxyRoutes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;
use tracing::warn;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Tracks per-connection and per-tunnel tasks so `stop` can drain them and then force them
/// closed.
#[derive(Clone, Default)]
pub(crate) struct ConnectionTasks {
    tracker: TaskTracker,
    force: CancellationToken,
}

impl ConnectionTasks {
    /// Spawns `task`, dropping it early if the server force-closes.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let force = self.force.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = task => {}
                () = force.cancelled() => {}
            }
        });
    }
}

/// A local HTTP proxy that forwards traffic through a [`StreamDialer`].
///
/// Supports `CONNECT` tunnels, absolute-form HTTP forwarding and URL-proxy mounts added with
/// [`ProxyServer::add_url_proxy`].
pub struct ProxyServer {
    local_addr: SocketAddr,
    routes: UrlProxyRoutes,
    state: Arc<watch::Sender<ServerState>>,
    shutdown: CancellationToken,
    tasks: ConnectionTasks,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ProxyServer {
    /// Binds `address` (`host:port`) and starts accepting connections.
    ///
    /// An empty host binds loopback and an empty or zero port picks an ephemeral port.
    pub async fn start(address: &str, dialer: StreamDialer) -> Result<Self, ServerError> {
        let state = Arc::new(watch::Sender::new(ServerState::Starting));
        let bind_addr = resolve_listen_addr(address).await?;
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| bind_error(address, bind_addr, source))?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind {
                addr: bind_addr,
                source,
            })?;

        let routes = UrlProxyRoutes::default();
        let shutdown = CancellationToken::new();
        let tasks = ConnectionTasks::default();
        let handler = ProxyHandler::new(dialer, routes.clone(), tasks.clone());
        let acceptor = tokio::spawn(accept_loop(
            listener,
            handler,
            shutdown.clone(),
            tasks.clone(),
        ));

        state.send_replace(ServerState::Running);
        info!("proxy listening on {local_addr}");
        Ok(Self {
            local_addr,
            routes,
            state,
            shutdown,
            tasks,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Serves URL fetches under `path_prefix` through `dialer`. Can be called while running.
    pub fn add_url_proxy(&self, path_prefix: &str, dialer: StreamDialer) {
        let transport = dialer.transport_config().clone();
        let prefix = self.routes.mount(path_prefix, dialer);
        info!("URL proxy mounted at {prefix}/ (transport={transport})");
    }

    /// Stops accepting, lets in-flight work finish for up to `grace`, then force-closes the rest.
    ///
    /// The drain runs in its own task, so dropping this future never leaves the server stuck in
    /// [`ServerState::Stopping`]. Every caller enforces its own `grace`: a later call with a
    /// shorter grace force-closes sooner, and all calls return once the server is stopped.
    pub async fn stop(&self, grace: Duration) {
        let initiated = self.state.send_if_modified(|state| match state {
            ServerState::Starting | ServerState::Running => {
                *state = ServerState::Stopping;
                true
            }
            ServerState::Stopping | ServerState::Stopped => false,
        });
        if initiated {
            info!("stopping proxy on {} (grace {grace:?})", self.local_addr);
            self.shutdown.cancel();
            let acceptor = self
                .acceptor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            tokio::spawn(drain(
                acceptor,
                self.tasks.clone(),
                Arc::clone(&self.state),
                self.local_addr,
            ));
        }

        let mut state = self.state.subscribe();
        let drained = tokio::time::timeout(
            grace,
            state.wait_for(|state| *state == ServerState::Stopped),
        )
        .await
        .is_ok();
        if !drained {
            let remaining = self.tasks.tracker.len();
            warn!("force closing {remaining} connection(s) after {grace:?}");
            self.tasks.force.cancel();
            let _ = state.wait_for(|state| *state == ServerState::Stopped).await;
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.tasks.force.cancel();
    }
}

/// Waits for the acceptor and every tracked connection to end, then marks the server stopped.
async fn drain(
    acceptor: Option<JoinHandle<()>>,
    tasks: ConnectionTasks,
    state: Arc<watch::Sender<ServerState>>,
    local_addr: SocketAddr,
) {
    if let Some(acceptor) = acceptor
        && let Err(err) = acceptor.await
    {
        warn!("proxy accept loop ended abnormally: {err}");
    }
    tasks.tracker.close();
    tasks.tracker.wait().await;
    state.send_replace(ServerState::Stopped);
    info!("proxy on {local_addr} stopped");
}

async fn accept_loop(
    listener: TcpListener,
    handler: ProxyHandler,
    shutdown: CancellationToken,
    tasks: ConnectionTasks,
) {
    loop {
        let (stream, client) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("failed to accept connection: {err}");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };
        debug!("accepted connection from {client}");
        tasks.spawn(serve_connection(
            stream,
            client,
            handler.clone(),
            shutdown.clone(),
        ));
    }
    debug!("proxy stopped accepting connections");
}

async fn serve_connection(
    stream: TcpStream,
    client: SocketAddr,
    handler: ProxyHandler,
    shutdown: CancellationToken,
) {
    let service = service_fn(move |req| handler.clone().handle(client, req));
    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    let mut conn = std::pin::pin!(conn);

    let finished = tokio::select! {
        result = conn.as_mut() => Some(result),
        () = shutdown.cancelled() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };
    if let Err(err) = result {
        debug!("connection from {client} ended with error: {err}");
    }
}

async fn resolve_listen_addr(address: &str) -> Result<SocketAddr, ServerError> {
    let trimmed = address.trim();
    let (host, port) = if let Some(rest) = trimmed.strip_prefix('[') {
        let Some((host, after)) = rest.split_once(']') else {
            return Err(ServerError::invalid_address(address, "unterminated `[`"));
        };
        let port = match after {
            "" => "",
            after => after
                .strip_prefix(':')
                .ok_or_else(|| ServerError::invalid_address(address, "expected `[host]:port`"))?,
        };
        (host, port)
    } else {
        let Some((host, port)) = trimmed.rsplit_once(':') else {
            return Err(ServerError::invalid_address(address, "expected `host:port`"));
        };
        if host.contains(':') {
            return Err(ServerError::invalid_address(
                address,
                "IPv6 hosts must be written as `[host]:port`",
            ));
        }
        (host, port)
    };

    let port = if port.is_empty() {
        0
    } else {
        port.parse::<u16>()
            .map_err(|_| ServerError::invalid_address(address, format!("invalid port `{port}`")))?
    };
    if host.is_empty() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|err| ServerError::invalid_address(address, err.to_string()))?
        .collect();
    resolved
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| resolved.first())
        .copied()
        .ok_or_else(|| ServerError::invalid_address(address, "host did not resolve"))
}

fn bind_error(address: &str, addr: SocketAddr, source: io::Error) -> ServerError {
    match source.kind() {
        io::ErrorKind::AddrInUse => ServerError::AddressInUse { addr, source },
        io::ErrorKind::AddrNotAvailable => {
            ServerError::invalid_address(address, source.to_string())
        }
        _ => ServerError::Bind { addr, source },
    }
}
