use crate::responses::ProxyBody;
use crate::responses::text_response;
use crate::server::ConnectionTasks;
use crate::transport::StreamDialer;
use crate::upstream;
use http::Request;
use http::Response;
use http::StatusCode;
use http::Uri;
use hyper::body::Incoming;
use std::cmp::Reverse;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use tracing::debug;
use tracing::warn;
use url::Url;

/// Path prefixes mounted for URL fetching, each bound to a dialer.
#[derive(Clone, Default)]
pub(crate) struct UrlProxyRoutes {
    routes: Arc<RwLock<Vec<UrlProxyRoute>>>,
}

#[derive(Clone)]
struct UrlProxyRoute {
    prefix: String,
    dialer: StreamDialer,
}

impl UrlProxyRoutes {
    /// Mounts `dialer` under `path_prefix`, replacing an existing mount with the same prefix.
    /// Returns the normalized prefix.
    pub(crate) fn mount(&self, path_prefix: &str, dialer: StreamDialer) -> String {
        let prefix = normalize_prefix(path_prefix);
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        routes.retain(|route| route.prefix != prefix);
        routes.push(UrlProxyRoute {
            prefix: prefix.clone(),
            dialer,
        });
        // Longest prefix first so `find` returns the most specific mount.
        routes.sort_by_key(|route| Reverse(route.prefix.len()));
        prefix
    }

    pub(crate) fn find(&self, path: &str) -> Option<(String, StreamDialer)> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|route| prefix_matches(&route.prefix, path))
            .map(|route| (route.prefix.clone(), route.dialer.clone()))
    }
}

/// `"proxy/"` becomes `"/proxy"`; `"/"` becomes `""`, which matches every path.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Extracts the fetch target from `<prefix>/<url>` (plus the original query) or from the
/// `url` query parameter when nothing follows the prefix.
pub(crate) fn target_url(prefix: &str, uri: &Uri) -> Result<Url, &'static str> {
    let rest = uri
        .path()
        .strip_prefix(prefix)
        .unwrap_or_default()
        .trim_start_matches('/');
    let raw = if rest.is_empty() {
        url::form_urlencoded::parse(uri.query().unwrap_or_default().as_bytes())
            .find(|(key, _)| key == "url")
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
            .ok_or("missing target url")?
    } else {
        match uri.query() {
            Some(query) => format!("{rest}?{query}"),
            None => rest.to_string(),
        }
    };

    let url = Url::parse(&raw).map_err(|_| "invalid target url")?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err("only http and https targets are supported");
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err("target url has no host");
    }
    Ok(url)
}

pub(crate) async fn serve(
    req: Request<Incoming>,
    prefix: &str,
    dialer: &StreamDialer,
    tasks: &ConnectionTasks,
) -> Response<ProxyBody> {
    let target = match target_url(prefix, req.uri()) {
        Ok(target) => target,
        Err(reason) => {
            debug!("rejecting URL proxy request {}: {reason}", req.uri());
            return text_response(StatusCode::BAD_REQUEST, reason);
        }
    };
    let method = req.method().clone();
    match upstream::forward(dialer, &target, req, tasks).await {
        Ok(response) => {
            debug!("URL proxy {method} {target} -> {}", response.status());
            response
        }
        Err(err) => {
            warn!("URL proxy {method} {target} failed: {err}");
            text_response(StatusCode::BAD_GATEWAY, "upstream request failed")
        }
    }
}
