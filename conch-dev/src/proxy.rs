//! Path-routing reverse proxy for `conch dev`.
//!
//! Terminates the public tunnel on one loopback port and forwards each
//! request to the dev process owning the longest matching path prefix. A
//! route without a prefix is the catch-all. Routes that opt in also carry
//! WebSocket upgrades (live reload); everything else is plain HTTP/1.1.
//!
//! A request that arrives before its upstream is listening gets a 502 after
//! a short connect-retry window; that is normal during startup and never
//! tears the proxy down.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::error::DevError;
use crate::signal::AbortSignal;

const UPSTREAM_CONNECT_ATTEMPTS: usize = 3;
const UPSTREAM_CONNECT_RETRY_DELAY_MS: u64 = 150;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// One registered forwarding rule.
#[derive(Debug, Clone)]
pub struct ProxyRoute {
    /// Path prefix owned by this upstream; `None` is the default route.
    pub path_prefix: Option<String>,
    pub upstream_port: u16,
    /// Tunnel WebSocket upgrades for this route.
    pub websocket: bool,
}

#[derive(Debug, Clone, Default)]
struct RouteTable {
    prefixed: Vec<ProxyRoute>,
    fallback: Option<ProxyRoute>,
}

impl RouteTable {
    fn new(routes: Vec<ProxyRoute>) -> Self {
        let mut prefixed = Vec::new();
        let mut fallback = None;
        for route in routes {
            if route.path_prefix.is_some() {
                prefixed.push(route);
            } else if fallback.is_none() {
                fallback = Some(route);
            }
        }
        // Longest prefix first; the sort is stable, so equal lengths keep
        // registration order.
        prefixed.sort_by_key(|route| {
            std::cmp::Reverse(route.path_prefix.as_deref().unwrap_or("").len())
        });
        Self { prefixed, fallback }
    }

    fn resolve(&self, path: &str) -> Option<&ProxyRoute> {
        self.prefixed
            .iter()
            .find(|route| {
                route
                    .path_prefix
                    .as_deref()
                    .is_some_and(|prefix| path.starts_with(prefix))
            })
            .or(self.fallback.as_ref())
    }

    fn registered_prefixes(&self) -> Vec<String> {
        self.prefixed
            .iter()
            .filter_map(|route| route.path_prefix.clone())
            .collect()
    }
}

struct ProxyState {
    tunnel_host: String,
    routes: RouteTable,
    client: Client<HttpConnector, Incoming>,
}

struct Running {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

/// Reverse proxy server fronting all proxied dev processes of one run.
pub struct ReverseProxy {
    tunnel_host: String,
    routes: RouteTable,
    running: Option<Running>,
}

impl ReverseProxy {
    pub fn new(tunnel_url: &str) -> Self {
        Self {
            tunnel_host: tunnel_host(tunnel_url),
            routes: RouteTable::default(),
            running: None,
        }
    }

    /// Replace the route table. Takes effect on the next `start`.
    pub fn configure(&mut self, routes: Vec<ProxyRoute>) {
        self.routes = RouteTable::new(routes);
    }

    /// Bind `listen_port` (or an OS-assigned port when `None`) and start
    /// accepting. Returns the bound port. The shared signal also closes the
    /// listener, independently of an explicit `stop`.
    pub async fn start(
        &mut self,
        listen_port: Option<u16>,
        signal: AbortSignal,
    ) -> Result<u16, DevError> {
        if let Some(running) = &self.running {
            return Ok(running.port);
        }

        let requested = listen_port.unwrap_or(0);
        let addr = SocketAddr::from(([127, 0, 0, 1], requested));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DevError::ProxyBind {
                port: requested,
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| DevError::ProxyBind {
                port: requested,
                source,
            })?
            .port();

        let state = Arc::new(ProxyState {
            tunnel_host: self.tunnel_host.clone(),
            routes: self.routes.clone(),
            client: Client::builder(TokioExecutor::new()).build_http(),
        });
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = signal.aborted() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _peer)) = accepted else { continue };
                        let state = state.clone();
                        tokio::spawn(async move {
                            let service =
                                service_fn(move |req| handle(state.clone(), req));
                            if let Err(err) = hyper::server::conn::http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .with_upgrades()
                                .await
                            {
                                tracing::debug!(error = %err, "proxy connection ended with error");
                            }
                        });
                    }
                }
            }
        });

        tracing::info!(port, "dev proxy listening");
        self.running = Some(Running {
            port,
            shutdown_tx,
            task,
        });
        Ok(port)
    }

    /// Close the listening socket. Safe to call repeatedly, or without a
    /// successful `start`.
    pub async fn stop(&mut self) {
        let Some(Running {
            port,
            shutdown_tx,
            task,
        }) = self.running.take()
        else {
            return;
        };
        let _ = shutdown_tx.send(true);
        let _ = task.await;
        tracing::debug!(port, "dev proxy stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|running| running.port)
    }
}

async fn handle(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, Infallible> {
    let path = req.uri().path().to_string();
    let Some(route) = state.routes.resolve(&path).cloned() else {
        return Ok(not_found_response(&state.routes, &path));
    };

    let response = if route.websocket && is_websocket_upgrade(req.headers()) {
        proxy_upgrade(&state, &route, req).await
    } else {
        proxy_request(&state, &route, req).await
    };
    Ok(response)
}

async fn proxy_request(
    state: &ProxyState,
    route: &ProxyRoute,
    mut req: Request<Incoming>,
) -> Response<ProxyBody> {
    if !upstream_reachable(route.upstream_port).await {
        return upstream_unavailable_response(route.upstream_port, "not listening yet");
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = format!("http://127.0.0.1:{}{}", route.upstream_port, path_and_query);
    let Ok(uri) = target.parse::<Uri>() else {
        return text_response(StatusCode::BAD_REQUEST, "invalid request target".to_string());
    };
    *req.uri_mut() = uri;

    rewrite_origin_headers(req.headers_mut(), &state.tunnel_host);
    strip_hop_by_hop_headers(req.headers_mut());

    match state.client.request(req).await {
        Ok(mut response) => {
            strip_hop_by_hop_headers(response.headers_mut());
            response.map(|body| body.boxed())
        }
        Err(err) => upstream_unavailable_response(route.upstream_port, &err.to_string()),
    }
}

/// Tunnel a WebSocket handshake: replay it against the upstream, mirror the
/// `101 Switching Protocols` back, then splice raw bytes between the two
/// upgraded connections until either side closes.
async fn proxy_upgrade(
    state: &ProxyState,
    route: &ProxyRoute,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    if !upstream_reachable(route.upstream_port).await {
        return upstream_unavailable_response(route.upstream_port, "not listening yet");
    }

    let stream = match TcpStream::connect(("127.0.0.1", route.upstream_port)).await {
        Ok(stream) => stream,
        Err(err) => {
            return upstream_unavailable_response(route.upstream_port, &err.to_string());
        }
    };
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await
    {
        Ok(handshake) => handshake,
        Err(err) => {
            return upstream_unavailable_response(route.upstream_port, &err.to_string());
        }
    };
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            tracing::debug!(error = %err, "upstream websocket connection ended with error");
        }
    });

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let mut upstream_req = Request::new(Empty::<Bytes>::new());
    *upstream_req.method_mut() = req.method().clone();
    if let Ok(uri) = path_and_query.parse::<Uri>() {
        *upstream_req.uri_mut() = uri;
    }
    // Keep the upgrade handshake headers intact; only the origin moves.
    *upstream_req.headers_mut() = req.headers().clone();
    rewrite_origin_headers(upstream_req.headers_mut(), &state.tunnel_host);

    let mut upstream_res = match sender.send_request(upstream_req).await {
        Ok(response) => response,
        Err(err) => {
            return upstream_unavailable_response(route.upstream_port, &err.to_string());
        }
    };

    if upstream_res.status() != StatusCode::SWITCHING_PROTOCOLS {
        return upstream_res.map(|body| body.boxed());
    }

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = upstream_res.headers().clone();

    tokio::spawn(async move {
        let upstream = match hyper::upgrade::on(&mut upstream_res).await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::debug!(error = %err, "upstream websocket upgrade failed");
                return;
            }
        };
        let client = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::debug!(error = %err, "client websocket upgrade failed");
                return;
            }
        };
        let mut upstream = TokioIo::new(upstream);
        let mut client = TokioIo::new(client);
        if let Err(err) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            tracing::debug!(error = %err, "websocket tunnel closed with error");
        }
    });

    response
}

/// Backends come up after the proxy, so give a freshly-routed port a short
/// connect-retry window before reporting it unavailable.
async fn upstream_reachable(port: u16) -> bool {
    for attempt in 0..UPSTREAM_CONNECT_ATTEMPTS {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        if attempt + 1 < UPSTREAM_CONNECT_ATTEMPTS {
            tokio::time::sleep(Duration::from_millis(UPSTREAM_CONNECT_RETRY_DELAY_MS)).await;
        }
    }
    false
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(hyper::header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// Backends should see the public origin, not the loopback hop.
fn rewrite_origin_headers(headers: &mut HeaderMap, tunnel_host: &str) {
    if let Ok(host) = HeaderValue::from_str(tunnel_host) {
        headers.insert(hyper::header::HOST, host.clone());
        headers.insert("x-forwarded-host", host);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
}

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn tunnel_host(tunnel_url: &str) -> String {
    let rest = tunnel_url
        .split_once("://")
        .map(|(_scheme, rest)| rest)
        .unwrap_or(tunnel_url);
    rest.split('/').next().unwrap_or(rest).to_string()
}

fn full_body(text: String) -> ProxyBody {
    Full::new(Bytes::from(text))
        .map_err(|never| match never {})
        .boxed()
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    let mut res = Response::new(full_body(body));
    *res.status_mut() = status;
    res.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}

fn upstream_unavailable_response(port: u16, reason: &str) -> Response<ProxyBody> {
    tracing::debug!(port, reason, "upstream unavailable");
    text_response(
        StatusCode::BAD_GATEWAY,
        format!("The dev process behind this route (port {port}) is not reachable: {reason}"),
    )
}

fn not_found_response(routes: &RouteTable, path: &str) -> Response<ProxyBody> {
    let mut known = routes.registered_prefixes();
    known.sort();
    text_response(
        StatusCode::NOT_FOUND,
        format!(
            "No dev process is mounted at '{}'. Registered routes:\n{}",
            path,
            known.join("\n")
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(prefix: Option<&str>, port: u16) -> ProxyRoute {
        ProxyRoute {
            path_prefix: prefix.map(str::to_string),
            upstream_port: port,
            websocket: false,
        }
    }

    #[test]
    fn longest_matching_prefix_wins() {
        let table = RouteTable::new(vec![
            route(Some("/ext"), 1),
            route(Some("/ext/nested"), 2),
            route(None, 3),
        ]);

        assert_eq!(table.resolve("/ext/nested/x").unwrap().upstream_port, 2);
        assert_eq!(table.resolve("/ext/other").unwrap().upstream_port, 1);
        assert_eq!(table.resolve("/elsewhere").unwrap().upstream_port, 3);
    }

    #[test]
    fn equal_length_prefixes_keep_registration_order() {
        let table = RouteTable::new(vec![route(Some("/aa"), 1), route(Some("/ab"), 2)]);
        // Both are two characters; '/aa' was registered first and must stay
        // first in the table.
        assert_eq!(table.prefixed[0].upstream_port, 1);
    }

    #[test]
    fn no_match_without_fallback_resolves_to_none() {
        let table = RouteTable::new(vec![route(Some("/ext"), 1)]);
        assert!(table.resolve("/elsewhere").is_none());
    }

    #[test]
    fn tunnel_host_strips_scheme_and_path() {
        assert_eq!(tunnel_host("https://my-app.example.dev/x"), "my-app.example.dev");
        assert_eq!(tunnel_host("my-app.example.dev"), "my-app.example.dev");
    }

    #[test]
    fn websocket_upgrade_detection_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&headers));

        headers.insert(hyper::header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_upgrade(&headers));
        assert!(!is_websocket_upgrade(&HeaderMap::new()));
    }

    #[test]
    fn origin_headers_are_rewritten() {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::HOST, HeaderValue::from_static("127.0.0.1:9999"));
        rewrite_origin_headers(&mut headers, "my-app.example.dev");

        assert_eq!(headers[hyper::header::HOST], "my-app.example.dev");
        assert_eq!(headers["x-forwarded-host"], "my-app.example.dev");
        assert_eq!(headers["x-forwarded-proto"], "https");
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let mut proxy = ReverseProxy::new("https://my-app.example.dev");
        assert!(!proxy.is_running());
        proxy.stop().await;
        proxy.stop().await;
    }
}
