//! Subdomain app dispatcher
//!
//! Requests whose Host matches the app hostname pattern are authorized with
//! the signed app token, routed to the agent named in the token through the
//! connection cache, and streamed both ways. Everything else falls through to
//! the gateway's own routes.
//!
//! The cache handle lives as long as the response: for plain requests it is
//! owned by the response body, for upgraded connections by the forwarding
//! task. Either way it is released exactly once, when its owner is dropped.

use crate::agent::SharedDialer;
use crate::body::{BoxError, ProxyBody};
use crate::cache::{CacheHandle, ConnectionCache};
use crate::error::GatewayError;
use crate::hostname::{request_host, AppRoute, RouteMatch, SubdomainRouter};
use crate::middleware::{ConnInfo, Middleware, Next, RealIp, RequestId};
use crate::token::{
    app_token_cookie, extract_app_token, strip_token_from_cookies, strip_token_from_query, TokenError, TokenSource,
    TokenVerifier, APP_TOKEN_HEADER,
};
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::HeaderValue;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Largest upgrade response head accepted from an agent
const MAX_UPGRADE_RESPONSE_HEAD: usize = 16 * 1024;
/// How long an agent may take to answer an upgrade request
const UPGRADE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

type AgentHandle = CacheHandle<SharedDialer>;

pub struct SubdomainAppProxy {
    router: SubdomainRouter,
    verifier: TokenVerifier,
    cache: ConnectionCache<SharedDialer>,
    secure_cookie: bool,
}

impl SubdomainAppProxy {
    pub fn new(
        router: SubdomainRouter,
        verifier: TokenVerifier,
        cache: ConnectionCache<SharedDialer>,
        secure_cookie: bool,
    ) -> Self {
        Self {
            router,
            verifier,
            cache,
            secure_cookie,
        }
    }

    async fn dispatch(&self, mut req: Request<Incoming>, route_match: RouteMatch) -> Result<Response<ProxyBody>, GatewayError> {
        let route = route_match.parse_route()?;

        let (token, source) = extract_app_token(&req).ok_or(TokenError::Missing)?;
        let claims = self.verifier.verify(&token, Some(&route))?;

        let set_cookie = if source == TokenSource::Query {
            strip_query_token(&mut req);
            Some(app_token_cookie(&token, claims.remaining_secs(), self.secure_cookie))
        } else {
            None
        };
        req.headers_mut().remove(APP_TOKEN_HEADER);
        strip_cookie_token(&mut req);
        set_forwarding_headers(&mut req);

        let handle = self.cache.acquire(claims.agent_id).await?;
        debug!(agent_id = %claims.agent_id, route = %route, "Dispatching app request");

        let mut response = if is_upgrade_request(&req) {
            handle_upgrade(req, handle, &route).await?
        } else {
            forward(req, handle, &route).await?
        };

        if let Some(cookie) = set_cookie.and_then(|c| HeaderValue::from_str(&c).ok()) {
            response.headers_mut().append(hyper::header::SET_COOKIE, cookie);
        }
        Ok(response)
    }
}

impl Middleware for SubdomainAppProxy {
    fn handle<'a>(&'a self, req: Request<Incoming>, next: Next<'a>) -> BoxFuture<'a, Response<ProxyBody>> {
        let route_match = request_host(&req).map(|host| self.router.match_host(host));
        let Some(route_match) = route_match.filter(|m| m.matched) else {
            return next.run(req);
        };

        Box::pin(async move {
            match self.dispatch(req, route_match).await {
                Ok(response) => response,
                Err(e) => {
                    match &e {
                        GatewayError::AgentUnreachable { .. } => warn!(error = %e, "App request failed"),
                        _ => debug!(error = %e, "App request rejected"),
                    }
                    e.into_response()
                }
            }
        })
    }
}

/// Remove the app token from the query string before the request leaves the
/// gateway
fn strip_query_token<B>(req: &mut Request<B>) {
    let path = req.uri().path();
    let path_and_query = match req.uri().query().and_then(strip_token_from_query) {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    };

    let mut parts = req.uri().clone().into_parts();
    match path_and_query.parse() {
        Ok(pq) => parts.path_and_query = Some(pq),
        Err(e) => {
            warn!(error = %e, "Failed to rebuild request path without app token");
            return;
        }
    }
    if let Ok(uri) = Uri::from_parts(parts) {
        *req.uri_mut() = uri;
    }
}

/// Drop the app token cookie from every Cookie header, keeping the rest
fn strip_cookie_token<B>(req: &mut Request<B>) {
    let kept: Vec<HeaderValue> = req
        .headers()
        .get_all(hyper::header::COOKIE)
        .iter()
        .filter_map(|value| match value.to_str() {
            Ok(cookies) => strip_token_from_cookies(cookies).and_then(|c| HeaderValue::from_str(&c).ok()),
            Err(_) => Some(value.clone()),
        })
        .collect();

    let headers = req.headers_mut();
    headers.remove(hyper::header::COOKIE);
    for value in kept {
        headers.append(hyper::header::COOKIE, value);
    }
}

/// Overwrite the X-Forwarded-* headers. Client supplied values are never
/// passed through; the gateway is the first trusted hop.
fn set_forwarding_headers<B>(req: &mut Request<B>) {
    let client_ip = req
        .extensions()
        .get::<RealIp>()
        .map(|ip| ip.0)
        .or_else(|| req.extensions().get::<ConnInfo>().map(|info| info.peer.ip()));
    let is_tls = req.extensions().get::<ConnInfo>().is_some_and(|info| info.is_tls);
    let host = request_host(req).and_then(|h| HeaderValue::from_str(h).ok());

    let headers = req.headers_mut();
    match client_ip.and_then(|ip| HeaderValue::from_str(&ip.to_string()).ok()) {
        Some(value) => {
            headers.insert(X_FORWARDED_FOR, value);
        }
        None => {
            headers.remove(X_FORWARDED_FOR);
        }
    }
    match host {
        Some(value) => {
            headers.insert(X_FORWARDED_HOST, value);
        }
        None => {
            headers.remove(X_FORWARDED_HOST);
        }
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(if is_tls { "https" } else { "http" }),
    );
}

async fn forward(req: Request<Incoming>, handle: AgentHandle, route: &AppRoute) -> Result<Response<ProxyBody>, GatewayError> {
    let response = handle.send_request(req, route.port()).await?;
    let (parts, body) = response.into_parts();

    let closed = Box::pin(handle.closed_signal());
    let body = LeasedBody {
        inner: body,
        closed,
        _handle: handle,
    };
    Ok(Response::from_parts(parts, body.boxed_unsync()))
}

/// Agent response body that keeps the cache handle alive until the client
/// has the last byte, and fails the stream if the connection is closed
/// underneath it.
struct LeasedBody {
    inner: Incoming,
    closed: Pin<Box<dyn Future<Output = ()> + Send>>,
    _handle: AgentHandle,
}

impl Body for LeasedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        if this.closed.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(GatewayError::CacheClosed.into())));
        }
        Pin::new(&mut this.inner).poll_frame(cx).map_err(Into::into)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    // Check for Connection: Upgrade header (case-insensitive value check)
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Build the raw HTTP upgrade request to send to the agent
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    if !req.headers().contains_key(hyper::header::HOST) {
        if let Some(host) = request_host(req) {
            request.push_str(&format!("host: {}\r\n", host));
        }
    }
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Position just past the blank line ending a response head
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse the status line and headers of an agent's upgrade response
fn parse_upgrade_response(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let head = std::str::from_utf8(head).ok()?;
    let mut lines = head.lines();

    // Parse status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Read the agent's response head. Returns the head and any bytes the agent
/// already sent after it.
async fn read_upgrade_response(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "agent closed connection before responding to upgrade",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
    }
}

async fn handle_upgrade(req: Request<Incoming>, handle: AgentHandle, route: &AppRoute) -> Result<Response<ProxyBody>, GatewayError> {
    let agent_id = handle.agent_id();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());

    let mut agent_stream = handle.open_stream(route.port()).await?;
    agent_stream
        .write_all(&build_upgrade_request(&req))
        .await
        .map_err(|e| GatewayError::unreachable(agent_id, format!("send upgrade request: {}", e)))?;

    let (head, leftover) = tokio::time::timeout(UPGRADE_RESPONSE_TIMEOUT, read_upgrade_response(&mut agent_stream))
        .await
        .map_err(|_| GatewayError::unreachable(agent_id, "timed out waiting for upgrade response"))?
        .map_err(|e| GatewayError::unreachable(agent_id, format!("read upgrade response: {}", e)))?;

    let (status, response_headers) = parse_upgrade_response(&head)
        .ok_or_else(|| GatewayError::unreachable(agent_id, "invalid upgrade response"))?;

    let mut response = Response::builder().status(status);
    for (name, value) in &response_headers {
        // Hyper frames the response itself
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(%agent_id, %status, "Agent rejected upgrade request");
        return Ok(response
            .body(crate::body::empty())
            .expect("valid response builder"));
    }

    info!(%agent_id, request_id, upgrade_type, "WebSocket upgrade successful");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => forward_upgraded(upgraded, agent_stream, leftover, handle, &request_id).await,
            Err(e) => error!(%agent_id, error = %e, "Failed to upgrade client connection"),
        }
        debug!(%agent_id, request_id, "Upgraded connection closed");
    });

    Ok(response
        .body(crate::body::empty())
        .expect("valid response builder"))
}

/// Copy bytes both ways until either side closes or the agent connection is
/// closed by the cache. No size or duration cap.
async fn forward_upgraded(client: Upgraded, mut agent: TcpStream, leftover: Vec<u8>, handle: AgentHandle, request_id: &str) {
    let agent_id = handle.agent_id();
    let mut client_io = TokioIo::new(client);

    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(%agent_id, request_id, error = %e, "Failed to flush buffered agent bytes");
            return;
        }
    }

    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut client_io, &mut agent) => match result {
            Ok((client_to_agent, agent_to_client)) => {
                debug!(%agent_id, request_id, client_to_agent, agent_to_client, "WebSocket connection closed normally");
            }
            Err(e) => {
                debug!(%agent_id, request_id, error = %e, "WebSocket connection closed with error");
            }
        },
        _ = handle.closed_signal() => {
            debug!(%agent_id, request_id, "Agent connection closed during WebSocket session");
        }
    }
}
