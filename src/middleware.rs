//! Request interceptor chain
//!
//! The gateway composes an ordered list of [`Middleware`] at startup into a
//! [`Pipeline`] ending in an [`Endpoint`]. Each interceptor receives the
//! request and a [`Next`] handle for the rest of the chain; it can answer
//! directly, or call `next.run(req)` and adjust the response.

use crate::body::ProxyBody;
use crate::error::{json_error_response, GatewayError, ProxyErrorCode};
use crate::events::{GatewayEvent, SharedEventSink};
use crate::hostname::{normalize_host, request_host, HostPattern};
use crate::ratelimit::{RateDecision, RateLimiter};
use futures::future::{BoxFuture, FutureExt};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header carrying the gateway build version on every response
pub const X_BUILD_VERSION: &str = "x-coder-build-version";

const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Maximum accepted length of a client supplied request ID
const MAX_REQUEST_ID_LEN: usize = 128;

pub trait Middleware: Send + Sync + 'static {
    fn handle<'a>(&'a self, req: Request<Incoming>, next: Next<'a>) -> BoxFuture<'a, Response<ProxyBody>>;
}

/// Terminal handler of a pipeline
pub trait Endpoint: Send + Sync + 'static {
    fn call(&self, req: Request<Incoming>) -> BoxFuture<'_, Response<ProxyBody>>;
}

/// The remainder of the chain after the current interceptor
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub fn run(self, req: Request<Incoming>) -> BoxFuture<'a, Response<ProxyBody>> {
        match self.rest.split_first() {
            Some((layer, rest)) => layer.handle(
                req,
                Next {
                    rest,
                    endpoint: self.endpoint,
                },
            ),
            None => self.endpoint.call(req),
        }
    }
}

pub struct Pipeline {
    layers: Vec<Arc<dyn Middleware>>,
    endpoint: Arc<dyn Endpoint>,
}

impl Pipeline {
    pub fn new(endpoint: impl Endpoint) -> Self {
        Self {
            layers: Vec::new(),
            endpoint: Arc::new(endpoint),
        }
    }

    /// Append an interceptor. Interceptors run in the order they are added.
    pub fn with(mut self, layer: impl Middleware) -> Self {
        self.layers.push(Arc::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        Next {
            rest: &self.layers,
            endpoint: self.endpoint.as_ref(),
        }
        .run(req)
        .await
    }
}

/// Per-connection facts attached to every request by the server
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub is_tls: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Client address after trusted forwarding headers are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealIp(pub IpAddr);

/// Turns panics anywhere below it into a 500
pub struct Recover;

impl Middleware for Recover {
    fn handle<'a>(&'a self, req: Request<Incoming>, next: Next<'a>) -> BoxFuture<'a, Response<ProxyBody>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        Box::pin(async move {
            match AssertUnwindSafe(async move { next.run(req).await }).catch_unwind().await {
                Ok(response) => response,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(%method, path, panic = %message, "Panic while handling request");
                    json_error_response(ProxyErrorCode::InternalError, "Internal server error")
                }
            }
        })
    }
}

/// Sends requests for hosts other than the access URL (or app hosts) to the
/// access URL with a 307.
pub struct RedirectToAccessUrl {
    access_url: String,
    access_host: String,
    app_hosts: Option<HostPattern>,
}

impl RedirectToAccessUrl {
    pub fn new(access_url: &hyper::Uri, app_hosts: Option<HostPattern>) -> Self {
        let access_host = access_url
            .authority()
            .and_then(|a| normalize_host(a.as_str()))
            .unwrap_or_default();
        Self {
            access_url: access_url.to_string().trim_end_matches('/').to_string(),
            access_host,
            app_hosts,
        }
    }

    pub fn should_redirect(&self, host: Option<&str>) -> bool {
        let Some(host) = host.and_then(normalize_host) else {
            return true;
        };
        if host == self.access_host {
            return false;
        }
        !self.app_hosts.as_ref().is_some_and(|pattern| pattern.matches(&host))
    }
}

impl Middleware for RedirectToAccessUrl {
    fn handle<'a>(&'a self, req: Request<Incoming>, next: Next<'a>) -> BoxFuture<'a, Response<ProxyBody>> {
        if !self.should_redirect(request_host(&req)) {
            return next.run(req);
        }

        let response = Response::builder()
            .status(StatusCode::TEMPORARY_REDIRECT)
            .header(hyper::header::LOCATION, &self.access_url)
            .body(crate::body::empty())
            .expect("valid response builder");
        Box::pin(async move { response })
    }
}

/// Assigns every request an ID, echoed in the response
pub struct AttachRequestId;

impl Middleware for AttachRequestId {
    fn handle<'a>(&'a self, mut req: Request<Incoming>, next: Next<'a>) -> BoxFuture<'a, Response<ProxyBody>> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
            .filter(|v| v.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            req.headers_mut().insert(X_REQUEST_ID, value);
        }
        req.extensions_mut().insert(RequestId(request_id.clone()));

        Box::pin(async move {
            let mut response = next.run(req).await;
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert(X_REQUEST_ID, value);
            }
            response
        })
    }
}

/// Resolves the client address. Forwarding headers are only believed when
/// the peer is a trusted origin.
pub struct ExtractRealIp {
    trusted_origins: Vec<IpAddr>,
    headers: Vec<HeaderName>,
}

impl ExtractRealIp {
    pub fn new(trusted_origins: Vec<IpAddr>, headers: Vec<HeaderName>) -> Self {
        Self {
            trusted_origins,
            headers,
        }
    }

    pub fn resolve(&self, peer: IpAddr, headers: &HeaderMap) -> IpAddr {
        if !self.trusted_origins.contains(&peer) {
            return peer;
        }

        for name in &self.headers {
            let forwarded = headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|v| v.trim().parse::<IpAddr>().ok());
            if let Some(ip) = forwarded {
                return ip;
            }
        }
        peer
    }
}

impl Middleware for ExtractRealIp {
    fn handle<'a>(&'a self, mut req: Request<Incoming>, next: Next<'a>) -> BoxFuture<'a, Response<ProxyBody>> {
        if let Some(info) = req.extensions().get::<ConnInfo>().copied() {
            let ip = self.resolve(info.peer.ip(), req.headers());
            req.extensions_mut().insert(RealIp(ip));
        }
        next.run(req)
    }
}

/// Opens the request span and reports the outcome
pub struct RequestLogger {
    events: SharedEventSink,
}

impl RequestLogger {
    pub fn new(events: SharedEventSink) -> Self {
        Self { events }
    }
}

impl Middleware for RequestLogger {
    fn handle<'a>(&'a self, req: Request<Incoming>, next: Next<'a>) -> BoxFuture<'a, Response<ProxyBody>> {
        let method = req.method().to_string();
        let host = request_host(&req).unwrap_or_default().to_string();
        let path = req.uri().path().to_string();
        let request_id = req
            .extensions()
            .get::<RequestId>()
            .map(|id| id.0.clone())
            .unwrap_or_default();
        let remote = req.extensions().get::<RealIp>().map(|ip| ip.0);

        let span = info_span!("request", request_id, method, host, path);
        Box::pin(async move {
            let start = Instant::now();
            let response = next.run(req).instrument(span.clone()).await;
            let latency = start.elapsed();
            let status = response.status().as_u16();

            span.in_scope(|| {
                info!(
                    status,
                    latency_ms = latency.as_millis() as u64,
                    remote = ?remote,
                    "Request completed"
                );
            });
            self.events.record(GatewayEvent::RequestCompleted {
                method,
                host,
                path,
                status,
                latency,
            });
            response
        })
    }
}

/// Headers set on every response
pub struct SecurityHeaders {
    build_version: HeaderValue,
}

impl SecurityHeaders {
    pub fn new(build_version: &str) -> Self {
        Self {
            build_version: HeaderValue::from_str(build_version).unwrap_or(HeaderValue::from_static("unknown")),
        }
    }
}

impl Middleware for SecurityHeaders {
    fn handle<'a>(&'a self, req: Request<Incoming>, next: Next<'a>) -> BoxFuture<'a, Response<ProxyBody>> {
        Box::pin(async move {
            let mut response = next.run(req).await;
            let headers = response.headers_mut();
            headers.insert(X_BUILD_VERSION, self.build_version.clone());
            headers.insert(
                hyper::header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            );
            response
        })
    }
}

/// Global admission gate
pub struct RateLimit {
    limiter: Arc<RateLimiter>,
    events: SharedEventSink,
}

impl RateLimit {
    pub fn new(limiter: Arc<RateLimiter>, events: SharedEventSink) -> Self {
        Self { limiter, events }
    }
}

fn set_rate_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    let reset_secs = decision.reset_after.as_secs_f64().ceil() as u64;
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_secs));
}

impl Middleware for RateLimit {
    fn handle<'a>(&'a self, req: Request<Incoming>, next: Next<'a>) -> BoxFuture<'a, Response<ProxyBody>> {
        let Some(decision) = self.limiter.admit() else {
            return next.run(req);
        };

        if !decision.allowed {
            let remote = req.extensions().get::<RealIp>().map(|ip| ip.0);
            warn!(remote = ?remote, limit = decision.limit, "Request rate limited");
            self.events.record(GatewayEvent::RateLimited { remote });

            let mut response = GatewayError::RateLimited.into_response();
            set_rate_headers(response.headers_mut(), &decision);
            let retry_after = decision.reset_after.as_secs_f64().ceil().max(1.0) as u64;
            response
                .headers_mut()
                .insert(hyper::header::RETRY_AFTER, HeaderValue::from(retry_after));
            return Box::pin(async move { response });
        }

        Box::pin(async move {
            let mut response = next.run(req).await;
            set_rate_headers(response.headers_mut(), &decision);
            response
        })
    }
}

/// Rejects state-changing cross-origin requests to gateway routes
pub struct Csrf;

impl Csrf {
    pub fn is_cross_origin<B>(req: &Request<B>) -> bool {
        if matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE) {
            return false;
        }

        let Some(origin) = req.headers().get(hyper::header::ORIGIN).and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let origin_host = origin
            .parse::<hyper::Uri>()
            .ok()
            .and_then(|uri| uri.authority().and_then(|a| normalize_host(a.as_str())));
        let host = request_host(req).and_then(normalize_host);

        match (origin_host, host) {
            (Some(origin_host), Some(host)) => origin_host != host,
            // "null" origins and unparseable values
            _ => true,
        }
    }
}

impl Middleware for Csrf {
    fn handle<'a>(&'a self, req: Request<Incoming>, next: Next<'a>) -> BoxFuture<'a, Response<ProxyBody>> {
        if Self::is_cross_origin(&req) {
            warn!(method = %req.method(), path = req.uri().path(), "Rejected cross-origin request");
            let response = json_error_response(ProxyErrorCode::Forbidden, "Cross-origin request rejected");
            return Box::pin(async move { response });
        }
        next.run(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, host: &str, origin: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().method(method).uri("/api/v2/users").header("host", host);
        if let Some(origin) = origin {
            builder = builder.header("origin", origin);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_redirect_decision() {
        let access: hyper::Uri = "https://example.com".parse().unwrap();
        let redirect = RedirectToAccessUrl::new(&access, Some(HostPattern::parse("*.example.com").unwrap()));

        assert!(!redirect.should_redirect(Some("example.com")));
        assert!(!redirect.should_redirect(Some("EXAMPLE.com:443")));
        assert!(!redirect.should_redirect(Some("dev.example.com")));
        assert!(redirect.should_redirect(Some("127.0.0.1:3000")));
        assert!(redirect.should_redirect(Some("a.b.example.com")));
        assert!(redirect.should_redirect(None));
        assert_eq!(redirect.access_url, "https://example.com");

        let no_wildcard = RedirectToAccessUrl::new(&access, None);
        assert!(no_wildcard.should_redirect(Some("dev.example.com")));
    }

    #[test]
    fn test_real_ip_only_from_trusted_peers() {
        let trusted: IpAddr = "10.0.0.1".parse().unwrap();
        let untrusted: IpAddr = "203.0.113.9".parse().unwrap();
        let extractor = ExtractRealIp::new(vec![trusted], vec![HeaderName::from_static("x-forwarded-for")]);

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.7, 10.0.0.1"));

        assert_eq!(extractor.resolve(trusted, &headers), "198.51.100.7".parse::<IpAddr>().unwrap());
        assert_eq!(extractor.resolve(untrusted, &headers), untrusted);

        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        assert_eq!(extractor.resolve(trusted, &headers), trusted);
    }

    #[test]
    fn test_csrf_cross_origin() {
        assert!(!Csrf::is_cross_origin(&request(Method::GET, "example.com", Some("https://evil.com"))));
        assert!(!Csrf::is_cross_origin(&request(Method::POST, "example.com", None)));
        assert!(!Csrf::is_cross_origin(&request(
            Method::POST,
            "example.com",
            Some("https://example.com")
        )));
        assert!(Csrf::is_cross_origin(&request(Method::POST, "example.com", Some("https://evil.com"))));
        assert!(Csrf::is_cross_origin(&request(Method::DELETE, "example.com", Some("null"))));
    }

    #[test]
    fn test_rate_headers() {
        let mut headers = HeaderMap::new();
        set_rate_headers(
            &mut headers,
            &RateDecision {
                allowed: true,
                limit: 512,
                remaining: 511,
                reset_after: std::time::Duration::from_millis(1500),
            },
        );

        assert_eq!(headers.get(X_RATELIMIT_LIMIT).unwrap(), "512");
        assert_eq!(headers.get(X_RATELIMIT_REMAINING).unwrap(), "511");
        assert_eq!(headers.get(X_RATELIMIT_RESET).unwrap(), "2");
    }
}
