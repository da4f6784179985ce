//! Gateway-owned routes served when a request is not an app request

use crate::body::{self, ProxyBody};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::middleware::Endpoint;
use futures::future::BoxFuture;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize)]
pub struct BuildInfo {
    pub version: String,
    pub external_url: String,
}

pub struct GatewayRoutes {
    build_info: String,
}

impl GatewayRoutes {
    pub fn new(external_url: Option<&str>) -> Self {
        let info = BuildInfo {
            version: VERSION.to_string(),
            external_url: external_url.unwrap_or_default().to_string(),
        };
        Self {
            build_info: serde_json::to_string(&info).unwrap_or_else(|_| "{}".to_string()),
        }
    }

    fn route(&self, method: &Method, path: &str) -> Response<ProxyBody> {
        match (method, path) {
            (&Method::GET | &Method::HEAD, "/healthz") => Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "text/plain")
                .body(body::full("OK"))
                .expect("valid response builder"),
            (&Method::GET, "/api/v2/buildinfo") => Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(body::full(self.build_info.clone()))
                .expect("valid response builder"),
            _ => json_error_response(ProxyErrorCode::NotFound, "Route not found"),
        }
    }
}

impl Endpoint for GatewayRoutes {
    fn call(&self, req: Request<Incoming>) -> BoxFuture<'_, Response<ProxyBody>> {
        let response = self.route(req.method(), req.uri().path());
        Box::pin(async move { response })
    }
}
