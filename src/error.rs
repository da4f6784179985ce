//! Error taxonomy and JSON error responses for the gateway

use crate::body::{self, ProxyBody};
use crate::token::TokenError;
use hyper::{Response, StatusCode};
use serde::Serialize;
use uuid::Uuid;

/// Errors surfaced by the gateway core.
///
/// Startup errors (`InvalidCertificateMaterial`, `NoListenerConfigured`) abort
/// the process before any listener accepts. Everything else is resolved to an
/// HTTP status for the request that hit it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("no certificate matches server name {0:?}")]
    CertificateNotFound(String),

    #[error("invalid certificate material: {0}")]
    InvalidCertificateMaterial(String),

    #[error("agent {agent_id} is unreachable: {reason}")]
    AgentUnreachable { agent_id: Uuid, reason: String },

    #[error("connection cache is closed")]
    CacheClosed,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("malformed application route: {0}")]
    MalformedRoute(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("no listener configured: set server.http_address or enable TLS")]
    NoListenerConfigured,
}

impl GatewayError {
    pub fn unreachable(agent_id: Uuid, reason: impl ToString) -> Self {
        GatewayError::AgentUnreachable {
            agent_id,
            reason: reason.to_string(),
        }
    }

    /// Error code reported to the client for this error
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            GatewayError::MalformedRoute(_) => ProxyErrorCode::MalformedRoute,
            GatewayError::Token(TokenError::ScopeMismatch) => ProxyErrorCode::Forbidden,
            GatewayError::Token(_) => ProxyErrorCode::Unauthorized,
            GatewayError::RateLimited => ProxyErrorCode::RateLimited,
            GatewayError::AgentUnreachable { .. } => ProxyErrorCode::AgentUnreachable,
            GatewayError::CacheClosed => ProxyErrorCode::ShuttingDown,
            GatewayError::CertificateNotFound(_)
            | GatewayError::InvalidCertificateMaterial(_)
            | GatewayError::NoListenerConfigured => ProxyErrorCode::InternalError,
        }
    }

    /// Client-facing message. Internal detail such as agent addresses stays in
    /// the logs.
    fn public_message(&self) -> String {
        match self {
            GatewayError::MalformedRoute(detail) => format!("Invalid application URL: {}", detail),
            GatewayError::Token(TokenError::Missing) => "No app token provided".to_string(),
            GatewayError::Token(TokenError::TokenExpired) => "App token has expired".to_string(),
            GatewayError::Token(TokenError::ScopeMismatch) => {
                "App token does not grant access to this application".to_string()
            }
            GatewayError::Token(_) => "Invalid app token".to_string(),
            GatewayError::RateLimited => "You've been rate limited".to_string(),
            GatewayError::AgentUnreachable { .. } => "Failed to connect to workspace agent".to_string(),
            GatewayError::CacheClosed => "Gateway is shutting down, please retry later".to_string(),
            _ => "Internal gateway error".to_string(),
        }
    }

    pub fn into_response(self) -> Response<ProxyBody> {
        json_error_response(self.code(), self.public_message())
    }
}

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Subdomain did not follow the application URL format
    MalformedRoute,
    /// Missing, malformed, tampered or expired app token
    Unauthorized,
    /// Valid token for a different application, or a rejected cross-site request
    Forbidden,
    /// Route does not exist on the gateway itself
    NotFound,
    /// Global request budget exhausted
    RateLimited,
    /// Dial to the workspace agent failed
    AgentUnreachable,
    /// Gateway is draining connections
    ShuttingDown,
    /// Internal gateway error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MalformedRoute => StatusCode::BAD_REQUEST,
            ProxyErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ProxyErrorCode::AgentUnreachable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MalformedRoute => "MALFORMED_ROUTE",
            ProxyErrorCode::Unauthorized => "UNAUTHORIZED",
            ProxyErrorCode::Forbidden => "FORBIDDEN",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::RateLimited => "RATE_LIMITED",
            ProxyErrorCode::AgentUnreachable => "AGENT_UNREACHABLE",
            ProxyErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(body::full(error.to_json()))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_status_codes() {
        let cases = [
            (GatewayError::MalformedRoute("x".into()), StatusCode::BAD_REQUEST),
            (GatewayError::Token(TokenError::Missing), StatusCode::UNAUTHORIZED),
            (GatewayError::Token(TokenError::InvalidSignature), StatusCode::UNAUTHORIZED),
            (GatewayError::Token(TokenError::TokenExpired), StatusCode::UNAUTHORIZED),
            (GatewayError::Token(TokenError::ScopeMismatch), StatusCode::FORBIDDEN),
            (GatewayError::RateLimited, StatusCode::TOO_MANY_REQUESTS),
            (GatewayError::unreachable(Uuid::nil(), "refused"), StatusCode::BAD_GATEWAY),
            (GatewayError::CacheClosed, StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (error, status) in cases {
            assert_eq!(error.code().status_code(), status, "{}", error);
        }
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::AgentUnreachable, "Failed to connect");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"AGENT_UNREACHABLE\""));
        assert!(json.contains("\"message\":\"Failed to connect\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_unreachable_hides_reason_from_client() {
        let agent_id = Uuid::new_v4();
        let response = GatewayError::unreachable(agent_id, "connect to 10.0.0.7:4000 refused").into_response();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "AGENT_UNREACHABLE");
        assert_eq!(
            response.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_unreachable_display_keeps_reason() {
        let agent_id = Uuid::nil();
        let error = GatewayError::unreachable(agent_id, "timed out");
        assert!(error.to_string().contains("timed out"));
        assert!(error.to_string().contains(&agent_id.to_string()));
    }
}
