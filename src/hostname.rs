//! Hostname patterns and subdomain app routing
//!
//! Patterns are a tagged variant rather than a regex: `alpaca.com` is an
//! exact match, `*.llama.com` or `*--apps.example.com` substitute exactly one
//! leading label fragment (no dots) in front of a fixed suffix.
//!
//! Application hosts follow `{app}--{agent}--{workspace}--{user}{suffix}`,
//! for example `code-server--main--dev--alice.apps.example.com`.

use crate::error::GatewayError;
use hyper::Request;
use std::fmt;

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Separator between the parts of an application subdomain
const APP_SEPARATOR: &str = "--";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostPattern {
    Exact(String),
    /// Everything after the `*`, including any leading dot
    WildcardSuffix(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostPatternError {
    #[error("hostname pattern is empty")]
    Empty,
    #[error("hostname pattern {0:?} may only contain a single leading '*'")]
    MisplacedWildcard(String),
    #[error("hostname pattern {0:?} needs a suffix after the wildcard")]
    MissingSuffix(String),
}

impl HostPattern {
    pub fn parse(pattern: &str) -> Result<Self, HostPatternError> {
        let pattern = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
        if pattern.is_empty() {
            return Err(HostPatternError::Empty);
        }

        match pattern.strip_prefix('*') {
            Some(suffix) => {
                if suffix.contains('*') {
                    return Err(HostPatternError::MisplacedWildcard(pattern));
                }
                if suffix.is_empty() || suffix == "." {
                    return Err(HostPatternError::MissingSuffix(pattern));
                }
                Ok(HostPattern::WildcardSuffix(suffix.to_string()))
            }
            None if pattern.contains('*') => Err(HostPatternError::MisplacedWildcard(pattern)),
            None => Ok(HostPattern::Exact(pattern)),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, HostPattern::WildcardSuffix(_))
    }

    /// Returns the text substituted for the wildcard, or an empty string for
    /// an exact match. `host` must already be lowercase and port-free.
    pub fn capture<'a>(&self, host: &'a str) -> Option<&'a str> {
        match self {
            HostPattern::Exact(name) => (host == name).then_some(""),
            HostPattern::WildcardSuffix(suffix) => {
                let label = host.strip_suffix(suffix.as_str())?;
                if label.is_empty() || label.contains('.') {
                    return None;
                }
                Some(label)
            }
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        self.capture(host).is_some()
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPattern::Exact(name) => f.write_str(name),
            HostPattern::WildcardSuffix(suffix) => write!(f, "*{}", suffix),
        }
    }
}

/// Host of a request: the Host header for HTTP/1.1, the URI authority for
/// HTTP/2.
pub fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
}

/// Strip the port and validate a raw Host value, returning it lowercased.
pub fn normalize_host(raw: &str) -> Option<String> {
    let host = if let Some(rest) = raw.strip_prefix('[') {
        // IPv6 literal
        &raw[..rest.find(']')? + 2]
    } else {
        match raw.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => raw,
        }
    };
    let host = host.trim_end_matches('.');

    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen, dot and IPv6 punctuation only
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':' | '[' | ']'))
    {
        return None;
    }

    Some(host.to_ascii_lowercase())
}

/// Outcome of matching a Host header against the app hostname pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub matched: bool,
    pub key: String,
}

impl RouteMatch {
    fn unmatched() -> Self {
        Self {
            matched: false,
            key: String::new(),
        }
    }

    /// Parse the extracted key into an application route
    pub fn parse_route(&self) -> Result<AppRoute, GatewayError> {
        AppRoute::parse(&self.key)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubdomainRouter {
    pattern: Option<HostPattern>,
}

impl SubdomainRouter {
    pub fn new(pattern: Option<HostPattern>) -> Self {
        Self { pattern }
    }

    pub fn pattern(&self) -> Option<&HostPattern> {
        self.pattern.as_ref()
    }

    pub fn match_host(&self, host_header: &str) -> RouteMatch {
        let Some(pattern) = &self.pattern else {
            return RouteMatch::unmatched();
        };
        let Some(host) = normalize_host(host_header) else {
            return RouteMatch::unmatched();
        };

        match pattern.capture(&host) {
            Some(key) => RouteMatch {
                matched: true,
                key: key.to_string(),
            },
            None => RouteMatch::unmatched(),
        }
    }
}

/// Target of a subdomain app request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRoute {
    pub app_slug_or_port: String,
    pub agent_name: String,
    pub workspace_name: String,
    pub username: String,
}

impl AppRoute {
    pub fn parse(key: &str) -> Result<Self, GatewayError> {
        let parts: Vec<&str> = key.split(APP_SEPARATOR).collect();
        if parts.len() != 4 {
            return Err(GatewayError::MalformedRoute(format!(
                "expected 4 parts separated by {:?}, got {}",
                APP_SEPARATOR,
                parts.len()
            )));
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(GatewayError::MalformedRoute("empty subdomain part".to_string()));
        }

        Ok(Self {
            app_slug_or_port: parts[0].to_string(),
            agent_name: parts[1].to_string(),
            workspace_name: parts[2].to_string(),
            username: parts[3].to_string(),
        })
    }

    /// Port of a port-forwarding app (`8080--main--dev--alice`)
    pub fn port(&self) -> Option<u16> {
        self.app_slug_or_port.parse().ok()
    }
}

impl fmt::Display for AppRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}{sep}{}",
            self.app_slug_or_port,
            self.agent_name,
            self.workspace_name,
            self.username,
            sep = APP_SEPARATOR
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_patterns() {
        assert_eq!(
            HostPattern::parse("Alpaca.com").unwrap(),
            HostPattern::Exact("alpaca.com".to_string())
        );
        assert_eq!(
            HostPattern::parse("*.llama.com").unwrap(),
            HostPattern::WildcardSuffix(".llama.com".to_string())
        );
        assert_eq!(
            HostPattern::parse("*--apps.coder.com").unwrap(),
            HostPattern::WildcardSuffix("--apps.coder.com".to_string())
        );
        assert!(matches!(HostPattern::parse(""), Err(HostPatternError::Empty)));
        assert!(matches!(HostPattern::parse("*"), Err(HostPatternError::MissingSuffix(_))));
        assert!(matches!(HostPattern::parse("a.*.com"), Err(HostPatternError::MisplacedWildcard(_))));
        assert!(matches!(HostPattern::parse("**.com"), Err(HostPatternError::MisplacedWildcard(_))));
    }

    #[test]
    fn test_wildcard_replaces_single_label() {
        let pattern = HostPattern::parse("*.llama.com").unwrap();

        assert_eq!(pattern.capture("hi.llama.com"), Some("hi"));
        assert!(!pattern.matches("llama.com"));
        assert!(!pattern.matches(".llama.com"));
        assert!(!pattern.matches("a.b.llama.com"));
        assert!(!pattern.matches("hillama.com"));
    }

    #[test]
    fn test_exact_pattern() {
        let pattern = HostPattern::parse("alpaca.com").unwrap();
        assert_eq!(pattern.capture("alpaca.com"), Some(""));
        assert!(!pattern.matches("www.alpaca.com"));
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Example.COM:8080"), Some("example.com".to_string()));
        assert_eq!(normalize_host("example.com."), Some("example.com".to_string()));
        assert_eq!(normalize_host("127.0.0.1:3000"), Some("127.0.0.1".to_string()));
        assert_eq!(normalize_host("[::1]:3000"), Some("[::1]".to_string()));
        assert_eq!(normalize_host("bad host"), None);
        assert_eq!(normalize_host(""), None);
        assert_eq!(normalize_host(&"a".repeat(300)), None);
    }

    #[test]
    fn test_router_matches_app_hosts() {
        let router = SubdomainRouter::new(Some(HostPattern::parse("*.apps.coder.com").unwrap()));

        let m = router.match_host("code-server--main--dev--alice.apps.coder.com:443");
        assert!(m.matched);
        assert_eq!(m.key, "code-server--main--dev--alice");

        let route = m.parse_route().unwrap();
        assert_eq!(route.app_slug_or_port, "code-server");
        assert_eq!(route.agent_name, "main");
        assert_eq!(route.workspace_name, "dev");
        assert_eq!(route.username, "alice");
        assert_eq!(route.port(), None);
        assert_eq!(route.to_string(), "code-server--main--dev--alice");
    }

    #[test]
    fn test_router_passes_through_dashboard_host() {
        let router = SubdomainRouter::new(Some(HostPattern::parse("*.apps.coder.com").unwrap()));
        assert!(!router.match_host("coder.com").matched);
        assert!(!router.match_host("apps.coder.com").matched);
        assert!(!router.match_host("a.b.apps.coder.com").matched);

        let disabled = SubdomainRouter::default();
        assert!(!disabled.match_host("x--y--z--w.apps.coder.com").matched);
    }

    #[test]
    fn test_malformed_route_is_matched_but_rejected() {
        let router = SubdomainRouter::new(Some(HostPattern::parse("*.apps.coder.com").unwrap()));

        for host in ["app.apps.coder.com", "a--b--c.apps.coder.com", "a----c--d.apps.coder.com"] {
            let m = router.match_host(host);
            assert!(m.matched, "{}", host);
            assert!(
                matches!(m.parse_route(), Err(GatewayError::MalformedRoute(_))),
                "{}",
                host
            );
        }
    }

    #[test]
    fn test_port_app() {
        let route = AppRoute::parse("8080--main--dev--alice").unwrap();
        assert_eq!(route.port(), Some(8080));
    }

    #[test]
    fn test_request_host_prefers_header() {
        let req = Request::builder()
            .uri("http://from-uri.example.com/")
            .header("host", "from-header.example.com")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req), Some("from-header.example.com"));

        let req = Request::builder().uri("http://from-uri.example.com/").body(()).unwrap();
        assert_eq!(request_host(&req), Some("from-uri.example.com"));
    }
}
