use crate::error::GatewayError;
use crate::hostname::HostPattern;
use crate::tls::TlsError;
use crate::token::SecurityKey;
use hyper::header::HeaderName;
use hyper::Uri;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        }
    }
}

/// Gateway configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    /// Agent id -> address table used by the bundled dialer
    #[serde(default)]
    pub agents: HashMap<Uuid, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Plain HTTP listen address (empty to disable)
    #[serde(default = "default_http_address")]
    pub http_address: String,

    #[serde(default)]
    pub tls_enable: bool,

    #[serde(default = "default_tls_address")]
    pub tls_address: String,

    /// PEM certificate files, paired by position with `tls_key_files`
    #[serde(default)]
    pub tls_cert_files: Vec<PathBuf>,

    #[serde(default)]
    pub tls_key_files: Vec<PathBuf>,

    /// External URL of the deployment
    pub access_url: Option<String>,

    /// Hostname pattern for subdomain apps, e.g. `*.apps.example.com`
    pub wildcard_access_url: Option<String>,

    /// Redirect requests for unknown hosts to `access_url`
    #[serde(default)]
    pub redirect_to_access_url: bool,

    /// Requests admitted per window (<= 0 disables limiting)
    #[serde(default = "default_api_rate_limit")]
    pub api_rate_limit: i64,

    #[serde(default = "default_api_rate_limit_window")]
    pub api_rate_limit_window_secs: u64,

    /// Mark the app token cookie `Secure`
    #[serde(default)]
    pub secure_auth_cookie: bool,

    /// How long shutdown waits for in-flight requests
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Peers whose forwarding headers are trusted
    #[serde(default)]
    pub real_ip_trusted_origins: Vec<String>,

    #[serde(default = "default_real_ip_headers")]
    pub real_ip_headers: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_address: default_http_address(),
            tls_enable: false,
            tls_address: default_tls_address(),
            tls_cert_files: Vec::new(),
            tls_key_files: Vec::new(),
            access_url: None,
            wildcard_access_url: None,
            redirect_to_access_url: false,
            api_rate_limit: default_api_rate_limit(),
            api_rate_limit_window_secs: default_api_rate_limit_window(),
            secure_auth_cookie: false,
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            real_ip_trusted_origins: Vec::new(),
            real_ip_headers: default_real_ip_headers(),
        }
    }
}

fn default_http_address() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_tls_address() -> String {
    "127.0.0.1:3443".to_string()
}

fn default_api_rate_limit() -> i64 {
    512
}

fn default_api_rate_limit_window() -> u64 {
    60
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_real_ip_headers() -> Vec<String> {
    vec!["X-Forwarded-For".to_string()]
}

impl ServerConfig {
    pub fn http_enabled(&self) -> bool {
        !self.http_address.trim().is_empty()
    }

    pub fn http_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        if !self.http_enabled() {
            return Ok(None);
        }
        self.http_address
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::invalid("server.http_address", e))
    }

    pub fn tls_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        if !self.tls_enable {
            return Ok(None);
        }
        if self.tls_address.trim().is_empty() {
            return Err(ConfigError::invalid(
                "server.tls_address",
                "must not be empty when tls_enable is set",
            ));
        }
        self.tls_address
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::invalid("server.tls_address", e))
    }

    pub fn access_url(&self) -> Result<Option<Uri>, ConfigError> {
        let Some(raw) = self.access_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let uri: Uri = raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::invalid("server.access_url", e))?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(ConfigError::invalid(
                "server.access_url",
                format!("{:?} must be an absolute URL", raw),
            ));
        }
        Ok(Some(uri))
    }

    /// App hostname pattern; only a single leading `*` is accepted
    pub fn app_hostname(&self) -> Result<Option<HostPattern>, ConfigError> {
        let Some(raw) = self.wildcard_access_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let pattern = HostPattern::parse(raw).map_err(|e| ConfigError::invalid("server.wildcard_access_url", e))?;
        if !pattern.is_wildcard() {
            return Err(ConfigError::invalid(
                "server.wildcard_access_url",
                format!("{:?} must start with '*'", raw),
            ));
        }
        Ok(Some(pattern))
    }

    pub fn trusted_origins(&self) -> Result<Vec<IpAddr>, ConfigError> {
        self.real_ip_trusted_origins
            .iter()
            .map(|origin| {
                origin
                    .trim()
                    .parse()
                    .map_err(|e| ConfigError::invalid("server.real_ip_trusted_origins", format!("{:?}: {}", origin, e)))
            })
            .collect()
    }

    pub fn real_ip_header_names(&self) -> Result<Vec<HeaderName>, ConfigError> {
        self.real_ip_headers
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.trim().as_bytes())
                    .map_err(|e| ConfigError::invalid("server.real_ip_headers", format!("{:?}: {}", name, e)))
            })
            .collect()
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.api_rate_limit_window_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Idle time before an unused agent connection is closed (0 = close on release)
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Pooled idle HTTP connections kept per agent
    #[serde(default = "default_max_idle_per_agent")]
    pub max_idle_per_agent: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            dial_timeout_secs: default_dial_timeout(),
            max_idle_per_agent: default_max_idle_per_agent(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_dial_timeout() -> u64 {
    10
}

fn default_max_idle_per_agent() -> usize {
    10
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SecurityConfig {
    /// Hex encoded app security key (64 or 96 bytes)
    /// If not set, a random key is generated at startup
    pub app_security_key: Option<String>,
}

impl SecurityConfig {
    pub fn security_key(&self) -> Result<Option<SecurityKey>, ConfigError> {
        match self.app_security_key.as_deref().filter(|k| !k.trim().is_empty()) {
            Some(encoded) => SecurityKey::from_hex(encoded)
                .map(Some)
                .map_err(|e| ConfigError::invalid("security.app_security_key", e)),
            None => Ok(None),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate everything that can be checked without touching the network.
    /// Certificate files are parsed later, when the gateway binds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;

        if !server.http_enabled() && !server.tls_enable {
            return Err(GatewayError::NoListenerConfigured.into());
        }
        server.http_addr()?;
        server.tls_addr()?;

        if server.tls_cert_files.len() != server.tls_key_files.len() {
            return Err(GatewayError::from(TlsError::CountMismatch {
                certs: server.tls_cert_files.len(),
                keys: server.tls_key_files.len(),
            })
            .into());
        }
        if server.tls_enable && server.tls_cert_files.is_empty() {
            return Err(GatewayError::from(TlsError::NoCertificates).into());
        }

        server.access_url()?;
        server.app_hostname()?;
        server.trusted_origins()?;
        server.real_ip_header_names()?;
        self.security.security_key()?;

        Ok(())
    }
}
