//! TLS certificate selection by SNI
//!
//! Several independently issued certificates can be served from one listener.
//! Each certificate is indexed under the DNS names found in its subject common
//! name and SAN list. During the handshake an exact name wins; otherwise the
//! first certificate (in load order) with a matching wildcard name is used.

use crate::error::GatewayError;
use crate::hostname::HostPattern;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("tls_cert_files and tls_key_files must be used the same amount of times ({certs} certificates, {keys} keys)")]
    CountMismatch { certs: usize, keys: usize },

    #[error("TLS is enabled but no certificate/key pairs are configured")]
    NoCertificates,

    #[error("failed to load certificate {0}")]
    CertificateLoad(String),

    #[error("failed to load private key {0}")]
    KeyLoad(String),

    #[error("load TLS key pair (cert {cert}, key {key}): {reason}")]
    KeyPair { cert: String, key: String, reason: String },

    #[error("certificate {path} has no DNS names: {reason}")]
    InvalidCertificate { path: String, reason: String },

    #[error("TLS configuration: {0}")]
    Config(String),
}

impl From<TlsError> for GatewayError {
    fn from(err: TlsError) -> Self {
        GatewayError::InvalidCertificateMaterial(err.to_string())
    }
}

/// Immutable set of certificates built at startup
#[derive(Debug)]
pub struct CertificateSelector {
    /// All loaded certificates in load order
    certs: Vec<Arc<CertifiedKey>>,
    /// Lowercase exact hostname -> certificate
    exact: HashMap<String, Arc<CertifiedKey>>,
    /// Wildcard patterns in load order
    wildcards: Vec<(HostPattern, Arc<CertifiedKey>)>,
}

impl CertificateSelector {
    /// Load paired certificate and key files. Counts are checked before any
    /// file is opened.
    pub fn load<P: AsRef<Path>>(cert_files: &[P], key_files: &[P]) -> Result<Self, TlsError> {
        if cert_files.len() != key_files.len() {
            return Err(TlsError::CountMismatch {
                certs: cert_files.len(),
                keys: key_files.len(),
            });
        }
        if cert_files.is_empty() {
            return Err(TlsError::NoCertificates);
        }

        let mut pairs = Vec::with_capacity(cert_files.len());
        for (cert_path, key_path) in cert_files.iter().zip(key_files) {
            let (cert_path, key_path) = (cert_path.as_ref(), key_path.as_ref());
            let chain = load_certs(cert_path)?;
            let key = load_key(key_path)?;
            let certified = certified_key(chain, key).map_err(|reason| TlsError::KeyPair {
                cert: cert_path.display().to_string(),
                key: key_path.display().to_string(),
                reason,
            })?;
            let names = certificate_names(&certified.cert[0]).map_err(|reason| TlsError::InvalidCertificate {
                path: cert_path.display().to_string(),
                reason,
            })?;

            debug!(cert = %cert_path.display(), names = ?names, "Loaded TLS certificate");
            pairs.push((names, Arc::new(certified)));
        }

        Ok(Self::from_certified(pairs))
    }

    /// Build from already loaded certificates and the names each one serves
    pub fn from_certified(pairs: Vec<(Vec<String>, Arc<CertifiedKey>)>) -> Self {
        let mut certs = Vec::with_capacity(pairs.len());
        let mut exact = HashMap::new();
        let mut wildcards = Vec::new();

        for (names, cert) in pairs {
            for name in names {
                match HostPattern::parse(&name) {
                    Ok(pattern @ HostPattern::WildcardSuffix(_)) => wildcards.push((pattern, cert.clone())),
                    Ok(HostPattern::Exact(host)) => {
                        exact.entry(host).or_insert_with(|| cert.clone());
                    }
                    Err(e) => debug!(name = %name, error = %e, "Skipping certificate name"),
                }
            }
            certs.push(cert);
        }

        info!(
            certificates = certs.len(),
            exact_names = exact.len(),
            wildcard_names = wildcards.len(),
            "Certificate selector initialized"
        );

        Self {
            certs,
            exact,
            wildcards,
        }
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Certificate for `server_name`: exact match, then first wildcard match
    pub fn select(&self, server_name: &str) -> Result<Arc<CertifiedKey>, GatewayError> {
        let name = server_name.trim_end_matches('.').to_ascii_lowercase();

        if let Some(cert) = self.exact.get(&name) {
            return Ok(cert.clone());
        }

        self.wildcards
            .iter()
            .find(|(pattern, _)| pattern.matches(&name))
            .map(|(_, cert)| cert.clone())
            .ok_or(GatewayError::CertificateNotFound(name))
    }

    /// rustls server config resolving certificates through this selector
    pub fn server_config(self: Arc<Self>) -> Result<rustls::ServerConfig, TlsError> {
        let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(self);
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(config)
    }
}

impl ResolvesServerCert for CertificateSelector {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = client_hello.server_name() else {
            // Clients connecting by IP send no SNI
            return self.certs.first().cloned();
        };

        match self.select(name) {
            Ok(cert) => Some(cert),
            Err(e) => {
                debug!(error = %e, "Rejecting TLS handshake");
                None
            }
        }
    }
}

fn certified_key(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<CertifiedKey, String> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key).map_err(|e| e.to_string())?;
    let certified = CertifiedKey::new(chain, signing_key);
    certified.keys_match().map_err(|e| e.to_string())?;
    Ok(certified)
}

/// DNS names from the subject common name and the SAN extension
fn certificate_names(cert: &CertificateDer<'_>) -> Result<Vec<String>, String> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).map_err(|e| e.to_string())?;
    let mut names = Vec::new();

    for cn in parsed.subject().iter_common_name() {
        // Common names are free text; only keep ones shaped like hostnames
        if let Ok(cn) = cn.as_str() {
            if !cn.is_empty() && cn.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '*')) {
                names.push(cn.to_ascii_lowercase());
            }
        }
    }

    if let Some(san) = parsed.subject_alternative_name().map_err(|e| e.to_string())? {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                let dns = dns.to_ascii_lowercase();
                if !names.contains(&dns) {
                    names.push(dns);
                }
            }
        }
    }

    if names.is_empty() {
        return Err("no common name or DNS subject alternative names".to_string());
    }
    Ok(names)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::CertificateLoad(format!("{}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateLoad(format!("{}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateLoad(format!(
            "{}: no certificates found",
            path.display()
        )));
    }

    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::KeyLoad(format!("{}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| TlsError::KeyLoad(format!("{}: {}", path.display(), e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(TlsError::KeyLoad(format!("{}: no private key found", path.display())))
}
