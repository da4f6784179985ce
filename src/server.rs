//! Gateway server: listeners, interceptor chain and shutdown
//!
//! A gateway owns up to one plain and one TLS listener. Every request from
//! either listener runs through the same [`Pipeline`]. On shutdown the
//! listeners stop accepting, open connections finish their in-flight request,
//! the connection cache is closed and the server waits up to the configured
//! grace period for connection tasks to drain.

use crate::agent::{SharedDialer, TcpDialer};
use crate::cache::ConnectionCache;
use crate::config::{Config, ConfigError};
use crate::error::GatewayError;
use crate::events::{SharedEventSink, TracingEventSink};
use crate::hostname::SubdomainRouter;
use crate::middleware::{
    AttachRequestId, ConnInfo, Csrf, ExtractRealIp, Pipeline, RateLimit, Recover, RedirectToAccessUrl,
    RequestLogger, SecurityHeaders,
};
use crate::proxy::SubdomainAppProxy;
use crate::ratelimit::RateLimiter;
use crate::routes::{GatewayRoutes, VERSION};
use crate::tls::CertificateSelector;
use crate::token::{KeyProvider, SecurityKey, StaticKeyProvider, TokenVerifier};
use anyhow::Context;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// External collaborators the gateway is wired with
#[derive(Clone)]
pub struct Collaborators {
    pub dialer: SharedDialer,
    pub keys: Arc<dyn KeyProvider>,
    pub events: SharedEventSink,
}

impl Collaborators {
    /// Bundled collaborators: the static-table TCP dialer, the configured
    /// security key and tracing-backed events.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let key = match config.security.security_key()? {
            Some(key) => key,
            None => {
                warn!("No app_security_key configured, generated a random key; externally issued app tokens will be rejected");
                SecurityKey::generate()
            }
        };

        Ok(Self {
            dialer: SharedDialer::new(TcpDialer::new(
                config.agents.clone(),
                config.cache.dial_timeout(),
                config.cache.max_idle_per_agent,
            )),
            keys: Arc::new(StaticKeyProvider::new(key)),
            events: Arc::new(TracingEventSink),
        })
    }
}

pub struct Gateway {
    http_listener: Option<TcpListener>,
    tls_listener: Option<(TcpListener, TlsAcceptor)>,
    http_addr: Option<SocketAddr>,
    tls_addr: Option<SocketAddr>,
    pipeline: Arc<Pipeline>,
    cache: ConnectionCache<SharedDialer>,
    grace_period: Duration,
}

impl Gateway {
    /// Validate the configuration, load certificates and open the listeners.
    /// Nothing is bound if any startup check fails.
    pub async fn bind(config: &Config, collaborators: Collaborators) -> anyhow::Result<Self> {
        config.validate()?;
        let server = &config.server;

        let tls_acceptor = if server.tls_enable {
            let selector = CertificateSelector::load(&server.tls_cert_files, &server.tls_key_files)
                .map_err(GatewayError::from)?;
            let tls_config = Arc::new(selector).server_config().map_err(GatewayError::from)?;
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        } else {
            None
        };

        let verifier = TokenVerifier::new(collaborators.keys.as_ref()).context("Failed to load app security key")?;
        let cache = ConnectionCache::new(collaborators.dialer, config.cache.ttl(), collaborators.events.clone());
        let pipeline = build_pipeline(config, verifier, cache.clone(), &collaborators.events)?;

        let mut gateway = Self {
            http_listener: None,
            tls_listener: None,
            http_addr: None,
            tls_addr: None,
            pipeline: Arc::new(pipeline),
            cache,
            grace_period: server.shutdown_grace_period(),
        };

        if let Some(addr) = server.http_addr()? {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;
            let local = listener.local_addr()?;
            info!("Started HTTP listener at http://{}", local);
            gateway.http_addr = Some(local);
            gateway.http_listener = Some(listener);
        }

        if let (Some(addr), Some(acceptor)) = (server.tls_addr()?, tls_acceptor) {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind TLS listener on {}", addr))?;
            let local = listener.local_addr()?;
            info!("Started TLS/HTTPS listener at https://{}", local);
            gateway.tls_addr = Some(local);
            gateway.tls_listener = Some((listener, acceptor));
        }

        Ok(gateway)
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn tls_addr(&self) -> Option<SocketAddr> {
        self.tls_addr
    }

    pub fn cache(&self) -> &ConnectionCache<SharedDialer> {
        &self.cache
    }

    /// Serve until `shutdown_rx` turns true
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let sweeper = self.cache.spawn_sweeper(shutdown_rx.clone());
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = accept(self.http_listener.as_ref()) => {
                    match result {
                        Ok((stream, peer)) => {
                            let pipeline = Arc::clone(&self.pipeline);
                            let shutdown_rx = shutdown_rx.clone();
                            connections.spawn(async move {
                                let Ok(local) = stream.local_addr() else { return };
                                let info = ConnInfo { peer, local, is_tls: false };
                                if let Err(e) = handle_connection(stream, info, pipeline, shutdown_rx).await {
                                    debug!(addr = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                result = accept(self.tls_listener.as_ref().map(|(listener, _)| listener)) => {
                    match result {
                        Ok((stream, peer)) => {
                            let Some((_, acceptor)) = &self.tls_listener else { continue };
                            let acceptor = acceptor.clone();
                            let pipeline = Arc::clone(&self.pipeline);
                            let shutdown_rx = shutdown_rx.clone();
                            connections.spawn(async move {
                                let Ok(local) = stream.local_addr() else { return };
                                let info = ConnInfo { peer, local, is_tls: true };
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        if let Err(e) = handle_connection(tls_stream, info, pipeline, shutdown_rx).await {
                                            debug!(addr = %peer, error = %e, "TLS connection error");
                                        }
                                    }
                                    Err(e) => debug!(addr = %peer, error = %e, "TLS handshake failed"),
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept TLS connection"),
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_signal(&mut shutdown_rx) => {
                    info!("Gateway shutting down");
                    break;
                }
            }
        }

        drop(self.http_listener);
        drop(self.tls_listener);
        self.cache.close();

        let active = connections.len();
        if active > 0 {
            info!(active, grace_period_secs = self.grace_period.as_secs(), "Waiting for connections to drain");
        }
        let drained = tokio::time::timeout(self.grace_period, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "Grace period elapsed, aborting remaining connections");
            connections.shutdown().await;
        }

        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        info!("Gateway stopped");
        Ok(())
    }
}

fn build_pipeline(
    config: &Config,
    verifier: TokenVerifier,
    cache: ConnectionCache<SharedDialer>,
    events: &SharedEventSink,
) -> Result<Pipeline, ConfigError> {
    let server = &config.server;
    let access_url = server.access_url()?;
    let app_hostname = server.app_hostname()?;
    let limiter = Arc::new(RateLimiter::new(server.api_rate_limit, server.rate_limit_window()));

    let mut pipeline = Pipeline::new(GatewayRoutes::new(server.access_url.as_deref()))
        .with(SecurityHeaders::new(VERSION))
        .with(Recover)
        .with(AttachRequestId)
        .with(ExtractRealIp::new(server.trusted_origins()?, server.real_ip_header_names()?))
        .with(RequestLogger::new(events.clone()));

    match (&access_url, server.redirect_to_access_url) {
        (Some(url), true) => pipeline = pipeline.with(RedirectToAccessUrl::new(url, app_hostname.clone())),
        (None, true) => warn!("redirect_to_access_url is set without access_url, not redirecting"),
        _ => {}
    }

    let pipeline = pipeline
        .with(RateLimit::new(limiter, events.clone()))
        .with(SubdomainAppProxy::new(
            SubdomainRouter::new(app_hostname),
            verifier,
            cache,
            server.secure_auth_cookie,
        ))
        .with(Csrf);

    debug!(interceptors = pipeline.len(), "Built request pipeline");
    Ok(pipeline)
}

/// Resolves once shutdown is requested or the sender is gone
async fn shutdown_signal(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|shutdown| *shutdown).await;
}

/// Accept on an optional listener; a missing listener never yields
async fn accept(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => {
            let (stream, peer) = listener.accept().await?;
            let _ = stream.set_nodelay(true);
            Ok((stream, peer))
        }
        None => std::future::pending().await,
    }
}

async fn handle_connection<S>(
    stream: S,
    info: ConnInfo,
    pipeline: Arc<Pipeline>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |mut req: Request<Incoming>| {
        let pipeline = Arc::clone(&pipeline);
        req.extensions_mut().insert(info);
        async move { Ok::<_, Infallible>(pipeline.handle(req).await) }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true).http2().max_concurrent_streams(250);

    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown_signal(&mut shutdown_rx) => {
            // Finish the in-flight request, then close keep-alive
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))
}
