//! Agent connections and the bundled TCP dial primitive
//!
//! An [`AgentConn`] is the cached channel to one workspace agent: a pooled
//! HTTP client bound to the agent's address plus a close signal. Closing it
//! fails every request still using it with `CacheClosed`.

use crate::cache::{Connection, Dialer};
use crate::error::GatewayError;
use futures::future::{BoxFuture, FutureExt};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// How long an idle pooled HTTP connection to an agent is kept
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Dialer shared by the gateway, erased so deployments can supply their own
#[derive(Clone)]
pub struct SharedDialer(pub Arc<dyn Dialer<Conn = AgentConn>>);

impl SharedDialer {
    pub fn new<D: Dialer<Conn = AgentConn>>(dialer: D) -> Self {
        Self(Arc::new(dialer))
    }
}

impl Dialer for SharedDialer {
    type Conn = AgentConn;

    fn dial(&self, agent_id: Uuid) -> BoxFuture<'static, Result<AgentConn, GatewayError>> {
        self.0.dial(agent_id)
    }
}

pub struct AgentConn {
    agent_id: Uuid,
    addr: SocketAddr,
    client: Client<HttpConnector, Incoming>,
    closed: watch::Sender<bool>,
}

impl AgentConn {
    pub fn new(agent_id: Uuid, addr: SocketAddr, connect_timeout: Duration, max_idle: usize) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(connect_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(max_idle)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);

        let (closed, _) = watch::channel(false);
        Self {
            agent_id,
            addr,
            client,
            closed,
        }
    }

    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address serving `port` on the agent, or the agent itself
    pub fn target(&self, port: Option<u16>) -> SocketAddr {
        match port {
            Some(port) => SocketAddr::new(self.addr.ip(), port),
            None => self.addr,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection is closed
    pub fn closed_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.closed.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    /// Forward a request to the agent
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: Option<u16>,
    ) -> Result<Response<Incoming>, GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::CacheClosed);
        }

        let target = self.target(port);
        let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let uri = format!("http://{}{}", target, path)
            .parse::<hyper::Uri>()
            .map_err(|e| GatewayError::unreachable(self.agent_id, e))?;

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        // Agents speak HTTP/1.1 regardless of the client's protocol
        parts.version = hyper::Version::HTTP_11;
        let agent_req = Request::from_parts(parts, body);

        tokio::select! {
            result = self.client.request(agent_req) => {
                result.map_err(|e| GatewayError::unreachable(self.agent_id, e))
            }
            _ = self.closed_signal() => Err(GatewayError::CacheClosed),
        }
    }

    /// Open a raw stream to the agent for upgraded protocols
    pub async fn open_stream(&self, port: Option<u16>) -> Result<TcpStream, GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::CacheClosed);
        }

        let target = self.target(port);
        tokio::select! {
            result = TcpStream::connect(target) => {
                let stream = result.map_err(|e| GatewayError::unreachable(self.agent_id, format!("connect {}: {}", target, e)))?;
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            _ = self.closed_signal() => Err(GatewayError::CacheClosed),
        }
    }
}

impl Connection for AgentConn {
    fn close(&self) {
        self.closed.send_replace(true);
        debug!(agent_id = %self.agent_id, addr = %self.addr, "Agent connection closed");
    }
}

/// Dials agents listed in a static `agent id -> address` table. Reachability
/// is probed with a TCP connect bounded by the dial timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    agents: HashMap<Uuid, String>,
    dial_timeout: Duration,
    max_idle_per_agent: usize,
}

impl TcpDialer {
    pub fn new(agents: HashMap<Uuid, String>, dial_timeout: Duration, max_idle_per_agent: usize) -> Self {
        Self {
            agents,
            dial_timeout,
            max_idle_per_agent,
        }
    }
}

impl Dialer for TcpDialer {
    type Conn = AgentConn;

    fn dial(&self, agent_id: Uuid) -> BoxFuture<'static, Result<AgentConn, GatewayError>> {
        let target = self.agents.get(&agent_id).cloned();
        let dial_timeout = self.dial_timeout;
        let max_idle = self.max_idle_per_agent;

        async move {
            let target = target.ok_or_else(|| GatewayError::unreachable(agent_id, "unknown agent"))?;

            // Reachability check only; the stream is dropped and requests
            // go through the pooled client
            let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(&target))
                .await
                .map_err(|_| {
                    GatewayError::unreachable(agent_id, format!("dial {} timed out after {:?}", target, dial_timeout))
                })?
                .map_err(|e| GatewayError::unreachable(agent_id, format!("dial {}: {}", target, e)))?;

            let addr = stream
                .peer_addr()
                .map_err(|e| GatewayError::unreachable(agent_id, e))?;
            debug!(%agent_id, %addr, "Dialed agent");

            Ok(AgentConn::new(agent_id, addr, dial_timeout, max_idle))
        }
        .boxed()
    }
}
