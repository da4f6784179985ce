//! Structured events emitted by the gateway core
//!
//! The core reports request outcomes, cache activity and rate-limit rejections
//! through an [`EventSink`]. Where those events end up (log lines, a metrics
//! registry, a telemetry collector) is decided by whoever builds the gateway.

use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    RequestCompleted {
        method: String,
        host: String,
        path: String,
        status: u16,
        latency: Duration,
    },
    CacheHit {
        agent_id: Uuid,
    },
    CacheMiss {
        agent_id: Uuid,
    },
    CacheDial {
        agent_id: Uuid,
        ok: bool,
    },
    CacheEvict {
        agent_id: Uuid,
    },
    RateLimited {
        remote: Option<IpAddr>,
    },
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: GatewayEvent);
}

pub type SharedEventSink = Arc<dyn EventSink>;

/// Default sink: every event becomes a debug-level log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::RequestCompleted {
                method,
                host,
                path,
                status,
                latency,
            } => {
                debug!(%method, %host, %path, status, latency_ms = latency.as_millis() as u64, "request completed");
            }
            GatewayEvent::CacheHit { agent_id } => debug!(%agent_id, "agent connection cache hit"),
            GatewayEvent::CacheMiss { agent_id } => debug!(%agent_id, "agent connection cache miss"),
            GatewayEvent::CacheDial { agent_id, ok } => debug!(%agent_id, ok, "agent dial finished"),
            GatewayEvent::CacheEvict { agent_id } => debug!(%agent_id, "agent connection evicted"),
            GatewayEvent::RateLimited { remote } => debug!(remote = ?remote, "request rate limited"),
        }
    }
}

/// Sink that keeps every event in memory, for assertions in tests and for
/// embedding the gateway where events are drained by the host program.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<GatewayEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&GatewayEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl EventSink for MemoryEventSink {
    fn record(&self, event: GatewayEvent) {
        self.events.lock().push(event);
    }
}
