//! Reference-counted cache of agent connections
//!
//! Every agent gets at most one live connection, shared by all requests that
//! target it. The first `acquire` for an agent starts the dial; concurrent
//! callers await the same shared dial future, so a burst of requests to a cold
//! agent produces exactly one dial. A failed dial is handed to every waiter
//! and the entry is dropped, so the next `acquire` dials fresh.
//!
//! Entries are released by dropping the [`CacheHandle`]. An entry whose
//! reference count reaches zero stays warm for the TTL and is then closed by
//! the sweeper. A zero TTL closes the entry as soon as the last handle drops.
//!
//! The map is sharded (`DashMap`) and each entry carries its own lock, so
//! traffic to unrelated agents never contends on a cache-wide lock.

use crate::error::GatewayError;
use crate::events::{GatewayEvent, SharedEventSink};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on the sweep interval
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Lower bound on the sweep interval
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A live channel to an agent
pub trait Connection: Send + Sync + 'static {
    /// Close the channel. Users still holding it observe a closed-connection
    /// error on next use.
    fn close(&self);
}

/// The dial primitive: agent identifier to live connection
pub trait Dialer: Send + Sync + 'static {
    type Conn: Connection;

    fn dial(&self, agent_id: Uuid) -> BoxFuture<'static, Result<Self::Conn, GatewayError>>;
}

impl<T: Dialer + ?Sized> Dialer for Arc<T> {
    type Conn = T::Conn;

    fn dial(&self, agent_id: Uuid) -> BoxFuture<'static, Result<Self::Conn, GatewayError>> {
        (**self).dial(agent_id)
    }
}

type DialFuture<C> = Shared<BoxFuture<'static, Result<Arc<C>, GatewayError>>>;

/// Statistics for the connection cache
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub dials: AtomicU64,
    pub dial_failures: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    pub fn get_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn get_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn get_dials(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    pub fn get_dial_failures(&self) -> u64 {
        self.dial_failures.load(Ordering::Relaxed)
    }

    pub fn get_evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

struct SlotState {
    ref_count: usize,
    last_released: Instant,
}

/// One cache entry. The dial future doubles as the pending/ready/failed state.
struct Slot<C> {
    dial: DialFuture<C>,
    state: Mutex<SlotState>,
}

struct Inner<D: Dialer> {
    dialer: D,
    slots: dashmap::DashMap<Uuid, Arc<Slot<D::Conn>>>,
    ttl: Duration,
    closed: watch::Sender<bool>,
    stats: Arc<CacheStats>,
    events: SharedEventSink,
}

impl<D: Dialer> Inner<D> {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the cache is closed
    fn closed_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.closed.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    fn start_dial(&self, agent_id: Uuid) -> DialFuture<D::Conn> {
        let dial = self.dialer.dial(agent_id);
        let stats = Arc::clone(&self.stats);
        let events = Arc::clone(&self.events);

        async move {
            stats.dials.fetch_add(1, Ordering::Relaxed);
            let result = dial.await;
            events.record(GatewayEvent::CacheDial {
                agent_id,
                ok: result.is_ok(),
            });

            match result {
                Ok(conn) => {
                    debug!(%agent_id, "Agent connection established");
                    Ok(Arc::new(conn))
                }
                Err(e) => {
                    stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(%agent_id, error = %e, "Agent dial failed");
                    Err(e)
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Remove `slot` if it is still the entry for `agent_id` and unused
    fn evict_if_idle(&self, agent_id: Uuid, slot: &Arc<Slot<D::Conn>>) {
        let removed = self
            .slots
            .remove_if(&agent_id, |_, s| Arc::ptr_eq(s, slot) && s.state.lock().ref_count == 0);

        if let Some((_, slot)) = removed {
            self.evicted(agent_id, &slot);
        }
    }

    fn evicted(&self, agent_id: Uuid, slot: &Slot<D::Conn>) {
        if let Some(Ok(conn)) = slot.dial.peek() {
            conn.close();
        }
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        self.events.record(GatewayEvent::CacheEvict { agent_id });
        debug!(%agent_id, "Agent connection evicted");
    }
}

/// Releases one reference when dropped
struct Lease<D: Dialer> {
    inner: Arc<Inner<D>>,
    agent_id: Uuid,
    slot: Arc<Slot<D::Conn>>,
}

impl<D: Dialer> Drop for Lease<D> {
    fn drop(&mut self) {
        let idle = {
            let mut state = self.slot.state.lock();
            state.ref_count = state.ref_count.saturating_sub(1);
            state.last_released = Instant::now();
            state.ref_count == 0
        };

        if idle && (self.inner.ttl.is_zero() || self.inner.is_closed()) {
            self.inner.evict_if_idle(self.agent_id, &self.slot);
        }
    }
}

/// A cached connection in use. Dropping the handle releases it.
pub struct CacheHandle<D: Dialer> {
    conn: Arc<D::Conn>,
    lease: Lease<D>,
}

impl<D: Dialer> CacheHandle<D> {
    pub fn agent_id(&self) -> Uuid {
        self.lease.agent_id
    }

    pub fn connection(&self) -> &Arc<D::Conn> {
        &self.conn
    }
}

impl<D: Dialer> Deref for CacheHandle<D> {
    type Target = D::Conn;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

pub struct ConnectionCache<D: Dialer> {
    inner: Arc<Inner<D>>,
}

impl<D: Dialer> Clone for ConnectionCache<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Dialer> ConnectionCache<D> {
    pub fn new(dialer: D, ttl: Duration, events: SharedEventSink) -> Self {
        Self {
            inner: Arc::new(Inner {
                dialer,
                slots: dashmap::DashMap::new(),
                ttl,
                closed: watch::channel(false).0,
                stats: Arc::new(CacheStats::default()),
                events,
            }),
        }
    }

    /// Get the shared connection for `agent_id`, dialing it if needed
    pub async fn acquire(&self, agent_id: Uuid) -> Result<CacheHandle<D>, GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::CacheClosed);
        }

        let (slot, fresh) = {
            let mut fresh = false;
            let entry = self.inner.slots.entry(agent_id).or_insert_with(|| {
                fresh = true;
                Arc::new(Slot {
                    dial: self.inner.start_dial(agent_id),
                    state: Mutex::new(SlotState {
                        ref_count: 0,
                        last_released: Instant::now(),
                    }),
                })
            });
            let slot = Arc::clone(entry.value());
            slot.state.lock().ref_count += 1;
            (slot, fresh)
        };

        if fresh {
            self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
            self.inner.events.record(GatewayEvent::CacheMiss { agent_id });
        } else {
            self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
            self.inner.events.record(GatewayEvent::CacheHit { agent_id });
        }

        // From here on the reference is released on every path, including
        // cancellation of this future.
        let lease = Lease {
            inner: Arc::clone(&self.inner),
            agent_id,
            slot: Arc::clone(&slot),
        };

        // close() may have drained the map just before our insert
        if self.is_closed() {
            return Err(GatewayError::CacheClosed);
        }

        // A pending dial is abandoned as soon as the cache closes
        let result = tokio::select! {
            result = slot.dial.clone() => result,
            _ = self.inner.closed_signal() => return Err(GatewayError::CacheClosed),
        };

        match result {
            Ok(conn) => {
                if self.is_closed() {
                    conn.close();
                    return Err(GatewayError::CacheClosed);
                }
                Ok(CacheHandle { conn, lease })
            }
            Err(e) => {
                drop(lease);
                self.inner
                    .slots
                    .remove_if(&agent_id, |_, s| Arc::ptr_eq(s, &slot));
                Err(e)
            }
        }
    }

    /// Close and remove entries idle for longer than the TTL. Returns the
    /// number of evicted entries.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let ttl = self.inner.ttl;
        let mut expired = Vec::new();

        self.inner.slots.retain(|agent_id, slot| {
            let state = slot.state.lock();
            let idle = state.ref_count == 0 && now.duration_since(state.last_released) > ttl;
            if idle {
                expired.push((*agent_id, Arc::clone(slot)));
            }
            !idle
        });

        for (agent_id, slot) in &expired {
            self.inner.evicted(*agent_id, slot);
        }
        expired.len()
    }

    /// Sweep interval for the configured TTL
    pub fn sweep_interval(&self) -> Duration {
        (self.inner.ttl / 4).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
    }

    /// Run the sweeper until shutdown. No task is started for a zero TTL since
    /// entries are then evicted on release.
    pub fn spawn_sweeper(&self, mut shutdown_rx: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if self.inner.ttl.is_zero() {
            return None;
        }

        let cache = self.clone();
        let interval = self.sweep_interval();
        debug!(interval_ms = interval.as_millis() as u64, "Starting connection cache sweeper");

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if cache.is_closed() {
                            break;
                        }
                        let evicted = cache.sweep();
                        if evicted > 0 {
                            debug!(evicted, remaining = cache.len(), "Swept idle agent connections");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }))
    }

    /// Close every entry regardless of reference count and refuse further
    /// acquires.
    pub fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }

        let mut drained = Vec::new();
        self.inner.slots.retain(|agent_id, slot| {
            drained.push((*agent_id, Arc::clone(slot)));
            false
        });

        for (agent_id, slot) in &drained {
            self.inner.evicted(*agent_id, slot);
        }
        info!(closed = drained.len(), "Connection cache closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    /// Current reference count of the entry for `agent_id`
    pub fn ref_count(&self, agent_id: Uuid) -> Option<usize> {
        self.inner
            .slots
            .get(&agent_id)
            .map(|slot| slot.state.lock().ref_count)
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.inner.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct TestConn {
        closes: Arc<AtomicUsize>,
    }

    impl Connection for TestConn {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingDialer {
        dials: AtomicUsize,
        fail: AtomicBool,
        hang: AtomicBool,
        delay: Duration,
        closes: Arc<AtomicUsize>,
    }

    impl CountingDialer {
        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Default::default()
            })
        }

        fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    impl Dialer for CountingDialer {
        type Conn = TestConn;

        fn dial(&self, agent_id: Uuid) -> BoxFuture<'static, Result<TestConn, GatewayError>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail.load(Ordering::SeqCst);
            let hang = self.hang.load(Ordering::SeqCst);
            let delay = self.delay;
            let closes = Arc::clone(&self.closes);

            async move {
                if hang {
                    futures::future::pending::<()>().await;
                }
                tokio::time::sleep(delay).await;
                if fail {
                    Err(GatewayError::unreachable(agent_id, "connection refused"))
                } else {
                    Ok(TestConn { closes })
                }
            }
            .boxed()
        }
    }

    fn cache(dialer: &Arc<CountingDialer>, ttl: Duration) -> (ConnectionCache<Arc<CountingDialer>>, Arc<MemoryEventSink>) {
        let events = MemoryEventSink::new();
        (ConnectionCache::new(Arc::clone(dialer), ttl, events.clone()), events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_dials_once() {
        let dialer = CountingDialer::with_delay(Duration::from_millis(100));
        let (cache, events) = cache(&dialer, Duration::from_secs(60));
        let agent_id = Uuid::new_v4();

        let handles = futures::future::join_all((0..10).map(|_| cache.acquire(agent_id))).await;
        let handles: Vec<_> = handles.into_iter().map(|h| h.unwrap()).collect();

        assert_eq!(dialer.dials(), 1);
        assert_eq!(cache.ref_count(agent_id), Some(10));
        assert!(handles.iter().all(|h| Arc::ptr_eq(h.connection(), handles[0].connection())));
        assert_eq!(events.count(|e| matches!(e, GatewayEvent::CacheMiss { .. })), 1);
        assert_eq!(events.count(|e| matches!(e, GatewayEvent::CacheHit { .. })), 9);
        assert_eq!(events.count(|e| matches!(e, GatewayEvent::CacheDial { ok: true, .. })), 1);

        drop(handles);
        assert_eq!(cache.ref_count(agent_id), Some(0));
        assert_eq!(cache.len(), 1);
        assert_eq!(dialer.closes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_dial_failure_shared_and_retried() {
        let dialer = CountingDialer::with_delay(Duration::from_millis(100));
        dialer.fail.store(true, Ordering::SeqCst);
        let (cache, _) = cache(&dialer, Duration::from_secs(60));
        let agent_id = Uuid::new_v4();

        let results = futures::future::join_all((0..5).map(|_| cache.acquire(agent_id))).await;
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(GatewayError::AgentUnreachable { agent_id: id, .. }) if *id == agent_id)));
        assert_eq!(dialer.dials(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().get_dial_failures(), 1);

        // A later acquire dials fresh
        dialer.fail.store(false, Ordering::SeqCst);
        let handle = cache.acquire(agent_id).await.unwrap();
        assert_eq!(dialer.dials(), 2);
        assert_eq!(handle.agent_id(), agent_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_entry_is_reused() {
        let dialer = CountingDialer::with_delay(Duration::ZERO);
        let (cache, _) = cache(&dialer, Duration::from_secs(60));
        let agent_id = Uuid::new_v4();

        drop(cache.acquire(agent_id).await.unwrap());
        drop(cache.acquire(agent_id).await.unwrap());
        let _a = cache.acquire(agent_id).await.unwrap();
        let _b = cache.acquire(Uuid::new_v4()).await.unwrap();

        assert_eq!(dialer.dials(), 2);
        assert_eq!(cache.stats().get_hits(), 2);
        assert_eq!(cache.stats().get_misses(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entry_evicted_after_ttl() {
        let dialer = CountingDialer::with_delay(Duration::ZERO);
        let (cache, events) = cache(&dialer, Duration::from_secs(60));
        let agent_id = Uuid::new_v4();

        drop(cache.acquire(agent_id).await.unwrap());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
        assert_eq!(dialer.closes(), 1);
        assert_eq!(events.count(|e| matches!(e, GatewayEvent::CacheEvict { .. })), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_use_entry_not_evicted() {
        let dialer = CountingDialer::with_delay(Duration::ZERO);
        let (cache, _) = cache(&dialer, Duration::from_secs(10));
        let agent_id = Uuid::new_v4();

        let handle = cache.acquire(agent_id).await.unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(cache.sweep(), 0);
        assert_eq!(dialer.closes(), 0);

        // Idle time counts from the release, not from the dial
        drop(handle);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.sweep(), 0);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.sweep(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_evicts_on_release() {
        let dialer = CountingDialer::with_delay(Duration::ZERO);
        let (cache, _) = cache(&dialer, Duration::ZERO);
        let agent_id = Uuid::new_v4();

        let a = cache.acquire(agent_id).await.unwrap();
        let b = cache.acquire(agent_id).await.unwrap();
        assert_eq!(dialer.dials(), 1);

        drop(a);
        assert_eq!(cache.len(), 1);
        drop(b);
        assert!(cache.is_empty());
        assert_eq!(dialer.closes(), 1);

        drop(cache.acquire(agent_id).await.unwrap());
        assert_eq!(dialer.dials(), 2);
        assert!(cache.spawn_sweeper(watch::channel(false).1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_closes_entries_in_use() {
        let dialer = CountingDialer::with_delay(Duration::ZERO);
        let (cache, _) = cache(&dialer, Duration::from_secs(60));
        let agent_id = Uuid::new_v4();

        let handle = cache.acquire(agent_id).await.unwrap();
        drop(cache.acquire(Uuid::new_v4()).await.unwrap());

        cache.close();
        assert!(cache.is_closed());
        assert!(cache.is_empty());
        assert_eq!(dialer.closes(), 2);

        assert!(matches!(cache.acquire(agent_id).await, Err(GatewayError::CacheClosed)));

        // Releasing after close must not close twice
        drop(handle);
        assert_eq!(dialer.closes(), 2);
        cache.close();
        assert_eq!(dialer.closes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_aborts_pending_dial() {
        let dialer = CountingDialer::with_delay(Duration::ZERO);
        dialer.hang.store(true, Ordering::SeqCst);
        let (cache, _) = cache(&dialer, Duration::from_secs(60));
        let agent_id = Uuid::new_v4();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.acquire(agent_id).await.map(|_| ()) })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(dialer.dials(), 1);

        let closed_at = Instant::now();
        cache.close();

        for waiter in waiters {
            let result = tokio::time::timeout(Duration::from_millis(5), waiter)
                .await
                .expect("acquire returns promptly after close")
                .unwrap();
            assert!(matches!(result, Err(GatewayError::CacheClosed)));
        }
        assert!(closed_at.elapsed() < Duration::from_millis(5));
        assert_eq!(dialer.closes(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_releases() {
        let dialer = CountingDialer::with_delay(Duration::from_secs(1));
        let (cache, _) = cache(&dialer, Duration::from_secs(60));
        let agent_id = Uuid::new_v4();

        let result = tokio::time::timeout(Duration::from_millis(10), cache.acquire(agent_id)).await;
        assert!(result.is_err());
        assert_eq!(cache.ref_count(agent_id), Some(0));

        // The pending dial is picked up by the next caller
        let _handle = cache.acquire(agent_id).await.unwrap();
        assert_eq!(dialer.dials(), 1);
        assert_eq!(cache.ref_count(agent_id), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_evicts() {
        let dialer = CountingDialer::with_delay(Duration::ZERO);
        let (cache, _) = cache(&dialer, Duration::from_secs(4));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        assert_eq!(cache.sweep_interval(), Duration::from_secs(1));

        let sweeper = cache.spawn_sweeper(shutdown_rx).unwrap();
        drop(cache.acquire(Uuid::new_v4()).await.unwrap());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(cache.is_empty());
        assert_eq!(dialer.closes(), 1);

        shutdown_tx.send(true).unwrap();
        sweeper.await.unwrap();
    }

    #[test]
    fn test_sweep_interval_bounds() {
        let dialer = CountingDialer::with_delay(Duration::ZERO);
        let (short, _) = cache(&dialer, Duration::from_secs(2));
        let (long, _) = cache(&dialer, Duration::from_secs(3600));
        let (mid, _) = cache(&dialer, Duration::from_secs(120));

        assert_eq!(short.sweep_interval(), Duration::from_secs(1));
        assert_eq!(long.sweep_interval(), Duration::from_secs(60));
        assert_eq!(mid.sweep_interval(), Duration::from_secs(30));
    }
}
