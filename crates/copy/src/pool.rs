//! Bounded, aged pool of outbound copy clients.
//!
//! Clients are keyed by `(host, port, compression)`. The pool never holds
//! more than `max_client_count` live clients, counting both idle and leased
//! ones. When full, acquiring a new key evicts the least recently used idle
//! client; if every client is leased, acquisition fails immediately.
//!
//! A leased client comes back through [`PooledClient`]'s `Drop`. It is
//! returned for reuse only if the holder marked it reusable and it has not
//! outlived `max_client_age`; otherwise it is discarded.

use crate::error::{CopyError, CopyResult};
use async_trait::async_trait;
use quarry_core::CounterSet;
use quarry_core::config::CopyConfig;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pool key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub host: String,
    pub port: u16,
    pub use_compression: bool,
}

impl ClientKey {
    pub fn new(host: impl Into<String>, port: u16, use_compression: bool) -> Self {
        Self {
            host: host.into(),
            port,
            use_compression,
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Creates the clients a [`ClientPool`] hands out.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    type Client: Send + Sync + 'static;

    /// Establish a client for `key`. The pool bounds this with its connect
    /// timeout.
    async fn connect(&self, key: &ClientKey) -> CopyResult<Self::Client>;
}

#[derive(Clone, Copy, Debug)]
pub struct PoolSettings {
    pub max_client_count: usize,
    pub max_client_age: Duration,
    pub connect_timeout: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &CopyConfig) -> Self {
        Self {
            max_client_count: config.max_client_count,
            max_client_age: config.max_client_age(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

struct Slot<C> {
    client: C,
    created: Instant,
    last_used: u64,
}

struct PoolState<C> {
    idle: HashMap<ClientKey, Vec<Slot<C>>>,
    /// Idle plus leased clients, including connections being established.
    live: usize,
    /// Release sequence used for LRU ordering.
    seq: u64,
}

impl<C> PoolState<C> {
    fn idle_count(&self) -> usize {
        self.idle.values().map(Vec::len).sum()
    }

    /// Remove idle clients for `key` that reached `max_age`.
    fn take_expired_for(&mut self, key: &ClientKey, now: Instant, max_age: Duration) -> Vec<Slot<C>> {
        let Some(slots) = self.idle.get_mut(key) else {
            return Vec::new();
        };
        let (expired, fresh): (Vec<_>, Vec<_>) = slots
            .drain(..)
            .partition(|slot| now.duration_since(slot.created) >= max_age);
        *slots = fresh;
        if slots.is_empty() {
            self.idle.remove(key);
        }
        self.live -= expired.len();
        expired
    }

    /// Take the most recently returned idle client for `key`.
    fn pop_idle(&mut self, key: &ClientKey) -> Option<Slot<C>> {
        let slots = self.idle.get_mut(key)?;
        let slot = slots.pop();
        if slots.is_empty() {
            self.idle.remove(key);
        }
        slot
    }

    /// Take the least recently used idle client across all keys.
    fn evict_lru(&mut self) -> Option<(ClientKey, Slot<C>)> {
        let (key, index) = self
            .idle
            .iter()
            .flat_map(|(key, slots)| {
                slots
                    .iter()
                    .enumerate()
                    .map(move |(index, slot)| (slot.last_used, key, index))
            })
            .min_by_key(|(last_used, _, _)| *last_used)
            .map(|(_, key, index)| (key.clone(), index))?;
        let slots = self.idle.get_mut(&key)?;
        let slot = slots.remove(index);
        if slots.is_empty() {
            self.idle.remove(&key);
        }
        Some((key, slot))
    }
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
    retired: AtomicU64,
    discarded: AtomicU64,
    exhausted: AtomicU64,
    connect_failures: AtomicU64,
}

struct PoolInner<F: ClientFactory> {
    factory: F,
    settings: PoolSettings,
    state: Mutex<PoolState<F::Client>>,
    counters: PoolCounters,
}

impl<F: ClientFactory> PoolInner<F> {
    fn lock(&self) -> MutexGuard<'_, PoolState<F::Client>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, key: &ClientKey, mut slot: Slot<F::Client>, reusable: bool) {
        let expired = slot.created.elapsed() >= self.settings.max_client_age;
        if reusable && !expired {
            let mut state = self.lock();
            state.seq += 1;
            slot.last_used = state.seq;
            state.idle.entry(key.clone()).or_default().push(slot);
            return;
        }

        self.lock().live -= 1;
        if expired {
            self.counters.retired.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "discarding copy client");
        }
        drop(slot);
    }
}

/// Holds one unit of pool capacity while a connection is established and
/// gives it back if the connect fails or the caller goes away.
struct Reservation<'a, F: ClientFactory> {
    inner: &'a PoolInner<F>,
    armed: bool,
}

impl<F: ClientFactory> Reservation<'_, F> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<F: ClientFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock().live -= 1;
        }
    }
}

enum Plan<C> {
    Reuse(Slot<C>),
    Create,
    Exhausted,
}

/// Bounded pool of copy clients.
pub struct ClientPool<F: ClientFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ClientFactory> Clone for ClientPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ClientFactory> ClientPool<F> {
    pub fn new(factory: F, settings: PoolSettings) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                settings,
                state: Mutex::new(PoolState {
                    idle: HashMap::new(),
                    live: 0,
                    seq: 0,
                }),
                counters: PoolCounters::default(),
            }),
        }
    }

    pub fn settings(&self) -> PoolSettings {
        self.inner.settings
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Lease a client for `key`, reusing an idle one when possible.
    ///
    /// Fails fast with [`CopyError::PoolExhausted`] when every client is
    /// leased, and with [`CopyError::TimedOut`] when connecting takes longer
    /// than the connect timeout.
    pub async fn acquire(&self, key: ClientKey) -> CopyResult<PooledClient<F>> {
        let inner = &*self.inner;
        let now = Instant::now();

        let mut dropped = Vec::new();
        let plan = {
            let mut state = inner.lock();
            let expired = state.take_expired_for(&key, now, inner.settings.max_client_age);
            inner
                .counters
                .retired
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            dropped.extend(expired);

            if let Some(slot) = state.pop_idle(&key) {
                Plan::Reuse(slot)
            } else if state.live < inner.settings.max_client_count {
                state.live += 1;
                Plan::Create
            } else if let Some((evicted_key, slot)) = state.evict_lru() {
                debug!(evicted = %evicted_key, key = %key, "evicting idle copy client");
                inner.counters.evicted.fetch_add(1, Ordering::Relaxed);
                dropped.push(slot);
                Plan::Create
            } else {
                Plan::Exhausted
            }
        };
        drop(dropped);

        match plan {
            Plan::Reuse(slot) => {
                inner.counters.reused.fetch_add(1, Ordering::Relaxed);
                Ok(self.lease(key, slot))
            }
            Plan::Exhausted => {
                inner.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, capacity = inner.settings.max_client_count, "copy client pool exhausted");
                Err(CopyError::PoolExhausted {
                    capacity: inner.settings.max_client_count,
                })
            }
            Plan::Create => {
                let reservation = Reservation { inner, armed: true };
                let timeout = inner.settings.connect_timeout;
                let client = match tokio::time::timeout(timeout, inner.factory.connect(&key)).await {
                    Ok(Ok(client)) => client,
                    Ok(Err(e)) => {
                        inner.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }
                    Err(_) => {
                        inner.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
                        return Err(CopyError::TimedOut(timeout));
                    }
                };
                reservation.disarm();
                inner.counters.created.fetch_add(1, Ordering::Relaxed);
                let slot = Slot {
                    client,
                    created: Instant::now(),
                    last_used: 0,
                };
                Ok(self.lease(key, slot))
            }
        }
    }

    fn lease(&self, key: ClientKey, slot: Slot<F::Client>) -> PooledClient<F> {
        PooledClient {
            pool: Arc::clone(&self.inner),
            key,
            slot: Some(slot),
            reusable: false,
        }
    }

    /// Retire idle clients older than `max_client_age`. Returns how many
    /// were closed.
    pub fn cleanup(&self) -> usize {
        let inner = &*self.inner;
        let now = Instant::now();
        let max_age = inner.settings.max_client_age;

        let expired: Vec<Slot<F::Client>> = {
            let mut state = inner.lock();
            let keys: Vec<ClientKey> = state.idle.keys().cloned().collect();
            keys.iter()
                .flat_map(|key| state.take_expired_for(key, now, max_age))
                .collect()
        };

        let count = expired.len();
        if count > 0 {
            inner.counters.retired.fetch_add(count as u64, Ordering::Relaxed);
            debug!(count, "retired aged copy clients");
        }
        drop(expired);
        count
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until cancelled.
    pub fn spawn_cleanup(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.cleanup();
                    }
                }
            }
        })
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().live
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle_count()
    }

    pub fn stats(&self) -> CounterSet {
        let (live, idle) = {
            let state = self.inner.lock();
            (state.live, state.idle_count())
        };
        let c = &self.inner.counters;
        let mut stats = CounterSet::new();
        stats.set("live", live as i64);
        stats.set("idle", idle as i64);
        for (name, counter) in [
            ("created", &c.created),
            ("reused", &c.reused),
            ("evicted", &c.evicted),
            ("retired", &c.retired),
            ("discarded", &c.discarded),
            ("exhausted", &c.exhausted),
            ("connect_failures", &c.connect_failures),
        ] {
            stats.set(name, counter.load(Ordering::Relaxed) as i64);
        }
        stats
    }
}

/// A leased client. Dropping it returns the client to the pool if it was
/// marked reusable, and discards it otherwise.
pub struct PooledClient<F: ClientFactory> {
    pool: Arc<PoolInner<F>>,
    key: ClientKey,
    slot: Option<Slot<F::Client>>,
    reusable: bool,
}

impl<F: ClientFactory> PooledClient<F> {
    pub fn key(&self) -> &ClientKey {
        &self.key
    }

    /// The last exchange completed and the connection can be reused.
    pub fn mark_reusable(&mut self) {
        self.reusable = true;
    }

    /// The connection is in an unknown state and must not be reused.
    pub fn mark_broken(&mut self) {
        self.reusable = false;
    }
}

impl<F: ClientFactory> Deref for PooledClient<F> {
    type Target = F::Client;

    fn deref(&self) -> &F::Client {
        match &self.slot {
            Some(slot) => &slot.client,
            None => unreachable!("pooled client used after release"),
        }
    }
}

impl<F: ClientFactory> Drop for PooledClient<F> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(&self.key, slot, self.reusable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Connects {
        by_host: Mutex<HashMap<String, usize>>,
    }

    impl Connects {
        fn count(&self, host: &str) -> usize {
            self.by_host.lock().unwrap().get(host).copied().unwrap_or(0)
        }
    }

    struct FakeFactory {
        connects: Arc<Connects>,
        hang: bool,
    }

    #[async_trait]
    impl ClientFactory for FakeFactory {
        type Client = String;

        async fn connect(&self, key: &ClientKey) -> CopyResult<String> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            let mut by_host = self.connects.by_host.lock().unwrap();
            let n = by_host.entry(key.host.clone()).or_insert(0);
            *n += 1;
            Ok(format!("{}#{}", key.host, n))
        }
    }

    fn pool(max_client_count: usize) -> (ClientPool<FakeFactory>, Arc<Connects>) {
        let connects = Arc::new(Connects::default());
        let factory = FakeFactory {
            connects: Arc::clone(&connects),
            hang: false,
        };
        let settings = PoolSettings {
            max_client_count,
            max_client_age: Duration::from_secs(10 * 60),
            connect_timeout: Duration::from_secs(5),
        };
        (ClientPool::new(factory, settings), connects)
    }

    fn key(host: &str) -> ClientKey {
        ClientKey::new(host, 7089, false)
    }

    async fn use_once(pool: &ClientPool<FakeFactory>, host: &str) -> String {
        let mut client = pool.acquire(key(host)).await.unwrap();
        client.mark_reusable();
        client.clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_client_is_reused() {
        let (pool, connects) = pool(4);

        let first = use_once(&pool, "a").await;
        let second = use_once(&pool, "a").await;
        assert_eq!(first, second);
        assert_eq!(connects.count("a"), 1);
        assert_eq!(pool.stats().get("reused"), Some(1));
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmarked_client_is_discarded() {
        let (pool, connects) = pool(4);

        let client = pool.acquire(key("a")).await.unwrap();
        drop(client);
        assert_eq!(pool.live_count(), 0);

        use_once(&pool, "a").await;
        assert_eq!(connects.count("a"), 2);
        assert_eq!(pool.stats().get("discarded"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_pool_evicts_least_recently_used() {
        let (pool, connects) = pool(2);

        use_once(&pool, "a").await;
        use_once(&pool, "b").await;
        use_once(&pool, "a").await;
        use_once(&pool, "c").await;

        assert_eq!(pool.live_count(), 2);
        assert_eq!(pool.stats().get("evicted"), Some(1));

        // "a" survived, "b" was evicted.
        use_once(&pool, "a").await;
        assert_eq!(connects.count("a"), 1);
        use_once(&pool, "b").await;
        assert_eq!(connects.count("b"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_fails_fast() {
        let (pool, _) = pool(1);

        let held = pool.acquire(key("a")).await.unwrap();
        let err = match pool.acquire(key("b")).await {
            Ok(_) => panic!("expected exhaustion"),
            Err(e) => e,
        };
        assert!(matches!(err, CopyError::PoolExhausted { capacity: 1 }));
        assert_eq!(err.reason(), crate::error::CopyFailureReason::SourceUnreachable);
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aged_client_not_reused_after_cleanup() {
        let (pool, connects) = pool(4);

        use_once(&pool, "a").await;
        tokio::time::advance(Duration::from_secs(11 * 60)).await;

        assert_eq!(pool.cleanup(), 1);
        assert_eq!(pool.live_count(), 0);

        use_once(&pool, "a").await;
        assert_eq!(connects.count("a"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aged_client_retired_on_acquire() {
        let (pool, connects) = pool(4);

        use_once(&pool, "a").await;
        tokio::time::advance(Duration::from_secs(11 * 60)).await;

        use_once(&pool, "a").await;
        assert_eq!(connects.count("a"), 2);
        assert_eq!(pool.stats().get("retired"), Some(1));
        assert_eq!(pool.live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_releases_capacity() {
        let factory = FakeFactory {
            connects: Arc::new(Connects::default()),
            hang: true,
        };
        let settings = PoolSettings {
            max_client_count: 1,
            max_client_age: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(2),
        };
        let pool = ClientPool::new(factory, settings);

        let err = match pool.acquire(key("slow")).await {
            Ok(_) => panic!("expected timeout"),
            Err(e) => e,
        };
        assert!(matches!(err, CopyError::TimedOut(_)));
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.stats().get("connect_failures"), Some(1));
    }
}
