//! Keyed registry of downstream connection pools.
//!
//! One pool per [`ConnectionSignature`], built lazily on first use and shared
//! by every later request for the same signature.
//!
//! # Design
//!
//! - **`OnceCell` per signature**: single-flight construction. Concurrent
//!   first requests for one signature wait for a single `connect`; a failed
//!   construction leaves the cell empty so the next request retries.
//! - **`AtomicUsize` active count**: every [`PoolLease`] holds one unit for its
//!   lifetime. Eviction never touches an entry with live leases.
//! - **Bounded size**: at most `max_pools` slots. Opening a new signature at
//!   capacity evicts the least recently used idle entries, or fails with
//!   `PoolExhausted` when every entry is leased.
//! - **Cleanup task**: holds a `Weak` reference, wakes every
//!   `cleanup_interval` and closes entries idle longer than `idle_timeout`.
//!
//! # Concurrency
//!
//! - Locks are never held across pool construction or pool close.
//! - Eviction happens under the map's write lock after re-checking the entry.
//!   A lease is only granted under the read lock after confirming the slot is
//!   still the one in the map, so a lease can never point at an evicted pool.
//! - A caller that loses that race simply retries with a fresh slot.

use crate::config::RegistryOptions;
use crate::db::connector::{PoolConnector, TargetPool};
use crate::error::{BrokerError, BrokerResult, classify_downstream};
use crate::models::{ConnectTarget, ConnectionSignature};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, RwLock as TokioRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One live downstream pool.
pub struct PoolEntry<P> {
    pool: P,
    signature: ConnectionSignature,
    created_at: Instant,
    /// std lock, never held across an await
    last_accessed: std::sync::RwLock<Instant>,
    /// Live leases. Eviction skips entries with active_count > 0.
    active_count: AtomicUsize,
}

impl<P> PoolEntry<P> {
    fn new(pool: P, signature: ConnectionSignature) -> Self {
        let now = Instant::now();
        Self {
            pool,
            signature,
            created_at: now,
            last_accessed: std::sync::RwLock::new(now),
            active_count: AtomicUsize::new(0),
        }
    }

    fn increment_active(&self) {
        self.active_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Saturates at 0.
    fn decrement_active(&self) {
        let result = self
            .active_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });

        if let Ok(0) = result {
            warn!(signature = %self.signature, "Active count underflow detected");
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    fn touch(&self) {
        if let Ok(mut last_accessed) = self.last_accessed.write() {
            *last_accessed = Instant::now();
        }
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
            .read()
            .map(|guard| *guard)
            .unwrap_or(self.created_at)
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_accessed())
    }
}

impl<P> std::fmt::Debug for PoolEntry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("signature", &self.signature)
            .field("created_at", &self.created_at)
            .field("active_count", &self.active_count.load(Ordering::Relaxed))
            .finish()
    }
}

/// RAII lease on a registry pool.
///
/// Holding a lease keeps the pool out of eviction. Dropping it releases the
/// unit synchronously.
pub struct PoolLease<P> {
    entry: Arc<PoolEntry<P>>,
}

impl<P: TargetPool> PoolLease<P> {
    pub fn pool(&self) -> &P {
        &self.entry.pool
    }

    pub fn signature(&self) -> &ConnectionSignature {
        &self.entry.signature
    }

    /// Borrow one connection. A pool timeout becomes `PoolExhausted`.
    pub async fn acquire(&self) -> BrokerResult<P::Connection> {
        self.entry
            .pool
            .acquire()
            .await
            .map_err(|e| classify_downstream(e, &self.entry.signature, "acquire"))
    }

    /// True when both leases point at the same registry entry.
    pub fn same_pool(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.entry, &b.entry)
    }
}

impl<P> Deref for PoolLease<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.entry.pool
    }
}

impl<P> Drop for PoolLease<P> {
    fn drop(&mut self) {
        // Idle time counts from release
        self.entry.touch();
        self.entry.decrement_active();
    }
}

impl<P> std::fmt::Debug for PoolLease<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolLease")
            .field("signature", &self.entry.signature)
            .finish_non_exhaustive()
    }
}

/// Point-in-time registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Initialized pools.
    pub pools: usize,
    /// Leases currently held across all pools.
    pub active_leases: usize,
}

/// Source of leased downstream pools.
pub trait PoolProvider: Send + Sync + 'static {
    type Pool: TargetPool;

    /// Lease the pool for `target`, building it on first use.
    fn get_pool(
        &self,
        target: &ConnectTarget,
    ) -> impl Future<Output = BrokerResult<PoolLease<Self::Pool>>> + Send;

    fn stats(&self) -> impl Future<Output = RegistryStats> + Send;

    /// Close every pool. Used on process shutdown.
    fn close_all(&self) -> impl Future<Output = ()> + Send;
}

type Slot<P> = Arc<OnceCell<Arc<PoolEntry<P>>>>;

/// Lazily built, bounded map of signature to pool.
pub struct PoolRegistry<C: PoolConnector> {
    connector: C,
    options: RegistryOptions,
    pools: TokioRwLock<HashMap<ConnectionSignature, Slot<C::Pool>>>,
    cleanup_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<C: PoolConnector> PoolRegistry<C> {
    /// Create a registry and spawn its cleanup task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(connector: C, options: RegistryOptions) -> Arc<Self> {
        let registry = Arc::new(Self {
            connector,
            options,
            pools: TokioRwLock::new(HashMap::new()),
            cleanup_handle: std::sync::Mutex::new(None),
        });

        let weak_registry = Arc::downgrade(&registry);
        let handle = tokio::spawn(Self::cleanup_task(
            weak_registry,
            registry.options.cleanup_interval,
            registry.options.idle_timeout,
        ));

        if let Ok(mut guard) = registry.cleanup_handle.lock() {
            *guard = Some(handle);
        }

        registry
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Lease the pool for `target`, building it once per signature.
    pub async fn get_pool(&self, target: &ConnectTarget) -> BrokerResult<PoolLease<C::Pool>> {
        let signature = &target.signature;
        loop {
            let slot = self.slot_for(signature).await?;

            let entry = slot
                .get_or_try_init(|| async {
                    let pool = self.connector.connect(target).await?;
                    info!(signature = %signature, "Registered downstream pool");
                    Ok::<_, BrokerError>(Arc::new(PoolEntry::new(pool, signature.clone())))
                })
                .await?
                .clone();

            if let Some(lease) = self.lease_if_current(signature, &slot, entry).await {
                debug!(signature = %signature, active_count = lease.entry.active_count(), "Leased pool");
                return Ok(lease);
            }

            debug!(signature = %signature, "Pool evicted while leasing, retrying");
        }
    }

    /// Find or insert the slot for a signature, making room at capacity.
    async fn slot_for(&self, signature: &ConnectionSignature) -> BrokerResult<Slot<C::Pool>> {
        {
            let pools = self.pools.read().await;
            if let Some(slot) = pools.get(signature) {
                return Ok(Arc::clone(slot));
            }
        }

        let (slot, evicted) = {
            let mut pools = self.pools.write().await;
            // Double-check after acquiring write lock
            if let Some(slot) = pools.get(signature) {
                return Ok(Arc::clone(slot));
            }

            let evicted = self.make_room(&mut pools, signature)?;
            let slot: Slot<C::Pool> = Arc::new(OnceCell::new());
            pools.insert(signature.clone(), Arc::clone(&slot));
            (slot, evicted)
        }; // Write lock released here

        close_entries(evicted, "capacity").await;
        Ok(slot)
    }

    /// Free at least one slot when the map is full.
    ///
    /// Abandoned empty slots go first, then idle entries in least recently
    /// used order. Evicts nothing unless enough idle entries exist.
    fn make_room(
        &self,
        pools: &mut HashMap<ConnectionSignature, Slot<C::Pool>>,
        requested: &ConnectionSignature,
    ) -> BrokerResult<Vec<Arc<PoolEntry<C::Pool>>>> {
        if pools.len() < self.options.max_pools {
            return Ok(Vec::new());
        }

        pools.retain(|_, slot| slot.initialized() || Arc::strong_count(slot) > 1);
        if pools.len() < self.options.max_pools {
            return Ok(Vec::new());
        }

        let needed = pools.len() + 1 - self.options.max_pools;
        let mut idle: Vec<(Instant, ConnectionSignature)> = pools
            .iter()
            .filter_map(|(sig, slot)| {
                let entry = slot.get()?;
                (entry.active_count() == 0).then(|| (entry.last_accessed(), sig.clone()))
            })
            .collect();

        if idle.len() < needed {
            warn!(
                signature = %requested,
                max_pools = self.options.max_pools,
                "Pool registry full and every pool is in use"
            );
            return Err(BrokerError::pool_exhausted(
                requested,
                format!(
                    "registry holds the maximum of {} pools and all are in use",
                    self.options.max_pools
                ),
            ));
        }

        idle.sort();
        Ok(idle
            .into_iter()
            .take(needed)
            .filter_map(|(_, sig)| pools.remove(&sig))
            .filter_map(|slot| slot.get().cloned())
            .collect())
    }

    /// Grant a lease only if `slot` is still the registered one.
    async fn lease_if_current(
        &self,
        signature: &ConnectionSignature,
        slot: &Slot<C::Pool>,
        entry: Arc<PoolEntry<C::Pool>>,
    ) -> Option<PoolLease<C::Pool>> {
        let pools = self.pools.read().await;
        match pools.get(signature) {
            Some(current) if Arc::ptr_eq(current, slot) => {
                entry.touch();
                entry.increment_active();
                Some(PoolLease { entry })
            }
            _ => None,
        }
    }

    /// Number of initialized pools.
    pub async fn pool_count(&self) -> usize {
        let pools = self.pools.read().await;
        pools.values().filter(|slot| slot.initialized()).count()
    }

    pub async fn stats(&self) -> RegistryStats {
        let pools = self.pools.read().await;
        pools
            .values()
            .filter_map(|slot| slot.get())
            .fold(RegistryStats::default(), |mut stats, entry| {
                stats.pools += 1;
                stats.active_leases += entry.active_count();
                stats
            })
    }

    /// Cancel the cleanup task and close every pool.
    pub async fn close_all(&self) {
        if let Ok(mut handle_guard) = self.cleanup_handle.lock() {
            if let Some(handle) = handle_guard.take() {
                handle.abort();
            }
        }

        // Drain under lock, close outside lock
        let entries: Vec<_> = {
            let mut pools = self.pools.write().await;
            pools
                .drain()
                .filter_map(|(_, slot)| slot.get().cloned())
                .collect()
        };

        close_entries(entries, "shutdown").await;
    }

    /// Background eviction of idle pools.
    ///
    /// Collects candidates under the read lock, then re-checks and removes
    /// each one under a brief write lock, then closes outside all locks.
    /// Exits once the registry is dropped.
    async fn cleanup_task(weak_registry: Weak<Self>, cleanup_interval: Duration, idle_timeout: Duration) {
        let mut interval = tokio::time::interval(cleanup_interval);
        // First tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            let Some(registry) = weak_registry.upgrade() else {
                info!("Pool registry dropped, cleanup task exiting");
                return;
            };

            let now = Instant::now();
            let candidates: Vec<ConnectionSignature> = {
                let pools = registry.pools.read().await;
                pools
                    .iter()
                    .filter(|(sig, slot)| match slot.get() {
                        Some(entry) => {
                            let active = entry.active_count();
                            if active > 0 {
                                debug!(signature = %sig, active_count = active, "Skipping cleanup of active pool");
                                return false;
                            }
                            entry.idle_for(now) > idle_timeout
                        }
                        // Construction failed and nobody is retrying
                        None => Arc::strong_count(slot) == 1,
                    })
                    .map(|(sig, _)| sig.clone())
                    .collect()
            }; // Read lock released here

            for signature in candidates {
                let removed = {
                    let mut pools = registry.pools.write().await;

                    // Re-check after acquiring write lock
                    let still_evictable = match pools.get(&signature) {
                        Some(slot) => match slot.get() {
                            Some(entry) => {
                                entry.active_count() == 0 && entry.idle_for(now) > idle_timeout
                            }
                            None => Arc::strong_count(slot) == 1,
                        },
                        None => false,
                    };
                    if !still_evictable {
                        debug!(signature = %signature, "Pool used during cleanup, skipping");
                        continue;
                    }

                    pools.remove(&signature)
                }; // Write lock released here

                if let Some(entry) = removed.and_then(|slot| slot.get().cloned()) {
                    close_entries(vec![entry], "idle").await;
                }
            }

            // Drop strong reference before sleeping to allow registry deallocation
            drop(registry);
        }
    }
}

async fn close_entries<P: TargetPool>(entries: Vec<Arc<PoolEntry<P>>>, reason: &'static str) {
    let closes = entries.iter().map(|entry| {
        info!(signature = %entry.signature, reason, "Closing downstream pool");
        entry.pool.close()
    });
    futures_util::future::join_all(closes).await;
}

impl<C: PoolConnector> PoolProvider for PoolRegistry<C> {
    type Pool = C::Pool;

    fn get_pool(
        &self,
        target: &ConnectTarget,
    ) -> impl Future<Output = BrokerResult<PoolLease<C::Pool>>> + Send {
        PoolRegistry::get_pool(self, target)
    }

    fn stats(&self) -> impl Future<Output = RegistryStats> + Send {
        PoolRegistry::stats(self)
    }

    fn close_all(&self) -> impl Future<Output = ()> + Send {
        PoolRegistry::close_all(self)
    }
}

impl<C: PoolConnector> Drop for PoolRegistry<C> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.cleanup_handle.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

impl<C: PoolConnector> std::fmt::Debug for PoolRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("max_pools", &self.options.max_pools)
            .field("idle_timeout", &self.options.idle_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
    use zeroize::Zeroizing;

    struct SqliteConnector {
        built: AtomicUsize,
    }

    impl PoolConnector for SqliteConnector {
        type Pool = SqlitePool;

        async fn connect(&self, target: &ConnectTarget) -> BrokerResult<SqlitePool> {
            self.built.fetch_add(1, Ordering::SeqCst);
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .map_err(|e| BrokerError::connection(&target.signature, e.to_string(), "check"))
        }
    }

    fn target(dbname: &str) -> ConnectTarget {
        ConnectTarget::new(
            ConnectionSignature::new("app", "localhost", 5432, dbname),
            Zeroizing::new("pw".to_string()),
        )
    }

    fn registry(max_pools: usize) -> Arc<PoolRegistry<SqliteConnector>> {
        PoolRegistry::new(
            SqliteConnector {
                built: AtomicUsize::new(0),
            },
            RegistryOptions {
                max_pools,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_pool_entry_active_count_saturates() {
        let entry = PoolEntry::new((), ConnectionSignature::new("u", "h", 1, "d"));
        assert_eq!(entry.active_count(), 0);
        entry.increment_active();
        entry.increment_active();
        assert_eq!(entry.active_count(), 2);
        entry.decrement_active();
        entry.decrement_active();
        entry.decrement_active();
        assert_eq!(entry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_same_signature_shares_pool() {
        let registry = registry(4);
        let a = registry.get_pool(&target("one")).await.unwrap();
        let b = registry.get_pool(&target("one")).await.unwrap();
        assert!(PoolLease::same_pool(&a, &b));
        assert_eq!(registry.connector().built.load(Ordering::SeqCst), 1);
        assert_eq!(
            registry.stats().await,
            RegistryStats {
                pools: 1,
                active_leases: 2
            }
        );
    }

    #[tokio::test]
    async fn test_lease_drop_releases() {
        let registry = registry(4);
        let lease = registry.get_pool(&target("one")).await.unwrap();
        assert_eq!(registry.stats().await.active_leases, 1);
        drop(lease);
        assert_eq!(registry.stats().await.active_leases, 0);
        assert_eq!(registry.pool_count().await, 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let registry = registry(2);
        drop(registry.get_pool(&target("one")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(registry.get_pool(&target("two")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;

        let _three = registry.get_pool(&target("three")).await.unwrap();
        assert_eq!(registry.pool_count().await, 2);

        let pools = registry.pools.read().await;
        assert!(!pools.contains_key(&target("one").signature));
        assert!(pools.contains_key(&target("two").signature));
    }

    #[tokio::test]
    async fn test_capacity_with_all_leased_is_exhausted() {
        let registry = registry(1);
        let _held = registry.get_pool(&target("one")).await.unwrap();
        let err = registry.get_pool(&target("two")).await.unwrap_err();
        assert!(matches!(err, BrokerError::PoolExhausted { .. }));
        assert_eq!(registry.pool_count().await, 1);
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let registry = registry(4);
        let lease = registry.get_pool(&target("one")).await.unwrap();
        let pool = lease.pool().clone();
        drop(lease);
        registry.close_all().await;
        assert_eq!(registry.pool_count().await, 0);
        assert!(pool.is_closed());
    }
}
