// ABOUTME: Owned registry of per-destination client pools, built lazily on first use
// ABOUTME: Existing pools get an opportunistic purge-and-replace before being handed out

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::client_pool::{ClientPool, PoolError, PoolResult, PoolStats};
use super::directory::Directory;
use super::metrics::{MetricsSnapshot, PoolMetrics};
use crate::config::PoolConfig;
use crate::destination::DestinationKey;
use crate::transport::Connector;

type PoolCell<K> = Arc<OnceCell<Arc<ClientPool<K>>>>;

/// Destination key -> client pool
///
/// Construct one per process (or per test) and share it by reference; there
/// is no global instance.
pub struct ConnectionPoolRegistry<K: Connector> {
    connector: Arc<K>,
    pool_size: usize,
    acquire_timeout: Option<Duration>,
    pools: RwLock<Directory<PoolCell<K>>>,
    metrics: Arc<PoolMetrics>,
}

impl<K: Connector> ConnectionPoolRegistry<K> {
    /// Create an empty registry; pools are built on first request
    pub fn new(connector: K, config: &PoolConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            pool_size: config.pool_size,
            acquire_timeout: config.acquire_timeout,
            pools: RwLock::new(Directory::new(config.max_destinations)),
            metrics: Arc::new(PoolMetrics::new()),
        }
    }

    /// Pool for `key`, building it (and all its clients) if this is the first request
    ///
    /// Concurrent first requests for the same key share one build. A failed
    /// build gives its directory row back, so unreachable destinations never
    /// count against `max_destinations`.
    ///
    /// # Errors
    ///
    /// - `Directory` when a new key would exceed `max_destinations`
    /// - `Connect` when the clients of a new pool cannot be built
    pub async fn pool_for(&self, key: &DestinationKey) -> PoolResult<Arc<ClientPool<K>>> {
        let cell = self.cell_for(key)?;

        if let Some(pool) = cell.get() {
            match pool.purge_and_replace().await {
                Ok(0) => {}
                Ok(replaced) => debug!(destination = %key, replaced, "Refreshed pool before use"),
                // Remaining free clients can still serve; acquire retries the purge if needed
                Err(e) => warn!(destination = %key, error = %e, "Opportunistic purge failed"),
            }
            return Ok(Arc::clone(pool));
        }

        let built = cell
            .get_or_try_init(|| async {
                info!(destination = %key, capacity = self.pool_size, "Creating client pool");
                let pool = ClientPool::build(
                    key.clone(),
                    Arc::clone(&self.connector),
                    self.pool_size,
                    self.acquire_timeout,
                    Arc::clone(&self.metrics),
                )
                .await?;
                self.metrics.pool_created();
                Ok::<_, PoolError>(Arc::new(pool))
            })
            .await;

        match built {
            Ok(pool) => Ok(Arc::clone(pool)),
            Err(e) => {
                self.forget_unbuilt(key, &cell);
                Err(e)
            }
        }
    }

    /// Built pool for `key`, without creating one
    pub fn get(&self, key: &DestinationKey) -> Option<Arc<ClientPool<K>>> {
        self.read_pools()
            .lookup_first(key.as_str())
            .and_then(|cell| cell.get().cloned())
    }

    /// Stats for a built pool
    pub fn stats(&self, key: &DestinationKey) -> Option<PoolStats> {
        self.get(key).map(|pool| pool.stats())
    }

    /// Keys of every pool that has been built
    pub fn destinations(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .read_pools()
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(key, _)| key.to_string())
            .collect();
        keys.sort();
        keys
    }

    /// Number of directory rows (including pools whose build is still pending)
    pub fn len(&self) -> usize {
        self.read_pools().len()
    }

    /// True when no destination has been seen
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared counters
    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    /// Point-in-time copy of the counters
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Close every built pool; waiting and future acquires fail with `Closed`
    pub fn shutdown(&self) {
        let pools = self.read_pools();
        for (key, cell) in pools.iter() {
            if let Some(pool) = cell.get() {
                debug!(destination = %key, "Closing pool");
                pool.close();
            }
        }
        info!(pools = pools.len(), "Pool registry shut down");
    }

    /// Existing cell for `key`, or a new empty one inserted under the write lock
    fn cell_for(&self, key: &DestinationKey) -> PoolResult<PoolCell<K>> {
        if let Some(cell) = self.read_pools().lookup_first(key.as_str()) {
            return Ok(Arc::clone(cell));
        }

        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have inserted between the read and write locks
        if let Some(cell) = pools.lookup_first(key.as_str()) {
            return Ok(Arc::clone(cell));
        }

        let cell: PoolCell<K> = Arc::new(OnceCell::new());
        pools.insert(key.as_str(), Arc::clone(&cell))?;
        Ok(cell)
    }

    /// Remove the row for `key` if it still holds `cell` and nothing was built into it
    fn forget_unbuilt(&self, key: &DestinationKey, cell: &PoolCell<K>) {
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        let unbuilt = pools
            .lookup_first(key.as_str())
            .is_some_and(|current| Arc::ptr_eq(current, cell) && !current.initialized());
        if unbuilt {
            pools.remove(key.as_str());
            debug!(destination = %key, "Dropped directory row after failed pool build");
        }
    }

    fn read_pools(&self) -> std::sync::RwLockReadGuard<'_, Directory<PoolCell<K>>> {
        self.pools.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: Connector> fmt::Debug for ConnectionPoolRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPoolRegistry")
            .field("pool_size", &self.pool_size)
            .field("destinations", &self.destinations())
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}
