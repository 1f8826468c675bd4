// ABOUTME: Fixed-size pool of transport clients for one destination, gated by a semaphore
// ABOUTME: Acquire hands out a Lease; releasing the lease frees or breaks its slot and posts the permit

//! Per-destination client pool.
//!
//! The pool owns `capacity` pre-built clients plus a counting semaphore
//! initialized to `capacity`. A caller first takes a permit, then claims a
//! `Free` slot. While a slot is `Active` its permit travels inside the
//! [`Lease`]; releasing the lease updates the slot *and then* returns the
//! permit, so the next acquirer never sees a half-updated entry.
//!
//! ```text
//!   acquire ──▶ permit ──▶ claim Free slot ──▶ Lease
//!                               │ none free
//!                               ▼
//!                       purge_and_replace ──▶ claim again ──▶ Corrupt
//!
//!   Lease::release(saw_error) ──▶ slot Free | Broken ──▶ permit posted
//! ```
//!
//! Invariant: `available_permits + active == capacity` whenever no acquire is
//! between taking its permit and claiming its slot.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::try_join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use super::directory::DirectoryError;
use super::entry::{ClientId, EntryState, PoolEntry};
use super::metrics::PoolMetrics;
use crate::destination::DestinationKey;
use crate::transport::{Connector, TransportError};

// === Pool Errors ===

/// Errors that can occur during pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool directory is full
    #[error("Pool directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// A transport client could not be built
    #[error("Failed to build client for {key}: {source}")]
    Connect {
        /// Destination being built
        key: DestinationKey,
        /// Transport failure
        #[source]
        source: TransportError,
    },

    /// A permit was held but no slot could be claimed even after replacement
    #[error("Pool for {key} is corrupt: permit held but no free client after replacement")]
    Corrupt {
        /// Destination whose bookkeeping is inconsistent
        key: DestinationKey,
    },

    /// Waiting for a permit took longer than the configured limit
    #[error("Timed out after {elapsed:?} waiting for a client for {key}")]
    AcquireTimeout {
        /// Destination that stayed saturated
        key: DestinationKey,
        /// How long the caller waited
        elapsed: Duration,
    },

    /// Pool was shut down
    #[error("Pool for {0} is closed")]
    Closed(DestinationKey),
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

// === Stats ===

/// Point-in-time view of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Fixed number of slots
    pub capacity: usize,
    /// Slots ready for use
    pub free: usize,
    /// Slots with a request in flight
    pub active: usize,
    /// Slots waiting for replacement
    pub broken: usize,
    /// Permits not currently held
    pub available_permits: usize,
}

/// Identity and state of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    /// Slot index
    pub slot: usize,
    /// Client occupying the slot
    pub id: ClientId,
    /// Slot state
    pub state: EntryState,
    /// Requests dispatched on this client
    pub requests_served: u64,
}

// === Client Pool ===

/// Clients for one destination plus the semaphore bounding their use
pub struct ClientPool<K: Connector> {
    key: DestinationKey,
    connector: Arc<K>,
    entries: Mutex<Vec<PoolEntry<K::Client>>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Option<Duration>,
    /// Serializes replacement so a broken slot is rebuilt once
    purge_lock: tokio::sync::Mutex<()>,
    metrics: Arc<PoolMetrics>,
}

impl<K: Connector> fmt::Debug for ClientPool<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPool")
            .field("key", &self.key)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<K: Connector> ClientPool<K> {
    /// Build a pool, constructing all `capacity` clients up front
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Connect` if any client fails to build; no pool is
    /// created in that case.
    pub async fn build(
        key: DestinationKey,
        connector: Arc<K>,
        capacity: usize,
        acquire_timeout: Option<Duration>,
        metrics: Arc<PoolMetrics>,
    ) -> PoolResult<Self> {
        let started = Instant::now();
        let clients = try_join_all((0..capacity).map(|_| connector.connect(&key)))
            .await
            .map_err(|source| PoolError::Connect {
                key: key.clone(),
                source,
            })?;

        debug!(
            destination = %key,
            capacity,
            elapsed = ?started.elapsed(),
            "Built client pool"
        );

        Ok(Self {
            entries: Mutex::new(clients.into_iter().map(PoolEntry::new).collect()),
            permits: Arc::new(Semaphore::new(capacity)),
            key,
            connector,
            capacity,
            acquire_timeout,
            purge_lock: tokio::sync::Mutex::new(()),
            metrics,
        })
    }

    /// Destination this pool serves
    pub const fn key(&self) -> &DestinationKey {
        &self.key
    }

    /// Fixed number of slots
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a permit, then claim a free client
    ///
    /// Suspends while every client is busy. If a permit is obtained but no
    /// slot is free, broken slots are replaced and the scan runs once more.
    ///
    /// # Errors
    ///
    /// - `AcquireTimeout` if an acquire timeout is configured and expires
    /// - `Connect` if a broken slot could not be rebuilt
    /// - `Corrupt` if no slot can be claimed despite holding a permit
    /// - `Closed` after `close()`
    pub async fn acquire(self: &Arc<Self>) -> PoolResult<Lease<K>> {
        let permit = self.wait_for_permit().await?;

        if let Some(lease) = self.claim_free(&permit) {
            return Ok(lease.with_permit(permit));
        }

        debug!(destination = %self.key, "Permit held but no free client, replacing broken clients");
        self.purge_and_replace().await?;

        if let Some(lease) = self.claim_free(&permit) {
            return Ok(lease.with_permit(permit));
        }

        let stats = self.stats();
        error!(
            destination = %self.key,
            ?stats,
            "Pool bookkeeping inconsistent: no claimable client after replacement"
        );
        Err(PoolError::Corrupt {
            key: self.key.clone(),
        })
    }

    /// Thread-blocking acquire for worker threads
    ///
    /// Must not be called from inside an async task; use it from
    /// `spawn_blocking` or a plain thread holding a runtime handle.
    pub fn blocking_acquire(self: &Arc<Self>, handle: &Handle) -> PoolResult<Lease<K>> {
        handle.block_on(self.acquire())
    }

    /// Rebuild every broken slot in place
    ///
    /// Returns the number of clients replaced; zero when nothing is broken.
    /// Clients of replaced slots are dropped once no request still holds them.
    pub async fn purge_and_replace(&self) -> PoolResult<usize> {
        if !self.has_broken() {
            return Ok(0);
        }
        let _guard = self.purge_lock.lock().await;

        let broken: Vec<(usize, ClientId)> = self
            .lock_entries()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state() == EntryState::Broken)
            .map(|(slot, e)| (slot, e.id()))
            .collect();

        if broken.is_empty() {
            return Ok(0);
        }

        let mut replaced = 0;
        for (slot, old_id) in broken {
            let client = match self.connector.connect(&self.key).await {
                Ok(client) => client,
                Err(source) => {
                    warn!(destination = %self.key, slot, error = %source, "Failed to rebuild client");
                    self.metrics.clients_replaced(replaced);
                    return Err(PoolError::Connect {
                        key: self.key.clone(),
                        source,
                    });
                }
            };

            let fresh = PoolEntry::new(client);
            let new_id = fresh.id();
            let retired = {
                let mut entries = self.lock_entries();
                let entry = &mut entries[slot];
                if entry.id() == old_id && entry.state() == EntryState::Broken {
                    Some(std::mem::replace(entry, fresh))
                } else {
                    None
                }
            };

            if retired.is_some() {
                replaced += 1;
                info!(destination = %self.key, slot, old = %old_id, new = %new_id, "Replaced broken client");
            }
        }

        self.metrics.clients_replaced(replaced);
        Ok(replaced)
    }

    /// Counts per state plus available permits
    pub fn stats(&self) -> PoolStats {
        let entries = self.lock_entries();
        let count = |state| entries.iter().filter(|e| e.state() == state).count();
        PoolStats {
            capacity: self.capacity,
            free: count(EntryState::Free),
            active: count(EntryState::Active),
            broken: count(EntryState::Broken),
            available_permits: self.permits.available_permits(),
        }
    }

    /// Identity and state of every slot
    pub fn slots(&self) -> Vec<SlotSnapshot> {
        self.lock_entries()
            .iter()
            .enumerate()
            .map(|(slot, e)| SlotSnapshot {
                slot,
                id: e.id(),
                state: e.state(),
                requests_served: e.requests_served(),
            })
            .collect()
    }

    /// Stop handing out clients; pending and future acquires fail with `Closed`
    pub fn close(&self) {
        self.permits.close();
    }

    async fn wait_for_permit(&self) -> PoolResult<OwnedSemaphorePermit> {
        let started = Instant::now();
        let permit = match self.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, Arc::clone(&self.permits).acquire_owned())
                .await
                .map_err(|_| PoolError::AcquireTimeout {
                    key: self.key.clone(),
                    elapsed: started.elapsed(),
                })?,
            None => Arc::clone(&self.permits).acquire_owned().await,
        };
        permit.map_err(|_| PoolError::Closed(self.key.clone()))
    }

    /// Claim the first free slot; the permit argument proves the caller holds one
    fn claim_free(self: &Arc<Self>, _permit: &OwnedSemaphorePermit) -> Option<PendingLease<K>> {
        let mut entries = self.lock_entries();
        let (slot, entry) = entries.iter_mut().enumerate().find(|(_, e)| e.is_free())?;
        if !entry.activate() {
            return None;
        }
        debug!(destination = %self.key, slot, client = %entry.id(), "Claimed client");
        Some(PendingLease {
            pool: Arc::clone(self),
            slot,
            id: entry.id(),
            client: Arc::clone(entry.client()),
        })
    }

    /// Active -> Free/Broken for the slot held by a lease
    fn finish(&self, slot: usize, id: ClientId, saw_error: bool) {
        let mut entries = self.lock_entries();
        let Some(entry) = entries.get_mut(slot) else {
            error!(destination = %self.key, slot, "Released lease for unknown slot");
            return;
        };
        if entry.id() != id {
            error!(destination = %self.key, slot, expected = %id, found = %entry.id(), "Released lease for replaced client");
            return;
        }
        if !entry.finish(saw_error) {
            error!(destination = %self.key, slot, state = %entry.state(), "Released lease for client that was not active");
            return;
        }
        if saw_error {
            debug!(destination = %self.key, slot, client = %id, "Client marked broken");
        }
    }

    fn has_broken(&self) -> bool {
        self.lock_entries()
            .iter()
            .any(|e| e.state() == EntryState::Broken)
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<PoolEntry<K::Client>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// === Lease ===

/// A claimed slot that has not yet been paired with its permit
struct PendingLease<K: Connector> {
    pool: Arc<ClientPool<K>>,
    slot: usize,
    id: ClientId,
    client: Arc<K::Client>,
}

impl<K: Connector> PendingLease<K> {
    fn with_permit(self, permit: OwnedSemaphorePermit) -> Lease<K> {
        Lease {
            pool: self.pool,
            slot: self.slot,
            id: self.id,
            client: self.client,
            permit: Some(permit),
        }
    }
}

/// Exclusive use of one pooled client
///
/// Release it exactly once with [`Lease::release`]. A lease dropped without
/// being released counts as a failed request: the slot is marked broken and
/// the permit is still returned.
pub struct Lease<K: Connector> {
    pool: Arc<ClientPool<K>>,
    slot: usize,
    id: ClientId,
    client: Arc<K::Client>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<K: Connector> Lease<K> {
    /// Transport client for this request
    pub const fn client(&self) -> &Arc<K::Client> {
        &self.client
    }

    /// Slot index inside the pool
    pub const fn slot(&self) -> usize {
        self.slot
    }

    /// Identity of the leased client
    pub const fn client_id(&self) -> ClientId {
        self.id
    }

    /// Destination of the owning pool
    pub fn destination(&self) -> &DestinationKey {
        self.pool.key()
    }

    /// Hand the client back; `saw_error` marks it for replacement
    pub fn release(mut self, saw_error: bool) {
        self.release_inner(saw_error);
    }

    fn release_inner(&mut self, saw_error: bool) {
        if let Some(permit) = self.permit.take() {
            self.pool.finish(self.slot, self.id, saw_error);
            // Permit goes back only after the slot is updated
            drop(permit);
        }
    }
}

impl<K: Connector> Drop for Lease<K> {
    fn drop(&mut self) {
        if self.permit.is_some() {
            warn!(destination = %self.pool.key(), slot = self.slot, "Lease dropped without release, marking client broken");
            self.release_inner(true);
        }
    }
}

impl<K: Connector> fmt::Debug for Lease<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("destination", self.pool.key())
            .field("slot", &self.slot)
            .field("client", &self.id)
            .finish_non_exhaustive()
    }
}
