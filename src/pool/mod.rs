// ABOUTME: Keyed HTTPS client pooling for outbound overlay requests
//
// Key components:
// - directory: bounded key -> value table used for pools and services
// - entry: one pooled client and its Free/Active/Broken state
// - client_pool: fixed-size pool per destination gated by a semaphore
// - registry: owned destination -> pool map with lazy construction
// - metrics: registry-level counters

pub mod client_pool;
pub mod directory;
pub mod entry;
pub mod metrics;
pub mod registry;

// Re-exports for convenient access
pub use client_pool::{ClientPool, Lease, PoolError, PoolResult, PoolStats, SlotSnapshot};
pub use directory::{Directory, DirectoryError};
pub use entry::{ClientId, EntryState, PoolEntry};
pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use registry::ConnectionPoolRegistry;
