#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Cache building blocks for the ticket map tile pipeline.
//!
//! - [`SizedCache`]: process-local LRU bounded by approximate byte size,
//!   shared by the point tile, ward tile and snapshot caches.
//! - [`DistributedCache`]: async client abstraction over a shared
//!   key-value cache with TTLs and advisory locks, plus the in-process
//!   [`MemoryDistributedCache`].
//! - [`CacheEnvelope`]: versioned framing for cached payloads.
//! - [`DiskSnapshotStore`]: gzip snapshots on local disk, keyed by
//!   namespace and version.

pub mod distributed;
pub mod envelope;
pub mod sized;
pub mod snapshot;

pub use distributed::{DistributedCache, MemoryCacheStats, MemoryDistributedCache};
pub use envelope::CacheEnvelope;
pub use sized::{SizeEstimator, SizedCache};
pub use snapshot::DiskSnapshotStore;

/// Errors raised by cache tiers.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The distributed cache could not be reached.
    #[error("Distributed cache unavailable: {0}")]
    Unavailable(String),

    /// A stored entry could not be decoded.
    #[error("Corrupt cache entry {key}: {reason}")]
    Corrupt {
        /// Cache key or file path of the entry.
        key: String,
        /// Decoder error message.
        reason: String,
    },

    /// An entry could not be serialized.
    #[error("Failed to encode cache entry: {0}")]
    Encode(String),

    /// I/O error reading or writing snapshot files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A compression task panicked or was cancelled.
    #[error("Snapshot task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
