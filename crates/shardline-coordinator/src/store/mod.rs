//! Coordination Store
//!
//! The strongly-consistent key-value store the coordinator is built on:
//! - point-in-time prefix reads with the store revision they were served at
//! - prefix watches starting from a given revision
//! - lease-backed leader election sessions
//!
//! `EtcdStore` talks to a real etcd cluster; `MemoryStore` implements the
//! same contract in process.

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use shardline_core::{KeyValue, WatchEvent};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Coordination store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("etcd: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("watch canceled: {0}")]
    WatchCanceled(String),
    #[error("watch compacted at revision {0}")]
    Compacted(i64),
    #[error("encode record: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("election session closed")]
    SessionClosed,
    #[error("injected failure: {0}")]
    Injected(String),
}

/// Result of a prefix read
#[derive(Debug, Clone, Default)]
pub struct PrefixRead {
    pub kvs: Vec<KeyValue>,
    /// Store revision the read was served at
    pub revision: i64,
}

/// Batches of events in store revision order.
///
/// The stream ends or yields an error when the subscription breaks; it is
/// never resumed.
pub type EventStream = BoxStream<'static, Result<Vec<WatchEvent>, StoreError>>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read every key under `prefix`. A serializable (possibly stale) read is
    /// acceptable.
    async fn get_prefix(&self, prefix: &str) -> Result<PrefixRead, StoreError>;

    /// Subscribe to changes under `prefix` starting at `from_revision`.
    async fn watch_prefix(&self, prefix: &str, from_revision: i64) -> Result<EventStream, StoreError>;

    /// Open a lease-backed session for leader election.
    async fn open_session(&self) -> Result<Box<dyn ElectionSession>, StoreError>;
}

/// Lease-backed election session
#[async_trait]
pub trait ElectionSession: Send + Sync {
    /// Block until this session holds leadership of `election`.
    async fn campaign(&mut self, election: &str, value: &str) -> Result<(), StoreError>;

    /// Give up leadership so another campaigner can take over.
    async fn resign(&mut self) -> Result<(), StoreError>;

    /// Fires when the session lease is lost involuntarily.
    fn lost(&self) -> CancellationToken;
}
