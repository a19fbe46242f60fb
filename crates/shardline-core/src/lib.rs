//! Core shared types for shardline
//!
//! This crate contains the membership and shard-assignment model, the JSON
//! record codecs, the coordination-store key layout, and the `StateStore`
//! that turns raw key/value records and change events into immutable
//! snapshots. It performs no I/O.

pub mod codec;
pub mod error;
pub mod keys;
mod models;
pub mod state;

pub use error::StateError;
pub use models::{
    MemberExtra, MemberId, MemberInfo, ShardExtra, ShardId, ShardInfo, ShardRevision,
    ShardStatus,
};
pub use state::{EventKind, KeyValue, Snapshot, StateStore, WatchEvent};
