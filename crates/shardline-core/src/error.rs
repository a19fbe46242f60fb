//! State decoding errors

use thiserror::Error;

/// Failure while building or updating a snapshot.
///
/// Any of these aborts the whole batch; the input snapshot stays valid.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("decode {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid num_shards value {value:?}: {source}")]
    InvalidNumShards {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("invalid shard id in key {key}")]
    InvalidShardId { key: String },
    #[error("shard id {id} out of range (num_shards = {len})")]
    ShardOutOfRange { id: u32, len: usize },
    #[error("delete of {key} is not supported")]
    UnsupportedDelete { key: String },
}
