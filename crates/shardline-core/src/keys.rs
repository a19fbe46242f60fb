//! Key layout under a namespace
//!
//! ```text
//! /<ns>/members/<member_id>  -> member record (JSON)
//! /<ns>/shards/<shard_id>    -> shard record (JSON)
//! /<ns>/num_shards           -> decimal shard count
//! /<ns>/elections/           -> controller election
//! ```

use crate::models::{MemberId, ShardId};

pub const MEMBERS: &str = "members";
pub const SHARDS: &str = "shards";
pub const NUM_SHARDS: &str = "num_shards";
pub const ELECTIONS: &str = "elections";

/// Prefix scoping every key of a namespace.
pub fn namespace_prefix(ns: &str) -> String {
    format!("/{ns}/")
}

pub fn member_key(ns: &str, id: &MemberId) -> String {
    format!("/{ns}/{MEMBERS}/{id}")
}

pub fn shard_key(ns: &str, id: ShardId) -> String {
    format!("/{ns}/{SHARDS}/{id}")
}

pub fn num_shards_key(ns: &str) -> String {
    format!("/{ns}/{NUM_SHARDS}")
}

pub fn election_prefix(ns: &str) -> String {
    format!("/{ns}/{ELECTIONS}/")
}
