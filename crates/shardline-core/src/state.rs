//! Snapshot reconstruction and incremental update
//!
//! A [`Snapshot`] is an immutable view of one namespace: the member map and
//! the shard table. [`StateStore::apply`] never touches its input; it
//! produces a new snapshot that shares every container the batch left alone
//! and holds a private copy of the ones it changed. Each container is copied
//! at most once per batch, and only when an event actually touches it.
//!
//! The shard table only grows. A larger `num_shards` appends unassigned
//! slots; a smaller one is ignored, since shrinking needs the owners to
//! release their shards first.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::codec;
use crate::error::StateError;
use crate::keys;
use crate::models::{MemberId, MemberInfo, ShardId, ShardInfo};

/// Raw record from a point-in-time read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// Change event delivered by a prefix watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: Vec<u8>,
}

impl WatchEvent {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: EventKind::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Delete,
            key: key.into(),
            value: Vec::new(),
        }
    }
}

impl From<KeyValue> for WatchEvent {
    fn from(kv: KeyValue) -> Self {
        WatchEvent::put(kv.key, kv.value)
    }
}

/// Immutable membership and shard view
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    members: Arc<HashMap<MemberId, MemberInfo>>,
    shards: Arc<Vec<ShardInfo>>,
}

impl Snapshot {
    pub fn members(&self) -> &HashMap<MemberId, MemberInfo> {
        &self.members
    }

    pub fn shards(&self) -> &[ShardInfo] {
        &self.shards
    }

    /// Member map handle shared with every snapshot that did not change it.
    pub fn shared_members(&self) -> Arc<HashMap<MemberId, MemberInfo>> {
        Arc::clone(&self.members)
    }

    /// Shard table handle shared with every snapshot that did not change it.
    pub fn shared_shards(&self) -> Arc<Vec<ShardInfo>> {
        Arc::clone(&self.shards)
    }

    /// Whether both snapshots hold the very same member map.
    pub fn same_members(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.members, &other.members)
    }

    /// Whether both snapshots hold the very same shard table.
    pub fn same_shards(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.shards, &other.shards)
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn member(&self, id: &MemberId) -> Option<&MemberInfo> {
        self.members.get(id)
    }

    pub fn shard(&self, id: ShardId) -> Option<&ShardInfo> {
        self.shards.get(id.index())
    }

    pub fn unassigned_shards(&self) -> impl Iterator<Item = &ShardInfo> {
        self.shards.iter().filter(|s| s.owner.is_none())
    }

    pub fn shards_owned_by<'a>(&'a self, member: &'a MemberId) -> impl Iterator<Item = &'a ShardInfo> {
        self.shards.iter().filter(move |s| s.is_owned_by(member))
    }

    /// Members that announced they are about to leave.
    pub fn draining_members(&self) -> impl Iterator<Item = &MemberInfo> {
        self.members.values().filter(|m| m.is_leaving())
    }
}

/// Decodes the records of one namespace into snapshots.
///
/// Stateless apart from the namespace; callers must apply batches of one
/// namespace one at a time and in delivery order.
#[derive(Debug, Clone)]
pub struct StateStore {
    namespace: String,
    prefix: String,
    num_shards_key: String,
}

impl StateStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            prefix: keys::namespace_prefix(&namespace),
            num_shards_key: keys::num_shards_key(&namespace),
            namespace,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Key prefix covering every record of the namespace.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build a snapshot from a full prefix read.
    ///
    /// The records are treated as one batch of puts.
    pub fn build(&self, kvs: &[KeyValue]) -> Result<Snapshot, StateError> {
        let events: Vec<WatchEvent> = kvs.iter().cloned().map(WatchEvent::from).collect();
        self.apply(&Snapshot::default(), &events)
    }

    /// Apply one batch of events on top of `base`.
    ///
    /// Returns the first error encountered; on error nothing derived from the
    /// batch may be published.
    pub fn apply(&self, base: &Snapshot, events: &[WatchEvent]) -> Result<Snapshot, StateError> {
        let mut members: Option<HashMap<MemberId, MemberInfo>> = None;
        let mut shards: Option<Vec<ShardInfo>> = None;

        if let Some(target) = self.find_num_shards(events)? {
            let len = base.shards.len();
            if target > len {
                let grown = shards.get_or_insert_with(|| base.shards.as_ref().clone());
                grown.extend((len..target).map(|i| ShardInfo::unassigned(ShardId(i as u32))));
                trace!(from = len, to = target, "Shard table grown");
            }
        }

        for event in events {
            let Some(rest) = event.key.strip_prefix(&self.prefix) else {
                continue;
            };

            if let Some(id) = rest
                .strip_prefix(keys::MEMBERS)
                .and_then(|r| r.strip_prefix('/'))
            {
                if event.kind == EventKind::Delete {
                    return Err(StateError::UnsupportedDelete {
                        key: event.key.clone(),
                    });
                }

                let mut info = codec::decode_member(&event.value).map_err(|source| {
                    StateError::Codec {
                        key: event.key.clone(),
                        source,
                    }
                })?;
                // The key is authoritative over the embedded id
                info.id = MemberId::from(id);

                members
                    .get_or_insert_with(|| base.members.as_ref().clone())
                    .insert(info.id.clone(), info);
                continue;
            }

            if let Some(id) = rest
                .strip_prefix(keys::SHARDS)
                .and_then(|r| r.strip_prefix('/'))
            {
                if event.kind == EventKind::Delete {
                    return Err(StateError::UnsupportedDelete {
                        key: event.key.clone(),
                    });
                }

                let id: u32 = id.parse().map_err(|_| StateError::InvalidShardId {
                    key: event.key.clone(),
                })?;
                let len = shards.as_ref().map_or(base.shards.len(), Vec::len);
                if id as usize >= len {
                    return Err(StateError::ShardOutOfRange { id, len });
                }

                let mut info = codec::decode_shard(&event.value).map_err(|source| {
                    StateError::Codec {
                        key: event.key.clone(),
                        source,
                    }
                })?;
                info.id = ShardId(id);

                shards.get_or_insert_with(|| base.shards.as_ref().clone())[id as usize] = info;
                continue;
            }

            if event.kind == EventKind::Delete && event.key == self.num_shards_key {
                return Err(StateError::UnsupportedDelete {
                    key: event.key.clone(),
                });
            }
        }

        Ok(Snapshot {
            members: members
                .map(Arc::new)
                .unwrap_or_else(|| Arc::clone(&base.members)),
            shards: shards
                .map(Arc::new)
                .unwrap_or_else(|| Arc::clone(&base.shards)),
        })
    }

    /// Largest shard count put in the batch, if any.
    fn find_num_shards(&self, events: &[WatchEvent]) -> Result<Option<usize>, StateError> {
        let mut found = None;
        for event in events {
            if event.kind != EventKind::Put || event.key != self.num_shards_key {
                continue;
            }

            let text = String::from_utf8_lossy(&event.value);
            let count: u32 = text
                .parse()
                .map_err(|source| StateError::InvalidNumShards {
                    value: text.to_string(),
                    source,
                })?;
            found = Some(found.map_or(count, |prev: u32| prev.max(count)));
        }
        Ok(found.map(|n| n as usize))
    }
}
