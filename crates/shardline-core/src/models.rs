//! Membership and shard data models

use std::fmt;

/// Opaque identity of a cluster participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MemberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Dense shard index in `[0, num_shards)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ShardId(pub u32);

impl ShardId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generation counter of a shard assignment.
///
/// Bumped on every ownership change so that a stale owner can be fenced off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ShardRevision(pub u64);

impl fmt::Display for ShardRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Assignment status of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShardStatus {
    /// No member currently serves the shard
    #[default]
    Unassigned,
    /// The owner is serving the shard
    Active,
}

impl ShardStatus {
    /// Integer form used in stored records.
    pub fn code(self) -> u8 {
        match self {
            ShardStatus::Unassigned => 0,
            ShardStatus::Active => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ShardStatus::Unassigned),
            1 => Some(ShardStatus::Active),
            _ => None,
        }
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardStatus::Unassigned => write!(f, "unassigned"),
            ShardStatus::Active => write!(f, "active"),
        }
    }
}

/// Member flags that are not part of its identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemberExtra {
    /// The member intends to drain and leave the cluster
    pub prepare_to_leave: bool,
}

/// Liveness and address record of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemberInfo {
    pub id: MemberId,
    pub addr: String,
    pub extra: MemberExtra,
}

impl MemberInfo {
    pub fn new(id: impl Into<MemberId>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            extra: MemberExtra::default(),
        }
    }

    pub fn is_leaving(&self) -> bool {
        self.extra.prepare_to_leave
    }
}

/// Shard flags that are not part of the assignment itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShardExtra {
    /// The owner should release the shard
    pub prepare_to_drop: bool,
}

/// Current assignment of one shard
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShardInfo {
    pub id: ShardId,
    pub status: ShardStatus,
    pub owner: Option<MemberId>,
    pub revision: ShardRevision,
    pub extra: ShardExtra,
}

impl ShardInfo {
    /// Fresh slot: unassigned, revision 0, no owner.
    pub fn unassigned(id: ShardId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn is_owned_by(&self, member: &MemberId) -> bool {
        self.owner.as_ref() == Some(member)
    }
}
