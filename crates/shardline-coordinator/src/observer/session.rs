//! Read sessions over the published snapshot

use crate::controller::MemberWatcher;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use shardline_core::{MemberId, MemberInfo, ShardInfo, Snapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Consumer view of an [`ObserverClient`](super::ObserverClient).
///
/// Reads never block and always see a complete snapshot.
pub struct ObserverSession {
    published: Arc<ArcSwap<Snapshot>>,
    changes: watch::Receiver<u64>,
}

impl ObserverSession {
    pub(super) fn new(published: Arc<ArcSwap<Snapshot>>, changes: watch::Receiver<u64>) -> Self {
        Self { published, changes }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.published.load_full()
    }

    pub fn members(&self) -> Arc<HashMap<MemberId, MemberInfo>> {
        self.published.load().shared_members()
    }

    pub fn shards(&self) -> Arc<Vec<ShardInfo>> {
        self.published.load().shared_shards()
    }

    /// Wait for the next publication.
    ///
    /// Returns `true` once the watch loop has stopped for good; every later
    /// call returns `true` immediately.
    pub async fn wait(&mut self) -> bool {
        self.changes.changed().await.is_err()
    }

    /// Adapt this session into a watcher that only wakes on member changes.
    pub fn into_member_watcher(self) -> MembershipWatcher {
        let seen = self.members();
        MembershipWatcher {
            session: self,
            seen,
        }
    }
}

/// [`MemberWatcher`] over an observer session.
///
/// Publications that leave the member map untouched (shard-only batches) are
/// skipped. A resnapshot yields a fresh map, so contents are compared too.
pub struct MembershipWatcher {
    session: ObserverSession,
    seen: Arc<HashMap<MemberId, MemberInfo>>,
}

#[async_trait]
impl MemberWatcher for MembershipWatcher {
    fn members(&self) -> Arc<HashMap<MemberId, MemberInfo>> {
        self.session.members()
    }

    async fn wait(&mut self) -> bool {
        loop {
            if self.session.wait().await {
                return true;
            }

            let current = self.session.members();
            let changed = !Arc::ptr_eq(&current, &self.seen) && *current != *self.seen;
            self.seen = current;
            if changed {
                return false;
            }
        }
    }
}
