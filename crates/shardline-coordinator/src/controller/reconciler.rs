//! Reconciliation hook

use crate::observability::events;
use async_trait::async_trait;
use shardline_core::Snapshot;
use std::sync::Arc;
use tracing::{debug, info};

/// Computes and applies a shard plan for a snapshot.
///
/// Called by the leader on taking leadership and after every membership change.
/// An error ends the controller run.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, snapshot: Arc<Snapshot>) -> anyhow::Result<()>;
}

/// Reports what a planner would have to act on without writing anything.
#[derive(Debug, Clone)]
pub struct LoggingReconciler {
    namespace: String,
}

impl LoggingReconciler {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl Reconciler for LoggingReconciler {
    async fn reconcile(&self, snapshot: Arc<Snapshot>) -> anyhow::Result<()> {
        let unassigned = snapshot.unassigned_shards().count();

        let mut draining = 0usize;
        for member in snapshot.draining_members() {
            let held = snapshot.shards_owned_by(&member.id).count();
            debug!(
                namespace = %self.namespace,
                member_id = %member.id,
                shards_held = held,
                "Member preparing to leave"
            );
            draining += held;
        }

        info!(
            namespace = %self.namespace,
            member_count = snapshot.members().len(),
            shard_count = snapshot.num_shards(),
            unassigned_shards = unassigned,
            draining_shards = draining,
            "Reconciliation plan inputs"
        );
        events::reconciliation_completed(&self.namespace, snapshot.members().len(), snapshot.num_shards());
        Ok(())
    }
}
