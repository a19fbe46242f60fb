//! Structured Events
//!
//! Provides structured event logging with consistent fields across the
//! coordinator. Each event type has a dedicated function so field names stay
//! uniform between the observer and the controller.
//!
//! Event types:
//! - `snapshot_published` - A new snapshot became visible to readers
//! - `watch_failed` - The watch subscription broke; a resnapshot follows
//! - `resnapshot_failed` - A full read or resubscription attempt failed
//! - `observer_stopped` - The watch loop exited for good
//! - `controller_state_changed` - Leader-election state transition
//! - `reconciliation_completed` - A reconciliation pass finished
//! - `leadership_lost` - The election lease was lost involuntarily
//! - `lease_lost` - Keep-alive for a session lease stopped

use tracing::{debug, error, info, warn};

/// Emit a snapshot published event
pub fn snapshot_published(namespace: &str, generation: u64, member_count: usize, shard_count: usize) {
    debug!(
        event_type = "snapshot_published",
        namespace = %namespace,
        generation = generation,
        member_count = member_count,
        shard_count = shard_count,
        "Snapshot published"
    );
}

/// Emit a watch failed event
pub fn watch_failed(namespace: &str, error: &anyhow::Error, retry_in_secs: u64) {
    error!(
        event_type = "watch_failed",
        namespace = %namespace,
        error = %format!("{error:#}"),
        retry_in_secs = retry_in_secs,
        "Watch failed, resnapshotting after backoff"
    );
}

/// Emit a resnapshot failed event
pub fn resnapshot_failed(namespace: &str, error: &anyhow::Error, attempt: u32) {
    warn!(
        event_type = "resnapshot_failed",
        namespace = %namespace,
        error = %format!("{error:#}"),
        attempt = attempt,
        "Resnapshot failed"
    );
}

/// Emit an observer stopped event
pub fn observer_stopped(namespace: &str) {
    info!(
        event_type = "observer_stopped",
        namespace = %namespace,
        "Observer stopped"
    );
}

/// Emit a controller state changed event
pub fn controller_state_changed(namespace: &str, member_id: &str, previous: &str, new: &str) {
    info!(
        event_type = "controller_state_changed",
        namespace = %namespace,
        member_id = %member_id,
        previous_state = %previous,
        new_state = %new,
        "Controller state changed"
    );
}

/// Emit a reconciliation completed event
pub fn reconciliation_completed(namespace: &str, member_count: usize, shard_count: usize) {
    info!(
        event_type = "reconciliation_completed",
        namespace = %namespace,
        member_count = member_count,
        shard_count = shard_count,
        "Reconciliation completed"
    );
}

/// Emit a leadership lost event
pub fn leadership_lost(namespace: &str, member_id: &str) {
    warn!(
        event_type = "leadership_lost",
        namespace = %namespace,
        member_id = %member_id,
        "Leadership lost"
    );
}

/// Emit a lease lost event
pub fn lease_lost(lease_id: i64, reason: &str) {
    warn!(
        event_type = "lease_lost",
        lease_id = lease_id,
        reason = %reason,
        "Election lease lost"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_functions_dont_panic() {
        let err = anyhow::anyhow!("connection reset");
        snapshot_published("sample", 3, 2, 16);
        watch_failed("sample", &err, 10);
        resnapshot_failed("sample", &err, 1);
        observer_stopped("sample");
        controller_state_changed("sample", "controller-1", "campaigning", "leading");
        reconciliation_completed("sample", 2, 16);
        leadership_lost("sample", "controller-1");
        lease_lost(7587869151396265991, "keep-alive stream closed");
    }
}
