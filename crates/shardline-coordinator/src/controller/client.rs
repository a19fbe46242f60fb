//! Controller client

use super::{ControllerState, MemberWatcher, Reconciler, RunOutcome};
use crate::config::CoordinatorConfig;
use crate::observability::{events, metrics};
use crate::store::CoordinationStore;
use anyhow::{Context, Result};
use shardline_core::{keys, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Leader-elected reconciliation loop for one namespace.
pub struct ControllerClient {
    store: Arc<dyn CoordinationStore>,
    state: StateStore,
    member_id: String,
    resign_timeout: Duration,
    reconciler: Arc<dyn Reconciler>,
    /// Coalesced membership change signal
    changes: Arc<Notify>,
    /// Cancelled once the watcher has closed for good
    watcher_closed: CancellationToken,
    forwarder: JoinHandle<()>,
    state_tx: watch::Sender<ControllerState>,
}

impl ControllerClient {
    /// Create the controller and start forwarding membership changes.
    ///
    /// Must be called within a tokio runtime.
    pub fn new<W>(
        store: Arc<dyn CoordinationStore>,
        watcher: W,
        config: &CoordinatorConfig,
        reconciler: Arc<dyn Reconciler>,
    ) -> Self
    where
        W: MemberWatcher + 'static,
    {
        let changes = Arc::new(Notify::new());
        let watcher_closed = CancellationToken::new();
        let forwarder = tokio::spawn(forward_changes(
            watcher,
            Arc::clone(&changes),
            watcher_closed.clone(),
        ));
        let (state_tx, _) = watch::channel(ControllerState::Campaigning);

        Self {
            store,
            state: StateStore::new(config.namespace.clone()),
            member_id: config.member_id.clone(),
            resign_timeout: config.resign_timeout,
            reconciler,
            changes,
            watcher_closed,
            forwarder,
            state_tx,
        }
    }

    pub fn namespace(&self) -> &str {
        self.state.namespace()
    }

    pub fn state(&self) -> ControllerState {
        *self.state_tx.borrow()
    }

    /// Follow state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state_tx.subscribe()
    }

    /// Campaign, lead until told to stop or the lease is lost, then return.
    ///
    /// Store failures while campaigning or reconciling end the run with an
    /// error and leave the state at [`ControllerState::Failed`]; the caller
    /// decides whether to run again. Closure of the member watcher is handled
    /// like `shutdown`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<RunOutcome> {
        match self.campaign_and_lead(&shutdown).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(
                    namespace = %self.namespace(),
                    member_id = %self.member_id,
                    error = %format!("{e:#}"),
                    "Controller run failed"
                );
                self.transition(ControllerState::Failed);
                Err(e)
            }
        }
    }

    async fn campaign_and_lead(&self, shutdown: &CancellationToken) -> Result<RunOutcome> {
        self.transition(ControllerState::Campaigning);

        let mut session = self
            .store
            .open_session()
            .await
            .context("Failed to open election session")?;
        let lost = session.lost();
        let election = keys::election_prefix(self.namespace());

        debug!(
            namespace = %self.namespace(),
            member_id = %self.member_id,
            election = %election,
            "Campaigning for leadership"
        );

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(namespace = %self.namespace(), "Shutdown requested while campaigning");
                self.transition(ControllerState::Resigned);
                return Ok(RunOutcome::Resigned);
            }
            _ = self.watcher_closed.cancelled() => {
                info!(namespace = %self.namespace(), "Member watcher closed while campaigning");
                self.transition(ControllerState::Resigned);
                return Ok(RunOutcome::Resigned);
            }
            won = session.campaign(&election, &self.member_id) => {
                won.context("Campaign failed")?;
            }
        }

        self.transition(ControllerState::Leading);

        // A pass runs on taking leadership and after every membership change.
        // Lease loss and stop requests preempt a pass in flight.
        let mut reconcile_due = true;
        loop {
            if reconcile_due {
                reconcile_due = false;
                tokio::select! {
                    biased;

                    _ = lost.cancelled() => return Ok(self.leadership_lost()),
                    _ = shutdown.cancelled() => {
                        info!(namespace = %self.namespace(), "Shutdown requested, reconciliation abandoned");
                        break;
                    }
                    _ = self.watcher_closed.cancelled() => {
                        info!(namespace = %self.namespace(), "Member watcher closed, reconciliation abandoned");
                        break;
                    }
                    done = self.reconcile() => done?,
                }
                continue;
            }

            tokio::select! {
                biased;

                _ = lost.cancelled() => return Ok(self.leadership_lost()),
                _ = shutdown.cancelled() => break,
                _ = self.watcher_closed.cancelled() => {
                    info!(namespace = %self.namespace(), "Member watcher closed, stepping down");
                    break;
                }
                _ = self.changes.notified() => {
                    debug!(namespace = %self.namespace(), "Membership changed");
                    reconcile_due = true;
                }
            }
        }

        self.transition(ControllerState::Resigning);
        match tokio::time::timeout(self.resign_timeout, session.resign()).await {
            Ok(Ok(())) => debug!(namespace = %self.namespace(), "Resigned leadership"),
            Ok(Err(e)) => warn!(
                namespace = %self.namespace(),
                error = %e,
                "Resign failed, leadership ends with the lease"
            ),
            Err(_) => warn!(
                namespace = %self.namespace(),
                timeout_secs = self.resign_timeout.as_secs(),
                "Resign timed out, leadership ends with the lease"
            ),
        }
        self.transition(ControllerState::Resigned);

        Ok(RunOutcome::Resigned)
    }

    fn leadership_lost(&self) -> RunOutcome {
        events::leadership_lost(self.namespace(), &self.member_id);
        self.transition(ControllerState::LeadershipLost);
        RunOutcome::LeadershipLost
    }

    /// Read the whole namespace and hand it to the reconciler.
    async fn reconcile(&self) -> Result<()> {
        let read = self
            .store
            .get_prefix(self.state.prefix())
            .await
            .context("Reconciliation read failed")?;
        let snapshot = self
            .state
            .build(&read.kvs)
            .context("Reconciliation snapshot build failed")?;

        debug!(
            namespace = %self.namespace(),
            revision = read.revision,
            "Reconciling"
        );
        self.reconciler
            .reconcile(Arc::new(snapshot))
            .await
            .context("Reconciler failed")?;

        metrics::record_reconciliation(self.namespace());
        Ok(())
    }

    fn transition(&self, new: ControllerState) {
        let previous = self.state_tx.send_replace(new);
        if previous == new {
            return;
        }

        events::controller_state_changed(
            self.namespace(),
            &self.member_id,
            previous.as_str(),
            new.as_str(),
        );
        metrics::record_controller_transition(new.as_str());
    }
}

impl Drop for ControllerClient {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Turn each watcher change cycle into one (coalescing) notification.
async fn forward_changes<W: MemberWatcher>(mut watcher: W, changes: Arc<Notify>, closed: CancellationToken) {
    loop {
        if watcher.wait().await {
            debug!("Member watcher closed");
            closed.cancel();
            return;
        }
        changes.notify_one();
    }
}
