//! Observer client and watch loop

use super::session::ObserverSession;
use crate::config::CoordinatorConfig;
use crate::observability::{events, metrics};
use crate::store::{CoordinationStore, EventStream};
use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use futures::StreamExt;
use shardline_core::{Snapshot, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Owns the snapshot and subscription lifecycle of one namespace.
///
/// Dropping the client stops the watch loop; [`ObserverClient::close`] also
/// waits for it to exit.
pub struct ObserverClient {
    namespace: String,
    published: Arc<ArcSwap<Snapshot>>,
    changes: watch::Receiver<u64>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ObserverClient {
    /// Take the initial snapshot, open the watch and start the loop.
    ///
    /// Fails if the initial read, decode or subscription fails; nothing is
    /// retried before the client exists.
    pub async fn start(store: Arc<dyn CoordinationStore>, config: &CoordinatorConfig) -> Result<Self> {
        let state = StateStore::new(config.namespace.clone());
        let (snapshot, stream) = load(store.as_ref(), &state)
            .await
            .context("Initial snapshot failed")?;

        info!(
            namespace = %config.namespace,
            member_count = snapshot.members().len(),
            shard_count = snapshot.num_shards(),
            "Observer started"
        );

        let published = Arc::new(ArcSwap::from_pointee(snapshot));
        let (changes_tx, changes) = watch::channel(0u64);
        let cancel = CancellationToken::new();

        let watch_loop = WatchLoop {
            store,
            state,
            published: Arc::clone(&published),
            changes: changes_tx,
            cancel: cancel.clone(),
            retry_backoff: config.retry_backoff,
        };
        let task = tokio::spawn(watch_loop.run(stream));

        Ok(Self {
            namespace: config.namespace.clone(),
            published,
            changes,
            cancel,
            task: Some(task),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Current snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.published.load_full()
    }

    /// Open a read session; its first wait returns on the next publication.
    pub fn session(&self) -> ObserverSession {
        let mut changes = self.changes.clone();
        changes.borrow_and_update();
        ObserverSession::new(Arc::clone(&self.published), changes)
    }

    /// Stop the watch loop and wait until it has exited.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Observer task failed");
            }
        }
    }
}

impl Drop for ObserverClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Read the whole namespace and subscribe right after the read revision.
async fn load(store: &dyn CoordinationStore, state: &StateStore) -> Result<(Snapshot, EventStream)> {
    let read = store
        .get_prefix(state.prefix())
        .await
        .context("Prefix read failed")?;
    let snapshot = state.build(&read.kvs).context("Snapshot build failed")?;
    let stream = store
        .watch_prefix(state.prefix(), read.revision + 1)
        .await
        .context("Watch subscription failed")?;

    debug!(
        namespace = %state.namespace(),
        revision = read.revision,
        "Snapshot loaded, watching from next revision"
    );
    Ok((snapshot, stream))
}

/// Single writer of the published snapshot.
///
/// Owns the change sender: when the loop returns, sessions observe closure.
struct WatchLoop {
    store: Arc<dyn CoordinationStore>,
    state: StateStore,
    published: Arc<ArcSwap<Snapshot>>,
    changes: watch::Sender<u64>,
    cancel: CancellationToken,
    retry_backoff: Duration,
}

impl WatchLoop {
    async fn run(self, mut stream: EventStream) {
        let namespace = self.state.namespace().to_string();

        'outer: loop {
            let err = tokio::select! {
                _ = self.cancel.cancelled() => break 'outer,
                err = self.consume(&mut stream) => err,
            };
            drop(stream);

            events::watch_failed(&namespace, &err, self.retry_backoff.as_secs());
            metrics::record_watch_restart(&namespace);

            let mut attempt = 0u32;
            loop {
                if !self.backoff().await {
                    break 'outer;
                }

                attempt += 1;
                let loaded = tokio::select! {
                    _ = self.cancel.cancelled() => break 'outer,
                    loaded = load(self.store.as_ref(), &self.state) => loaded,
                };

                match loaded {
                    Ok((snapshot, next)) => {
                        info!(namespace = %namespace, attempt = attempt, "Resnapshot succeeded");
                        self.publish(snapshot);
                        stream = next;
                        continue 'outer;
                    }
                    Err(e) => {
                        events::resnapshot_failed(&namespace, &e, attempt);
                        metrics::record_resnapshot_failure(&namespace);
                    }
                }
            }
        }

        events::observer_stopped(&namespace);
    }

    /// Apply batches until the subscription breaks or a batch is rejected.
    async fn consume(&self, stream: &mut EventStream) -> anyhow::Error {
        let namespace = self.state.namespace();

        while let Some(batch) = stream.next().await {
            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => return anyhow::Error::new(e).context("Watch stream failed"),
            };

            let current = self.published.load_full();
            match self.state.apply(&current, &batch) {
                Ok(next) => {
                    metrics::record_batch_applied(namespace);
                    // Batches of unrelated keys (elections) change nothing
                    if next.same_members(&current) && next.same_shards(&current) {
                        trace!(namespace = %namespace, "Batch left snapshot unchanged");
                        continue;
                    }
                    self.publish(next);
                }
                Err(e) => {
                    metrics::record_apply_error(namespace);
                    return anyhow::Error::new(e).context("Watch batch rejected");
                }
            }
        }

        anyhow!("Watch stream closed")
    }

    fn publish(&self, snapshot: Snapshot) {
        let member_count = snapshot.members().len();
        let shard_count = snapshot.num_shards();

        self.published.store(Arc::new(snapshot));
        self.changes.send_modify(|generation| *generation += 1);

        let namespace = self.state.namespace();
        metrics::set_snapshot_size(namespace, member_count, shard_count);
        events::snapshot_published(namespace, *self.changes.borrow(), member_count, shard_count);
    }

    /// Sleep for the retry backoff. Returns false if cancelled meanwhile.
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.retry_backoff) => true,
        }
    }
}
