//! Controller behaviour against the in-memory store

use async_trait::async_trait;
use shardline_core::{keys, MemberId, MemberInfo, Snapshot};
use shardline_coordinator::{
    ControllerClient, ControllerState, CoordinationStore, CoordinatorConfig, ElectionSession,
    MemberWatcher, MemoryStore, ObserverClient, Reconciler, RunOutcome,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const NS: &str = "sample";

fn config(member_id: &str) -> CoordinatorConfig {
    CoordinatorConfig::default()
        .with_namespace(NS)
        .with_member_id(member_id)
        .with_retry_backoff(Duration::from_secs(10))
        .with_resign_timeout(Duration::from_secs(30))
}

fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.set_num_shards(NS, 8);
    store.put_member(NS, &MemberInfo::new("m1", "addr01:2000")).unwrap();
    store
}

/// Member watcher driven by the test through a channel
struct ChannelWatcher {
    rx: mpsc::UnboundedReceiver<()>,
}

#[async_trait]
impl MemberWatcher for ChannelWatcher {
    fn members(&self) -> Arc<HashMap<MemberId, MemberInfo>> {
        Arc::new(HashMap::new())
    }

    async fn wait(&mut self) -> bool {
        self.rx.recv().await.is_none()
    }
}

fn channel_watcher() -> (mpsc::UnboundedSender<()>, ChannelWatcher) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ChannelWatcher { rx })
}

/// Keeps every snapshot it was asked to reconcile
struct RecordingReconciler {
    seen: Mutex<Vec<Arc<Snapshot>>>,
    calls: watch::Sender<usize>,
}

impl RecordingReconciler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            calls: watch::channel(0).0,
        })
    }

    async fn wait_for_calls(&self, n: usize) {
        let mut calls = self.calls.subscribe();
        calls.wait_for(|c| *c >= n).await.unwrap();
    }

    async fn last(&self) -> Arc<Snapshot> {
        self.seen.lock().await.last().cloned().unwrap()
    }
}

#[async_trait]
impl Reconciler for RecordingReconciler {
    async fn reconcile(&self, snapshot: Arc<Snapshot>) -> anyhow::Result<()> {
        self.seen.lock().await.push(snapshot);
        self.calls.send_modify(|c| *c += 1);
        Ok(())
    }
}

/// Fails every pass
struct FailingReconciler;

#[async_trait]
impl Reconciler for FailingReconciler {
    async fn reconcile(&self, _snapshot: Arc<Snapshot>) -> anyhow::Result<()> {
        anyhow::bail!("planner unavailable")
    }
}

/// Never finishes a pass
struct StalledReconciler {
    entered: Notify,
}

impl StalledReconciler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Notify::new(),
        })
    }
}

#[async_trait]
impl Reconciler for StalledReconciler {
    async fn reconcile(&self, _snapshot: Arc<Snapshot>) -> anyhow::Result<()> {
        self.entered.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn spawn_run(
    controller: &Arc<ControllerClient>,
    shutdown: &CancellationToken,
) -> JoinHandle<anyhow::Result<RunOutcome>> {
    let controller = Arc::clone(controller);
    let shutdown = shutdown.clone();
    tokio::spawn(async move { controller.run(shutdown).await })
}

#[tokio::test]
async fn test_reconciles_on_leadership_and_member_change() {
    let store = seeded_store();
    let (tx, watcher) = channel_watcher();
    let reconciler = RecordingReconciler::new();
    let controller = Arc::new(ControllerClient::new(
        Arc::new(store.clone()),
        watcher,
        &config("controller-1"),
        reconciler.clone(),
    ));
    let shutdown = CancellationToken::new();
    let run = spawn_run(&controller, &shutdown);

    reconciler.wait_for_calls(1).await;
    assert_eq!(controller.state(), ControllerState::Leading);
    assert_eq!(store.leader().as_deref(), Some("controller-1"));
    assert_eq!(reconciler.last().await.members().len(), 1);
    assert_eq!(reconciler.last().await.num_shards(), 8);

    store.put_member(NS, &MemberInfo::new("m2", "addr02:2000")).unwrap();
    tx.send(()).unwrap();
    reconciler.wait_for_calls(2).await;
    assert_eq!(reconciler.last().await.members().len(), 2);

    shutdown.cancel();
    assert_eq!(run.await.unwrap().unwrap(), RunOutcome::Resigned);
}

#[tokio::test]
async fn test_lease_loss_ends_run_without_resign() {
    let store = seeded_store();
    let (_tx, watcher) = channel_watcher();
    let reconciler = RecordingReconciler::new();
    let controller = Arc::new(ControllerClient::new(
        Arc::new(store.clone()),
        watcher,
        &config("controller-1"),
        reconciler.clone(),
    ));
    let mut states = controller.subscribe_state();
    let shutdown = CancellationToken::new();
    let run = spawn_run(&controller, &shutdown);

    reconciler.wait_for_calls(1).await;
    assert!(store.expire_leader());

    assert_eq!(run.await.unwrap().unwrap(), RunOutcome::LeadershipLost);
    assert_eq!(store.resign_count(), 0);
    assert_eq!(*states.borrow_and_update(), ControllerState::LeadershipLost);
}

#[tokio::test]
async fn test_shutdown_resigns_and_hands_over() {
    let store = seeded_store();
    let (_tx1, watcher1) = channel_watcher();
    let (_tx2, watcher2) = channel_watcher();
    let first = Arc::new(ControllerClient::new(
        Arc::new(store.clone()),
        watcher1,
        &config("controller-1"),
        RecordingReconciler::new(),
    ));
    let second_reconciler = RecordingReconciler::new();
    let second = Arc::new(ControllerClient::new(
        Arc::new(store.clone()),
        watcher2,
        &config("controller-2"),
        second_reconciler.clone(),
    ));

    let first_shutdown = CancellationToken::new();
    let mut first_states = first.subscribe_state();
    let first_run = spawn_run(&first, &first_shutdown);
    first_states
        .wait_for(|s| *s == ControllerState::Leading)
        .await
        .unwrap();

    let second_shutdown = CancellationToken::new();
    let second_run = spawn_run(&second, &second_shutdown);
    tokio::task::yield_now().await;
    assert_eq!(second.state(), ControllerState::Campaigning);

    first_shutdown.cancel();
    assert_eq!(first_run.await.unwrap().unwrap(), RunOutcome::Resigned);
    assert_eq!(first.state(), ControllerState::Resigned);
    assert_eq!(store.resign_count(), 1);

    second_reconciler.wait_for_calls(1).await;
    assert_eq!(store.leader().as_deref(), Some("controller-2"));

    second_shutdown.cancel();
    assert_eq!(second_run.await.unwrap().unwrap(), RunOutcome::Resigned);
    assert_eq!(store.leader(), None);
}

#[tokio::test]
async fn test_shutdown_while_campaigning() {
    let store = seeded_store();
    let mut holder = store.open_session().await.unwrap();
    holder
        .campaign(&keys::election_prefix(NS), "other")
        .await
        .unwrap();

    let (_tx, watcher) = channel_watcher();
    let reconciler = RecordingReconciler::new();
    let controller = Arc::new(ControllerClient::new(
        Arc::new(store.clone()),
        watcher,
        &config("controller-1"),
        reconciler.clone(),
    ));
    let shutdown = CancellationToken::new();
    let run = spawn_run(&controller, &shutdown);
    tokio::task::yield_now().await;

    shutdown.cancel();
    assert_eq!(run.await.unwrap().unwrap(), RunOutcome::Resigned);
    assert_eq!(store.resign_count(), 0);
    assert_eq!(*reconciler.calls.borrow(), 0);
    assert_eq!(store.leader().as_deref(), Some("other"));
}

#[tokio::test(start_paused = true)]
async fn test_resign_is_bounded() {
    let store = seeded_store();
    store.set_resign_delay(Duration::from_secs(60));
    let (_tx, watcher) = channel_watcher();
    let reconciler = RecordingReconciler::new();
    let controller = Arc::new(ControllerClient::new(
        Arc::new(store.clone()),
        watcher,
        &config("controller-1"),
        reconciler.clone(),
    ));
    let shutdown = CancellationToken::new();
    let run = spawn_run(&controller, &shutdown);
    reconciler.wait_for_calls(1).await;

    let before = Instant::now();
    shutdown.cancel();
    assert_eq!(run.await.unwrap().unwrap(), RunOutcome::Resigned);

    let elapsed = before.elapsed();
    assert!(elapsed >= Duration::from_secs(30));
    assert!(elapsed < Duration::from_secs(60));
    assert_eq!(store.resign_count(), 0);
    // Dropping the session still gives up leadership
    assert_eq!(store.leader(), None);
}

#[tokio::test]
async fn test_reconcile_read_failure_is_returned() {
    let store = seeded_store();
    store.fail_next_reads(1);
    let (_tx, watcher) = channel_watcher();
    let reconciler = RecordingReconciler::new();
    let controller = Arc::new(ControllerClient::new(
        Arc::new(store.clone()),
        watcher,
        &config("controller-1"),
        reconciler.clone(),
    ));

    let mut states = controller.subscribe_state();
    let result = controller.run(CancellationToken::new()).await;
    assert!(result.is_err());
    assert_eq!(*reconciler.calls.borrow(), 0);
    assert_eq!(store.leader(), None);
    assert_eq!(controller.state(), ControllerState::Failed);
    assert_eq!(*states.borrow_and_update(), ControllerState::Failed);

    // The caller may run again
    let shutdown = CancellationToken::new();
    let run = spawn_run(&controller, &shutdown);
    reconciler.wait_for_calls(1).await;
    assert_eq!(controller.state(), ControllerState::Leading);
    shutdown.cancel();
    assert_eq!(run.await.unwrap().unwrap(), RunOutcome::Resigned);
}

#[tokio::test]
async fn test_reconciler_error_fails_run() {
    let store = seeded_store();
    let (_tx, watcher) = channel_watcher();
    let controller = ControllerClient::new(
        Arc::new(store.clone()),
        watcher,
        &config("controller-1"),
        Arc::new(FailingReconciler),
    );

    let err = controller.run(CancellationToken::new()).await.unwrap_err();
    assert!(format!("{err:#}").contains("planner unavailable"));
    assert_eq!(controller.state(), ControllerState::Failed);
    assert_eq!(store.leader(), None);
    assert_eq!(store.resign_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_lease_loss_preempts_reconciliation() {
    let store = seeded_store();
    let (_tx, watcher) = channel_watcher();
    let reconciler = StalledReconciler::new();
    let controller = Arc::new(ControllerClient::new(
        Arc::new(store.clone()),
        watcher,
        &config("controller-1"),
        reconciler.clone(),
    ));
    let run = spawn_run(&controller, &CancellationToken::new());
    reconciler.entered.notified().await;

    let before = Instant::now();
    assert!(store.expire_leader());
    let outcome = run.await.unwrap().unwrap();

    assert_eq!(outcome, RunOutcome::LeadershipLost);
    assert!(before.elapsed() < Duration::from_secs(1));
    assert_eq!(controller.state(), ControllerState::LeadershipLost);
    assert_eq!(store.resign_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_preempts_reconciliation() {
    let store = seeded_store();
    let (_tx, watcher) = channel_watcher();
    let reconciler = StalledReconciler::new();
    let controller = Arc::new(ControllerClient::new(
        Arc::new(store.clone()),
        watcher,
        &config("controller-1"),
        reconciler.clone(),
    ));
    let shutdown = CancellationToken::new();
    let run = spawn_run(&controller, &shutdown);
    reconciler.entered.notified().await;

    let before = Instant::now();
    shutdown.cancel();
    let outcome = run.await.unwrap().unwrap();

    assert_eq!(outcome, RunOutcome::Resigned);
    assert!(before.elapsed() < Duration::from_secs(1));
    assert_eq!(store.resign_count(), 1);
    assert_eq!(store.leader(), None);
}

#[tokio::test]
async fn test_watcher_closure_stops_leader() {
    let store = seeded_store();
    let (tx, watcher) = channel_watcher();
    let reconciler = RecordingReconciler::new();
    let controller = Arc::new(ControllerClient::new(
        Arc::new(store.clone()),
        watcher,
        &config("controller-1"),
        reconciler.clone(),
    ));
    let run = spawn_run(&controller, &CancellationToken::new());
    reconciler.wait_for_calls(1).await;

    drop(tx);
    assert_eq!(run.await.unwrap().unwrap(), RunOutcome::Resigned);
    assert_eq!(store.resign_count(), 1);
}

#[tokio::test]
async fn test_observer_drives_controller() {
    let store = seeded_store();
    let observer = ObserverClient::start(Arc::new(store.clone()), &config("controller-1"))
        .await
        .unwrap();
    let reconciler = RecordingReconciler::new();
    let controller = Arc::new(ControllerClient::new(
        Arc::new(store.clone()),
        observer.session().into_member_watcher(),
        &config("controller-1"),
        reconciler.clone(),
    ));
    let shutdown = CancellationToken::new();
    let run = spawn_run(&controller, &shutdown);
    reconciler.wait_for_calls(1).await;

    store.put_member(NS, &MemberInfo::new("m2", "addr02:2000")).unwrap();
    reconciler.wait_for_calls(2).await;
    assert!(reconciler.last().await.member(&MemberId::from("m2")).is_some());

    // Closing the observer closes the watcher, which stops the controller
    observer.close().await;
    assert_eq!(run.await.unwrap().unwrap(), RunOutcome::Resigned);
}
