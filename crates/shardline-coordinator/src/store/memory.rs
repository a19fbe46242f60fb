//! In-Memory Coordination Store
//!
//! Revisioned key-value map with prefix watches and a single-holder election,
//! plus fault injection for exercising recovery paths.

use super::{CoordinationStore, ElectionSession, EventStream, PrefixRead, StoreError};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use shardline_core::{codec, keys, KeyValue, MemberInfo, ShardInfo, WatchEvent};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type WatchItem = Result<Vec<WatchEvent>, StoreError>;

struct Subscriber {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchItem>,
}

struct Leader {
    session: u64,
    value: String,
    lost: CancellationToken,
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct Inner {
    revision: i64,
    data: BTreeMap<String, Vec<u8>>,
    history: Vec<(i64, WatchEvent)>,
    subscribers: Vec<Subscriber>,
    failing_reads: usize,
    read_attempts: Vec<Instant>,
    leader: Option<Leader>,
    next_session: u64,
    resign_delay: Option<Duration>,
    resigns: usize,
}

impl Inner {
    /// Commit one batch at a new revision and fan it out to live watches.
    fn commit(&mut self, events: Vec<WatchEvent>) -> i64 {
        self.revision += 1;
        let revision = self.revision;

        for event in &events {
            match event.kind {
                shardline_core::EventKind::Put => {
                    self.data.insert(event.key.clone(), event.value.clone());
                }
                shardline_core::EventKind::Delete => {
                    self.data.remove(&event.key);
                }
            }
            self.history.push((revision, event.clone()));
        }

        self.subscribers.retain(|sub| {
            let batch: Vec<WatchEvent> = events
                .iter()
                .filter(|e| e.key.starts_with(&sub.prefix))
                .cloned()
                .collect();
            batch.is_empty() || sub.tx.send(Ok(batch)).is_ok()
        });

        revision
    }
}

/// In-process coordination store
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    leadership: Arc<Semaphore>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            leadership: Arc::new(Semaphore::new(1)),
        }
    }

    /// Put a single key. Returns the new store revision.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> i64 {
        self.inner.lock().commit(vec![WatchEvent::put(key, value)])
    }

    /// Put several keys atomically; watchers receive them as one batch.
    pub fn put_all(&self, kvs: Vec<KeyValue>) -> i64 {
        let events = kvs.into_iter().map(WatchEvent::from).collect();
        self.inner.lock().commit(events)
    }

    pub fn delete(&self, key: impl Into<String>) -> i64 {
        self.inner.lock().commit(vec![WatchEvent::delete(key)])
    }

    pub fn put_member(&self, ns: &str, info: &MemberInfo) -> Result<i64, StoreError> {
        let value = codec::encode_member(info)?;
        Ok(self.put(keys::member_key(ns, &info.id), value))
    }

    pub fn put_shard(&self, ns: &str, info: &ShardInfo) -> Result<i64, StoreError> {
        let value = codec::encode_shard(info)?;
        Ok(self.put(keys::shard_key(ns, info.id), value))
    }

    pub fn set_num_shards(&self, ns: &str, num_shards: u32) -> i64 {
        self.put(keys::num_shards_key(ns), num_shards.to_string())
    }

    pub fn revision(&self) -> i64 {
        self.inner.lock().revision
    }

    /// Make the next `n` prefix reads fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.inner.lock().failing_reads = n;
    }

    /// Times at which prefix reads were attempted, failed ones included.
    pub fn read_attempts(&self) -> Vec<Instant> {
        self.inner.lock().read_attempts.clone()
    }

    /// Terminate every live watch with an error.
    pub fn break_watches(&self, reason: &str) {
        let subscribers = std::mem::take(&mut self.inner.lock().subscribers);
        debug!(count = subscribers.len(), reason = %reason, "Breaking watches");
        for sub in subscribers {
            let _ = sub.tx.send(Err(StoreError::Injected(reason.to_string())));
        }
    }

    pub fn watch_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|sub| !sub.tx.is_closed());
        inner.subscribers.len()
    }

    /// Value the current leader campaigned with.
    pub fn leader(&self) -> Option<String> {
        self.inner.lock().leader.as_ref().map(|l| l.value.clone())
    }

    /// Expire the current leader's lease, as if its keep-alives stopped.
    pub fn expire_leader(&self) -> bool {
        match self.inner.lock().leader.take() {
            Some(leader) => {
                leader.lost.cancel();
                true
            }
            None => false,
        }
    }

    /// Delay every resign call by `delay`.
    pub fn set_resign_delay(&self, delay: Duration) {
        self.inner.lock().resign_delay = Some(delay);
    }

    pub fn resign_count(&self) -> usize {
        self.inner.lock().resigns
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get_prefix(&self, prefix: &str) -> Result<PrefixRead, StoreError> {
        let mut inner = self.inner.lock();
        inner.read_attempts.push(Instant::now());
        if inner.failing_reads > 0 {
            inner.failing_reads -= 1;
            return Err(StoreError::Injected("read failure".to_string()));
        }

        let kvs = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
            .collect();

        Ok(PrefixRead {
            kvs,
            revision: inner.revision,
        })
    }

    async fn watch_prefix(&self, prefix: &str, from_revision: i64) -> Result<EventStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock();
            let replay: Vec<WatchEvent> = inner
                .history
                .iter()
                .filter(|(rev, e)| *rev >= from_revision && e.key.starts_with(prefix))
                .map(|(_, e)| e.clone())
                .collect();
            if !replay.is_empty() {
                let _ = tx.send(Ok(replay));
            }
            inner.subscribers.push(Subscriber {
                prefix: prefix.to_string(),
                tx,
            });
        }

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn open_session(&self) -> Result<Box<dyn ElectionSession>, StoreError> {
        let id = {
            let mut inner = self.inner.lock();
            inner.next_session += 1;
            inner.next_session
        };
        Ok(Box::new(MemorySession {
            store: self.clone(),
            id,
            lost: CancellationToken::new(),
        }))
    }
}

struct MemorySession {
    store: MemoryStore,
    id: u64,
    lost: CancellationToken,
}

#[async_trait]
impl ElectionSession for MemorySession {
    async fn campaign(&mut self, election: &str, value: &str) -> Result<(), StoreError> {
        let permit = Arc::clone(&self.store.leadership)
            .acquire_owned()
            .await
            .map_err(|_| StoreError::SessionClosed)?;

        if self.lost.is_cancelled() {
            return Err(StoreError::SessionClosed);
        }

        debug!(election = %election, session = self.id, "Campaign won");
        self.store.inner.lock().leader = Some(Leader {
            session: self.id,
            value: value.to_string(),
            lost: self.lost.clone(),
            _permit: permit,
        });
        Ok(())
    }

    async fn resign(&mut self) -> Result<(), StoreError> {
        let delay = self.store.inner.lock().resign_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.store.inner.lock();
        inner.resigns += 1;
        if inner.leader.as_ref().is_some_and(|l| l.session == self.id) {
            inner.leader = None;
        }
        Ok(())
    }

    fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        // Lease goes away with the session
        let mut inner = self.store.inner.lock();
        if inner.leader.as_ref().is_some_and(|l| l.session == self.id) {
            inner.leader = None;
        }
    }
}
