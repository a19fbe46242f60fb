//! Etcd Operations
//!
//! Coordination store backed by etcd: connection with retry, prefix reads and
//! watches, lease-backed election sessions, and record writers.

use super::{CoordinationStore, ElectionSession, EventStream, PrefixRead, StoreError};
use crate::config::CoordinatorConfig;
use crate::observability::events;
use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{
    Client, EventType, GetOptions, LeaderKey, LeaseKeepAliveStream, LeaseKeeper, ResignOptions,
    WatchOptions, WatchResponse,
};
use futures::StreamExt;
use shardline_core::{codec, keys, KeyValue, MemberInfo, ShardInfo, WatchEvent};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Coordination store on an etcd cluster
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    config: CoordinatorConfig,
}

impl EtcdStore {
    /// Connect to etcd, retrying with exponential backoff until
    /// `etcd_backoff_max_elapsed` runs out.
    pub async fn connect(config: CoordinatorConfig) -> Result<Self> {
        let backoff = ExponentialBackoff {
            initial_interval: config.etcd_backoff_initial,
            max_interval: config.etcd_backoff_max,
            max_elapsed_time: Some(config.etcd_backoff_max_elapsed),
            multiplier: config.etcd_backoff_multiplier,
            ..Default::default()
        };

        let endpoints = config.etcd_endpoints.as_slice();
        let namespace = config.namespace.as_str();
        let attempts = AtomicU32::new(0);
        let client = retry(backoff, || {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            async move {
                Client::connect(endpoints, None).await.map_err(|e| {
                    warn!(
                        namespace = %namespace,
                        endpoints = ?endpoints,
                        attempt = attempt,
                        error = %e,
                        "etcd connection failed, retrying"
                    );
                    backoff::Error::transient(e)
                })
            }
        })
        .await
        .with_context(|| {
            format!(
                "Failed to connect to etcd at {endpoints:?} after {} attempts",
                attempts.load(Ordering::Relaxed)
            )
        })?;

        debug!(
            namespace = %config.namespace,
            attempts = attempts.load(Ordering::Relaxed),
            "Connected to etcd"
        );
        Ok(Self { client, config })
    }

    /// Wrap an already connected client
    pub fn from_client(client: Client, config: CoordinatorConfig) -> Self {
        Self { client, config }
    }

    /// Write a member record.
    pub async fn put_member(&self, ns: &str, info: &MemberInfo) -> Result<(), StoreError> {
        let value = codec::encode_member(info)?;
        self.put(keys::member_key(ns, &info.id), value).await
    }

    /// Write a shard record.
    pub async fn put_shard(&self, ns: &str, info: &ShardInfo) -> Result<(), StoreError> {
        let value = codec::encode_shard(info)?;
        self.put(keys::shard_key(ns, info.id), value).await
    }

    /// Write the shard count. Only growth has an effect on observers.
    pub async fn set_num_shards(&self, ns: &str, num_shards: u32) -> Result<(), StoreError> {
        self.put(keys::num_shards_key(ns), num_shards.to_string().into_bytes())
            .await
    }

    async fn put(&self, key: String, value: Vec<u8>) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.put(key, value, None).await?;
        Ok(())
    }
}

fn invalid_key(key: &[u8]) -> StoreError {
    StoreError::InvalidKey(String::from_utf8_lossy(key).into_owned())
}

fn event_from_parts(kind: EventType, key: &[u8], value: &[u8]) -> Result<WatchEvent, StoreError> {
    let key = std::str::from_utf8(key).map_err(|_| invalid_key(key))?;
    Ok(match kind {
        EventType::Put => WatchEvent::put(key, value),
        EventType::Delete => WatchEvent::delete(key),
    })
}

/// Decoded header flags and events of one watch response
#[derive(Debug, Default)]
struct WatchFrame {
    compact_revision: i64,
    canceled: bool,
    cancel_reason: String,
    events: Vec<WatchEvent>,
}

impl WatchFrame {
    fn from_response(resp: &WatchResponse) -> Result<Self, StoreError> {
        let mut events = Vec::with_capacity(resp.events().len());
        for event in resp.events() {
            if let Some(kv) = event.kv() {
                events.push(event_from_parts(event.event_type(), kv.key(), kv.value())?);
            }
        }

        Ok(Self {
            compact_revision: resp.compact_revision(),
            canceled: resp.canceled(),
            cancel_reason: resp.cancel_reason().to_string(),
            events,
        })
    }

    /// Batch to hand to the consumer; `None` for responses without events
    /// (creation acks, progress notifications).
    fn into_batch(self) -> Result<Option<Vec<WatchEvent>>, StoreError> {
        if self.compact_revision > 0 {
            return Err(StoreError::Compacted(self.compact_revision));
        }
        if self.canceled {
            return Err(StoreError::WatchCanceled(self.cancel_reason));
        }
        if self.events.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.events))
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get_prefix(&self, prefix: &str) -> Result<PrefixRead, StoreError> {
        let mut client = self.client.clone();
        let options = GetOptions::new().with_prefix().with_serializable();
        let resp = client.get(prefix, Some(options)).await?;

        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        let mut kvs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv.key_str().map_err(|_| invalid_key(kv.key()))?;
            kvs.push(KeyValue::new(key, kv.value()));
        }

        trace!(prefix = %prefix, revision = revision, count = kvs.len(), "Prefix read");
        Ok(PrefixRead { kvs, revision })
    }

    async fn watch_prefix(&self, prefix: &str, from_revision: i64) -> Result<EventStream, StoreError> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(from_revision);
        let (watcher, stream) = client.watch(prefix, Some(options)).await?;
        debug!(prefix = %prefix, from_revision = from_revision, "Watch stream established");

        // The watcher is carried along so the watch lives as long as the stream
        let events = futures::stream::unfold(Some((watcher, stream)), |state| async move {
            let (watcher, mut stream) = state?;
            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => return None,
                    Err(e) => return Some((Err(e.into()), None)),
                };

                match WatchFrame::from_response(&resp).and_then(WatchFrame::into_batch) {
                    Ok(Some(batch)) => return Some((Ok(batch), Some((watcher, stream)))),
                    Ok(None) => continue,
                    Err(e) => return Some((Err(e), None)),
                }
            }
        });

        Ok(events.boxed())
    }

    async fn open_session(&self) -> Result<Box<dyn ElectionSession>, StoreError> {
        let mut client = self.client.clone();
        let lease = client.lease_grant(self.config.lease_ttl, None).await?;
        let lease_id = lease.id();
        debug!(lease_id = lease_id, ttl = self.config.lease_ttl, "Lease granted");

        let (keeper, stream) = client.lease_keep_alive(lease_id).await?;
        let lost = CancellationToken::new();
        let keepalive = spawn_keepalive_task(
            keeper,
            stream,
            lease_id,
            self.config.keepalive_interval,
            lost.clone(),
        );

        Ok(Box::new(EtcdElectionSession {
            client,
            lease_id,
            leader: None,
            lost,
            keepalive,
        }))
    }
}

/// Renew the session lease every `keepalive_interval` until renewal fails,
/// then report why and cancel `lost`. The lease expires server side after that.
fn spawn_keepalive_task(
    mut keeper: LeaseKeeper,
    mut responses: LeaseKeepAliveStream,
    lease_id: i64,
    keepalive_interval: Duration,
    lost: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(keepalive_interval);
        interval.tick().await;

        let reason = loop {
            interval.tick().await;

            if let Err(e) = keeper.keep_alive().await {
                break format!("keep-alive send failed: {e}");
            }
            match responses.message().await {
                Ok(Some(resp)) if resp.ttl() > 0 => {
                    trace!(lease_id = lease_id, ttl = resp.ttl(), "Lease renewed");
                }
                Ok(Some(_)) => break "lease expired before renewal".to_string(),
                Ok(None) => break "keep-alive stream closed".to_string(),
                Err(e) => break format!("keep-alive failed: {e}"),
            }
        };

        events::lease_lost(lease_id, &reason);
        lost.cancel();
    })
}

struct EtcdElectionSession {
    client: Client,
    lease_id: i64,
    leader: Option<LeaderKey>,
    lost: CancellationToken,
    keepalive: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl ElectionSession for EtcdElectionSession {
    async fn campaign(&mut self, election: &str, value: &str) -> Result<(), StoreError> {
        let resp = self.client.campaign(election, value, self.lease_id).await?;
        self.leader = resp.leader().cloned();
        debug!(election = %election, lease_id = self.lease_id, "Campaign won");
        Ok(())
    }

    async fn resign(&mut self) -> Result<(), StoreError> {
        self.keepalive.abort();

        if let Some(leader) = self.leader.take() {
            self.client
                .resign(Some(ResignOptions::new().with_leader(leader)))
                .await?;
        }
        self.client.lease_revoke(self.lease_id).await?;
        debug!(lease_id = self.lease_id, "Resigned and lease revoked");
        Ok(())
    }

    fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }
}

impl Drop for EtcdElectionSession {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}
