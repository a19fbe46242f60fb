//! Shardline Coordinator
//!
//! Namespace observer and leader-elected reconciliation controller on top of
//! a strongly-consistent coordination store (etcd, or in memory for tests).
//!
//! Embedding processes install logging and metrics once, then start an
//! observer and hand its member watcher to a controller:
//!
//! ```no_run
//! use shardline_coordinator::observability::{init_metrics, init_tracing, TracingConfig};
//! use shardline_coordinator::{
//!     ControllerClient, CoordinatorConfig, EtcdStore, LoggingReconciler, ObserverClient,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn embed() -> anyhow::Result<()> {
//! init_tracing(TracingConfig::from_env()).map_err(|e| anyhow::anyhow!("{e}"))?;
//! let metrics = init_metrics().map_err(|e| anyhow::anyhow!("{e}"))?;
//!
//! let config = CoordinatorConfig::from_env();
//! let store = Arc::new(EtcdStore::connect(config.clone()).await?);
//!
//! let observer = ObserverClient::start(store.clone(), &config).await?;
//! let controller = ControllerClient::new(
//!     store,
//!     observer.session().into_member_watcher(),
//!     &config,
//!     Arc::new(LoggingReconciler::new(config.namespace.clone())),
//! );
//!
//! let outcome = controller.run(CancellationToken::new()).await?;
//! tracing::info!(?outcome, metrics = %metrics.render(), "Controller stopped");
//! observer.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod observability;
pub mod observer;
pub mod store;

pub use config::CoordinatorConfig;
pub use controller::{
    ControllerClient, ControllerState, LoggingReconciler, MemberWatcher, Reconciler, RunOutcome,
};
pub use observer::{MembershipWatcher, ObserverClient, ObserverSession};
pub use store::{CoordinationStore, ElectionSession, EtcdStore, MemoryStore, StoreError};
