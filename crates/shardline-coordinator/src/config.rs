//! Coordinator Configuration
//!
//! Centralized settings for the observer, the controller and the etcd
//! adapter, with environment variable overrides.

use std::time::Duration;

/// Coordinator configuration with sensible defaults
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Namespace scoping this cluster's keys (env: SHARDLINE_NAMESPACE)
    pub namespace: String,

    /// Etcd endpoints (env: ETCD_ENDPOINTS, comma-separated)
    pub etcd_endpoints: Vec<String>,

    /// Identity of this process, used as the election value (env: MEMBER_ID)
    pub member_id: String,

    // Observer settings
    /// Fixed delay between a watch failure and the next full read
    pub retry_backoff: Duration,

    // Controller settings
    /// Upper bound on the resign call during graceful shutdown
    pub resign_timeout: Duration,

    /// TTL of the election session lease (seconds)
    pub lease_ttl: i64,

    /// Interval for lease keep-alive (1/3 of TTL recommended)
    pub keepalive_interval: Duration,

    // Etcd backoff settings
    /// Initial interval for etcd connection retry
    pub etcd_backoff_initial: Duration,

    /// Maximum interval for etcd connection retry
    pub etcd_backoff_max: Duration,

    /// Maximum elapsed time for etcd connection retries
    pub etcd_backoff_max_elapsed: Duration,

    /// Multiplier for etcd backoff
    pub etcd_backoff_multiplier: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            member_id: format!("shardline-{}", uuid::Uuid::new_v4()),

            retry_backoff: Duration::from_secs(10),

            resign_timeout: Duration::from_secs(30),
            lease_ttl: 60,
            keepalive_interval: Duration::from_secs(20),

            etcd_backoff_initial: Duration::from_secs(1),
            etcd_backoff_max: Duration::from_secs(10),
            etcd_backoff_max_elapsed: Duration::from_secs(60),
            etcd_backoff_multiplier: 2.0,
        }
    }
}

impl CoordinatorConfig {
    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(namespace) = std::env::var("SHARDLINE_NAMESPACE") {
            config.namespace = namespace;
        }

        if let Ok(endpoints) = std::env::var("ETCD_ENDPOINTS") {
            config.etcd_endpoints = endpoints.split(',').map(String::from).collect();
        }

        if let Ok(member_id) = std::env::var("MEMBER_ID") {
            config.member_id = member_id;
        }

        config
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_member_id(mut self, member_id: impl Into<String>) -> Self {
        self.member_id = member_id.into();
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_resign_timeout(mut self, timeout: Duration) -> Self {
        self.resign_timeout = timeout;
        self
    }
}
