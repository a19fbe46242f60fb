//! Observability Module
//!
//! - `events`: Structured event logging with consistent fields
//! - `metrics`: Prometheus metrics for the observer and the controller
//! - `tracing`: tracing-subscriber setup for embedding processes

pub mod events;
pub mod metrics;
pub mod tracing;

pub use self::metrics::{init_metrics, MetricsState};
pub use self::tracing::{init_tracing, TracingConfig};
