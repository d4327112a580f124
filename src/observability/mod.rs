//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! registry / reload coordinator / node pools produce:
//!     → tracing events (structured fields: identity, generation, endpoint)
//!     → metrics.rs (counters and gauges through the `metrics` facade)
//!
//! Consumers:
//!     → logging.rs subscriber (stdout, env-filtered)
//!     → Prometheus exporter, when the binary enables it
//! ```

pub mod logging;
pub mod metrics;
