//! Samples a data-store connection pool's counters on a fixed interval and
//! exposes them as Prometheus gauges, both on a `/metrics` endpoint and by
//! pushing to a push gateway.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use dbstats_exporter::{Config, DataStore, Exporter, ProcessRegistry};
//! # async fn run(store: Arc<dyn DataStore>) -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ProcessRegistry::new()?;
//! let exporter = Exporter::new(Config::default().db_label("orders").expose_http(9100), registry);
//! exporter.activate(store)?;
//! # Ok(())
//! # }
//! ```

pub mod collector;
pub mod config;
pub mod exporter;
pub mod log_filter;
pub mod metrics;
pub mod plugins;
pub mod push;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod store;

pub use collector::{CollectorPlugin, PluginError, RefreshOutcome};
pub use config::{Config, ConflictPolicy};
pub use exporter::{Activation, Exporter, ExporterError};
pub use metrics::{MetricSet, PoolCounter};
pub use push::PushConfig;
pub use registry::ProcessRegistry;
pub use store::{DataStore, PoolStats, StoreError};

const SAMPLE_FAILURES: &str = "dbstats_exporter_sample_failures_total";
const SAMPLE_SUCCESSES: &str = "dbstats_exporter_sample_successes_total";
const PUSH_FAILURES: &str = "dbstats_exporter_push_failures_total";
const PUSH_SUCCESSES: &str = "dbstats_exporter_push_successes_total";
