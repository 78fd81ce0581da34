use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use prometheus::core::Collector;
use thiserror::Error;
use tracing::{error, warn};

use crate::metrics::MetricSet;
use crate::registry::ProcessRegistry;
use crate::store::{DataStore, StoreError};

/// `source` label value for the built-in pool snapshot.
pub const POOL_SOURCE: &str = "pool";

#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to sample {}", failed.join(", "))]
    Partial { failed: Vec<String> },
    #[error("{0}")]
    Other(String),
}

/// An auxiliary sampler that brings its own instruments.
///
/// The exporter calls `initialize` on every activation, registers whatever
/// `collectibles` returns afterwards, and calls `sample` once per refresh
/// tick on a blocking worker thread.
pub trait CollectorPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn initialize(&self, labels: &HashMap<String, String>) -> Result<(), prometheus::Error>;

    fn sample(&self, store: &dyn DataStore) -> Result<(), PluginError>;

    fn collectibles(&self) -> Vec<Box<dyn Collector>>;
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub pool: bool,
    pub failed_plugins: Vec<String>,
}

/// One sampling pass: the pool snapshot first, then every plugin in order.
pub fn refresh(
    store: &dyn DataStore,
    metric_set: &MetricSet,
    plugins: &[Arc<dyn CollectorPlugin>],
    registry: &ProcessRegistry,
) -> RefreshOutcome {
    let counters = registry.self_metrics();
    let mut outcome = RefreshOutcome::default();

    match store.stats() {
        Ok(stats) => {
            metric_set.apply(&stats);
            counters.sample_successes.with_label_values(&[POOL_SOURCE]).inc();
            outcome.pool = true;
        }
        Err(err) => {
            counters.sample_failures.with_label_values(&[POOL_SOURCE]).inc();
            error!(source = POOL_SOURCE, error = %err, "failed to collect db stats");
        }
    }

    for plugin in plugins {
        let name = plugin.name();
        let result = panic::catch_unwind(AssertUnwindSafe(|| plugin.sample(store)));

        match result {
            Ok(Ok(())) => {
                counters.sample_successes.with_label_values(&[name]).inc();
            }
            Ok(Err(err)) => {
                counters.sample_failures.with_label_values(&[name]).inc();
                warn!(source = name, error = %err, "plugin failed to sample");
                outcome.failed_plugins.push(name.to_owned());
            }
            Err(_) => {
                counters.sample_failures.with_label_values(&[name]).inc();
                error!(source = name, "plugin panicked while sampling");
                outcome.failed_plugins.push(name.to_owned());
            }
        }
    }

    outcome
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use prometheus::Gauge;

    use super::*;
    use crate::metrics::PoolCounter;
    use crate::store::testing::{sample_stats, FakeStore};

    /// Plugin with one gauge that counts its own calls.
    pub struct CountingPlugin {
        pub name: &'static str,
        pub calls: AtomicUsize,
        pub fail: bool,
        gauge: Mutex<Option<Gauge>>,
    }

    impl CountingPlugin {
        pub fn new(name: &'static str, fail: bool) -> Self {
            CountingPlugin {
                name,
                calls: AtomicUsize::new(0),
                fail,
                gauge: Mutex::new(None),
            }
        }
    }

    impl CollectorPlugin for CountingPlugin {
        fn name(&self) -> &str {
            self.name
        }

        fn initialize(&self, labels: &HashMap<String, String>) -> Result<(), prometheus::Error> {
            let opts = prometheus::Opts::new(format!("{}_calls", self.name), "calls")
                .const_labels(labels.clone());
            *self.gauge.lock().unwrap() = Some(Gauge::with_opts(opts)?);
            Ok(())
        }

        fn sample(&self, _store: &dyn DataStore) -> Result<(), PluginError> {
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(gauge) = self.gauge.lock().unwrap().as_ref() {
                gauge.set(calls as f64);
            }
            if self.fail {
                return Err(PluginError::Other("boom".into()));
            }
            Ok(())
        }

        fn collectibles(&self) -> Vec<Box<dyn Collector>> {
            self.gauge
                .lock()
                .unwrap()
                .iter()
                .map(|g| Box::new(g.clone()) as Box<dyn Collector>)
                .collect()
        }
    }

    struct PanickingPlugin;

    impl CollectorPlugin for PanickingPlugin {
        fn name(&self) -> &str {
            "panicking"
        }

        fn initialize(&self, _labels: &HashMap<String, String>) -> Result<(), prometheus::Error> {
            Ok(())
        }

        fn sample(&self, _store: &dyn DataStore) -> Result<(), PluginError> {
            panic!("sampler bug")
        }

        fn collectibles(&self) -> Vec<Box<dyn Collector>> {
            Vec::new()
        }
    }

    /// Shared buffer that a scoped fmt subscriber writes into.
    #[derive(Clone, Default)]
    pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }

        pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
            let buffer = self.clone();
            tracing_subscriber::fmt()
                .with_ansi(false)
                .with_writer(move || buffer.clone())
                .finish()
        }
    }

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn metric_set() -> MetricSet {
        MetricSet::build(None, &HashMap::new()).unwrap()
    }

    #[test]
    fn test_refresh_copies_snapshot() {
        let registry = ProcessRegistry::new().unwrap();
        let store = FakeStore::with_stats(sample_stats());
        let set = metric_set();

        let outcome = refresh(&store, &set, &[], &registry);

        assert!(outcome.pool);
        assert_eq!(set.value(PoolCounter::MaxOpenConnections), 10.0);
        assert_eq!(set.value(PoolCounter::WaitCount), 7.0);
        assert_eq!(set.value(PoolCounter::WaitDuration), 500_000_000.0);
    }

    #[test]
    fn test_failed_snapshot_keeps_previous_values_and_logs() {
        let registry = ProcessRegistry::new().unwrap();
        let store = FakeStore::with_stats(sample_stats());
        let set = metric_set();
        refresh(&store, &set, &[], &registry);

        store.set_stats(None);
        let logs = LogBuffer::default();
        let outcome = tracing::subscriber::with_default(logs.subscriber(), || {
            refresh(&store, &set, &[], &registry)
        });

        assert!(!outcome.pool);
        for counter in PoolCounter::ALL {
            let expected = match counter {
                PoolCounter::MaxOpenConnections => 10.0,
                PoolCounter::OpenConnections => 4.0,
                PoolCounter::InUse => 1.0,
                PoolCounter::Idle => 3.0,
                PoolCounter::WaitCount => 7.0,
                PoolCounter::WaitDuration => 500_000_000.0,
                PoolCounter::MaxIdleClosed => 2.0,
                PoolCounter::MaxLifetimeClosed => 0.0,
            };
            assert_eq!(set.value(counter), expected, "{:?}", counter);
        }

        let logs = logs.contents();
        assert!(logs.contains("failed to collect db stats"), "{}", logs);
        assert!(logs.contains("connection unavailable"), "{}", logs);
        assert_eq!(
            registry
                .self_metrics()
                .sample_failures
                .with_label_values(&[POOL_SOURCE])
                .get(),
            1
        );
    }

    #[test]
    fn test_plugins_run_after_failed_snapshot() {
        let registry = ProcessRegistry::new().unwrap();
        let store = FakeStore::default();
        let plugin = Arc::new(CountingPlugin::new("counting", false));
        let plugins: Vec<Arc<dyn CollectorPlugin>> = vec![plugin.clone()];

        let outcome = refresh(&store, &metric_set(), &plugins, &registry);

        assert!(!outcome.pool);
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_plugin_failures_are_isolated() {
        let registry = ProcessRegistry::new().unwrap();
        let store = FakeStore::with_stats(sample_stats());
        let failing = Arc::new(CountingPlugin::new("failing", true));
        let last = Arc::new(CountingPlugin::new("last", false));
        let plugins: Vec<Arc<dyn CollectorPlugin>> =
            vec![failing.clone(), Arc::new(PanickingPlugin), last.clone()];

        let outcome = refresh(&store, &metric_set(), &plugins, &registry);

        assert!(outcome.pool);
        assert_eq!(outcome.failed_plugins, vec!["failing", "panicking"]);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(last.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            registry
                .self_metrics()
                .sample_successes
                .with_label_values(&["last"])
                .get(),
            1
        );
    }
}
