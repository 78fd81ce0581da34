use prometheus::core::Collector;
use prometheus::{Gauge, Opts};
use std::collections::HashMap;

use crate::store::PoolStats;

const NAMESPACE: &str = "dbstats";

/// Const label carrying the configured data-store label.
pub const DB_NAME_LABEL: &str = "db_name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolCounter {
    MaxOpenConnections,
    OpenConnections,
    InUse,
    Idle,
    WaitCount,
    WaitDuration,
    MaxIdleClosed,
    MaxLifetimeClosed,
}

impl PoolCounter {
    pub const ALL: [PoolCounter; 8] = [
        PoolCounter::MaxOpenConnections,
        PoolCounter::OpenConnections,
        PoolCounter::InUse,
        PoolCounter::Idle,
        PoolCounter::WaitCount,
        PoolCounter::WaitDuration,
        PoolCounter::MaxIdleClosed,
        PoolCounter::MaxLifetimeClosed,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            PoolCounter::MaxOpenConnections => "max_open_connections",
            PoolCounter::OpenConnections => "open_connections",
            PoolCounter::InUse => "in_use",
            PoolCounter::Idle => "idle",
            PoolCounter::WaitCount => "wait_count",
            PoolCounter::WaitDuration => "wait_duration",
            PoolCounter::MaxIdleClosed => "max_idle_closed",
            PoolCounter::MaxLifetimeClosed => "max_lifetime_closed",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            PoolCounter::MaxOpenConnections => {
                "Maximum number of open connections to the database."
            }
            PoolCounter::OpenConnections => {
                "The number of established connections both in use and idle."
            }
            PoolCounter::InUse => "The number of connections currently in use.",
            PoolCounter::Idle => "The number of idle connections.",
            PoolCounter::WaitCount => "The total number of connections waited for.",
            PoolCounter::WaitDuration => {
                "The total time blocked waiting for a new connection, in nanoseconds."
            }
            PoolCounter::MaxIdleClosed => {
                "The total number of connections closed due to the max idle limit."
            }
            PoolCounter::MaxLifetimeClosed => {
                "The total number of connections closed due to the max lifetime limit."
            }
        }
    }

    fn read(self, stats: &PoolStats) -> f64 {
        match self {
            PoolCounter::MaxOpenConnections => stats.max_open as f64,
            PoolCounter::OpenConnections => stats.open as f64,
            PoolCounter::InUse => stats.in_use as f64,
            PoolCounter::Idle => stats.idle as f64,
            PoolCounter::WaitCount => stats.wait_count as f64,
            PoolCounter::WaitDuration => stats.wait_duration.as_nanos() as f64,
            PoolCounter::MaxIdleClosed => stats.max_idle_closed as f64,
            PoolCounter::MaxLifetimeClosed => stats.max_lifetime_closed as f64,
        }
    }
}

/// Replaces every character that is not valid in a metric name with `_`.
pub fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Name of a built-in pool gauge, e.g. `dbstats_db1_in_use`.
pub fn metric_name(db_label: Option<&str>, counter: PoolCounter) -> String {
    match db_label {
        Some(label) => format!("{}_{}_{}", NAMESPACE, sanitize(label), counter.suffix()),
        None => format!("{}_{}", NAMESPACE, counter.suffix()),
    }
}

/// Const labels for every instrument of one exporter: the extra labels plus
/// `db_name` when a data-store label is configured.
pub fn const_labels(
    db_label: Option<&str>,
    extra: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut labels = extra.clone();
    if let Some(label) = db_label {
        labels.insert(DB_NAME_LABEL.to_owned(), label.to_owned());
    }
    labels
}

/// The eight pool gauges of one activation, in `PoolCounter::ALL` order.
#[derive(Clone)]
pub struct MetricSet {
    gauges: Vec<(PoolCounter, Gauge)>,
}

impl MetricSet {
    pub fn build(
        db_label: Option<&str>,
        labels: &HashMap<String, String>,
    ) -> Result<MetricSet, prometheus::Error> {
        let gauges = PoolCounter::ALL
            .iter()
            .map(|&counter| {
                let opts = Opts::new(metric_name(db_label, counter), counter.help())
                    .const_labels(labels.clone());
                Gauge::with_opts(opts).map(|gauge| (counter, gauge))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MetricSet { gauges })
    }

    pub fn gauges(&self) -> &[(PoolCounter, Gauge)] {
        &self.gauges
    }

    pub fn value(&self, counter: PoolCounter) -> f64 {
        self.gauges
            .iter()
            .find(|(c, _)| *c == counter)
            .map(|(_, gauge)| gauge.get())
            .unwrap_or_default()
    }

    /// Writes a full snapshot. Callers only get here with a complete
    /// snapshot in hand, so a failed read never leaves a partial write.
    pub fn apply(&self, stats: &PoolStats) {
        for (counter, gauge) in &self.gauges {
            gauge.set(counter.read(stats));
        }
    }

    pub fn collectibles(&self) -> Vec<Box<dyn Collector>> {
        self.gauges
            .iter()
            .map(|(_, gauge)| Box::new(gauge.clone()) as Box<dyn Collector>)
            .collect()
    }
}
