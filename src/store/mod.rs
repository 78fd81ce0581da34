use std::time::Duration;

use thiserror::Error;

/// Point-in-time counters of a connection pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub max_open: u64,
    pub open: u64,
    pub in_use: u64,
    pub idle: u64,
    pub wait_count: u64,
    pub wait_duration: Duration,
    pub max_idle_closed: u64,
    pub max_lifetime_closed: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection unavailable: {0}")]
    ConnectionUnavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("{0} is not supported by this data store")]
    Unsupported(&'static str),
}

/// Read-only view of a data store that the exporter samples.
///
/// Both calls run on a blocking worker thread, so implementations may block
/// on I/O.
pub trait DataStore: Send + Sync {
    fn stats(&self) -> Result<PoolStats, StoreError>;

    /// Vendor status rows as `(name, value)` pairs, e.g. the output of
    /// `SHOW STATUS` on MySQL.
    fn status_variables(&self) -> Result<Vec<(String, String)>, StoreError> {
        Err(StoreError::Unsupported("status variables"))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Store whose answers can be swapped between ticks.
    #[derive(Default)]
    pub struct FakeStore {
        stats: Mutex<Option<PoolStats>>,
        rows: Mutex<Vec<(String, String)>>,
    }

    impl FakeStore {
        pub fn with_stats(stats: PoolStats) -> Self {
            let store = FakeStore::default();
            store.set_stats(Some(stats));
            store
        }

        pub fn set_stats(&self, stats: Option<PoolStats>) {
            *self.stats.lock().unwrap() = stats;
        }

        pub fn set_rows(&self, rows: &[(&str, &str)]) {
            *self.rows.lock().unwrap() = rows
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        }
    }

    impl DataStore for FakeStore {
        fn stats(&self) -> Result<PoolStats, StoreError> {
            self.stats
                .lock()
                .unwrap()
                .ok_or_else(|| StoreError::ConnectionUnavailable("pool is closed".into()))
        }

        fn status_variables(&self) -> Result<Vec<(String, String)>, StoreError> {
            Ok(self.rows.lock().unwrap().clone())
        }
    }

    pub fn sample_stats() -> PoolStats {
        PoolStats {
            max_open: 10,
            open: 4,
            in_use: 1,
            idle: 3,
            wait_count: 7,
            wait_duration: Duration::from_nanos(500_000_000),
            max_idle_closed: 2,
            max_lifetime_closed: 0,
        }
    }
}
