use std::collections::HashMap;
use std::sync::RwLock;

use prometheus::core::Collector;
use prometheus::{Gauge, Opts};
use tracing::warn;

use crate::collector::{CollectorPlugin, PluginError};
use crate::metrics::sanitize;
use crate::store::DataStore;

const DEFAULT_PREFIX: &str = "db_status_";

/// Samples named rows of the data store's status table (MySQL `SHOW STATUS`
/// and similar) into one gauge per variable.
pub struct StatusVariables {
    names: Vec<String>,
    prefix: String,
    gauges: RwLock<Vec<(String, Gauge)>>,
    labels: RwLock<Option<HashMap<String, String>>>,
}

impl StatusVariables {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StatusVariables {
            names: names.into_iter().map(Into::into).collect(),
            prefix: DEFAULT_PREFIX.to_owned(),
            gauges: RwLock::new(Vec::new()),
            labels: RwLock::new(None),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.read_gauges()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, gauge)| gauge.get())
    }

    fn read_gauges(&self) -> std::sync::RwLockReadGuard<'_, Vec<(String, Gauge)>> {
        self.gauges.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CollectorPlugin for StatusVariables {
    fn name(&self) -> &str {
        "status_variables"
    }

    /// Keeps the current gauges when called again with the same labels, so a
    /// repeated activation does not orphan the registered instruments.
    fn initialize(&self, labels: &HashMap<String, String>) -> Result<(), prometheus::Error> {
        let mut current = self.labels.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.as_ref() == Some(labels) {
            return Ok(());
        }

        let gauges = self
            .names
            .iter()
            .map(|name| {
                let opts = Opts::new(
                    format!("{}{}", self.prefix, sanitize(name)),
                    format!("Value of the {} status variable.", name),
                )
                .const_labels(labels.clone());
                Gauge::with_opts(opts).map(|gauge| (name.clone(), gauge))
            })
            .collect::<Result<Vec<_>, _>>()?;

        *self.gauges.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = gauges;
        *current = Some(labels.clone());
        Ok(())
    }

    fn sample(&self, store: &dyn DataStore) -> Result<(), PluginError> {
        let rows = store.status_variables()?;
        let gauges = self.read_gauges();
        let mut failed = Vec::new();

        for (name, value) in rows {
            let Some((_, gauge)) = gauges.iter().find(|(n, _)| *n == name) else {
                continue;
            };

            match value.trim().parse::<f64>() {
                Ok(v) => gauge.set(v),
                Err(err) => {
                    warn!(variable = %name, value = %value, error = %err, "status value is not numeric");
                    failed.push(name);
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(PluginError::Partial { failed })
        }
    }

    fn collectibles(&self) -> Vec<Box<dyn Collector>> {
        self.read_gauges()
            .iter()
            .map(|(_, gauge)| Box::new(gauge.clone()) as Box<dyn Collector>)
            .collect()
    }
}
