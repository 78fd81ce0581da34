use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use prometheus::core::Collector;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::collector::{self, RefreshOutcome};
use crate::config::{Config, ConflictPolicy, DEFAULT_HTTP_PORT};
use crate::metrics::{self, MetricSet};
use crate::push::{self, Pusher};
use crate::registry::{ProcessRegistry, RegisterError, StartGuard, StartState};
use crate::scheduler;
use crate::server::{self, ServerStart};
use crate::store::DataStore;

pub const NAME: &str = "dbstats:prometheus";

const DEFAULT_JOB: &str = "dbstats";

#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("activate must be called from within a tokio runtime")]
    NoRuntime,
    #[error("invalid instrument: {0}")]
    InvalidInstrument(#[source] prometheus::Error),
    #[error("registration conflict: an instrument named {name:?} is already registered")]
    RegistrationConflict { name: String },
    #[error("failed to register instrument: {0}")]
    Registry(#[source] prometheus::Error),
}

/// Which background loops a call to [`Exporter::activate`] started.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    pub scheduler: bool,
    /// `None` when HTTP exposition is disabled.
    pub http: Option<ServerStart>,
    pub push: bool,
}

struct Shared {
    config: Config,
    labels: HashMap<String, String>,
    registry: Arc<ProcessRegistry>,
    store: RwLock<Option<Arc<dyn DataStore>>>,
    metric_set: RwLock<Option<MetricSet>>,
    scheduler: StartGuard,
    push: StartGuard,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn refresh(&self) -> Option<RefreshOutcome> {
        let store = read(&self.store).clone()?;
        let metric_set = read(&self.metric_set).clone()?;

        Some(collector::refresh(
            store.as_ref(),
            &metric_set,
            &self.config.plugins,
            &self.registry,
        ))
    }

    fn collectibles(&self) -> Vec<Box<dyn Collector>> {
        let mut collectibles = read(&self.metric_set)
            .as_ref()
            .map(MetricSet::collectibles)
            .unwrap_or_default();
        for plugin in &self.config.plugins {
            collectibles.extend(plugin.collectibles());
        }
        collectibles
    }

    /// Registers one group of instruments and appends each registered one to
    /// `applied`. If any of them fails the group is rolled back. Returns
    /// whether the group ended up registered.
    fn register_group(
        &self,
        group: &dyn Fn() -> Vec<Box<dyn Collector>>,
        applied: &mut Vec<Box<dyn Collector>>,
    ) -> Result<bool, ExporterError> {
        let mark = applied.len();
        for (collector, handle) in group().into_iter().zip(group()) {
            let Err(err) = self.registry.register(collector) else {
                applied.push(handle);
                continue;
            };

            for collector in applied.drain(mark..) {
                let _ = self.registry.unregister(collector);
            }

            return match err {
                RegisterError::DuplicateName(name) => match self.config.conflict_policy {
                    ConflictPolicy::Fail => Err(ExporterError::RegistrationConflict { name }),
                    ConflictPolicy::Ignore => {
                        warn!(instrument = %name, "instrument already registered, ignoring");
                        Ok(false)
                    }
                },
                RegisterError::Registry(err) => Err(ExporterError::Registry(err)),
            };
        }

        Ok(true)
    }

    /// Registers the pool group followed by every plugin group. A failure
    /// unregisters everything this call registered. Returns whether the pool
    /// group was registered.
    fn register_all(&self, metric_set: &MetricSet) -> Result<bool, ExporterError> {
        let mut applied = Vec::new();
        let result = self
            .register_group(&|| metric_set.collectibles(), &mut applied)
            .and_then(|pool| {
                for plugin in &self.config.plugins {
                    self.register_group(&|| plugin.collectibles(), &mut applied)?;
                }
                Ok(pool)
            });

        if result.is_err() {
            for collector in applied {
                let _ = self.registry.unregister(collector);
            }
        }
        result
    }
}

/// Samples a data store's pool counters and exposes them by scrape and push.
pub struct Exporter {
    shared: Arc<Shared>,
}

impl Exporter {
    pub fn new(config: Config, registry: Arc<ProcessRegistry>) -> Exporter {
        let config = config.with_defaults();
        let labels = metrics::const_labels(config.db_label.as_deref(), &config.labels);

        Exporter {
            shared: Arc::new(Shared {
                config,
                labels,
                registry,
                store: RwLock::new(None),
                metric_set: RwLock::new(None),
                scheduler: StartGuard::new(),
                push: StartGuard::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        NAME
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.shared.registry
    }

    /// Wires the exporter to `store` and starts the background loops on the
    /// first successful call. Safe to call again, e.g. after a reconnect: the
    /// store is rebound, plugins are initialized and instruments are rebuilt,
    /// but every loop starts at most once. A failed call leaves no instruments
    /// of its own registered, so it can be retried.
    pub fn activate(&self, store: Arc<dyn DataStore>) -> Result<Activation, ExporterError> {
        Handle::try_current().map_err(|_| ExporterError::NoRuntime)?;
        let shared = &self.shared;

        *write(&shared.store) = Some(store);

        let metric_set = MetricSet::build(shared.config.db_label.as_deref(), &shared.labels)
            .map_err(ExporterError::InvalidInstrument)?;
        for plugin in &shared.config.plugins {
            plugin
                .initialize(&shared.labels)
                .map_err(ExporterError::InvalidInstrument)?;
        }

        let registered = shared.register_all(&metric_set)?;
        {
            let mut active = write(&shared.metric_set);
            if registered || active.is_none() {
                *active = Some(metric_set);
            }
        }

        Ok(self.start_loops())
    }

    fn start_loops(&self) -> Activation {
        let shared = &self.shared;
        let config = &shared.config;
        let mut activation = Activation::default();

        if let Some(_ticket) = shared.scheduler.try_begin() {
            let refresher = shared.clone();
            scheduler::every(config.refresh_interval, move || {
                let refresher = refresher.clone();
                async move {
                    let pass = tokio::task::spawn_blocking(move || refresher.refresh());
                    if let Err(err) = pass.await {
                        error!(error = %err, "refresh pass aborted");
                    }
                }
            });
            info!(period = ?config.refresh_interval, "started refresh loop");
            activation.scheduler = true;
        }

        if config.expose_http {
            let port = config.http_port.unwrap_or(DEFAULT_HTTP_PORT);
            activation.http = Some(server::start(&shared.registry, port));
        }

        if let Some(push_config) = &config.push {
            if let Some(_ticket) = shared.push.try_begin() {
                let job = config.db_label.as_deref().unwrap_or(DEFAULT_JOB);
                match Pusher::new(push_config, job) {
                    Ok(pusher) => {
                        let source = shared.clone();
                        push::start(
                            pusher,
                            config.refresh_interval,
                            shared.registry.clone(),
                            move || source.collectibles(),
                        );
                        activation.push = true;
                    }
                    Err(err) => {
                        error!(address = %push_config.address, error = %err, "failed to create pusher");
                    }
                }
            }
        }

        activation
    }

    /// Runs one sampling pass on the calling thread. `None` before the first
    /// activation.
    pub fn refresh_now(&self) -> Option<RefreshOutcome> {
        self.shared.refresh()
    }

    /// The active pool instruments.
    pub fn metric_set(&self) -> Option<MetricSet> {
        read(&self.shared.metric_set).clone()
    }

    /// Everything a push batch carries: the pool instruments plus every
    /// plugin's instruments.
    pub fn collectibles(&self) -> Vec<Box<dyn Collector>> {
        self.shared.collectibles()
    }

    pub fn scheduler_state(&self) -> StartState {
        self.shared.scheduler.state()
    }

    pub fn push_state(&self) -> StartState {
        self.shared.push.state()
    }
}
