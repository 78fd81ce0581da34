use serde::Deserialize;
use std::time::Duration;
use std::{collections::HashMap, fs::File, io::BufReader, io::Read, path::Path, sync::Arc};
use thiserror::Error;

use crate::collector::CollectorPlugin;
use crate::plugins::StatusVariables;
use crate::push::PushConfig;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_HTTP_PORT: u16 = 9100;

/// What `activate` does when an instrument name is already registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Fail the activation with a registration conflict.
    #[default]
    Fail,
    /// Log the conflict and carry on.
    Ignore,
}

#[derive(Clone)]
pub struct Config {
    pub db_label: Option<String>,
    pub labels: HashMap<String, String>,
    pub refresh_interval: Duration,
    pub push: Option<PushConfig>,
    pub expose_http: bool,
    /// `Some(0)` binds an ephemeral port.
    pub http_port: Option<u16>,
    pub conflict_policy: ConflictPolicy,
    pub plugins: Vec<Arc<dyn CollectorPlugin>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_label: None,
            labels: HashMap::new(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            push: None,
            expose_http: false,
            http_port: None,
            conflict_policy: ConflictPolicy::Fail,
            plugins: Vec::new(),
        }
    }
}

impl Config {
    pub fn db_label(mut self, label: impl Into<String>) -> Self {
        self.db_label = Some(label.into());
        self
    }

    pub fn label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn push(mut self, push: PushConfig) -> Self {
        self.push = Some(push);
        self
    }

    pub fn expose_http(mut self, port: u16) -> Self {
        self.expose_http = true;
        self.http_port = Some(port);
        self
    }

    pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn plugin(mut self, plugin: Arc<dyn CollectorPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Fills in unset or zero values. Called once when the exporter is built.
    pub(crate) fn with_defaults(mut self) -> Self {
        if self.refresh_interval.is_zero() {
            self.refresh_interval = DEFAULT_REFRESH_INTERVAL;
        }
        if self.http_port.is_none() {
            self.http_port = Some(DEFAULT_HTTP_PORT);
        }
        self
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let plugins: Vec<&str> = self.plugins.iter().map(|p| p.name()).collect();
        f.debug_struct("Config")
            .field("db_label", &self.db_label)
            .field("labels", &self.labels)
            .field("refresh_interval", &self.refresh_interval)
            .field("push", &self.push)
            .field("expose_http", &self.expose_http)
            .field("http_port", &self.http_port)
            .field("conflict_policy", &self.conflict_policy)
            .field("plugins", &plugins)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_label: Option<String>,
    #[serde(default)]
    labels: HashMap<String, String>,
    /// Seconds.
    #[serde(default)]
    refresh_interval: u64,
    #[serde(default)]
    expose_http: bool,
    http_port: Option<u16>,
    push: Option<PushConfig>,
    #[serde(default)]
    conflict_policy: ConflictPolicy,
    #[serde(default)]
    status_variables: Vec<String>,
}

pub fn parse(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let file = File::open(path)?;
    from_reader(BufReader::new(file))
}

pub fn from_reader(reader: impl Read) -> Result<Config, ConfigError> {
    let file: FileConfig = serde_yaml::from_reader(reader)?;

    let mut plugins: Vec<Arc<dyn CollectorPlugin>> = Vec::new();
    if !file.status_variables.is_empty() {
        plugins.push(Arc::new(StatusVariables::new(file.status_variables)));
    }

    Ok(Config {
        db_label: file.db_label.filter(|label| !label.is_empty()),
        labels: file.labels,
        refresh_interval: Duration::from_secs(file.refresh_interval),
        push: file.push,
        expose_http: file.expose_http,
        http_port: file.http_port,
        conflict_policy: file.conflict_policy,
        plugins,
    })
}
