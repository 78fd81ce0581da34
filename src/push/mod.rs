use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use prometheus::core::Collector;
use prometheus::{Encoder, TextEncoder};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::registry::ProcessRegistry;
use crate::scheduler;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const NAME: &str = env!("CARGO_PKG_NAME");

const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PushConfig {
    pub address: String,
    #[serde(default)]
    pub job: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl PushConfig {
    pub fn new(address: impl Into<String>) -> Self {
        PushConfig {
            address: address.into(),
            job: None,
            username: None,
            password: None,
        }
    }

    pub fn job(mut self, job: impl Into<String>) -> Self {
        self.job = Some(job.into());
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("invalid push address {0:?}")]
    InvalidAddress(String),
    #[error("failed to encode batch: {0}")]
    Encode(#[from] prometheus::Error),
    #[error("failed to reach push gateway: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("push gateway rejected batch with {status}: {body}")]
    Rejected { status: StatusCode, body: String },
}

/// Client for a push gateway, bound to one job.
pub struct Pusher {
    client: reqwest::Client,
    url: Url,
    username: Option<String>,
    password: Option<String>,
}

impl Pusher {
    /// Builds a pusher for `config`, using `default_job` when no job is set.
    pub fn new(config: &PushConfig, default_job: &str) -> Result<Pusher, PushError> {
        let job = config.job.as_deref().unwrap_or(default_job);
        let url = job_url(&config.address, job)?;
        let client = reqwest::Client::builder().timeout(PUSH_TIMEOUT).build()?;

        Ok(Pusher {
            client,
            url,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Sends one batch, replacing everything previously pushed for the job.
    pub async fn push(&self, collectibles: &[Box<dyn Collector>]) -> Result<(), PushError> {
        let body = encode(collectibles)?;

        let mut req = self
            .client
            .put(self.url.clone())
            .header(USER_AGENT, format!("{}/{}", NAME, VERSION))
            .header(CONTENT_TYPE, TextEncoder::new().format_type())
            .body(body);
        if let Some(username) = &self.username {
            req = req.basic_auth(username, self.password.as_ref());
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(PushError::Rejected { status, body })
    }
}

fn job_url(address: &str, job: &str) -> Result<Url, PushError> {
    let invalid = || PushError::InvalidAddress(address.to_owned());

    let address = if address.contains("://") {
        address.to_owned()
    } else {
        format!("http://{}", address)
    };

    let mut url = Url::parse(&address).map_err(|_| invalid())?;
    url.path_segments_mut()
        .map_err(|_| invalid())?
        .pop_if_empty()
        .extend(["metrics", "job", job]);
    Ok(url)
}

fn encode(collectibles: &[Box<dyn Collector>]) -> Result<Bytes, PushError> {
    let mut families: Vec<_> = collectibles.iter().flat_map(|c| c.collect()).collect();
    families.sort_by(|a, b| a.get_name().cmp(b.get_name()));

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&families, &mut buffer)?;
    Ok(Bytes::from(buffer))
}

/// Pushes whatever `collectibles` returns once per `period`. Failures are
/// logged and counted; the loop keeps going.
pub fn start<F>(
    pusher: Pusher,
    period: Duration,
    registry: Arc<ProcessRegistry>,
    collectibles: F,
) -> JoinHandle<()>
where
    F: Fn() -> Vec<Box<dyn Collector>> + Send + Sync + 'static,
{
    info!(url = %pusher.url(), ?period, "starting push loop");

    let pusher = Arc::new(pusher);
    let collectibles = Arc::new(collectibles);
    scheduler::every(period, move || {
        let pusher = pusher.clone();
        let collectibles = collectibles.clone();
        let registry = registry.clone();
        async move {
            let batch = collectibles();
            match pusher.push(&batch).await {
                Ok(()) => registry.self_metrics().push_successes.inc(),
                Err(err) => {
                    registry.self_metrics().push_failures.inc();
                    error!(url = %pusher.url(), error = %err, "failed to push metrics");
                }
            }
        }
    })
}
