use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use prometheus::core::Collector;
use prometheus::{opts, Encoder, IntCounter, IntCounterVec, Registry, TextEncoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("an instrument named {0:?} is already registered")]
    DuplicateName(String),
    #[error(transparent)]
    Registry(prometheus::Error),
}

const NOT_STARTED: u8 = 0;
const STARTING: u8 = 1;
const STARTED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartState {
    NotStarted,
    Starting,
    Started,
}

/// One-shot start transition for a background loop.
///
/// Exactly one caller wins `try_begin`; the state only moves forward.
#[derive(Debug, Default)]
pub struct StartGuard {
    state: AtomicU8,
}

impl StartGuard {
    pub fn new() -> Self {
        StartGuard::default()
    }

    pub fn state(&self) -> StartState {
        match self.state.load(Ordering::Acquire) {
            NOT_STARTED => StartState::NotStarted,
            STARTING => StartState::Starting,
            _ => StartState::Started,
        }
    }

    pub fn try_begin(&self) -> Option<StartTicket<'_>> {
        self.state
            .compare_exchange(NOT_STARTED, STARTING, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| StartTicket { guard: self })
    }
}

/// Held by the caller that won the start race. Marks the guard started when
/// dropped, whether or not the start itself succeeded.
pub struct StartTicket<'a> {
    guard: &'a StartGuard,
}

impl Drop for StartTicket<'_> {
    fn drop(&mut self) {
        self.guard.state.store(STARTED, Ordering::Release);
    }
}

/// Counters describing the exporter's own health.
pub struct SelfMetrics {
    pub sample_successes: IntCounterVec,
    pub sample_failures: IntCounterVec,
    pub push_successes: IntCounter,
    pub push_failures: IntCounter,
}

impl SelfMetrics {
    fn new() -> Result<SelfMetrics, prometheus::Error> {
        Ok(SelfMetrics {
            sample_successes: IntCounterVec::new(
                opts!(crate::SAMPLE_SUCCESSES, "Number of succeeded sampling passes"),
                &["source"],
            )?,
            sample_failures: IntCounterVec::new(
                opts!(crate::SAMPLE_FAILURES, "Number of failed sampling passes"),
                &["source"],
            )?,
            push_successes: IntCounter::with_opts(opts!(
                crate::PUSH_SUCCESSES,
                "Number of batches accepted by the push gateway"
            ))?,
            push_failures: IntCounter::with_opts(opts!(
                crate::PUSH_FAILURES,
                "Number of batches that failed to reach the push gateway"
            ))?,
        })
    }

    fn collectibles(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.sample_successes.clone()),
            Box::new(self.sample_failures.clone()),
            Box::new(self.push_successes.clone()),
            Box::new(self.push_failures.clone()),
        ]
    }
}

/// Instrument registry and listener guard shared by every exporter in a
/// process.
pub struct ProcessRegistry {
    registry: Registry,
    http: StartGuard,
    http_addr: OnceLock<SocketAddr>,
    self_metrics: SelfMetrics,
}

impl ProcessRegistry {
    pub fn new() -> Result<Arc<ProcessRegistry>, prometheus::Error> {
        let registry = Registry::new();
        let self_metrics = SelfMetrics::new()?;
        for collector in self_metrics.collectibles() {
            registry.register(collector)?;
        }

        Ok(Arc::new(ProcessRegistry {
            registry,
            http: StartGuard::new(),
            http_addr: OnceLock::new(),
            self_metrics,
        }))
    }

    pub fn register(&self, collector: Box<dyn Collector>) -> Result<(), RegisterError> {
        let name = collector
            .desc()
            .first()
            .map(|desc| desc.fq_name.clone())
            .unwrap_or_default();

        self.registry.register(collector).map_err(|err| match err {
            prometheus::Error::AlreadyReg => RegisterError::DuplicateName(name),
            other => RegisterError::Registry(other),
        })
    }

    pub fn unregister(&self, collector: Box<dyn Collector>) -> Result<(), prometheus::Error> {
        self.registry.unregister(collector)
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Renders every registered instrument in the text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
    }

    pub fn self_metrics(&self) -> &SelfMetrics {
        &self.self_metrics
    }

    pub(crate) fn http_guard(&self) -> &StartGuard {
        &self.http
    }

    pub(crate) fn set_http_addr(&self, addr: SocketAddr) {
        let _ = self.http_addr.set(addr);
    }

    /// Address the exposition server is listening on, once it has bound.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr.get().copied()
    }
}
