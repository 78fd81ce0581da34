use tracing::{metadata::LevelFilter, Level, Metadata};
use tracing_subscriber::layer::{Context, Filter, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::Layer;

pub struct LogFilter {
    level: Level,
}

impl LogFilter {
    pub fn new(level: Level) -> Self {
        LogFilter { level }
    }
}

impl<S> Filter<S> for LogFilter {
    fn enabled(&self, meta: &Metadata<'_>, _cx: &Context<'_, S>) -> bool {
        let target = meta.target();

        // enable logging for the exporter itself, and for tower_http response log
        *meta.level() <= self.level
            && (target.starts_with("dbstats_exporter")
                || target.starts_with("tower_http::trace::on_response"))
    }

    fn max_level_hint(&self) -> Option<LevelFilter> {
        Some(LevelFilter::from(self.level))
    }
}

/// Installs logfmt output for the exporter's own events as the global
/// subscriber. Hosts with their own subscriber can skip this.
pub fn init(level: Level) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(tracing_logfmt::layer().with_filter(LogFilter::new(level)))
        .try_init()
}
