//! Shared logging setup for everything that embeds the clip cache.
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;

/// Returns the default `RUST_LOG` style filter for the configured level.
///
/// Maintenance chatter from the store and the background queue is only shown from `debug` on.
pub fn default_filter(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "off",
        LevelFilter::ERROR => "error",
        LevelFilter::WARN => "warn",
        LevelFilter::INFO => {
            "info,\
             clipcache_service::utils::background=warn"
        }
        LevelFilter::DEBUG => {
            "info,\
             clipcache=debug,\
             clipcache_service=debug"
        }
        LevelFilter::TRACE => {
            "info,\
             clipcache=trace,\
             clipcache_service=trace"
        }
    }
}

/// Installs a JSON-lines subscriber that also forwards events to sentry.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .finish()
        .with(sentry::integrations::tracing::layer())
        .init();
}
