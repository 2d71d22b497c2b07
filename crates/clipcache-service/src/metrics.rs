//! Statsd reporting for the clip cache.
//!
//! Nothing is sent until [`configure_statsd`] has been called. Until then every [`metric!`]
//! invocation is a no-op.
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static METRICS: OnceLock<ClipMetrics> = OnceLock::new();

/// Traits the [`metric!`] macro needs in scope.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// The configured statsd client together with the tags attached to every metric.
#[derive(Debug)]
pub struct ClipMetrics {
    client: StatsdClient,
    global_tags: BTreeMap<String, String>,
}

impl ClipMetrics {
    pub fn statsd(&self) -> &StatsdClient {
        &self.client
    }

    /// Adds the global tags to `metric` and sends it.
    #[inline(always)]
    pub fn send<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.global_tags
            .iter()
            .fold(metric, |metric, (tag, value)| metric.with_tag(tag, value))
            .send()
    }
}

/// Starts reporting metrics to the statsd server at `host`.
///
/// Only the first call has an effect, later calls are logged and ignored.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    global_tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    let Some(first) = addrs.first() else {
        anyhow::bail!("statsd host did not resolve to any address");
    };
    tracing::info!(addr = %first, prefix, "Reporting metrics to statsd");

    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).context("failed to create statsd sink")?;

    let metrics = ClipMetrics {
        client: StatsdClient::from_sink(prefix, sink),
        global_tags,
    };
    if METRICS.set(metrics).is_err() {
        tracing::warn!("statsd was already configured");
    }
    Ok(())
}

/// Runs `f` with the configured metrics, or returns `R::default()` if there are none.
///
/// Prefer the [`metric!`](crate::metric) macro.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&ClipMetrics) -> R,
    R: Default,
{
    METRICS.get().map(f).unwrap_or_default()
}

/// Emits a metric.
///
/// ```ignore
/// metric!(counter("clips.hit") += 1);
/// metric!(gauge("clips.size.bytes") = total, "language" => "en-US");
/// metric!(timer("clips.synthesis.duration") = start.elapsed());
/// metric!(histogram("clips.store.size") = bytes);
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@emit count_with_tags, $id, $value $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@emit gauge_with_tags, $id, $value $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@emit time_with_tags, $id, $value $(, $k => $v)*)
    };
    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@emit histogram_with_tags, $id, $value $(, $k => $v)*)
    };
    (@emit $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|metrics| {
            metrics.send(metrics.statsd().$method($id, $value) $(.with_tag($k, $v))*);
        })
    }};
}
