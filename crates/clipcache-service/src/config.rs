use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "clipcache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Where and how clips are persisted.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file. Parent directories are created on open.
    pub path: PathBuf,

    /// Compress newly written clips with zstd.
    ///
    /// Existing uncompressed clips are upgraded lazily when they are read.
    pub compression: bool,

    /// The zstd compression level.
    ///
    /// Defaults to `3`.
    pub compression_level: i32,

    /// Upper bound for the summed size of all stored payloads, in MiB.
    ///
    /// `0` or absent means unlimited.
    pub max_size_mb: Option<u64>,
}

impl DatabaseConfig {
    /// The configured size budget in bytes, if any.
    pub fn max_size_bytes(&self) -> Option<u64> {
        self.max_size_mb
            .filter(|mb| *mb > 0)
            .map(|mb| mb * 1024 * 1024)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            compression: false,
            compression_level: zstd::DEFAULT_COMPRESSION_LEVEL,
            max_size_mb: None,
        }
    }
}

/// Tuning for the fetch path and its maintenance work.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    /// Upper bound for a single call to the speech synthesizer.
    ///
    /// Every caller waiting on the same fetch observes the timeout.
    ///
    /// Defaults to `30s`.
    #[serde(with = "humantime_serde")]
    pub synthesis_timeout: Duration,

    /// Maximum number of maintenance tasks (last-access touches, recompression, eviction)
    /// that may be queued or running at the same time.
    ///
    /// Tasks beyond this limit are skipped.
    ///
    /// Defaults to `64`.
    pub max_background_tasks: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            synthesis_timeout: Duration::from_secs(30),
            max_background_tasks: 64,
        }
    }
}

fn default_max_qps() -> f64 {
    10.0
}

fn default_output_format() -> String {
    "audio-16khz-128kbitrate-mono-mp3".into()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Credentials and tuning for the Azure text-to-speech service.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AzureConfig {
    /// The key sent in the `Ocp-Apim-Subscription-Key` header.
    pub subscription_key: String,

    /// The Azure region hosting the speech resource, e.g. `westeurope`.
    pub region: String,

    /// Overrides the base URL derived from `region`.
    ///
    /// Defaults to `https://{region}.tts.speech.microsoft.com`.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Maximum number of requests per second sent to the service.
    ///
    /// Values of zero or below fall back to the default of `10`.
    #[serde(default = "default_max_qps")]
    pub max_qps: f64,

    /// Voice names by language code, taking precedence over the voices the service advertises.
    ///
    /// A base language like `en` applies to every regional variant without a voice of its own.
    #[serde(default)]
    pub voices: BTreeMap<String, String>,

    /// The requested audio format.
    ///
    /// Defaults to `audio-16khz-128kbitrate-mono-mp3`.
    #[serde(default = "default_output_format")]
    pub output_format: String,

    /// The timeout for establishing a connection.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Upper bound for a single HTTP request, including the response body.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl AzureConfig {
    /// The base URL requests are sent to, without a trailing slash.
    pub fn base_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_owned(),
            None => format!("https://{}.tts.speech.microsoft.com", self.region),
        }
    }

    /// The configured request rate, with the default substituted for unusable values.
    pub fn effective_max_qps(&self) -> f64 {
        if self.max_qps.is_finite() && self.max_qps > 0.0 {
            self.max_qps
        } else {
            default_max_qps()
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Storage settings.
    pub database: DatabaseConfig,

    /// Fetch and maintenance settings.
    pub fetch: FetchConfig,

    /// The Azure speech service used to synthesize missing clips.
    ///
    /// Without it, only clips that are already cached can be served.
    pub azure: Option<AzureConfig>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
}

/// Default location of the clip database: `$XDG_DATA_HOME/clipcache/cache.db` or the
/// platform equivalent, falling back to the working directory.
fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clipcache")
        .join("cache.db")
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
