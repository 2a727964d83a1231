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

use crate::caching::MemoizeConfig;

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
    /// The log level for the service.
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
    /// A tag name to report the environment to, for each metric. Defaults to not sending such a tag.
    pub environment_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: match env::var("STATSD_SERVER") {
                Ok(metrics_statsd) => Some(metrics_statsd),
                Err(_) => None,
            },
            prefix: "anevt".into(),
            hostname_tag: None,
            environment_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Selects the shared store that memoized results are published to.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheStoreConfig {
    /// Per-process in-memory store. Cheap, but not shared across processes.
    InMemory {
        /// Maximum number of retained cache lines.
        #[serde(default = "default_in_memory_capacity")]
        capacity: u64,
    },
    /// File-backed store, shareable between processes on one host.
    Filesystem {
        /// The directory holding one file per cache line.
        path: PathBuf,
    },
}

fn default_in_memory_capacity() -> u64 {
    100_000
}

impl Default for CacheStoreConfig {
    fn default() -> Self {
        CacheStoreConfig::InMemory {
            capacity: default_in_memory_capacity(),
        }
    }
}

/// Default expiry settings applied to every memoized query.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MemoizeDefaults {
    /// Time-to-live of a completed result.
    #[serde(with = "humantime_serde")]
    pub result_ttl: Duration,
    /// How long an in-flight computation may block other callers.
    #[serde(with = "humantime_serde")]
    pub pending_timeout: Duration,
    /// How often waiting callers re-read a pending cache line.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for MemoizeDefaults {
    fn default() -> Self {
        let defaults = MemoizeConfig::default();
        MemoizeDefaults {
            result_ttl: defaults.result_ttl,
            pending_timeout: defaults.pending_timeout,
            poll_interval: defaults.poll_interval,
        }
    }
}

impl MemoizeDefaults {
    /// Builds the per-query config carrying these defaults.
    pub fn memoize_config(&self) -> MemoizeConfig {
        MemoizeConfig {
            result_ttl: self.result_ttl,
            pending_timeout: self.pending_timeout,
            poll_interval: self.poll_interval,
            ..MemoizeConfig::default()
        }
    }
}

/// Background cache warming of the built-in event count query.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// The interval between runs.
    #[serde(with = "humantime_serde")]
    pub run_every: Duration,
    /// Recompute on every run instead of settling for a cached result.
    pub force_memoize: bool,
}

impl Default for CronConfig {
    fn default() -> Self {
        CronConfig {
            run_every: Duration::from_secs(60),
            force_memoize: true,
        }
    }
}

/// Top-level service configuration, read from a YAML file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configure the logging system.
    pub logging: Logging,

    /// Configure the metrics system.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The shared store backing memoization.
    pub cache_store: CacheStoreConfig,

    /// Default expiry settings of memoized queries.
    pub memoize: MemoizeDefaults,

    /// Background cache warming. Disabled when absent.
    pub cron: Option<CronConfig>,
}

/// Checks if we are running in docker.
fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup")
        .map(|s| s.contains("/docker"))
        .unwrap_or(false)
}

/// Default value for the "bind" configuration.
fn default_bind() -> String {
    if is_docker() {
        // Docker images rely on this service being exposed
        "0.0.0.0:3093".to_owned()
    } else {
        "127.0.0.1:3093".to_owned()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            cache_store: CacheStoreConfig::default(),
            memoize: MemoizeDefaults::default(),
            cron: None,
        }
    }
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
