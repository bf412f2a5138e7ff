use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
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
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "composable".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Timeouts of a single [`LoadingCacheDelegate`](crate::LoadingCacheDelegate).
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LoadingCacheConfig {
    /// Name of the cache, reported to the loader and attached to all metrics.
    pub name: String,
    /// Maximum duration of a cache lookup before it is treated as a miss.
    #[serde(with = "humantime_serde")]
    pub cache_timeout: Duration,
    /// Maximum duration of a single load.
    #[serde(with = "humantime_serde")]
    pub loader_timeout: Duration,
    /// Maximum duration of a whole lookup, including the cache lookup and the load.
    #[serde(with = "humantime_serde")]
    pub global_timeout: Duration,
}

impl Default for LoadingCacheConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            cache_timeout: Duration::from_millis(500),
            loader_timeout: Duration::from_millis(500),
            global_timeout: Duration::from_secs(1),
        }
    }
}

impl LoadingCacheConfig {
    /// Creates a config with the given name and the default timeouts.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Configuration of read-modify-write updates.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CasConfig {
    /// Total attempts of an update before giving up.
    pub max_attempts: u32,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Configuration of the in-process [`MemoryBackend`](crate::MemoryBackend).
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum number of entries.
    pub capacity: u64,
    /// Expiration of entries written through a [`BackendCache`](crate::BackendCache).
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            default_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Configures the logging system.
    pub logging: Logging,

    /// Configures the metrics system.
    pub metrics: Metrics,

    /// Loading caches by name.
    ///
    /// The name of each entry overrides the `name` field of its config.
    pub caches: BTreeMap<String, LoadingCacheConfig>,

    /// Read-modify-write updates.
    pub cas: CasConfig,

    /// The in-process backend.
    pub memory: MemoryConfig,
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

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let mut config: Self =
            serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        for (name, cache) in &mut config.caches {
            cache.name.clone_from(name);
        }
        Ok(config)
    }

    /// Returns the configuration of the loading cache called `name`.
    ///
    /// Falls back to the default timeouts if the cache is not configured.
    pub fn loading_cache(&self, name: &str) -> LoadingCacheConfig {
        self.caches
            .get(name)
            .cloned()
            .unwrap_or_else(|| LoadingCacheConfig::named(name))
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
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
