use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, de};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache_key::{CACHE_FORMAT_VERSION, KeyFlags};
use crate::fetch::CacheOptions;
use crate::store::Store;
use crate::store::memory::MemoryStore;
use crate::store::persistent::PersistentStore;
use crate::transport::HttpTimeouts;

/// An error loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file")]
    Io(#[from] io::Error),
    #[error("config file empty")]
    Empty,
    #[error("failed to parse config YAML")]
    Parse(#[from] serde_yaml::Error),
}

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
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
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
            prefix: "fetch_cache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The directory of a persistent cache.
    ///
    /// Responses are kept in memory if this is not set.
    pub cache_dir: Option<PathBuf>,

    /// How long cached responses stay valid after they were written.
    ///
    /// Entries never expire if this is not set.
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,

    /// The maximum total size in bytes of the in-memory cache.
    ///
    /// Has no effect together with `cache_dir`.
    pub memory_capacity: Option<u64>,

    /// Selects which request fields make up the cache key.
    pub key_flags: KeyFlags,

    /// Configures the logging system.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Global timeout for one request.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let timeouts = HttpTimeouts::default();
        Config {
            cache_dir: None,
            ttl: None,
            memory_capacity: None,
            key_flags: KeyFlags::default(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            connect_timeout: timeouts.connect,
            timeout: timeouts.request,
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_reader(fs::File::open(path)?),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl io::Read) -> Result<Self, ConfigError> {
        let mut config = String::new();
        reader.read_to_string(&mut config)?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(serde_yaml::from_str(&config)?)
    }

    /// Creates the [`Store`] selected by `cache_dir` and `ttl`.
    pub fn build_store(&self) -> Arc<dyn Store> {
        match &self.cache_dir {
            Some(dir) => Arc::new(match self.ttl {
                Some(ttl) => PersistentStore::with_ttl(dir, ttl),
                None => PersistentStore::new(dir),
            }),
            None => Arc::new(MemoryStore::build(self.ttl, self.memory_capacity)),
        }
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            key_flags: self.key_flags.clone(),
            version: CACHE_FORMAT_VERSION,
        }
    }

    pub fn timeouts(&self) -> HttpTimeouts {
        HttpTimeouts {
            connect: self.connect_timeout,
            request: self.timeout,
        }
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
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
