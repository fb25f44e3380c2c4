use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::types::ExecutionOrder;

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
            prefix: "imageloader".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Limits of the in-memory image cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Whether decoded images are kept in memory at all.
    pub enabled: bool,

    /// Maximum summed cost of all cached images, `None` meaning unlimited.
    ///
    /// The cost of an image is its pixel count scaled by the square of its scale factor.
    pub max_cost: Option<u64>,

    /// Maximum number of cached images, `None` meaning unlimited.
    pub max_count: Option<usize>,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cost: None,
            max_count: None,
        }
    }
}

/// Retention of the on-disk image cache.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Maximum age of a cache file (measured from its last write).
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,

    /// Maximum total size (in bytes) of all cache files, `None` meaning unlimited.
    pub max_size: Option<u64>,

    /// Additional directories with pre-populated cache files.
    ///
    /// These are searched after the primary cache directory and never written to.
    pub read_only_paths: Vec<PathBuf>,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            max_age: Some(Duration::from_secs(3600 * 24 * 7)),
            max_size: None,
            read_only_paths: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configure the in-memory tier.
    pub memory: MemoryCacheConfig,
    /// Configure the on-disk tier.
    pub disk: DiskCacheConfig,
}

/// Configuration of the downloader and its HTTP transport.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Maximum number of downloads running at the same time.
    pub max_concurrent_downloads: usize,

    /// Order in which queued downloads of the same priority are started.
    pub execution_order: ExecutionOrder,

    /// The maximum duration of a single download, including reading the body.
    #[serde(with = "humantime_serde")]
    pub download_timeout: Duration,

    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Headers that are sent with every request.
    pub headers: BTreeMap<String, String>,

    /// User name for HTTP basic authentication.
    pub username: Option<String>,

    /// Password for HTTP basic authentication.
    pub password: Option<String>,

    /// Overrides the `User-Agent` header.
    pub user_agent: Option<String>,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Accept".to_owned(), "image/webp,image/*;q=0.8".to_owned());

        Self {
            max_concurrent_downloads: 6,
            execution_order: ExecutionOrder::Fifo,
            download_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            headers,
            username: None,
            password: None,
            user_agent: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use when caching. `None` disables the disk tier.
    pub cache_dir: Option<PathBuf>,

    /// Sub directory of `cache_dir` holding the cache files of this instance.
    pub namespace: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// Fine-tune the cache tiers.
    pub caches: CacheConfigs,

    /// Configuration of the downloader.
    pub downloader: DownloaderConfig,

    /// How long a permanently failing URL is refused without the retry option.
    ///
    /// `None` keeps failed URLs for the lifetime of the manager.
    #[serde(with = "humantime_serde")]
    pub failed_url_ttl: Option<Duration>,
}

/// Sub directory of `cache_dir` holding files that are still being written.
pub const TMP_DIR: &str = "tmp";

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    ///
    /// If there is no base cache directory configured this means no caching should happen
    /// and this returns None.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }

    /// Checks that `namespace` names a single directory that does not collide with [`TMP_DIR`].
    pub fn validate(&self) -> Result<()> {
        let namespace = self.namespace.as_str();
        if namespace.is_empty()
            || namespace == TMP_DIR
            || namespace == "."
            || namespace == ".."
            || namespace.contains(['/', '\\'])
        {
            anyhow::bail!("invalid cache namespace `{namespace}`");
        }
        Ok(())
    }
}

/// Default value for the "cache_dir" configuration.
fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("imageloader"))
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: default_cache_dir(),
            namespace: "default".to_owned(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            caches: CacheConfigs::default(),
            downloader: DownloaderConfig::default(),
            failed_url_ttl: None,
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

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
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
