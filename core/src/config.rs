//! Runtime configuration for the image cache.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::CacheError;

/// Entries kept in the memory tier unless configured otherwise.
pub const DEFAULT_MEMORY_CACHE_CAPACITY: usize = 100;
/// Age after which a persisted entry is treated as a miss.
pub const DEFAULT_EXPIRATION_DELAY: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// Smallest accepted expiration delay.
pub const MIN_EXPIRATION_DELAY: Duration = Duration::from_secs(60);
/// Minimum spacing between two background pruning passes.
pub const DEFAULT_PRUNING_INTERVAL: Duration = Duration::from_secs(60);
/// Delay between a pruning request and the pass it schedules.
pub const DEFAULT_PRUNING_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const ENV_DIR: &str = "IMAGE_CACHE_DIR";
const ENV_EXPIRATION_SECS: &str = "IMAGE_CACHE_EXPIRATION_SECS";
const ENV_MEMORY_CAPACITY: &str = "IMAGE_CACHE_MEMORY_CAPACITY";
const ENV_ENABLED: &str = "IMAGE_CACHE_ENABLED";
const ENV_REQUEST_TIMEOUT_SECS: &str = "IMAGE_CACHE_REQUEST_TIMEOUT_SECS";

/// Settings consumed by [`crate::ImageCache`] at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCacheConfig {
    /// Directory under which the persistent tier keeps its own namespace folder.
    pub store_root: PathBuf,
    /// Maximum age of a persisted entry.
    pub expiration_delay: Duration,
    /// Number of entries kept in memory; `0` disables the memory tier.
    pub memory_capacity: usize,
    /// Hard kill switch. A disabled cache misses every lookup and never touches the network.
    pub enabled: bool,
    pub pruning_interval: Duration,
    pub pruning_delay: Duration,
    /// Upper bound for a single download, connection included.
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Reject `get` calls made from any thread other than the constructing one.
    pub enforce_owner_thread: bool,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            store_root: default_store_root(),
            expiration_delay: DEFAULT_EXPIRATION_DELAY,
            memory_capacity: DEFAULT_MEMORY_CACHE_CAPACITY,
            enabled: true,
            pruning_interval: DEFAULT_PRUNING_INTERVAL,
            pruning_delay: DEFAULT_PRUNING_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            user_agent: format!("imgcache/{}", env!("CARGO_PKG_VERSION")),
            enforce_owner_thread: false,
        }
    }
}

impl ImageCacheConfig {
    pub fn with_store_root<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.store_root = path.into();
        self
    }

    pub fn with_expiration_delay(mut self, delay: Duration) -> Self {
        self.expiration_delay = delay;
        self
    }

    pub fn with_memory_capacity(mut self, capacity: usize) -> Self {
        self.memory_capacity = capacity;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Override both pruning timings at once.
    pub fn with_pruning(mut self, interval: Duration, delay: Duration) -> Self {
        self.pruning_interval = interval;
        self.pruning_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_owner_thread(mut self, enforce: bool) -> Self {
        self.enforce_owner_thread = enforce;
        self
    }

    /// Load defaults overridden by `IMAGE_CACHE_*` environment variables.
    pub fn from_env() -> Result<Self, CacheError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::from_env`] but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CacheError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let value =
            |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(dir) = value(ENV_DIR) {
            config.store_root = PathBuf::from(dir);
        }
        if let Some(raw) = value(ENV_EXPIRATION_SECS) {
            let secs = raw.parse::<u64>().map_err(|_| {
                CacheError::invalid("expiration_delay", format!("`{raw}` is not a whole number"))
            })?;
            config.expiration_delay = Duration::from_secs(secs);
        }
        if let Some(raw) = value(ENV_MEMORY_CAPACITY) {
            let parsed = raw.parse::<i64>().map_err(|_| {
                CacheError::invalid("memory_capacity", format!("`{raw}` is not an integer"))
            })?;
            config.memory_capacity = checked_capacity(parsed)?;
        }
        if let Some(raw) = value(ENV_ENABLED) {
            config.enabled = parse_flag(&raw).ok_or_else(|| {
                CacheError::invalid("enabled", format!("`{raw}` is not a boolean"))
            })?;
        }
        if let Some(raw) = value(ENV_REQUEST_TIMEOUT_SECS) {
            let secs = raw.parse::<u64>().map_err(|_| {
                CacheError::invalid("request_timeout", format!("`{raw}` is not a whole number"))
            })?;
            config.request_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every value that has a lower bound.
    pub fn validate(&self) -> Result<(), CacheError> {
        check_expiration_delay(self.expiration_delay)?;
        if self.request_timeout.is_zero() {
            return Err(CacheError::invalid("request_timeout", "must be greater than zero"));
        }
        Ok(())
    }
}

pub(crate) fn check_expiration_delay(delay: Duration) -> Result<(), CacheError> {
    if delay < MIN_EXPIRATION_DELAY {
        return Err(CacheError::invalid("expiration_delay", "must be at least one minute"));
    }
    Ok(())
}

/// Convert any integer into a memory capacity, rejecting negatives.
pub(crate) fn checked_capacity<N>(value: N) -> Result<usize, CacheError>
where
    N: TryInto<usize> + Copy + std::fmt::Display,
{
    value.try_into().map_err(|_| {
        CacheError::invalid("memory_capacity", format!("{value} is not a valid entry count"))
    })
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn default_store_root() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("com", "Vermeil", "image-cache") {
        dirs.cache_dir().to_path_buf()
    } else {
        std::env::temp_dir().join("image-cache")
    }
}
