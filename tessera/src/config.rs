//! Pipeline configuration.
//!
//! [`PipelineConfig`] groups the tunables for every pipeline component. It
//! can be built in code through the `with_*` methods or loaded from an INI
//! file:
//!
//! ```ini
//! [pipeline]
//! deduplication = true
//! rate_limiter = true
//! progressive_decoding = false
//! decompression = true
//!
//! [rate_limiter]
//! capacity = 25
//! tokens_per_tick = 2
//! tick_interval_ms = 25
//!
//! [memory_cache]
//! cost_limit = 256MB
//! count_limit = 1000
//! ttl_secs = 0
//! ```
//!
//! Missing sections and keys keep their defaults.

use std::path::Path;
use std::time::Duration;

use ini::Ini;

use crate::error::ConfigError;

// ==================== Rate Limiter Defaults ====================

/// Default bucket capacity (maximum burst of new load starts).
pub const DEFAULT_RATE_LIMITER_CAPACITY: u32 = 25;

/// Default number of tokens added per tick.
pub const DEFAULT_RATE_LIMITER_TOKENS_PER_TICK: u32 = 2;

/// Default tick interval in milliseconds.
///
/// With two tokens per tick this admits 80 new loads per second.
pub const DEFAULT_RATE_LIMITER_TICK_MS: u64 = 25;

// ==================== Memory Cache Defaults ====================

/// Default cost limit of the memory cache in bytes (256 MB).
pub const DEFAULT_MEMORY_CACHE_COST_LIMIT: usize = 256 * 1024 * 1024;

/// Default maximum number of cached images.
pub const DEFAULT_MEMORY_CACHE_COUNT_LIMIT: usize = 1000;

/// Token bucket configuration for the [`RateLimiter`](crate::rate_limiter::RateLimiter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Maximum number of tokens the bucket holds.
    pub capacity: u32,

    /// Tokens added on every tick.
    pub tokens_per_tick: u32,

    /// Time between ticks.
    pub tick_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_RATE_LIMITER_CAPACITY,
            tokens_per_tick: DEFAULT_RATE_LIMITER_TOKENS_PER_TICK,
            tick_interval: Duration::from_millis(DEFAULT_RATE_LIMITER_TICK_MS),
        }
    }
}

impl RateLimiterConfig {
    /// Returns the sustained admission rate in starts per second.
    pub fn rate_per_second(&self) -> f64 {
        let secs = self.tick_interval.as_secs_f64();
        if secs == 0.0 {
            return f64::INFINITY;
        }
        self.tokens_per_tick as f64 / secs
    }
}

/// Bounds for the [`MemoryCache`](crate::cache::MemoryCache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCacheConfig {
    /// Maximum total cost of resident entries.
    pub cost_limit: usize,

    /// Maximum number of resident entries.
    pub count_limit: usize,

    /// Entries older than this are treated as absent. `None` disables expiry.
    pub ttl: Option<Duration>,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            cost_limit: DEFAULT_MEMORY_CACHE_COST_LIMIT,
            count_limit: DEFAULT_MEMORY_CACHE_COUNT_LIMIT,
            ttl: None,
        }
    }
}

impl MemoryCacheConfig {
    /// Creates a cache config with the given cost limit and no count bound.
    pub fn with_cost_limit(cost_limit: usize) -> Self {
        Self {
            cost_limit,
            count_limit: usize::MAX,
            ttl: None,
        }
    }
}

/// Configuration for a [`Pipeline`](crate::pipeline::Pipeline).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Share one load and one decode task between equivalent requests.
    pub deduplication_enabled: bool,

    /// Gate new loads through the rate limiter.
    pub rate_limiter_enabled: bool,

    /// Decode partial data as it arrives and deliver previews.
    pub progressive_decoding_enabled: bool,

    /// Convert final images to RGBA8 before caching and delivery.
    pub decompression_enabled: bool,

    /// Rate limiter settings.
    pub rate_limiter: RateLimiterConfig,

    /// Memory cache settings.
    pub memory_cache: MemoryCacheConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            deduplication_enabled: true,
            rate_limiter_enabled: true,
            progressive_decoding_enabled: false,
            decompression_enabled: true,
            rate_limiter: RateLimiterConfig::default(),
            memory_cache: MemoryCacheConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Enables or disables task deduplication.
    pub fn with_deduplication(mut self, enabled: bool) -> Self {
        self.deduplication_enabled = enabled;
        self
    }

    /// Enables or disables the rate limiter.
    pub fn with_rate_limiter(mut self, enabled: bool) -> Self {
        self.rate_limiter_enabled = enabled;
        self
    }

    /// Enables or disables progressive decoding.
    pub fn with_progressive_decoding(mut self, enabled: bool) -> Self {
        self.progressive_decoding_enabled = enabled;
        self
    }

    /// Enables or disables decompression.
    pub fn with_decompression(mut self, enabled: bool) -> Self {
        self.decompression_enabled = enabled;
        self
    }

    /// Replaces the rate limiter settings.
    pub fn with_rate_limiter_config(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = config;
        self
    }

    /// Replaces the memory cache settings.
    pub fn with_memory_cache_config(mut self, config: MemoryCacheConfig) -> Self {
        self.memory_cache = config;
        self
    }

    /// Loads configuration from an INI file.
    pub fn from_ini_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_ini_str(&content)
    }

    /// Parses configuration from INI text.
    pub fn from_ini_str(content: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut config = Self::default();

        // [pipeline] section
        if let Some(section) = ini.section(Some("pipeline")) {
            if let Some(v) = section.get("deduplication") {
                config.deduplication_enabled = parse_bool("pipeline", "deduplication", v)?;
            }
            if let Some(v) = section.get("rate_limiter") {
                config.rate_limiter_enabled = parse_bool("pipeline", "rate_limiter", v)?;
            }
            if let Some(v) = section.get("progressive_decoding") {
                config.progressive_decoding_enabled =
                    parse_bool("pipeline", "progressive_decoding", v)?;
            }
            if let Some(v) = section.get("decompression") {
                config.decompression_enabled = parse_bool("pipeline", "decompression", v)?;
            }
        }

        // [rate_limiter] section
        if let Some(section) = ini.section(Some("rate_limiter")) {
            if let Some(v) = section.get("capacity") {
                config.rate_limiter.capacity = parse_number("rate_limiter", "capacity", v)?;
            }
            if let Some(v) = section.get("tokens_per_tick") {
                config.rate_limiter.tokens_per_tick =
                    parse_number("rate_limiter", "tokens_per_tick", v)?;
            }
            if let Some(v) = section.get("tick_interval_ms") {
                let ms: u64 = parse_number("rate_limiter", "tick_interval_ms", v)?;
                if ms == 0 {
                    return Err(invalid("rate_limiter", "tick_interval_ms", v));
                }
                config.rate_limiter.tick_interval = Duration::from_millis(ms);
            }
        }

        // [memory_cache] section
        if let Some(section) = ini.section(Some("memory_cache")) {
            if let Some(v) = section.get("cost_limit") {
                config.memory_cache.cost_limit = parse_size(v)
                    .ok_or_else(|| invalid("memory_cache", "cost_limit", v))?;
            }
            if let Some(v) = section.get("count_limit") {
                config.memory_cache.count_limit =
                    parse_number("memory_cache", "count_limit", v)?;
            }
            if let Some(v) = section.get("ttl_secs") {
                let secs: u64 = parse_number("memory_cache", "ttl_secs", v)?;
                config.memory_cache.ttl = (secs > 0).then(|| Duration::from_secs(secs));
            }
        }

        Ok(config)
    }
}

fn invalid(section: &str, key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: format!("{}.{}", section, key),
        value: value.to_string(),
    }
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(section, key, value)),
    }
}

fn parse_number<T: std::str::FromStr>(
    section: &str,
    key: &str,
    value: &str,
) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(section, key, value))
}

/// Parses a human-readable size such as `512`, `64KB`, `256MB` or `2GB`.
///
/// Suffixes are case-insensitive and use binary multiples.
pub fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let upper = s.to_uppercase();
    let (digits, multiplier) = [
        ("GB", 1024 * 1024 * 1024),
        ("G", 1024 * 1024 * 1024),
        ("MB", 1024 * 1024),
        ("M", 1024 * 1024),
        ("KB", 1024),
        ("K", 1024),
    ]
    .iter()
    .find(|(suffix, _)| upper.ends_with(suffix))
    .map(|(suffix, mult)| (&s[..s.len() - suffix.len()], *mult))
    .unwrap_or((s, 1_usize));

    digits.trim().parse::<usize>().ok()?.checked_mul(multiplier)
}
