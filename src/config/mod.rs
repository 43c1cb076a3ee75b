//! Validated plugin configuration.
//!
//! The host hands every plugin a loose mapping of options. Each plugin
//! variant turns that mapping into an explicit struct at construction time,
//! so bad values fail fast instead of at first use.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::consts;
use crate::error::ConfigError;
use crate::runtime::backoff::BackoffPolicy;

/// The raw option mapping supplied by the host.
pub type Options = serde_json::Map<String, Value>;

/// What to do with options a plugin does not recognize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strictness {
    /// Ignore unknown keys.
    #[default]
    Lenient,
    /// Reject unknown keys.
    Strict,
}

/// Typed access to an option mapping. Null values read as absent.
pub struct OptionReader<'a> {
    options: &'a Options,
}

impl<'a> OptionReader<'a> {
    /// Check `options` against the recognized keys and wrap it.
    pub fn new(
        options: &'a Options,
        recognized: &[&str],
        strictness: Strictness,
    ) -> Result<Self, ConfigError> {
        for key in options.keys() {
            if recognized.contains(&key.as_str()) {
                continue;
            }
            match strictness {
                Strictness::Strict => return Err(ConfigError::UnknownOption(key.clone())),
                Strictness::Lenient => debug!(option = %key, "ignoring unrecognized option"),
            }
        }
        Ok(Self { options })
    }

    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.options.get(key).filter(|v| !v.is_null())
    }

    pub fn bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v
                .as_bool()
                .ok_or_else(|| ConfigError::invalid(key, "expected a boolean")),
        }
    }

    pub fn u64(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v
                .as_u64()
                .ok_or_else(|| ConfigError::invalid(key, "expected a non-negative integer")),
        }
    }

    pub fn f64(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v
                .as_f64()
                .ok_or_else(|| ConfigError::invalid(key, "expected a number")),
        }
    }

    pub fn string(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_str()
                .map(|s| Some(s.to_string()))
                .ok_or_else(|| ConfigError::invalid(key, "expected a string")),
        }
    }

    /// A count that must be at least `min`.
    pub fn count(&self, key: &str, default: usize, min: usize) -> Result<usize, ConfigError> {
        let value = self.u64(key, default as u64)?;
        let value = usize::try_from(value).map_err(|_| ConfigError::invalid(key, "too large"))?;
        if value < min {
            return Err(ConfigError::invalid(key, format!("must be >= {min}")));
        }
        Ok(value)
    }

    /// Seconds as a strictly positive duration.
    pub fn seconds(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let secs = self.f64(key, default.as_secs_f64())?;
        positive_duration(key, secs)
    }

    /// Milliseconds as a strictly positive duration.
    pub fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let ms = self.u64(key, default.as_millis() as u64)?;
        if ms == 0 {
            return Err(ConfigError::invalid(key, "must be > 0"));
        }
        Ok(Duration::from_millis(ms))
    }
}

fn positive_duration(key: &str, secs: f64) -> Result<Duration, ConfigError> {
    if !(secs > 0.0) {
        return Err(ConfigError::invalid(key, "must be > 0"));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::invalid(key, e.to_string()))
}

/// Options for the async-oriented plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncPluginConfig {
    /// Deadline for each individual attempt.
    pub timeout: Duration,
    pub max_retries: u32,
    pub concurrent_limit: usize,
    pub enable_batch_processing: bool,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl Default for AsyncPluginConfig {
    fn default() -> Self {
        Self {
            timeout: consts::DEFAULT_TIMEOUT,
            max_retries: consts::DEFAULT_MAX_RETRIES,
            concurrent_limit: consts::DEFAULT_CONCURRENT_LIMIT,
            enable_batch_processing: false,
            backoff_base: consts::DEFAULT_BACKOFF_BASE,
            max_backoff: consts::DEFAULT_MAX_BACKOFF,
            jitter: false,
        }
    }
}

impl AsyncPluginConfig {
    pub const RECOGNIZED: &'static [&'static str] = &[
        "timeout",
        "max_retries",
        "concurrent_limit",
        "enable_batch_processing",
        "backoff_base_ms",
        "max_backoff_ms",
        "jitter",
    ];

    pub fn from_options(options: &Options, strictness: Strictness) -> Result<Self, ConfigError> {
        let reader = OptionReader::new(options, Self::RECOGNIZED, strictness)?;
        let defaults = Self::default();

        let max_retries = reader.u64("max_retries", defaults.max_retries as u64)?;
        let config = Self {
            timeout: reader.seconds("timeout", defaults.timeout)?,
            max_retries: u32::try_from(max_retries)
                .map_err(|_| ConfigError::invalid("max_retries", "too large"))?,
            concurrent_limit: reader.count("concurrent_limit", defaults.concurrent_limit, 1)?,
            enable_batch_processing: reader
                .bool("enable_batch_processing", defaults.enable_batch_processing)?,
            backoff_base: reader.millis("backoff_base_ms", defaults.backoff_base)?,
            max_backoff: reader.millis("max_backoff_ms", defaults.max_backoff)?,
            jitter: reader.bool("jitter", defaults.jitter)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Re-check invariants for configs built by hand rather than parsed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "must be > 0"));
        }
        if self.concurrent_limit == 0 {
            return Err(ConfigError::invalid("concurrent_limit", "must be >= 1"));
        }
        if self.backoff_base.is_zero() {
            return Err(ConfigError::invalid("backoff_base_ms", "must be > 0"));
        }
        if self.max_backoff < self.backoff_base {
            return Err(ConfigError::invalid(
                "max_backoff_ms",
                "must be >= backoff_base_ms",
            ));
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.backoff_base,
            max_delay: self.max_backoff,
            max_retries: self.max_retries,
            jitter: self.jitter,
        }
    }
}

/// Options for the state-oriented plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct StatefulPluginConfig {
    pub max_history_size: usize,
    pub enable_persistence: bool,
    pub state_file: PathBuf,
    /// Save after this many appends. Explicit flushes always save.
    pub persist_every: usize,
    pub clear_on_context_switch: bool,
    pub pattern_window: usize,
}

impl Default for StatefulPluginConfig {
    fn default() -> Self {
        Self {
            max_history_size: consts::DEFAULT_MAX_HISTORY_SIZE,
            enable_persistence: false,
            state_file: consts::default_state_path(),
            persist_every: consts::DEFAULT_PERSIST_EVERY,
            clear_on_context_switch: false,
            pattern_window: consts::DEFAULT_PATTERN_WINDOW,
        }
    }
}

impl StatefulPluginConfig {
    pub const RECOGNIZED: &'static [&'static str] = &[
        "max_history_size",
        "enable_persistence",
        "state_file",
        "persist_every",
        "clear_on_context_switch",
        "pattern_window",
    ];

    pub fn from_options(options: &Options, strictness: Strictness) -> Result<Self, ConfigError> {
        let reader = OptionReader::new(options, Self::RECOGNIZED, strictness)?;
        let defaults = Self::default();

        let state_file = match reader.string("state_file")? {
            Some(path) if path.trim().is_empty() => {
                return Err(ConfigError::invalid("state_file", "must not be empty"));
            }
            Some(path) => PathBuf::from(path),
            None => defaults.state_file,
        };

        let config = Self {
            max_history_size: reader.count("max_history_size", defaults.max_history_size, 1)?,
            enable_persistence: reader.bool("enable_persistence", defaults.enable_persistence)?,
            state_file,
            persist_every: reader.count("persist_every", defaults.persist_every, 1)?,
            clear_on_context_switch: reader
                .bool("clear_on_context_switch", defaults.clear_on_context_switch)?,
            pattern_window: reader.count("pattern_window", defaults.pattern_window, 2)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_history_size == 0 {
            return Err(ConfigError::invalid("max_history_size", "must be >= 1"));
        }
        if self.persist_every == 0 {
            return Err(ConfigError::invalid("persist_every", "must be >= 1"));
        }
        if self.pattern_window < 2 {
            return Err(ConfigError::invalid("pattern_window", "must be >= 2"));
        }
        Ok(())
    }
}

/// Options for the pass-through plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimplePluginConfig {
    pub log_messages: bool,
    pub prefix: String,
    pub add_prefix: bool,
}

impl Default for SimplePluginConfig {
    fn default() -> Self {
        Self {
            log_messages: false,
            prefix: consts::DEFAULT_SIMPLE_PREFIX.to_string(),
            add_prefix: false,
        }
    }
}

impl SimplePluginConfig {
    pub const RECOGNIZED: &'static [&'static str] = &["log_messages", "prefix", "add_prefix"];

    pub fn from_options(options: &Options, strictness: Strictness) -> Result<Self, ConfigError> {
        let reader = OptionReader::new(options, Self::RECOGNIZED, strictness)?;
        let defaults = Self::default();
        Ok(Self {
            log_messages: reader.bool("log_messages", defaults.log_messages)?,
            prefix: reader.string("prefix")?.unwrap_or(defaults.prefix),
            add_prefix: reader.bool("add_prefix", defaults.add_prefix)?,
        })
    }
}

/// Speed/depth trade-off for [`ConfiguredPluginConfig`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    Fast,
    #[default]
    Balanced,
    Thorough,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Thorough => "thorough",
        }
    }

    /// Processing passes per message.
    pub fn iterations(&self) -> usize {
        match self {
            Self::Fast => 1,
            Self::Balanced => 3,
            Self::Thorough => 5,
        }
    }

    /// Label each pass prefixes the message with.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Fast => "Quick",
            Self::Balanced => "Analysis",
            Self::Thorough => "Deep analysis",
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "balanced" => Ok(Self::Balanced),
            "thorough" => Ok(Self::Thorough),
            other => Err(ConfigError::invalid(
                "mode",
                format!("unknown mode '{other}', expected fast, balanced or thorough"),
            )),
        }
    }
}

/// Options for the schema-validated plugin. There is no `Default`:
/// `api_key` is required.
#[derive(Clone, PartialEq)]
pub struct ConfiguredPluginConfig {
    pub api_key: String,
    pub mode: ProcessingMode,
    pub max_tokens: u32,
    pub temperature: f64,
    pub enable_cache: bool,
    /// Lifetime of a cached response. `None` only when caching is off.
    pub cache_ttl: Option<Duration>,
}

impl fmt::Debug for ConfiguredPluginConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfiguredPluginConfig")
            .field("api_key", &"<redacted>")
            .field("mode", &self.mode)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("enable_cache", &self.enable_cache)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl ConfiguredPluginConfig {
    pub const RECOGNIZED: &'static [&'static str] = &[
        "api_key",
        "mode",
        "max_tokens",
        "temperature",
        "enable_cache",
        "cache_ttl",
    ];

    const API_KEY_PREFIXES: &'static [&'static str] = &["sk-", "api-"];
    const MIN_API_KEY_LEN: usize = 10;
    const MAX_TOKENS: u32 = 10_000;

    /// Defaults for everything but the key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            mode: ProcessingMode::default(),
            max_tokens: 1000,
            temperature: 0.7,
            enable_cache: true,
            cache_ttl: Some(consts::DEFAULT_CACHE_TTL),
        }
    }

    pub fn from_options(options: &Options, strictness: Strictness) -> Result<Self, ConfigError> {
        let reader = OptionReader::new(options, Self::RECOGNIZED, strictness)?;
        let api_key = reader
            .string("api_key")?
            .ok_or_else(|| ConfigError::Missing("api_key".into()))?;
        let defaults = Self::new(api_key);

        let mode = match reader.string("mode")? {
            Some(mode) => mode.parse()?,
            None => defaults.mode,
        };
        let max_tokens = u32::try_from(reader.u64("max_tokens", defaults.max_tokens as u64)?)
            .map_err(|_| ConfigError::invalid("max_tokens", "too large"))?;

        // Absent or null falls back to the default while caching is on.
        let enable_cache = reader.bool("enable_cache", defaults.enable_cache)?;
        let cache_ttl = match reader.get("cache_ttl") {
            Some(_) => Some(Duration::from_secs(reader.u64("cache_ttl", 0)?)),
            None if enable_cache => defaults.cache_ttl,
            None => None,
        };

        let config = Self {
            mode,
            max_tokens,
            temperature: reader.f64("temperature", defaults.temperature)?,
            enable_cache,
            cache_ttl,
            api_key: defaults.api_key,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.chars().count() < Self::MIN_API_KEY_LEN {
            return Err(ConfigError::invalid(
                "api_key",
                format!("must be at least {} characters", Self::MIN_API_KEY_LEN),
            ));
        }
        if !Self::API_KEY_PREFIXES
            .iter()
            .any(|prefix| self.api_key.starts_with(prefix))
        {
            return Err(ConfigError::invalid(
                "api_key",
                "must start with 'sk-' or 'api-'",
            ));
        }
        if !(1..=Self::MAX_TOKENS).contains(&self.max_tokens) {
            return Err(ConfigError::invalid(
                "max_tokens",
                format!("must be between 1 and {}", Self::MAX_TOKENS),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::invalid(
                "temperature",
                "must be between 0.0 and 2.0",
            ));
        }
        if self.enable_cache && self.cache_ttl.is_none() {
            return Err(ConfigError::invalid(
                "cache_ttl",
                "required while enable_cache is on",
            ));
        }
        Ok(())
    }
}
