use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::Plugin;
use crate::config::{ConfiguredPluginConfig, Options, ProcessingMode, Strictness};
use crate::consts::{CACHE_KEY_CHARS, DEFAULT_CACHE_TTL, truncate_chars};
use crate::context::{Metadata, PluginContext, Stage};
use crate::error::ConfigError;

const STAGES: &[Stage] = &[Stage::Parse, Stage::Think, Stage::Review];

struct CachedResponse {
    message: String,
    stored_at: Instant,
}

/// Response cache. Entries older than the TTL are dropped lazily.
#[derive(Default)]
struct ResponseCache {
    entries: HashMap<String, CachedResponse>,
}

impl ResponseCache {
    fn get(&mut self, key: &str, ttl: Duration) -> Option<String> {
        let expired = match self.entries.get(key) {
            None => return None,
            Some(hit) => hit.stored_at.elapsed() >= ttl,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|hit| hit.message.clone())
    }

    fn insert(&mut self, key: String, message: String, ttl: Duration) {
        self.entries.retain(|_, e| e.stored_at.elapsed() < ttl);
        self.entries.insert(
            key,
            CachedResponse {
                message,
                stored_at: Instant::now(),
            },
        );
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct Inner {
    config: ConfiguredPluginConfig,
    /// `None` while caching is disabled.
    cache: Option<ResponseCache>,
}

/// Point-in-time view of a [`ConfiguredPlugin`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfiguredMetrics {
    pub mode: ProcessingMode,
    pub cache_enabled: bool,
    pub cache_size: usize,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// Runs a mode-dependent number of processing passes over each message
/// and caches the result per stage and message prefix.
pub struct ConfiguredPlugin {
    inner: Mutex<Inner>,
}

impl ConfiguredPlugin {
    pub fn new(config: ConfiguredPluginConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let cache = config.enable_cache.then(ResponseCache::default);
        Ok(Self {
            inner: Mutex::new(Inner { config, cache }),
        })
    }

    pub fn from_options(options: &Options, strictness: Strictness) -> Result<Self, ConfigError> {
        Self::new(ConfiguredPluginConfig::from_options(options, strictness)?)
    }

    /// Swap in a new configuration. The cache is created or dropped when
    /// `enable_cache` flips; otherwise it survives the reload. On error the
    /// old configuration stays in place.
    pub async fn update_config(&self, config: ConfiguredPluginConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let mut inner = self.inner.lock().await;
        match (config.enable_cache, inner.cache.is_some()) {
            (true, false) => inner.cache = Some(ResponseCache::default()),
            (false, true) => inner.cache = None,
            _ => {}
        }
        info!(mode = %config.mode, cache = config.enable_cache, "configuration reloaded");
        inner.config = config;
        Ok(())
    }

    pub async fn update_options(
        &self,
        options: &Options,
        strictness: Strictness,
    ) -> Result<(), ConfigError> {
        self.update_config(ConfiguredPluginConfig::from_options(options, strictness)?)
            .await
    }

    pub async fn config(&self) -> ConfiguredPluginConfig {
        self.inner.lock().await.config.clone()
    }

    pub async fn metrics(&self) -> ConfiguredMetrics {
        let inner = self.inner.lock().await;
        ConfiguredMetrics {
            mode: inner.config.mode,
            cache_enabled: inner.config.enable_cache,
            cache_size: inner.cache.as_ref().map_or(0, ResponseCache::len),
            max_tokens: inner.config.max_tokens,
            temperature: inner.config.temperature,
        }
    }
}

fn cache_key(context: &PluginContext) -> String {
    format!(
        "{}:{}",
        context.stage,
        truncate_chars(&context.message, CACHE_KEY_CHARS)
    )
}

fn process(mode: ProcessingMode, message: &str) -> String {
    (1..=mode.iterations()).fold(message.to_string(), |acc, i| {
        format!("[{} {i}] {acc}", mode.tag())
    })
}

#[async_trait]
impl Plugin for ConfiguredPlugin {
    fn name(&self) -> &str {
        "configured"
    }

    fn supported_stages(&self) -> &[Stage] {
        STAGES
    }

    async fn execute(&self, mut context: PluginContext) -> Result<PluginContext> {
        let mut inner = self.inner.lock().await;
        let Inner { config, cache } = &mut *inner;
        let key = cache_key(&context);
        let ttl = config.cache_ttl.unwrap_or(DEFAULT_CACHE_TTL);

        if let Some(cache) = cache.as_mut()
            && let Some(cached) = cache.get(&key, ttl)
        {
            debug!(key = %key, "cache hit");
            context.message = cached;
            return Ok(context.with("cache_hit", true));
        }

        let result = process(config.mode, &context.message);
        if let Some(cache) = cache.as_mut() {
            cache.insert(key, result.clone(), ttl);
        }

        let mut additions = Metadata::new();
        additions.insert("processing_mode".into(), config.mode.as_str().into());
        additions.insert("iterations_used".into(), config.mode.iterations().into());
        context.message = result;
        Ok(context.merge(additions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(mode: ProcessingMode) -> ConfiguredPluginConfig {
        ConfiguredPluginConfig {
            mode,
            ..ConfiguredPluginConfig::new("sk-test-key-123")
        }
    }

    #[test]
    fn strategies_tag_each_pass() {
        assert_eq!(process(ProcessingMode::Fast, "x"), "[Quick 1] x");
        assert_eq!(
            process(ProcessingMode::Balanced, "x"),
            "[Analysis 3] [Analysis 2] [Analysis 1] x"
        );
        assert!(process(ProcessingMode::Thorough, "x").starts_with("[Deep analysis 5]"));
    }

    #[test]
    fn cache_key_uses_stage_and_prefix() {
        let long = "a".repeat(250);
        let key = cache_key(&PluginContext::new(long, Stage::Parse));
        assert_eq!(key, format!("PARSE:{}", "a".repeat(100)));
    }

    #[tokio::test]
    async fn writes_mode_and_iterations() {
        let plugin = ConfiguredPlugin::new(config(ProcessingMode::Fast)).unwrap();
        let out = plugin
            .execute(PluginContext::new("hi", Stage::Think))
            .await
            .unwrap();
        assert_eq!(out.message, "[Quick 1] hi");
        assert_eq!(out.get("processing_mode"), Some(&json!("fast")));
        assert_eq!(out.get("iterations_used"), Some(&json!(1)));
        assert!(out.get("cache_hit").is_none());
    }

    #[tokio::test]
    async fn second_call_hits_cache() {
        let plugin = ConfiguredPlugin::new(config(ProcessingMode::Balanced)).unwrap();
        let first = plugin
            .execute(PluginContext::new("hi", Stage::Think))
            .await
            .unwrap();
        let second = plugin
            .execute(PluginContext::new("hi", Stage::Think))
            .await
            .unwrap();
        assert_eq!(second.get("cache_hit"), Some(&json!(true)));
        assert_eq!(second.message, first.message);
        assert_eq!(plugin.metrics().await.cache_size, 1);

        let other_stage = plugin
            .execute(PluginContext::new("hi", Stage::Review))
            .await
            .unwrap();
        assert!(other_stage.get("cache_hit").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cached_entries_expire() {
        let plugin = ConfiguredPlugin::new(ConfiguredPluginConfig {
            cache_ttl: Some(Duration::from_secs(10)),
            ..config(ProcessingMode::Fast)
        })
        .unwrap();
        plugin.execute(PluginContext::new("hi", Stage::Think)).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        let hit = plugin.execute(PluginContext::new("hi", Stage::Think)).await.unwrap();
        assert_eq!(hit.get("cache_hit"), Some(&json!(true)));

        tokio::time::advance(Duration::from_secs(2)).await;
        let miss = plugin.execute(PluginContext::new("hi", Stage::Think)).await.unwrap();
        assert!(miss.get("cache_hit").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn null_ttl_still_evicts_stale_entries() {
        let options = match json!({"api_key": "sk-test-key-123", "cache_ttl": null}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let plugin = ConfiguredPlugin::from_options(&options, Strictness::Strict).unwrap();
        for m in ["a", "b", "c"] {
            plugin.execute(PluginContext::new(m, Stage::Think)).await.unwrap();
        }
        assert_eq!(plugin.metrics().await.cache_size, 3);

        tokio::time::advance(DEFAULT_CACHE_TTL).await;
        plugin.execute(PluginContext::new("d", Stage::Think)).await.unwrap();
        assert_eq!(plugin.metrics().await.cache_size, 1);
    }

    #[tokio::test]
    async fn disabled_cache_never_hits() {
        let plugin = ConfiguredPlugin::new(ConfiguredPluginConfig {
            enable_cache: false,
            ..config(ProcessingMode::Fast)
        })
        .unwrap();
        for _ in 0..2 {
            let out = plugin.execute(PluginContext::new("hi", Stage::Think)).await.unwrap();
            assert!(out.get("cache_hit").is_none());
        }
        assert_eq!(plugin.metrics().await.cache_size, 0);
    }

    #[tokio::test]
    async fn update_config_toggles_cache() {
        let plugin = ConfiguredPlugin::new(config(ProcessingMode::Fast)).unwrap();
        plugin.execute(PluginContext::new("hi", Stage::Think)).await.unwrap();
        assert_eq!(plugin.metrics().await.cache_size, 1);

        plugin
            .update_config(ConfiguredPluginConfig {
                enable_cache: false,
                ..config(ProcessingMode::Thorough)
            })
            .await
            .unwrap();
        let metrics = plugin.metrics().await;
        assert!(!metrics.cache_enabled);
        assert_eq!(metrics.cache_size, 0);
        assert_eq!(metrics.mode, ProcessingMode::Thorough);

        plugin.update_config(config(ProcessingMode::Fast)).await.unwrap();
        assert!(plugin.metrics().await.cache_enabled);
    }

    #[tokio::test]
    async fn invalid_update_keeps_old_config() {
        let plugin = ConfiguredPlugin::new(config(ProcessingMode::Fast)).unwrap();
        let bad = json!({"api_key": "nope"});
        assert!(
            plugin
                .update_options(bad.as_object().unwrap(), Strictness::Lenient)
                .await
                .is_err()
        );
        assert_eq!(plugin.metrics().await.mode, ProcessingMode::Fast);
    }
}
