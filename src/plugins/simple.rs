use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::Plugin;
use crate::config::{Options, SimplePluginConfig, Strictness};
use crate::context::{PluginContext, Stage};
use crate::error::ConfigError;

const STAGES: &[Stage] = &[Stage::Input, Stage::Output];

/// Marks every message it sees and can optionally log or prefix it.
pub struct SimplePlugin {
    config: SimplePluginConfig,
}

impl SimplePlugin {
    pub fn new(config: SimplePluginConfig) -> Self {
        Self { config }
    }

    pub fn from_options(options: &Options, strictness: Strictness) -> Result<Self, ConfigError> {
        SimplePluginConfig::from_options(options, strictness).map(Self::new)
    }

    pub fn config(&self) -> &SimplePluginConfig {
        &self.config
    }
}

impl Default for SimplePlugin {
    fn default() -> Self {
        Self::new(SimplePluginConfig::default())
    }
}

#[async_trait]
impl Plugin for SimplePlugin {
    fn name(&self) -> &str {
        "simple"
    }

    fn supported_stages(&self) -> &[Stage] {
        STAGES
    }

    async fn execute(&self, mut context: PluginContext) -> Result<PluginContext> {
        if self.config.log_messages {
            info!(prefix = %self.config.prefix, stage = %context.stage, message = %context.message, "processing");
        }
        if self.config.add_prefix {
            context.message = format!("{} {}", self.config.prefix, context.message);
        }
        Ok(context.with("simple_plugin_executed", true))
    }
}
