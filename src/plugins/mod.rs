//! Plugins the host calls once per message.
//!
//! Every plugin implements [`Plugin`]. Hosts should call plugins through
//! [`dispatch`], which skips unsupported stages and guarantees a context
//! comes back even when the plugin errors or panics.

pub mod async_plugin;
pub mod configured;
pub mod simple;
pub mod stateful;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use tracing::{debug, warn};

use crate::context::{PluginContext, Stage};
use crate::runtime::runner::panic_message;

pub use async_plugin::AsyncPlugin;
pub use configured::ConfiguredPlugin;
pub use simple::SimplePlugin;
pub use stateful::StatefulPlugin;

/// Metadata key carrying a fault caught at the plugin boundary.
pub const ERROR_KEY: &str = "plugin_error";

/// A message-processing plugin.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique name, used in logs and error annotations.
    fn name(&self) -> &str;

    /// Stages this plugin acts on. Anything else is passed through.
    fn supported_stages(&self) -> &[Stage];

    fn supports(&self, stage: Stage) -> bool {
        self.supported_stages().contains(&stage)
    }

    /// Process one message. Errors are turned into annotations by
    /// [`dispatch`]; they never reach the host.
    async fn execute(&self, context: PluginContext) -> Result<PluginContext>;

    /// Host-driven teardown. Flush state, release resources.
    async fn shutdown(&self) {}
}

/// Run `plugin` on `context` the way the host expects: unsupported
/// stages pass through untouched, and any error or panic leaves the
/// original context annotated under [`ERROR_KEY`].
pub async fn dispatch(plugin: &dyn Plugin, context: PluginContext) -> PluginContext {
    if !plugin.supports(context.stage) {
        debug!(plugin = plugin.name(), stage = %context.stage, "stage not supported, passing through");
        return context;
    }

    let fallback = context.clone();
    let result = AssertUnwindSafe(plugin.execute(context)).catch_unwind().await;

    let (kind, message) = match result {
        Ok(Ok(updated)) => return updated,
        Ok(Err(e)) => ("error", format!("{e:#}")),
        Err(panic) => ("panic", panic_message(panic.as_ref())),
    };

    warn!(plugin = plugin.name(), kind, error = %message, "plugin failed, returning context unchanged");
    fallback.with(
        ERROR_KEY,
        json!({
            "plugin": plugin.name(),
            "kind": kind,
            "message": message,
        }),
    )
}
