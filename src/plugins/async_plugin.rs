use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use super::Plugin;
use crate::config::{AsyncPluginConfig, Options, Strictness};
use crate::context::{Metadata, PluginContext, Stage};
use crate::error::ConfigError;
use crate::runtime::batch::{BatchCoordinator, BatchReport};
use crate::runtime::gate::ConcurrencyGate;
use crate::runtime::runner::OperationRunner;
use crate::runtime::{Operation, OperationOutcome, OperationRequest};

const STAGES: &[Stage] = &[Stage::Think, Stage::Do];

/// Text written to `fetch_error` when the final attempt hit the deadline.
pub const TIMEOUT_MESSAGE: &str = "Operation timed out";

/// Calls an external operation for every message and, when batching is
/// enabled, fans `metadata.items` out through the same bounded runtime.
pub struct AsyncPlugin {
    config: AsyncPluginConfig,
    runner: Arc<OperationRunner>,
    batch: BatchCoordinator,
}

impl AsyncPlugin {
    /// Fetch and batch items both go through `operation`.
    pub fn new(config: AsyncPluginConfig, operation: Arc<dyn Operation>) -> Result<Self, ConfigError> {
        config.validate()?;
        let runner = Arc::new(OperationRunner::from_config(operation, &config));
        let batch = BatchCoordinator::new(Arc::clone(&runner));
        Ok(Self {
            config,
            runner,
            batch,
        })
    }

    pub fn from_options(
        options: &Options,
        strictness: Strictness,
        operation: Arc<dyn Operation>,
    ) -> Result<Self, ConfigError> {
        Self::new(AsyncPluginConfig::from_options(options, strictness)?, operation)
    }

    /// Send batch items to a different operation. The concurrency gate
    /// stays shared with fetches.
    pub fn with_batch_operation(mut self, operation: Arc<dyn Operation>) -> Self {
        self.batch = BatchCoordinator::new(Arc::new(self.runner.with_operation(operation)));
        self
    }

    pub fn config(&self) -> &AsyncPluginConfig {
        &self.config
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        self.runner.gate()
    }

    pub async fn fetch(&self, query: &str) -> OperationOutcome {
        self.runner
            .run(OperationRequest::new("fetch", json!({ "query": query })))
            .await
    }

    /// One outcome per item, in item order.
    pub async fn process_batch(&self, items: Vec<Value>) -> Vec<OperationOutcome> {
        let requests = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| OperationRequest::new(format!("item-{i}"), item))
            .collect();
        self.batch.run_batch(requests).await
    }

    fn batch_items(&self, context: &PluginContext) -> Result<Option<Vec<Value>>> {
        if !self.config.enable_batch_processing {
            return Ok(None);
        }
        match context.get("items") {
            None | Some(Value::Null) => Ok(Some(Vec::new())),
            Some(Value::Array(items)) => Ok(Some(items.clone())),
            Some(other) => bail!("`items` must be an array, got {other}"),
        }
    }
}

#[async_trait]
impl Plugin for AsyncPlugin {
    fn name(&self) -> &str {
        "async"
    }

    fn supported_stages(&self) -> &[Stage] {
        STAGES
    }

    async fn execute(&self, context: PluginContext) -> Result<PluginContext> {
        let items = self.batch_items(&context)?;
        let mut additions = Metadata::new();

        let fetched = self.fetch(&context.message).await;
        additions.insert("fetch_attempts".into(), fetched.attempts().into());
        match fetched {
            OperationOutcome::Success { value, .. } => {
                additions.insert("fetch_result".into(), value);
            }
            OperationOutcome::Failure {
                error, timed_out, ..
            } => {
                let message = if timed_out {
                    TIMEOUT_MESSAGE.to_string()
                } else {
                    error
                };
                additions.insert("fetch_error".into(), message.into());
            }
        }

        if let Some(items) = items {
            let started = Instant::now();
            let outcomes = self.process_batch(items).await;
            let report = BatchReport::from(outcomes.as_slice());
            debug!(
                total = report.total,
                failed = report.failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "batch finished"
            );

            additions.insert(
                "batch_results".into(),
                outcomes.iter().map(OperationOutcome::to_json).collect(),
            );
            additions.insert("batch_summary".into(), serde_json::to_value(report)?);
            additions.insert(
                "batch_elapsed_ms".into(),
                (started.elapsed().as_millis() as u64).into(),
            );
        }

        Ok(context.merge(additions))
    }

    async fn shutdown(&self) {
        self.runner.gate().close();
    }
}
