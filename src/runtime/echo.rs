use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

use super::Operation;

/// What shape of response an [`EchoOperation`] fakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoMode {
    /// `{"query": .., "results": [..], "timestamp": ..}`
    Fetch,
    /// `"processed_<item>"`
    Process,
}

/// A local stand-in for a remote API. Waits `latency`, then answers.
/// Used by the harness when no endpoint is configured.
pub struct EchoOperation {
    latency: Duration,
    mode: EchoMode,
}

impl EchoOperation {
    pub fn fetch() -> Self {
        Self {
            latency: Duration::from_millis(100),
            mode: EchoMode::Fetch,
        }
    }

    pub fn process() -> Self {
        Self {
            latency: Duration::from_millis(50),
            mode: EchoMode::Process,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

fn item_label(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Operation for EchoOperation {
    fn name(&self) -> &str {
        match self.mode {
            EchoMode::Fetch => "echo-fetch",
            EchoMode::Process => "echo-process",
        }
    }

    async fn call(&self, payload: &Value) -> Result<Value> {
        tokio::time::sleep(self.latency).await;
        Ok(match self.mode {
            EchoMode::Fetch => {
                let query = payload.get("query").cloned().unwrap_or_else(|| payload.clone());
                json!({
                    "query": query,
                    "results": ["result1", "result2"],
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                })
            }
            EchoMode::Process => Value::String(format!("processed_{}", item_label(payload))),
        })
    }
}
