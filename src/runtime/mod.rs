//! Bounded, retrying execution of external calls.
//!
//! An [`Operation`] is the capability a plugin is handed at construction:
//! something async that maps a JSON payload to a JSON result. The
//! [`runner::OperationRunner`] wraps it with a deadline, retries and a
//! [`gate::ConcurrencyGate`]; [`batch::BatchCoordinator`] fans many requests
//! through one runner.

pub mod backoff;
pub mod batch;
pub mod echo;
pub mod gate;
pub mod http;
pub mod mock;
pub mod runner;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An external call the runtime can drive. Could be an HTTP API, a model
/// client, or a test script.
#[async_trait]
pub trait Operation: Send + Sync {
    fn name(&self) -> &str;
    async fn call(&self, payload: &Value) -> Result<Value>;
}

/// One unit of work for the runner.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub id: String,
    pub payload: Value,
}

impl OperationRequest {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Why a request ended without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Every allowed attempt failed or timed out.
    Exhausted,
    /// The operation panicked. Not retried.
    Fault,
    /// The gate closed before a slot was granted.
    Cancelled,
}

/// Final result of a request after all retries. Errors are information,
/// not failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationOutcome {
    Success {
        value: Value,
        attempts: u32,
    },
    Failure {
        kind: FailureKind,
        attempts: u32,
        error: String,
        #[serde(default)]
        timed_out: bool,
    },
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } | Self::Failure { attempts, .. } => *attempts,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Success { value, .. } => Some(value),
            Self::Failure { .. } => None,
        }
    }

    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }

    /// JSON form written into context metadata.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
