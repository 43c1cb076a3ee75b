use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::backoff::BackoffPolicy;
use super::gate::ConcurrencyGate;
use super::{FailureKind, Operation, OperationOutcome, OperationRequest};
use crate::config::AsyncPluginConfig;
use crate::error::AttemptError;

/// Runs one request to completion: gate, deadline, retry with backoff.
///
/// A slot is held only while the call is in flight. It is released before
/// every backoff sleep and on every exit path.
pub struct OperationRunner {
    operation: Arc<dyn Operation>,
    gate: ConcurrencyGate,
    timeout: Duration,
    backoff: BackoffPolicy,
}

impl OperationRunner {
    pub fn new(
        operation: Arc<dyn Operation>,
        gate: ConcurrencyGate,
        timeout: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            operation,
            gate,
            timeout,
            backoff,
        }
    }

    /// Build a runner with its own gate sized from `config`.
    pub fn from_config(operation: Arc<dyn Operation>, config: &AsyncPluginConfig) -> Self {
        Self::new(
            operation,
            ConcurrencyGate::new(config.concurrent_limit),
            config.timeout,
            config.backoff(),
        )
    }

    /// Same gate and policy, different operation.
    pub fn with_operation(&self, operation: Arc<dyn Operation>) -> Self {
        Self {
            operation,
            gate: self.gate.clone(),
            timeout: self.timeout,
            backoff: self.backoff,
        }
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn operation_name(&self) -> &str {
        self.operation.name()
    }

    pub async fn run(&self, request: OperationRequest) -> OperationOutcome {
        let op = self.operation.name();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let slot = match self.gate.acquire().await {
                Ok(slot) => slot,
                Err(closed) => {
                    debug!(op, id = %request.id, attempt, "gate closed before attempt");
                    return OperationOutcome::Failure {
                        kind: FailureKind::Cancelled,
                        attempts: attempt - 1,
                        error: closed.to_string(),
                        timed_out: false,
                    };
                }
            };
            let result = self.attempt(&request).await;
            slot.release();

            let err = match result {
                Ok(value) => {
                    debug!(op, id = %request.id, attempt, "operation succeeded");
                    return OperationOutcome::Success {
                        value,
                        attempts: attempt,
                    };
                }
                Err(AttemptError::Panicked(msg)) => {
                    warn!(op, id = %request.id, attempt, error = %msg, "operation panicked");
                    return OperationOutcome::Failure {
                        kind: FailureKind::Fault,
                        attempts: attempt,
                        error: msg,
                        timed_out: false,
                    };
                }
                Err(err) => err,
            };

            match self.backoff.next_delay(attempt) {
                Some(delay) => {
                    debug!(
                        op,
                        id = %request.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(
                        op,
                        id = %request.id,
                        attempts = attempt,
                        error = %err,
                        "retries exhausted"
                    );
                    return OperationOutcome::Failure {
                        kind: FailureKind::Exhausted,
                        attempts: attempt,
                        error: err.to_string(),
                        timed_out: err.is_timeout(),
                    };
                }
            }
        }
    }

    /// A single call under the deadline. Panics are caught and reported.
    async fn attempt(&self, request: &OperationRequest) -> Result<Value, AttemptError> {
        let call = AssertUnwindSafe(self.operation.call(&request.payload)).catch_unwind();
        match tokio::time::timeout(self.timeout, call).await {
            Err(_) => Err(AttemptError::Timeout(self.timeout)),
            Ok(Err(panic)) => Err(AttemptError::Panicked(panic_message(panic.as_ref()))),
            Ok(Ok(Err(e))) => Err(AttemptError::Failed(format!("{e:#}"))),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
