use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use super::Operation;

/// How a [`ScriptedOperation`] responds to one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    /// Echo the payload back.
    Succeed,
    /// Fail the first `n` calls, then echo.
    FailTimes(u32),
    /// Fail every call.
    AlwaysFail,
    /// Sleep, then echo.
    Delay(Duration),
    /// Panic inside the call.
    Panic,
}

/// A scripted operation for tests. Payloads are matched by their string
/// form; anything unscripted echoes back after the base latency.
///
/// Records every call so tests can check attempt counts, timing between
/// attempts, and the peak number of calls in flight.
pub struct ScriptedOperation {
    latency: Duration,
    script: HashMap<String, Behavior>,
    calls: Mutex<HashMap<String, Vec<Instant>>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for ScriptedOperation {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedOperation {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            script: HashMap::new(),
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Latency applied to every call before its behavior runs.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn script(mut self, key: impl Into<String>, behavior: Behavior) -> Self {
        self.script.insert(key.into(), behavior);
        self
    }

    /// Number of calls seen for `key`.
    pub fn calls(&self, key: &str) -> usize {
        self.call_times(key).len()
    }

    /// When each call for `key` started.
    pub fn call_times(&self, key: &str) -> Vec<Instant> {
        self.lock_calls().get(key).cloned().unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.lock_calls().values().map(Vec::len).sum()
    }

    /// Highest number of calls that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Instant>>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key_for(payload: &Value) -> String {
        match payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Decrements the in-flight counter even when the call is cancelled.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Operation for ScriptedOperation {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn call(&self, payload: &Value) -> Result<Value> {
        let key = Self::key_for(payload);
        let call_number = {
            let mut calls = self.lock_calls();
            let times = calls.entry(key.clone()).or_default();
            times.push(Instant::now());
            times.len() as u32
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.script.get(&key).unwrap_or(&Behavior::Succeed) {
            Behavior::Succeed => Ok(payload.clone()),
            Behavior::FailTimes(n) if call_number <= *n => {
                bail!("scripted failure {call_number}/{n} for {key}")
            }
            Behavior::FailTimes(_) => Ok(payload.clone()),
            Behavior::AlwaysFail => bail!("scripted permanent failure for {key}"),
            Behavior::Delay(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(payload.clone())
            }
            Behavior::Panic => panic!("scripted panic for {key}"),
        }
    }
}
