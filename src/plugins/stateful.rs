use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::Plugin;
use crate::config::{Options, StatefulPluginConfig, Strictness};
use crate::consts::{CONTEXT_SWITCH_KEEP, truncate_chars};
use crate::context::{Metadata, PluginContext, Stage};
use crate::error::{ConfigError, PersistenceError};
use crate::history::pattern::{PatternDetector, PatternSignal};
use crate::history::persist::{PersistedState, StateFile};
use crate::history::{ContextMemory, HistoryEntry, HistoryLog, Role, StateSummary, SwitchRecord};

const STAGES: &[Stage] = &[Stage::Think, Stage::Review];

/// Entries included in a [`StateSummary`].
const SUMMARY_RECENT: usize = 5;

/// Everything the plugin remembers between messages.
struct SessionState {
    log: HistoryLog,
    memory: ContextMemory,
    execution_count: u64,
    last_execution: Option<DateTime<Utc>>,
    /// Appends since the last successful save.
    unsaved: usize,
}

impl SessionState {
    fn fresh(max_history_size: usize) -> Self {
        Self {
            log: HistoryLog::new(max_history_size),
            memory: ContextMemory::default(),
            execution_count: 0,
            last_execution: None,
            unsaved: 0,
        }
    }

    fn restore(saved: PersistedState, max_history_size: usize) -> Self {
        let mut memory = saved.memory.clone();
        memory.trim();
        Self {
            log: saved.to_log(max_history_size),
            memory,
            execution_count: saved.execution_count,
            last_execution: saved.last_execution,
            unsaved: 0,
        }
    }

    fn snapshot(&self) -> PersistedState {
        PersistedState::new(
            &self.log,
            &self.memory,
            self.execution_count,
            self.last_execution,
        )
    }
}

/// Keeps a bounded history of the conversation, flags repetition and
/// changes of subject, and optionally persists itself to disk.
///
/// State is confined to this instance behind an async mutex, so the host
/// may call `execute` sequentially or concurrently. Saves snapshot the state
/// under that mutex and write it on the blocking pool after releasing it.
pub struct StatefulPlugin {
    config: StatefulPluginConfig,
    detector: PatternDetector,
    store: Option<StateFile>,
    state: Mutex<SessionState>,
    /// Held from snapshot to rename so writes land in snapshot order.
    writer: Mutex<()>,
}

impl StatefulPlugin {
    /// Loads saved state when persistence is enabled. A missing or broken
    /// state file starts the plugin empty; it never fails construction.
    pub fn new(config: StatefulPluginConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let store = config
            .enable_persistence
            .then(|| StateFile::new(&config.state_file));

        let state = match store.as_ref().and_then(StateFile::load) {
            Some(saved) => {
                info!(
                    path = %config.state_file.display(),
                    entries = saved.entries.len(),
                    executions = saved.execution_count,
                    "restored plugin state"
                );
                SessionState::restore(saved, config.max_history_size)
            }
            None => SessionState::fresh(config.max_history_size),
        };

        Ok(Self {
            detector: PatternDetector::default().with_window(config.pattern_window),
            config,
            store,
            state: Mutex::new(state),
            writer: Mutex::new(()),
        })
    }

    pub fn from_options(options: &Options, strictness: Strictness) -> Result<Self, ConfigError> {
        Self::new(StatefulPluginConfig::from_options(options, strictness)?)
    }

    pub fn config(&self) -> &StatefulPluginConfig {
        &self.config
    }

    /// Swap the pattern heuristics.
    pub fn with_detector(mut self, detector: PatternDetector) -> Self {
        self.detector = detector;
        self
    }

    /// History, most recent last.
    pub async fn entries(&self) -> Vec<HistoryEntry> {
        self.state.lock().await.log.to_vec()
    }

    pub async fn execution_count(&self) -> u64 {
        self.state.lock().await.execution_count
    }

    /// Re-run pattern detection over the current history.
    pub async fn detect_pattern(&self) -> Option<PatternSignal> {
        let state = self.state.lock().await;
        self.detector.detect(&state.log)
    }

    pub async fn state_summary(&self) -> StateSummary {
        let state = self.state.lock().await;
        StateSummary {
            execution_count: state.execution_count,
            history_size: state.log.len(),
            context_switches: state.memory.context_switches.len(),
            last_execution: state.last_execution,
            recent: state.log.recent(SUMMARY_RECENT).cloned().collect(),
            signal: self.detector.detect(&state.log),
            memory_keys: state.memory.keys(),
        }
    }

    /// Save now, regardless of how many appends are pending. No-op when
    /// persistence is disabled.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let state = self.state.lock().await;
        self.persist(state).await
    }

    /// Forget everything. The empty state is saved if persistence is on.
    pub async fn clear_state(&self) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        *state = SessionState::fresh(self.config.max_history_size);
        debug!("plugin state cleared");
        self.persist(state).await
    }

    /// Snapshot under `state`, release it, then write. Appends made while
    /// the write runs stay pending for the next save.
    async fn persist(&self, state: MutexGuard<'_, SessionState>) -> Result<(), PersistenceError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let writer = self.writer.lock().await;
        let snapshot = state.snapshot();
        let pending = state.unsaved;
        drop(state);

        let result = store.save_async(snapshot).await;
        drop(writer);

        match result {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.unsaved = state.unsaved.saturating_sub(pending);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, pending, "failed to save plugin state");
                Err(e)
            }
        }
    }

    fn handle_context_switch(&self, state: &mut SessionState, message: &str) {
        state.memory.record_switch(SwitchRecord {
            timestamp: Utc::now(),
            previous_context_size: state.log.len(),
            trigger_message: truncate_chars(message, 100).to_string(),
        });
        if self.config.clear_on_context_switch {
            state.log.retain_recent(CONTEXT_SWITCH_KEEP);
        }
    }
}

fn string_field(context: &PluginContext, key: &str) -> Option<String> {
    context.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Role from `metadata.role`; anything unrecognized counts as the user.
fn role_of(context: &PluginContext) -> Role {
    match context.get("role").and_then(Value::as_str) {
        Some("assistant") => Role::Assistant,
        Some("system") => Role::System,
        _ => Role::User,
    }
}

#[async_trait]
impl Plugin for StatefulPlugin {
    fn name(&self) -> &str {
        "stateful"
    }

    fn supported_stages(&self) -> &[Stage] {
        STAGES
    }

    async fn execute(&self, context: PluginContext) -> Result<PluginContext> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        state.execution_count += 1;
        let time_since_last = state
            .last_execution
            .map(|last| (now - last).num_milliseconds() as f64 / 1000.0);
        state.last_execution = Some(now);

        let mut entry = HistoryEntry::new(role_of(&context), context.stage, &context.message)
            .with_timestamp(now)
            .with_execution_number(state.execution_count);
        if let Some(category) =
            string_field(&context, "category").or_else(|| string_field(&context, "topic"))
        {
            entry = entry.with_category(category);
        }
        state.log.append(entry);
        state.memory.record_message(&context.message, context.stage);
        state.unsaved += 1;

        let report = self.detector.analyze(&state.log, &state.memory.lengths());
        let signal = self.detector.detect(&state.log);

        let mut additions = Metadata::new();
        additions.insert("execution_count".into(), state.execution_count.into());
        additions.insert("time_since_last".into(), time_since_last.into());
        if !report.is_empty() {
            additions.insert("detected_patterns".into(), Value::Object(report.to_metadata()));
        }
        if let Some(signal) = &signal {
            additions.insert("pattern_signal".into(), serde_json::to_value(signal)?);
            if signal.is_context_switch() {
                debug!(execution = state.execution_count, "context switch detected");
                additions.insert("context_switch_detected".into(), true.into());
                self.handle_context_switch(&mut state, &context.message);
            }
        }
        additions.insert("history_size".into(), state.log.len().into());

        if self.store.is_some()
            && state.unsaved >= self.config.persist_every
            && let Err(e) = self.persist(state).await
        {
            additions.insert("state_save_error".into(), e.to_string().into());
        }

        Ok(context.merge(additions))
    }

    async fn shutdown(&self) {
        if let Err(e) = self.flush().await {
            warn!(error = %e, "state not saved on shutdown");
        }
    }
}
