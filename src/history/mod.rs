pub mod pattern;
pub mod persist;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::consts::{CONTEXT_SWITCH_MEMORY, MESSAGE_LENGTH_MEMORY, STAGE_TRANSITION_MEMORY};
use crate::context::Stage;
use pattern::PatternSignal;

/// Who produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One recorded interaction. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub stage: Stage,
    pub message: String,
    /// Topic label extracted from the context, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub execution_number: u64,
}

impl HistoryEntry {
    pub fn new(role: Role, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            role,
            stage,
            message: message.into(),
            category: None,
            execution_number: 0,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_execution_number(mut self, n: u64) -> Self {
        self.execution_number = n;
        self
    }
}

/// Ordered, size-capped log of past interactions. Oldest entries are
/// evicted first once `max_size` is reached.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryLog {
    entries: VecDeque<HistoryEntry>,
    max_size: usize,
}

impl HistoryLog {
    /// `max_size` is clamped to at least one entry.
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            entries: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Rebuild a log from stored entries, keeping only the newest
    /// `max_size` of them.
    pub fn from_entries(entries: Vec<HistoryEntry>, max_size: usize) -> Self {
        let mut log = Self::new(max_size);
        for entry in entries {
            log.append(entry);
        }
        log
    }

    /// Append an entry, returning the one evicted to make room.
    pub fn append(&mut self, entry: HistoryEntry) -> Option<HistoryEntry> {
        let evicted = if self.entries.len() >= self.max_size {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// All entries, most recent last.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &HistoryEntry> + ExactSizeIterator {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    /// The last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().skip(self.entries.len().saturating_sub(n))
    }

    /// Drop everything but the last `n` entries.
    pub fn retain_recent(&mut self, n: usize) {
        while self.entries.len() > n {
            self.entries.pop_front();
        }
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A recorded change of subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchRecord {
    pub timestamp: DateTime<Utc>,
    /// History length when the switch was seen.
    pub previous_context_size: usize,
    /// First 100 characters of the triggering message.
    pub trigger_message: String,
}

fn push_capped<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    queue.push_back(item);
    while queue.len() > cap {
        queue.pop_front();
    }
}

/// Longer-lived facts kept next to the history log. Every slot is capped,
/// oldest dropped first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextMemory {
    /// Character counts of recent messages, oldest first.
    pub message_lengths: VecDeque<usize>,
    /// Stages in the order they were entered, consecutive duplicates folded.
    pub stage_transitions: VecDeque<Stage>,
    pub context_switches: VecDeque<SwitchRecord>,
}

impl ContextMemory {
    pub fn record_message(&mut self, message: &str, stage: Stage) {
        push_capped(
            &mut self.message_lengths,
            message.chars().count(),
            MESSAGE_LENGTH_MEMORY,
        );
        if self.stage_transitions.back() != Some(&stage) {
            push_capped(&mut self.stage_transitions, stage, STAGE_TRANSITION_MEMORY);
        }
    }

    pub fn record_switch(&mut self, record: SwitchRecord) {
        push_capped(&mut self.context_switches, record, CONTEXT_SWITCH_MEMORY);
    }

    /// Re-apply the caps, for memory read from an older or hand-edited file.
    pub fn trim(&mut self) {
        self.message_lengths
            .drain(..self.message_lengths.len().saturating_sub(MESSAGE_LENGTH_MEMORY));
        self.stage_transitions
            .drain(..self.stage_transitions.len().saturating_sub(STAGE_TRANSITION_MEMORY));
        self.context_switches
            .drain(..self.context_switches.len().saturating_sub(CONTEXT_SWITCH_MEMORY));
    }

    pub fn lengths(&self) -> Vec<usize> {
        self.message_lengths.iter().copied().collect()
    }

    /// Names of the memory slots that hold anything.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if !self.message_lengths.is_empty() {
            keys.push("message_lengths".to_string());
        }
        if !self.stage_transitions.is_empty() {
            keys.push("stage_transitions".to_string());
        }
        if !self.context_switches.is_empty() {
            keys.push("context_switches".to_string());
        }
        keys
    }
}

/// Read-only snapshot of a stateful plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSummary {
    pub execution_count: u64,
    pub history_size: usize,
    pub context_switches: usize,
    pub last_execution: Option<DateTime<Utc>>,
    pub recent: Vec<HistoryEntry>,
    pub signal: Option<PatternSignal>,
    pub memory_keys: Vec<String>,
}
