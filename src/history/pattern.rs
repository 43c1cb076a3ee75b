//! Best-effort pattern detection over the tail of a [`HistoryLog`].
//!
//! These are heuristics for annotating context, not correctness
//! properties. Every threshold lives on [`PatternDetector`] and can be
//! tuned per plugin.
//!
//! Context switch: the newest entry contains a switch phrase, carries a
//! category none of the preceding `switch_window` entries had, or its length
//! differs from their average by more than `length_deviation` of it.
//!
//! Repetition: the newest message (case- and whitespace-insensitive) occurs
//! more than once in the trailing `window`, or the whole window (at least
//! three entries) shares one category.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{HistoryEntry, HistoryLog};
use crate::context::Metadata;

const SWITCH_INDICATORS: &[&str] = &[
    "new topic",
    "different question",
    "change subject",
    "anyway",
    "by the way",
];

/// What a repetition was detected on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepetitionBasis {
    Message,
    Category,
}

/// Why the newest entry looks like a change of subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SwitchTrigger {
    Indicator { phrase: String },
    CategoryChange { from: String, to: String },
    LengthShift { length: usize, average: f64 },
}

/// A pattern found in the trailing window. Derived on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum PatternSignal {
    Repetition {
        basis: RepetitionBasis,
        value: String,
        occurrences: usize,
    },
    ContextSwitch {
        trigger: SwitchTrigger,
    },
}

impl PatternSignal {
    pub fn is_context_switch(&self) -> bool {
        matches!(self, Self::ContextSwitch { .. })
    }
}

/// Coarse flags about recent activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternReport {
    pub repetitive_messages: bool,
    pub unique_messages: bool,
    pub increasing_length: bool,
    pub decreasing_length: bool,
    pub rapid_execution: bool,
}

impl PatternReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Only the flags that are set, as `{flag: true}`.
    pub fn to_metadata(&self) -> Metadata {
        let flags = [
            ("repetitive_messages", self.repetitive_messages),
            ("unique_messages", self.unique_messages),
            ("increasing_length", self.increasing_length),
            ("decreasing_length", self.decreasing_length),
            ("rapid_execution", self.rapid_execution),
        ];
        flags
            .into_iter()
            .filter(|(_, set)| *set)
            .map(|(name, _)| (name.to_string(), true.into()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternDetector {
    /// Entries examined for repetition.
    pub window: usize,
    /// Entries before the newest one compared for a context switch.
    pub switch_window: usize,
    /// Relative length change that counts as a switch.
    pub length_deviation: f64,
    /// Two executions closer than this are "rapid".
    pub rapid_threshold: Duration,
    pub indicators: Vec<String>,
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self {
            window: 5,
            switch_window: 3,
            length_deviation: 0.8,
            rapid_threshold: Duration::from_secs(1),
            indicators: SWITCH_INDICATORS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn normalize(message: &str) -> String {
    message.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn char_len(message: &str) -> usize {
    message.chars().count()
}

impl PatternDetector {
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(2);
        self
    }

    /// The strongest signal for the newest entry. Context switches win
    /// over repetition.
    pub fn detect(&self, log: &HistoryLog) -> Option<PatternSignal> {
        self.detect_switch(log)
            .map(|trigger| PatternSignal::ContextSwitch { trigger })
            .or_else(|| self.detect_repetition(log))
    }

    pub fn detect_switch(&self, log: &HistoryLog) -> Option<SwitchTrigger> {
        if log.len() < 2 {
            return None;
        }
        let latest = log.last()?;
        let preceding: Vec<&HistoryEntry> = log
            .recent(self.switch_window + 1)
            .take(self.switch_window.min(log.len() - 1))
            .collect();

        let lowered = latest.message.to_lowercase();
        if let Some(phrase) = self.indicators.iter().find(|p| lowered.contains(p.as_str())) {
            return Some(SwitchTrigger::Indicator {
                phrase: phrase.clone(),
            });
        }

        if let Some(to) = &latest.category
            && let Some(from) = preceding.iter().rev().find_map(|e| e.category.as_ref())
            && preceding.iter().all(|e| e.category.as_ref() != Some(to))
        {
            return Some(SwitchTrigger::CategoryChange {
                from: from.clone(),
                to: to.clone(),
            });
        }

        let average =
            preceding.iter().map(|e| char_len(&e.message)).sum::<usize>() as f64 / preceding.len() as f64;
        let length = char_len(&latest.message);
        if average > 0.0 && (length as f64 - average).abs() > average * self.length_deviation {
            return Some(SwitchTrigger::LengthShift { length, average });
        }

        None
    }

    pub fn detect_repetition(&self, log: &HistoryLog) -> Option<PatternSignal> {
        let latest = log.last()?;
        let window: Vec<&HistoryEntry> = log.recent(self.window).collect();

        let needle = normalize(&latest.message);
        let occurrences = window
            .iter()
            .filter(|e| normalize(&e.message) == needle)
            .count();
        if occurrences >= 2 {
            return Some(PatternSignal::Repetition {
                basis: RepetitionBasis::Message,
                value: latest.message.clone(),
                occurrences,
            });
        }

        if window.len() >= 3
            && let Some(category) = &latest.category
            && window.iter().all(|e| e.category.as_ref() == Some(category))
        {
            return Some(PatternSignal::Repetition {
                basis: RepetitionBasis::Category,
                value: category.clone(),
                occurrences: window.len(),
            });
        }

        None
    }

    /// Activity flags. Needs at least three entries; `lengths` is the
    /// longer-lived message length memory used for trends.
    pub fn analyze(&self, log: &HistoryLog, lengths: &[usize]) -> PatternReport {
        let mut report = PatternReport::default();
        if log.len() < 3 {
            return report;
        }

        let recent: Vec<String> = log.recent(self.window).map(|e| normalize(&e.message)).collect();
        let mut distinct = recent.clone();
        distinct.sort();
        distinct.dedup();
        if distinct.len() == recent.len() {
            report.unique_messages = true;
        } else {
            report.repetitive_messages = true;
        }

        if lengths.len() >= 3 {
            let recent_avg = lengths[lengths.len() - 3..].iter().sum::<usize>() as f64 / 3.0;
            let overall_avg = lengths.iter().sum::<usize>() as f64 / lengths.len() as f64;
            if recent_avg > overall_avg * 1.5 {
                report.increasing_length = true;
            } else if recent_avg < overall_avg * 0.5 {
                report.decreasing_length = true;
            }
        }

        let mut tail = log.recent(2);
        if let (Some(prev), Some(last)) = (tail.next(), tail.next())
            && let Ok(gap) = (last.timestamp - prev.timestamp).to_std()
            && gap < self.rapid_threshold
        {
            report.rapid_execution = true;
        }

        report
    }
}
