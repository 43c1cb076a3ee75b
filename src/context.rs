//! The per-message value the host hands to every plugin.
//!
//! Contexts are passed by value: a plugin receives one and returns the
//! updated one. Metadata additions go through [`PluginContext::merge`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Free-form metadata carried alongside the message.
pub type Metadata = serde_json::Map<String, Value>;

/// Processing stages the host can invoke a plugin at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    Input,
    Parse,
    Think,
    Do,
    Review,
    Output,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Input,
        Stage::Parse,
        Stage::Think,
        Stage::Do,
        Stage::Review,
        Stage::Output,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Input => "INPUT",
            Stage::Parse => "PARSE",
            Stage::Think => "THINK",
            Stage::Do => "DO",
            Stage::Review => "REVIEW",
            Stage::Output => "OUTPUT",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginContext {
    pub message: String,
    pub stage: Stage,
    #[serde(default)]
    pub metadata: Metadata,
}

impl PluginContext {
    pub fn new(message: impl Into<String>, stage: Stage) -> Self {
        Self {
            message: message.into(),
            stage,
            metadata: Metadata::new(),
        }
    }

    /// Insert or overwrite a single metadata key.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Merge `additions` into the metadata. Later keys win.
    pub fn merge(mut self, additions: Metadata) -> Self {
        self.metadata.extend(additions);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }
}
