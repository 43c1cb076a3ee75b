//! Project-wide constants and defaults.

use std::path::PathBuf;
use std::time::Duration;

/// Per-attempt deadline when `timeout` is not configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_CONCURRENT_LIMIT: usize = 5;

/// First backoff delay; doubles on every further retry.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Ceiling for a single backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

pub const DEFAULT_MAX_HISTORY_SIZE: usize = 100;

/// Appends between automatic saves of the state file.
pub const DEFAULT_PERSIST_EVERY: usize = 10;

/// Trailing entries examined by the pattern detector.
pub const DEFAULT_PATTERN_WINDOW: usize = 5;

/// Entries kept when a context switch clears history.
pub const CONTEXT_SWITCH_KEEP: usize = 10;

/// Message lengths remembered for trend analysis.
pub const MESSAGE_LENGTH_MEMORY: usize = 50;

/// Stage transitions remembered.
pub const STAGE_TRANSITION_MEMORY: usize = 50;

/// Context switch records remembered.
pub const CONTEXT_SWITCH_MEMORY: usize = 20;

/// Schema version written into the state file.
pub const STATE_VERSION: u32 = 1;

/// Oldest state file version that can still be read.
pub const MIN_STATE_VERSION: u32 = 1;

pub const STATE_FILE_NAME: &str = "plugin_state.json";

pub const DEFAULT_SIMPLE_PREFIX: &str = "[SimplePlugin]";

/// Lifetime of a cached response in the configured plugin.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Characters of the message used in a cache key.
pub const CACHE_KEY_CHARS: usize = 100;

/// Default state file: `<data dir>/stagecraft/plugin_state.json`.
/// Falls back to the working directory when no data dir is known.
pub fn default_state_path() -> PathBuf {
    match dirs::data_local_dir() {
        Some(dir) => dir.join("stagecraft").join(STATE_FILE_NAME),
        None => PathBuf::from(STATE_FILE_NAME),
    }
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
