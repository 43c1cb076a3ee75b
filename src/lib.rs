//! Runtime support for stage-driven message plugins: bounded, retrying
//! async calls and a persisted conversation history with pattern
//! detection, plus a few ready-made plugins built on them.

pub mod config;
pub mod consts;
pub mod context;
pub mod error;
pub mod history;
pub mod plugins;
pub mod runtime;
