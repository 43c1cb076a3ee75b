use std::fs;
use std::path::PathBuf;

use futures::future::join_all;
use serde_json::{Value, json};

use stagecraft::config::StatefulPluginConfig;
use stagecraft::consts::{CONTEXT_SWITCH_MEMORY, STAGE_TRANSITION_MEMORY};
use stagecraft::context::{PluginContext, Stage};
use stagecraft::plugins::{ERROR_KEY, Plugin, StatefulPlugin, dispatch};

fn persistent(path: PathBuf, persist_every: usize) -> StatefulPluginConfig {
    StatefulPluginConfig {
        enable_persistence: true,
        state_file: path,
        persist_every,
        ..StatefulPluginConfig::default()
    }
}

#[tokio::test]
async fn history_is_capped_across_executions() {
    let plugin = StatefulPlugin::new(StatefulPluginConfig {
        max_history_size: 3,
        ..StatefulPluginConfig::default()
    })
    .unwrap();

    for m in ["a", "b", "c", "d", "e"] {
        dispatch(&plugin, PluginContext::new(m, Stage::Think)).await;
    }

    let messages: Vec<_> = plugin.entries().await.into_iter().map(|e| e.message).collect();
    assert_eq!(messages, ["c", "d", "e"]);
    let summary = plugin.state_summary().await;
    assert_eq!(summary.execution_count, 5);
    assert_eq!(summary.history_size, 3);
}

#[tokio::test]
async fn execution_metadata_is_written() {
    let plugin = StatefulPlugin::new(StatefulPluginConfig::default()).unwrap();

    for m in ["first", "second"] {
        dispatch(&plugin, PluginContext::new(m, Stage::Review)).await;
    }
    let out = dispatch(&plugin, PluginContext::new("second", Stage::Think)).await;

    assert_eq!(out.get("execution_count"), Some(&json!(3)));
    assert_eq!(out.get("history_size"), Some(&json!(3)));
    assert!(out.get("time_since_last").unwrap().is_number());
    assert_eq!(out.get("detected_patterns").unwrap()["repetitive_messages"], true);
    assert_eq!(out.get("pattern_signal").unwrap()["signal"], "repetition");
    assert!(out.get("context_switch_detected").is_none());
}

#[tokio::test]
async fn unsupported_stage_does_not_record() {
    let plugin = StatefulPlugin::new(StatefulPluginConfig::default()).unwrap();
    let ctx = PluginContext::new("hi", Stage::Input);

    assert_eq!(dispatch(&plugin, ctx.clone()).await, ctx);
    assert!(plugin.entries().await.is_empty());
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let plugin = StatefulPlugin::new(persistent(path.clone(), 100)).unwrap();
    for m in ["one", "two", "three"] {
        dispatch(&plugin, PluginContext::new(m, Stage::Think)).await;
    }
    assert!(!path.exists());
    plugin.shutdown().await;
    assert!(path.exists());

    let reloaded = StatefulPlugin::new(persistent(path, 100)).unwrap();
    let messages: Vec<_> = reloaded.entries().await.into_iter().map(|e| e.message).collect();
    assert_eq!(messages, ["one", "two", "three"]);
    assert_eq!(reloaded.execution_count().await, 3);
}

#[tokio::test]
async fn saves_every_n_appends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let plugin = StatefulPlugin::new(persistent(path.clone(), 2)).unwrap();

    dispatch(&plugin, PluginContext::new("one", Stage::Think)).await;
    assert!(!path.exists());
    dispatch(&plugin, PluginContext::new("two", Stage::Think)).await;
    assert!(path.exists());
}

#[tokio::test]
async fn corrupt_state_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    fs::write(&path, "{\"version\": 1, \"entries\": [tru").unwrap();

    let plugin = StatefulPlugin::new(persistent(path, 10)).unwrap();

    assert!(plugin.entries().await.is_empty());
    assert_eq!(plugin.execution_count().await, 0);
}

#[tokio::test]
async fn failed_save_is_annotated_and_history_kept() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, "file").unwrap();
    let plugin = StatefulPlugin::new(persistent(blocker.join("state.json"), 1)).unwrap();

    let out = dispatch(&plugin, PluginContext::new("hello", Stage::Think)).await;

    assert!(out.get("state_save_error").is_some());
    assert!(out.get(ERROR_KEY).is_none());
    assert_eq!(out.get("history_size"), Some(&json!(1)));
    assert_eq!(plugin.entries().await.len(), 1);
    assert!(plugin.flush().await.is_err());
}

#[tokio::test]
async fn clear_state_persists_empty_history() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let plugin = StatefulPlugin::new(persistent(path.clone(), 1)).unwrap();
    dispatch(&plugin, PluginContext::new("hello", Stage::Think)).await;

    plugin.clear_state().await.unwrap();

    assert!(plugin.entries().await.is_empty());
    let reloaded = StatefulPlugin::new(persistent(path, 1)).unwrap();
    assert!(reloaded.entries().await.is_empty());
}

#[tokio::test]
async fn category_change_is_a_context_switch() {
    let plugin = StatefulPlugin::new(StatefulPluginConfig::default()).unwrap();
    for m in ["knead the dough", "proof overnight"] {
        dispatch(&plugin, PluginContext::new(m, Stage::Think).with("category", "baking")).await;
    }

    let out = dispatch(
        &plugin,
        PluginContext::new("rotate the tyres", Stage::Think).with("category", "cars"),
    )
    .await;

    assert_eq!(out.get("context_switch_detected"), Some(&json!(true)));
    assert_eq!(out.get("pattern_signal").unwrap()["trigger"]["reason"], "category_change");
    let summary = plugin.state_summary().await;
    assert_eq!(summary.context_switches, 1);
    assert!(summary.memory_keys.contains(&"context_switches".to_string()));
}

#[tokio::test]
async fn long_sessions_keep_memory_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let config = StatefulPluginConfig {
        max_history_size: 3,
        ..persistent(path.clone(), 100_000)
    };
    let plugin = StatefulPlugin::new(config.clone()).unwrap();

    for i in 0..200 {
        let stage = if i % 2 == 0 { Stage::Think } else { Stage::Review };
        let ctx = PluginContext::new(format!("message {i}"), stage)
            .with("category", format!("topic {i}"));
        dispatch(&plugin, ctx).await;
    }
    plugin.flush().await.unwrap();

    let saved: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(saved["entries"].as_array().unwrap().len(), 3);
    let memory = &saved["memory"];
    assert_eq!(memory["stage_transitions"].as_array().unwrap().len(), STAGE_TRANSITION_MEMORY);
    assert_eq!(memory["context_switches"].as_array().unwrap().len(), CONTEXT_SWITCH_MEMORY);

    let reloaded = StatefulPlugin::new(config).unwrap();
    assert_eq!(reloaded.state_summary().await.context_switches, CONTEXT_SWITCH_MEMORY);
}

#[tokio::test]
async fn concurrent_executions_are_all_counted() {
    let plugin = StatefulPlugin::new(StatefulPluginConfig {
        max_history_size: 5,
        ..StatefulPluginConfig::default()
    })
    .unwrap();

    let outputs = join_all(
        (0..20).map(|i| dispatch(&plugin, PluginContext::new(format!("m{i}"), Stage::Think))),
    )
    .await;

    assert!(outputs.iter().all(|out| out.get(ERROR_KEY).is_none()));
    assert_eq!(plugin.execution_count().await, 20);
    let entries = plugin.entries().await;
    assert_eq!(entries.len(), 5);
    let numbers: Vec<_> = entries.iter().map(|e| e.execution_number).collect();
    assert_eq!(numbers, [16, 17, 18, 19, 20]);
}

#[tokio::test]
async fn concurrent_saves_leave_the_newest_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let plugin = StatefulPlugin::new(persistent(path.clone(), 1)).unwrap();

    join_all((0..10).map(|i| dispatch(&plugin, PluginContext::new(format!("m{i}"), Stage::Think))))
        .await;
    plugin.flush().await.unwrap();

    let reloaded = StatefulPlugin::new(persistent(path, 1)).unwrap();
    assert_eq!(reloaded.execution_count().await, 10);
    assert_eq!(reloaded.entries().await.len(), 10);
}
