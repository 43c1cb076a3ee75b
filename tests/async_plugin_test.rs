use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use stagecraft::config::AsyncPluginConfig;
use stagecraft::context::{PluginContext, Stage};
use stagecraft::plugins::async_plugin::TIMEOUT_MESSAGE;
use stagecraft::plugins::{AsyncPlugin, ERROR_KEY, Plugin, dispatch};
use stagecraft::runtime::echo::EchoOperation;
use stagecraft::runtime::mock::{Behavior, ScriptedOperation};

fn config() -> AsyncPluginConfig {
    AsyncPluginConfig {
        timeout: Duration::from_secs(1),
        max_retries: 2,
        concurrent_limit: 2,
        ..AsyncPluginConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn fetch_result_is_written() {
    let plugin = AsyncPlugin::new(config(), Arc::new(EchoOperation::fetch())).unwrap();

    let out = dispatch(&plugin, PluginContext::new("weather", Stage::Think)).await;

    let result = out.get("fetch_result").unwrap();
    assert_eq!(result["query"], "weather");
    assert_eq!(result["results"], json!(["result1", "result2"]));
    assert_eq!(out.get("fetch_attempts"), Some(&json!(1)));
    assert!(out.get("fetch_error").is_none());
    assert!(out.get("batch_results").is_none());
}

#[tokio::test(start_paused = true)]
async fn timed_out_fetch_reports_timeout() {
    let op = ScriptedOperation::new().script(
        json!({"query": "slow"}).to_string(),
        Behavior::Delay(Duration::from_secs(10)),
    );
    let plugin = AsyncPlugin::new(config(), Arc::new(op)).unwrap();

    let out = dispatch(&plugin, PluginContext::new("slow", Stage::Do)).await;

    assert_eq!(out.get("fetch_error"), Some(&json!(TIMEOUT_MESSAGE)));
    assert_eq!(out.get("fetch_attempts"), Some(&json!(3)));
    assert!(out.get(ERROR_KEY).is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_reports_error_text() {
    let op = ScriptedOperation::new().script(json!({"query": "bad"}).to_string(), Behavior::AlwaysFail);
    let plugin = AsyncPlugin::new(config(), Arc::new(op)).unwrap();

    let out = dispatch(&plugin, PluginContext::new("bad", Stage::Think)).await;

    let error = out.get("fetch_error").and_then(|v| v.as_str()).unwrap();
    assert!(error.contains("scripted permanent failure"), "{error}");
}

#[tokio::test(start_paused = true)]
async fn batch_items_are_processed_in_order() {
    let batch_op = Arc::new(
        ScriptedOperation::new()
            .with_latency(Duration::from_millis(50))
            .script("b", Behavior::AlwaysFail),
    );
    let plugin = AsyncPlugin::new(
        AsyncPluginConfig {
            enable_batch_processing: true,
            ..config()
        },
        Arc::new(EchoOperation::fetch()),
    )
    .unwrap()
    .with_batch_operation(batch_op.clone());

    let ctx = PluginContext::new("q", Stage::Think).with("items", json!(["a", "b", "c", "d"]));
    let out = dispatch(&plugin, ctx).await;

    let results = out.get("batch_results").and_then(|v| v.as_array()).unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(results[0]["status"], "success");
    assert_eq!(results[0]["value"], "a");
    assert_eq!(results[1]["status"], "failure");
    assert_eq!(results[1]["attempts"], 3);
    assert_eq!(results[3]["value"], "d");
    assert_eq!(
        out.get("batch_summary"),
        Some(&json!({"total": 4, "succeeded": 3, "failed": 1}))
    );
    assert!(batch_op.peak_in_flight() <= 2);
}

#[tokio::test(start_paused = true)]
async fn missing_items_is_an_empty_batch() {
    let plugin = AsyncPlugin::new(
        AsyncPluginConfig {
            enable_batch_processing: true,
            ..config()
        },
        Arc::new(EchoOperation::fetch()),
    )
    .unwrap();

    let out = dispatch(&plugin, PluginContext::new("q", Stage::Think)).await;

    assert_eq!(out.get("batch_results"), Some(&json!([])));
}

#[tokio::test]
async fn non_array_items_is_annotated_not_raised() {
    let plugin = AsyncPlugin::new(
        AsyncPluginConfig {
            enable_batch_processing: true,
            ..config()
        },
        Arc::new(ScriptedOperation::new()),
    )
    .unwrap();

    let ctx = PluginContext::new("q", Stage::Think).with("items", "nope");
    let out = dispatch(&plugin, ctx.clone()).await;

    assert_eq!(out.message, ctx.message);
    assert!(out.get("fetch_result").is_none());
    let err = out.get(ERROR_KEY).unwrap();
    assert_eq!(err["plugin"], "async");
    assert_eq!(err["kind"], "error");
}

#[tokio::test]
async fn unsupported_stage_is_untouched() {
    let op = Arc::new(ScriptedOperation::new());
    let plugin = AsyncPlugin::new(config(), op.clone()).unwrap();

    let ctx = PluginContext::new("q", Stage::Output);
    let out = dispatch(&plugin, ctx.clone()).await;

    assert_eq!(out, ctx);
    assert_eq!(op.total_calls(), 0);
}

#[tokio::test]
async fn fetch_after_shutdown_is_cancelled() {
    let plugin = AsyncPlugin::new(config(), Arc::new(ScriptedOperation::new())).unwrap();
    plugin.shutdown().await;

    let out = dispatch(&plugin, PluginContext::new("q", Stage::Think)).await;

    assert_eq!(out.get("fetch_attempts"), Some(&json!(0)));
    assert!(out.get("fetch_error").is_some());
}
