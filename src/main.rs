use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stagecraft::config::{Options, Strictness};
use stagecraft::context::{PluginContext, Stage};
use stagecraft::plugins::{
    AsyncPlugin, ConfiguredPlugin, Plugin, SimplePlugin, StatefulPlugin, dispatch,
};
use stagecraft::runtime::Operation;
use stagecraft::runtime::echo::EchoOperation;
use stagecraft::runtime::http::HttpOperation;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PluginKind {
    Simple,
    Async,
    Stateful,
    Configured,
}

#[derive(Parser)]
#[command(
    name = "stagecraft",
    version,
    about = "Feed stdin lines through a single plugin and print the resulting contexts."
)]
struct Cli {
    /// Plugin to run
    #[arg(short, long, value_enum, default_value_t = PluginKind::Simple)]
    plugin: PluginKind,

    /// Stage to run at (defaults to the plugin's first supported stage)
    #[arg(short, long)]
    stage: Option<Stage>,

    /// JSON file holding the plugin's option mapping
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reject unrecognized options instead of ignoring them
    #[arg(long, default_value_t = false)]
    strict: bool,

    /// HTTP endpoint for the async plugin (default: local echo)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Bearer token sent to --endpoint
    #[arg(long, requires = "endpoint")]
    token: Option<String>,

    /// Extra header sent to --endpoint, as NAME=VALUE (repeatable)
    #[arg(long = "header", value_name = "NAME=VALUE", requires = "endpoint")]
    headers: Vec<String>,

    /// Treat each input line as a JSON context instead of plain text
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn load_options(path: Option<&Path>) -> anyhow::Result<Options> {
    let Some(path) = path else {
        return Ok(Options::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("config {} is not valid JSON", path.display()))?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => bail!("config {} must be a JSON object", path.display()),
    }
}

fn parse_header(raw: &str) -> anyhow::Result<(&str, &str)> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value.trim())),
        _ => bail!("header '{raw}' must look like NAME=VALUE"),
    }
}

fn build_plugin(cli: &Cli, options: &Options) -> anyhow::Result<Arc<dyn Plugin>> {
    let strictness = if cli.strict {
        Strictness::Strict
    } else {
        Strictness::Lenient
    };

    let plugin: Arc<dyn Plugin> = match cli.plugin {
        PluginKind::Simple => Arc::new(SimplePlugin::from_options(options, strictness)?),
        PluginKind::Stateful => Arc::new(StatefulPlugin::from_options(options, strictness)?),
        PluginKind::Configured => Arc::new(ConfiguredPlugin::from_options(options, strictness)?),
        PluginKind::Async => {
            let (fetch, batch) = match &cli.endpoint {
                Some(url) => {
                    let mut http = HttpOperation::new(url)?;
                    if let Some(token) = &cli.token {
                        http = http.with_bearer(token);
                    }
                    for raw in &cli.headers {
                        let (name, value) = parse_header(raw)?;
                        http = http.with_header(name, value);
                    }
                    let http: Arc<dyn Operation> = Arc::new(http);
                    (Arc::clone(&http), http)
                }
                None => {
                    let fetch: Arc<dyn Operation> = Arc::new(EchoOperation::fetch());
                    let batch: Arc<dyn Operation> = Arc::new(EchoOperation::process());
                    (fetch, batch)
                }
            };
            Arc::new(AsyncPlugin::from_options(options, strictness, fetch)?.with_batch_operation(batch))
        }
    };
    Ok(plugin)
}

fn parse_line(line: &str, stage: Stage, json: bool) -> anyhow::Result<PluginContext> {
    if json {
        serde_json::from_str(line).context("line is not a valid context")
    } else {
        Ok(PluginContext::new(line, stage))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = load_options(cli.config.as_deref())?;
    let plugin = build_plugin(&cli, &options)?;

    let stage = match cli.stage {
        Some(stage) => stage,
        None => match plugin.supported_stages().first() {
            Some(stage) => *stage,
            None => bail!("plugin '{}' supports no stages", plugin.name()),
        },
    };
    info!(plugin = plugin.name(), %stage, "ready, reading messages from stdin");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        let line = tokio::select! {
            result = lines.next_line() => {
                match result {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "input error");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let context = match parse_line(line, stage, cli.json) {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "skipping line");
                continue;
            }
        };

        let result = dispatch(plugin.as_ref(), context).await;
        println!("{}", serde_json::to_string(&result)?);
    }

    plugin.shutdown().await;
    Ok(())
}
