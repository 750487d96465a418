use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fragments_runtime::config::Config;
use fragments_runtime::sandbox::{Execution, ExecutionEvent, Sandbox};

/// How long to wait for trailing output after the execution settles.
const RELAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn print_help() {
    println!(
        "\
fragments-runtime v{}

Runs a script fragment in a supervised worker process.

USAGE:
    fragments-runtime [OPTIONS] CONFIG_PATH [ARG...]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file
    ARG...         Arguments passed to the script's default export.
                   Each is parsed as JSON, or passed as a string otherwise.

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG                Log level filter for tracing
                            (e.g. debug, fragments_runtime=debug,warn)
    FRAGMENTS_WORKER        Path to the fragments-worker executable
    FRAGMENTS_WORKER_LOG    Log level filter inside the worker

EXAMPLES:
    fragments-runtime greeting.toml morning
    fragments-runtime math.toml 2 3
    RUST_LOG=debug fragments-runtime greeting.toml '\"evening\"'",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Parses a command-line argument as JSON, falling back to a plain string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Relays worker output and notifications to the terminal until the
/// execution's event stream closes.
async fn relay_events(mut events: mpsc::UnboundedReceiver<ExecutionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ExecutionEvent::Stdout(text) => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            ExecutionEvent::Stderr(text) => eprint!("{text}"),
            ExecutionEvent::Notify { method, args } => {
                info!("Notification from script: {method} {}", serde_json::Value::from(args));
            }
            ExecutionEvent::Status(status) => info!("Status: {status}"),
            ExecutionEvent::Exit(code) => info!("Worker exited ({code:?})"),
        }
    }
}

async fn run_to_completion(execution: &Execution) -> Result<Value> {
    tokio::select! {
        result = execution.run() => result.map_err(|e| anyhow!("Execution failed: {e}")),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, cancelling execution");
            execution.cancel();
            execution.wait_released().await;
            Err(anyhow!("Execution cancelled"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut positional = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fragments-runtime v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => positional.push(arg),
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fragments_runtime=info")),
        )
        .init();

    let mut positional = positional.into_iter();
    let config_path = positional
        .next()
        .ok_or_else(|| anyhow!("Missing CONFIG_PATH (see --help)"))?;
    let args: Vec<Value> = positional.map(|raw| parse_arg(&raw)).collect();

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;
    let base_dir = Path::new(&config_path)
        .parent()
        .unwrap_or_else(|| Path::new("."));
    let options = config.sandbox_options(base_dir);

    info!("Script: {}", config.sandbox.source_description());
    info!(
        "Limits: {} MB, {}s",
        options.memory_limit_mb,
        options.time_limit.as_secs_f64()
    );
    info!("Worker: {}", options.worker_program.display());
    if !options.bindings.is_empty() {
        info!("Bindings: {}", options.bindings.names().join(", "));
    }

    let sandbox = Sandbox::new(options);
    let execution = sandbox.create_execution(args);
    info!("Execution {} created", execution.id());

    let relay = tokio::spawn(relay_events(execution.subscribe()));
    let outcome = run_to_completion(&execution).await;

    // The event stream closes once the execution and its tasks are gone
    drop(execution);
    if tokio::time::timeout(RELAY_DRAIN_TIMEOUT, relay).await.is_err() {
        warn!("Output relay did not finish in time");
    }

    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_arg_json() {
        assert_eq!(parse_arg("42"), json!(42));
        assert_eq!(parse_arg("\"morning\""), json!("morning"));
        assert_eq!(parse_arg("[1,2]"), json!([1, 2]));
        assert_eq!(parse_arg("{\"a\":true}"), json!({ "a": true }));
    }

    #[test]
    fn test_parse_arg_falls_back_to_string() {
        assert_eq!(parse_arg("morning"), json!("morning"));
        assert_eq!(parse_arg("hello world"), json!("hello world"));
    }
}
