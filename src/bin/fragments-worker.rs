use std::process::ExitCode;

use fragments_runtime::worker::{self, WorkerArgs, WorkerError};
use tracing_subscriber::EnvFilter;

/// Log filter for the worker. Logs go to stderr, which the host forwards
/// as output events, so the default is quiet.
const LOG_ENV: &str = "FRAGMENTS_WORKER_LOG";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = match WorkerArgs::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e @ WorkerError::MissingArguments(_)) => {
            eprintln!("Error: {e}");
            eprintln!("Usage: fragments-worker --id=<id> --port=<port> --script=<path> [--lib=<path>] [--memory=<mb>]");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match worker::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("worker failed: {e}");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
