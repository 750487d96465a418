//! Worker process: connects back to the host, loads the helper and the
//! script into an isolate, reports Ready, and runs the script when told to.

pub mod bridge;
pub mod runtime;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use bridge::Bridge;
pub use runtime::ScriptRuntime;

use crate::protocol::{write_message, FrameReader, Message};

/// How long queued frames get to reach the host before the worker exits.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("missing required arguments: {}", .0.join(", "))]
    MissingArguments(Vec<&'static str>),
    #[error("failed to connect to host on port {port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("connection to host closed")]
    ConnectionClosed,
    #[error("method name '{0}' is reserved")]
    ReservedMethod(String),
    #[error("{0}")]
    Script(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Command line of the worker:
/// `--id=<id> --port=<port> --script=<path> [--lib=<path>] [--memory=<mb>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    pub id: String,
    pub port: u16,
    pub script: PathBuf,
    pub lib: Option<PathBuf>,
    pub memory_mb: Option<u32>,
}

impl WorkerArgs {
    /// Parses `--key=value` arguments; unknown ones are ignored. `id`,
    /// `port` and `script` are required, and a port that is not a number
    /// counts as missing.
    pub fn parse<I>(args: I) -> Result<Self, WorkerError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut id = None;
        let mut port = None;
        let mut script = None;
        let mut lib = None;
        let mut memory_mb = None;

        for arg in args {
            let Some((key, value)) = arg.strip_prefix("--").and_then(|a| a.split_once('=')) else {
                continue;
            };
            match key {
                "id" if !value.is_empty() => id = Some(value.to_string()),
                "port" => port = value.parse::<u16>().ok(),
                "script" if !value.is_empty() => script = Some(PathBuf::from(value)),
                "lib" if !value.is_empty() => lib = Some(PathBuf::from(value)),
                "memory" => memory_mb = value.parse::<u32>().ok(),
                _ => {}
            }
        }

        match (id, port, script) {
            (Some(id), Some(port), Some(script)) => Ok(Self {
                id,
                port,
                script,
                lib,
                memory_mb,
            }),
            (id, port, script) => {
                let mut missing = Vec::new();
                if id.is_none() {
                    missing.push("--id");
                }
                if port.is_none() {
                    missing.push("--port");
                }
                if script.is_none() {
                    missing.push("--script");
                }
                Err(WorkerError::MissingArguments(missing))
            }
        }
    }
}

/// Commands from the host, as seen by the main loop.
#[derive(Debug)]
enum Control {
    Run(Vec<Value>),
    Kill,
}

/// Runs the worker to completion.
///
/// Returns `Ok` when the host asks the worker to stop (or goes away), and
/// an error if the script fails; the binary maps that to a non-zero exit.
pub async fn run(args: WorkerArgs) -> Result<(), WorkerError> {
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, args.port))
        .await
        .map_err(|source| WorkerError::Connect {
            port: args.port,
            source,
        })?;
    stream.set_nodelay(true)?;
    debug!(id = %args.id, port = args.port, "connected to host");

    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let bridge = Bridge::new(outbound_tx);

    let writer = tokio::spawn(write_to_host(write_half, outbound_rx));
    tokio::spawn(read_from_host(read_half, bridge.clone(), control_tx));

    serve(&args, bridge, &mut control_rx).await?;

    // Let queued frames reach the host before exiting
    if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
        warn!("timed out flushing frames to host");
    }
    Ok(())
}

async fn serve(
    args: &WorkerArgs,
    bridge: Bridge,
    control: &mut mpsc::UnboundedReceiver<Control>,
) -> Result<(), WorkerError> {
    let mut runtime = ScriptRuntime::new(bridge.clone(), args.memory_mb)?;
    if let Some(lib) = &args.lib {
        runtime.load_helper(lib).await?;
    }

    bridge.send(Message::Ready {
        id: args.id.clone(),
    })?;
    info!(id = %args.id, "worker ready");

    while let Some(command) = control.recv().await {
        match command {
            Control::Run(params) => {
                let value = runtime.run_entry(&args.script, &params).await?;
                bridge.send(Message::Return {
                    id: args.id.clone(),
                    value,
                })?;
            }
            Control::Kill => {
                debug!("kill requested by host");
                break;
            }
        }
    }
    Ok(())
}

async fn write_to_host(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            warn!(error = %e, "failed to write to host");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_from_host(
    reader: OwnedReadHalf,
    bridge: Bridge,
    control: mpsc::UnboundedSender<Control>,
) {
    let mut frames = FrameReader::new(BufReader::new(reader));
    loop {
        match frames.next_message().await {
            Ok(Some(Message::Response {
                request_id,
                outcome,
            })) => {
                bridge.resolve(request_id, outcome);
            }
            Ok(Some(Message::Run { args })) => {
                let _ = control.send(Control::Run(args));
            }
            Ok(Some(Message::Kill)) => {
                let _ = control.send(Control::Kill);
                break;
            }
            Ok(Some(other)) => warn!(message = ?other, "unexpected message from host"),
            Ok(None) => {
                debug!("host closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "failed to read from host");
                break;
            }
        }
    }
    bridge.fail_pending(&WorkerError::ConnectionClosed.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_full_command_line() {
        let parsed = WorkerArgs::parse(args(&[
            "--id=abc",
            "--port=4000",
            "--script=/tmp/a.js",
            "--memory=64",
            "--lib=/tmp/lib.js",
        ]))
        .unwrap();
        assert_eq!(
            parsed,
            WorkerArgs {
                id: "abc".to_string(),
                port: 4000,
                script: PathBuf::from("/tmp/a.js"),
                lib: Some(PathBuf::from("/tmp/lib.js")),
                memory_mb: Some(64),
            }
        );
    }

    #[test]
    fn test_parse_keeps_equals_in_values() {
        let parsed =
            WorkerArgs::parse(args(&["--id=a", "--port=1", "--script=/tmp/x=y.js"])).unwrap();
        assert_eq!(parsed.script, PathBuf::from("/tmp/x=y.js"));
        assert_eq!(parsed.lib, None);
        assert_eq!(parsed.memory_mb, None);
    }

    #[test]
    fn test_parse_reports_missing_arguments() {
        let err = WorkerArgs::parse(args(&["--id=abc"])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing required arguments: --port, --script"
        );
    }

    #[test]
    fn test_parse_non_numeric_port_counts_as_missing() {
        let err =
            WorkerArgs::parse(args(&["--id=a", "--port=http", "--script=a.js"])).unwrap_err();
        assert!(matches!(err, WorkerError::MissingArguments(ref m) if m == &vec!["--port"]));
    }

    #[test]
    fn test_parse_ignores_unknown_and_malformed() {
        let parsed = WorkerArgs::parse(args(&[
            "positional",
            "--verbose",
            "--id=a",
            "--port=1",
            "--script=a.js",
            "--color=auto",
        ]))
        .unwrap();
        assert_eq!(parsed.id, "a");
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = run(WorkerArgs {
            id: "a".to_string(),
            port,
            script: PathBuf::from("a.js"),
            lib: None,
            memory_mb: None,
        })
        .await
        .unwrap_err();
        assert!(matches!(err, WorkerError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_reader_routes_host_frames() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut host, _) = listener.accept().await.unwrap();

        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(outbound_tx);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (read_half, _write_half) = client.into_split();
        let reader = tokio::spawn(read_from_host(read_half, bridge, control_tx));

        write_message(
            &mut host,
            &Message::Run {
                args: vec![serde_json::json!(1)],
            },
        )
        .await
        .unwrap();
        write_message(&mut host, &Message::Kill).await.unwrap();

        assert!(matches!(control_rx.recv().await, Some(Control::Run(a)) if a == vec![serde_json::json!(1)]));
        assert!(matches!(control_rx.recv().await, Some(Control::Kill)));
        reader.await.unwrap();
    }
}
