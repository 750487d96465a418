use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use uuid::Uuid;

use super::cleanup::Resource;
use super::execution::{ExecutionEvent, Shared};
use super::{ExecutionError, SandboxOptions, Status};

const READ_CHUNK: usize = 8 * 1024;

/// How long a worker may linger after returning before it is killed.
pub(crate) const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Builds the worker invocation:
/// `--id=<uuid> --port=<port> --script=<path> --memory=<mb> [--lib=<path>]`.
pub(crate) fn worker_command(
    options: &SandboxOptions,
    id: Uuid,
    port: u16,
    script: &Path,
    helper: Option<&Path>,
) -> Command {
    let mut command = Command::new(&options.worker_program);
    command
        .arg(format!("--id={id}"))
        .arg(format!("--port={port}"))
        .arg(format!("--script={}", script.display()))
        .arg(format!("--memory={}", options.memory_limit_mb));
    if let Some(helper) = helper {
        command.arg(format!("--lib={}", helper.display()));
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Pipe {
    Stdout,
    Stderr,
}

impl Pipe {
    fn event(self, text: String) -> ExecutionEvent {
        match self {
            Pipe::Stdout => ExecutionEvent::Stdout(text),
            Pipe::Stderr => ExecutionEvent::Stderr(text),
        }
    }

    fn resource(self) -> Resource {
        match self {
            Pipe::Stdout => Resource::Stdout,
            Pipe::Stderr => Resource::Stderr,
        }
    }
}

/// Forwards a worker pipe to event subscribers until EOF.
pub(crate) async fn drain<R>(mut pipe: R, kind: Pipe, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                shared.emit(kind.event(text));
            }
            Err(e) => {
                warn!(execution = %shared.id, pipe = ?kind, error = %e, "failed to read worker output");
                break;
            }
        }
    }
    shared.cleanup.release(kind.resource());
}

/// Waits for the worker to exit, killing it on request, and records the
/// outcome.
pub(crate) async fn supervise(mut child: Child, shared: Arc<Shared>) {
    let pid = child.id();
    let exit = tokio::select! {
        exit = child.wait() => exit,
        _ = shared.kill_requested() => {
            debug!(execution = %shared.id, pid, "killing worker");
            if let Err(e) = child.start_kill() {
                warn!(execution = %shared.id, pid, error = %e, "failed to kill worker");
            }
            child.wait().await
        }
    };

    let code = match exit {
        Ok(status) => {
            debug!(execution = %shared.id, pid, %status, "worker exited");
            if status.success() {
                shared.advance(Status::Finished);
            } else {
                shared.fail(ExecutionError::Script {
                    code: status.code(),
                });
            }
            status.code()
        }
        Err(e) => {
            warn!(execution = %shared.id, pid, error = %e, "failed to wait for worker");
            shared.fail(ExecutionError::Script { code: None });
            None
        }
    };

    shared.emit(ExecutionEvent::Exit(code));
    shared.cleanup.release(Resource::Child);
}

/// Fails the execution with a timeout and kills the worker if it has not
/// settled within `limit`.
pub(crate) async fn enforce_time_limit(shared: Arc<Shared>, limit: Duration) {
    tokio::select! {
        _ = shared.status.wait_terminal() => {}
        _ = tokio::time::sleep(limit) => {
            // Status first, so the kill is attributed to the timeout
            if shared.fail(ExecutionError::Timeout { limit }) {
                shared.request_kill();
            }
        }
    }
}

/// Kills a worker that is still alive `grace` after it returned.
pub(crate) async fn reap_after(shared: Arc<Shared>, grace: Duration) {
    let exited = tokio::time::timeout(grace, async {
        let mut flags = shared.cleanup.subscribe();
        let _ = flags.wait_for(|f| f.child).await;
    })
    .await;
    if exited.is_err() {
        warn!(execution = %shared.id, "worker still alive after returning, killing it");
        shared.request_kill();
    }
}
