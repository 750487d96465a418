use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cleanup::{CleanupBarrier, CleanupFlags, Resource};
use super::status::StatusCell;
use super::{connection, process, ExecutionError, SandboxOptions, Status};
use crate::bindings::Bindings;
use crate::protocol::Message;

/// Everything an observer can see happen during an execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// A chunk of the worker's stdout, decoded lossily as UTF-8.
    Stdout(String),
    /// A chunk of the worker's stderr.
    Stderr(String),
    /// The status changed.
    Status(Status),
    /// A script-defined notification from the worker.
    Notify { method: String, args: Vec<Value> },
    /// The worker process exited with this code (`None` if killed by a signal).
    Exit(Option<i32>),
}

/// Fans events out to every subscriber without dropping any.
///
/// Events emitted before the first subscription are kept and handed to the
/// first subscriber, so output produced while the caller is still setting
/// up is not lost. Later subscribers only see events from then on.
struct EventHub {
    inner: Mutex<HubState>,
}

struct HubState {
    backlog: Option<Vec<ExecutionEvent>>,
    subscribers: Vec<mpsc::UnboundedSender<ExecutionEvent>>,
}

impl EventHub {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HubState {
                backlog: Some(Vec::new()),
                subscribers: Vec::new(),
            }),
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ExecutionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for event in state.backlog.take().unwrap_or_default() {
            let _ = tx.send(event);
        }
        state.subscribers.push(tx);
        rx
    }

    fn emit(&self, event: ExecutionEvent) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(backlog) = state.backlog.as_mut() {
            backlog.push(event);
            return;
        }
        state
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

/// State shared between an [`Execution`] handle and its supervisor tasks.
pub(crate) struct Shared {
    pub(crate) id: Uuid,
    pub(crate) status: StatusCell,
    pub(crate) cleanup: CleanupBarrier,
    events: EventHub,
    outbound: mpsc::UnboundedSender<Message>,
    return_value: Mutex<Option<Value>>,
    kill: Notify,
}

impl Shared {
    pub(crate) fn new(id: Uuid) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            id,
            status: StatusCell::new(),
            cleanup: CleanupBarrier::new(),
            events: EventHub::new(),
            outbound,
            return_value: Mutex::new(None),
            kill: Notify::new(),
        });
        (shared, outbound_rx)
    }

    /// Moves the status forward and publishes the change. Returns false if
    /// the transition was not legal (typically: already terminal).
    pub(crate) fn advance(&self, next: Status) -> bool {
        if !self.status.advance(next.clone()) {
            return false;
        }
        match &next {
            Status::Failed(err) => warn!(execution = %self.id, error = %err, "execution failed"),
            other => info!(execution = %self.id, status = %other, "execution status changed"),
        }
        self.emit(ExecutionEvent::Status(next));
        true
    }

    pub(crate) fn fail(&self, err: ExecutionError) -> bool {
        self.advance(Status::Failed(err))
    }

    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ExecutionEvent) {
        self.events.emit(event);
    }

    /// Queues a frame for the worker. Dropped silently once the connection
    /// is gone.
    pub(crate) fn send(&self, message: Message) {
        if self.outbound.send(message).is_err() {
            debug!(execution = %self.id, "worker connection closed, message dropped");
        }
    }

    /// Asks the process supervisor to kill the worker.
    pub(crate) fn request_kill(&self) {
        self.kill.notify_one();
    }

    pub(crate) async fn kill_requested(&self) {
        self.kill.notified().await;
    }

    /// Stores the script's return value. Only the first one is kept.
    pub(crate) fn store_return(&self, value: Value) -> bool {
        let mut slot = self.return_value.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        true
    }

    fn return_value(&self) -> Value {
        self.return_value
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or(Value::Null)
    }
}

/// One supervised run of a script in its own worker process.
///
/// The worker is spawned as soon as the execution is created and loads in
/// the background; [`Execution::run`] sends the Run command once the worker
/// is Ready and resolves when the execution has settled. Dropping an
/// execution that has not settled cancels it.
pub struct Execution {
    shared: Arc<Shared>,
    port: Option<u16>,
    args: Vec<Value>,
    time_limit: Duration,
    run_started: AtomicBool,
    // Inline sources are materialised to temp files that must outlive the worker
    _sources: Vec<tempfile::NamedTempFile>,
}

impl Execution {
    /// Spawns the worker and its supervisor tasks. Never fails
    /// synchronously: launch problems surface as a `Failed` status.
    pub(crate) fn launch(options: &SandboxOptions, bindings: Arc<Bindings>, args: Vec<Value>) -> Self {
        let id = Uuid::new_v4();
        let (shared, outbound_rx) = Shared::new(id);
        let mut execution = Self {
            shared: shared.clone(),
            port: None,
            args,
            time_limit: options.time_limit,
            run_started: AtomicBool::new(false),
            _sources: Vec::new(),
        };

        let listener = match bind_loopback() {
            Ok(listener) => listener,
            Err(e) => {
                execution.abort_launch(ExecutionError::Connection(format!(
                    "failed to bind loopback listener: {e}"
                )));
                return execution;
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                execution.abort_launch(ExecutionError::Connection(e.to_string()));
                return execution;
            }
        };
        execution.port = Some(port);

        let script = match options.script.materialize() {
            Ok(source) => source,
            Err(e) => {
                execution.abort_launch(ExecutionError::Spawn(format!("script unavailable: {e}")));
                return execution;
            }
        };
        let helper = match options.helper.as_ref().map(|h| h.materialize()).transpose() {
            Ok(helper) => helper,
            Err(e) => {
                execution.abort_launch(ExecutionError::Spawn(format!("helper unavailable: {e}")));
                return execution;
            }
        };

        let mut command = process::worker_command(
            options,
            id,
            port,
            &script.path,
            helper.as_ref().map(|h| h.path.as_path()),
        );
        execution._sources.extend(script.temp);
        execution._sources.extend(helper.and_then(|h| h.temp));

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                execution.abort_launch(ExecutionError::Spawn(format!(
                    "{}: {e}",
                    options.worker_program.display()
                )));
                return execution;
            }
        };
        info!(
            execution = %id,
            port,
            pid = child.id(),
            "worker spawned"
        );

        tokio::spawn(connection::serve(
            listener,
            shared.clone(),
            bindings,
            outbound_rx,
            process::EXIT_GRACE,
        ));

        match child.stdout.take() {
            Some(stdout) => {
                tokio::spawn(process::drain(stdout, process::Pipe::Stdout, shared.clone()));
            }
            None => shared.cleanup.release(Resource::Stdout),
        }
        match child.stderr.take() {
            Some(stderr) => {
                tokio::spawn(process::drain(stderr, process::Pipe::Stderr, shared.clone()));
            }
            None => shared.cleanup.release(Resource::Stderr),
        }
        tokio::spawn(process::supervise(child, shared));

        execution
    }

    fn abort_launch(&self, err: ExecutionError) {
        self.shared.fail(err);
        self.shared.cleanup.release_all();
    }

    /// Unique identifier, also sent to the worker and echoed in its Ready frame.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Loopback port of the rendezvous listener, if it could be bound.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn status(&self) -> Status {
        self.shared.status.current()
    }

    /// Status receiver; the current status is visible immediately.
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.shared.status.subscribe()
    }

    /// Subscribes to output, status and notification events.
    ///
    /// The first subscriber also receives everything emitted before it
    /// subscribed. The receiver yields `None` once the execution and all of
    /// its tasks are gone.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ExecutionEvent> {
        self.shared.subscribe()
    }

    pub fn cleanup_flags(&self) -> CleanupFlags {
        self.shared.cleanup.snapshot()
    }

    /// Waits until the listener, both pipes and the process are released.
    pub async fn wait_released(&self) {
        self.shared.cleanup.wait().await;
    }

    /// Runs the script and waits for the outcome.
    ///
    /// Sends Run as soon as the worker is Ready (immediately if it already
    /// is), starts the time limit, then resolves once the status is terminal
    /// and every resource has been released. Only the first call proceeds;
    /// later calls fail with [`ExecutionError::AlreadyStarted`]. If the
    /// execution settled before the first call (a launch failure, say), that
    /// outcome is returned.
    pub async fn run(&self) -> Result<Value, ExecutionError> {
        if self.run_started.swap(true, Ordering::SeqCst) {
            return Err(ExecutionError::AlreadyStarted);
        }

        debug!(execution = %self.id(), limit = ?self.time_limit, "run requested");
        if !self.status().is_terminal() {
            tokio::spawn(process::enforce_time_limit(self.shared.clone(), self.time_limit));
        }

        let mut status = self.shared.status.subscribe();
        let outcome = loop {
            let current = status.borrow_and_update().clone();
            match current {
                Status::Ready => {
                    self.shared.send(Message::Run {
                        args: self.args.clone(),
                    });
                    self.shared.advance(Status::Running);
                }
                Status::Finished | Status::Failed(_) => break current,
                Status::Loading | Status::Running => {}
            }
            if status.changed().await.is_err() {
                break self.shared.status.current();
            }
        };

        self.shared.cleanup.wait().await;
        match outcome {
            Status::Failed(err) => Err(err),
            _ => Ok(self.shared.return_value()),
        }
    }

    /// Cancels the execution: the status becomes `Failed(Cancelled)` and the
    /// worker is killed. Returns false if the execution had already settled.
    pub fn cancel(&self) -> bool {
        if !self.shared.fail(ExecutionError::Cancelled) {
            return false;
        }
        self.shared.send(Message::Kill);
        self.shared.request_kill();
        true
    }
}

impl Drop for Execution {
    fn drop(&mut self) {
        if !self.status().is_terminal() {
            debug!(execution = %self.id(), "execution dropped before settling");
            self.cancel();
        }
    }
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("id", &self.id())
            .field("port", &self.port)
            .field("status", &self.status())
            .finish()
    }
}

/// Binds an ephemeral loopback port for the worker rendezvous.
///
/// Bound synchronously so the port is known before the worker is spawned.
fn bind_loopback() -> std::io::Result<TcpListener> {
    let listener = std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}
