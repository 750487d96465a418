use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::cleanup::Resource;
use super::execution::{ExecutionEvent, Shared};
use super::process::{reap_after, EXIT_GRACE};
use super::{ExecutionError, Status};
use crate::bindings::Bindings;
use crate::protocol::{write_message, FrameReader, Message, ProtocolError};

/// Accepts the single worker connection and serves it until either side
/// closes it.
///
/// The listener is dropped right after the first accept, so any further
/// connection attempt is refused. Its cleanup flag is released only once
/// the connection itself is closed. If the execution settles before the
/// worker ever connects, the listener is closed without waiting.
///
/// A connection that stays open after the worker process has exited (held
/// by a forked descendant, say) is closed by the host after `linger`.
pub(crate) async fn serve(
    listener: TcpListener,
    shared: Arc<Shared>,
    bindings: Arc<Bindings>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    linger: Duration,
) {
    let accepted = tokio::select! {
        accepted = listener.accept() => Some(accepted),
        _ = shared.status.wait_terminal() => None,
    };
    drop(listener);

    match accepted {
        Some(Ok((stream, peer))) => {
            debug!(execution = %shared.id, %peer, "worker connected");
            if let Err(e) = stream.set_nodelay(true) {
                debug!(execution = %shared.id, error = %e, "failed to set TCP_NODELAY");
            }
            handle(stream, &shared, &bindings, &mut outbound, linger).await;
            debug!(execution = %shared.id, "worker connection closed");
        }
        Some(Err(e)) => {
            shared.fail(ExecutionError::Connection(format!(
                "failed to accept worker connection: {e}"
            )));
            shared.request_kill();
        }
        None => debug!(execution = %shared.id, "execution settled before the worker connected"),
    }
    shared.cleanup.release(Resource::Listener);
}

async fn handle(
    stream: TcpStream,
    shared: &Arc<Shared>,
    bindings: &Arc<Bindings>,
    outbound: &mut mpsc::UnboundedReceiver<Message>,
    linger: Duration,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut frames = FrameReader::new(BufReader::new(read_half));

    let orphaned = async {
        let mut flags = shared.cleanup.subscribe();
        let _ = flags.wait_for(|f| f.child).await;
        tokio::time::sleep(linger).await;
    };
    tokio::pin!(orphaned);

    loop {
        tokio::select! {
            incoming = frames.next_message() => match incoming {
                Ok(Some(message)) => on_message(message, shared, bindings),
                Ok(None) => {
                    debug!(execution = %shared.id, "worker closed the connection");
                    break;
                }
                // The exit status tells what happened to the worker
                Err(ProtocolError::Io(e)) => {
                    debug!(execution = %shared.id, error = %e, "worker connection lost");
                    break;
                }
                Err(e) => {
                    shared.fail(ExecutionError::Protocol(e.to_string()));
                    shared.request_kill();
                    break;
                }
            },
            _ = &mut orphaned => {
                warn!(execution = %shared.id, "worker exited but its connection is still open, closing it");
                break;
            }
            Some(message) = outbound.recv() => {
                if let Err(e) = write_message(&mut write_half, &message).await {
                    debug!(execution = %shared.id, error = %e, "failed to write to worker");
                    break;
                }
            }
        }
    }
}

fn on_message(message: Message, shared: &Arc<Shared>, bindings: &Arc<Bindings>) {
    match message {
        Message::Ready { id } => {
            if id != shared.id.to_string() {
                warn!(execution = %shared.id, reported = %id, "worker reported a different execution id");
            }
            shared.advance(Status::Ready);
        }
        Message::Return { value, .. } => {
            if shared.status.current().is_terminal() {
                debug!(execution = %shared.id, "ignoring return from a settled execution");
                return;
            }
            shared.store_return(value);
            shared.send(Message::Kill);
            shared.advance(Status::Finished);
            tokio::spawn(reap_after(shared.clone(), EXIT_GRACE));
        }
        Message::Request {
            request_id,
            method,
            args,
        } => {
            let shared = shared.clone();
            let bindings = bindings.clone();
            tokio::spawn(async move {
                let outcome = bindings
                    .dispatch(&method, args)
                    .await
                    .map_err(|e| e.to_string());
                if let Err(e) = &outcome {
                    warn!(execution = %shared.id, binding = %method, error = %e, "binding request failed");
                }
                shared.send(Message::Response {
                    request_id,
                    outcome,
                });
            });
        }
        Message::Notify { method, args } => {
            debug!(execution = %shared.id, %method, "script notification");
            shared.emit(ExecutionEvent::Notify { method, args });
        }
        other @ (Message::Run { .. } | Message::Kill | Message::Response { .. }) => {
            warn!(execution = %shared.id, message = ?other, "unexpected message from worker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::tcp::OwnedReadHalf;
    use uuid::Uuid;

    struct FakeWorker {
        frames: FrameReader<BufReader<OwnedReadHalf>>,
        writer: tokio::net::tcp::OwnedWriteHalf,
    }

    impl FakeWorker {
        async fn send(&mut self, message: Message) {
            write_message(&mut self.writer, &message).await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            tokio::time::timeout(Duration::from_secs(2), self.frames.next_message())
                .await
                .expect("timed out waiting for host frame")
                .unwrap()
                .expect("connection closed")
        }
    }

    async fn connect(bindings: Bindings) -> (Arc<Shared>, FakeWorker) {
        connect_with_linger(bindings, EXIT_GRACE).await
    }

    async fn connect_with_linger(bindings: Bindings, linger: Duration) -> (Arc<Shared>, FakeWorker) {
        let (shared, outbound_rx) = Shared::new(Uuid::new_v4());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(
            listener,
            shared.clone(),
            Arc::new(bindings),
            outbound_rx,
            linger,
        ));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        let worker = FakeWorker {
            frames: FrameReader::new(BufReader::new(read_half)),
            writer,
        };
        (shared, worker)
    }

    async fn wait_for_status(shared: &Shared, expected: Status) {
        let mut rx = shared.status.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == expected))
            .await
            .expect("status not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_ready_moves_status_to_ready() {
        let (shared, mut worker) = connect(Bindings::new()).await;
        worker
            .send(Message::Ready {
                id: shared.id.to_string(),
            })
            .await;
        wait_for_status(&shared, Status::Ready).await;
    }

    #[tokio::test]
    async fn test_request_is_answered_by_binding() {
        let bindings = Bindings::new().with_fn("add", |args| async move {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(sum))
        });
        let (_shared, mut worker) = connect(bindings).await;

        worker
            .send(Message::Request {
                request_id: 7,
                method: "add".to_string(),
                args: vec![json!(2), json!(3)],
            })
            .await;

        assert_eq!(
            worker.recv().await,
            Message::Response {
                request_id: 7,
                outcome: Ok(json!(5)),
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_binding_gets_error_response() {
        let (_shared, mut worker) = connect(Bindings::new()).await;

        worker
            .send(Message::Request {
                request_id: 0,
                method: "readSecrets".to_string(),
                args: vec![],
            })
            .await;

        assert_eq!(
            worker.recv().await,
            Message::Response {
                request_id: 0,
                outcome: Err("binding 'readSecrets' is not registered".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_return_stores_value_and_sends_kill() {
        let (shared, mut worker) = connect(Bindings::new()).await;
        let id = shared.id.to_string();
        worker.send(Message::Ready { id: id.clone() }).await;
        worker
            .send(Message::Return {
                id,
                value: json!("Good morning, Elly!"),
            })
            .await;

        assert_eq!(worker.recv().await, Message::Kill);
        wait_for_status(&shared, Status::Finished).await;
        assert!(!shared.store_return(json!("second")));
    }

    #[tokio::test]
    async fn test_notification_is_published() {
        let (shared, mut worker) = connect(Bindings::new()).await;
        let mut events = shared.subscribe();

        worker
            .send(Message::Notify {
                method: "progress".to_string(),
                args: vec![json!(50)],
            })
            .await;

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ExecutionEvent::Notify {
                method: "progress".to_string(),
                args: vec![json!(50)],
            }
        );
    }

    #[tokio::test]
    async fn test_garbage_frame_fails_execution() {
        let (shared, mut worker) = connect(Bindings::new()).await;
        worker.writer.write_all(b"this is not json\n").await.unwrap();

        let mut rx = shared.status.subscribe();
        let status = tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(Status::is_terminal),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert!(matches!(status, Status::Failed(ExecutionError::Protocol(_))));
    }

    async fn wait_listener_released(shared: &Shared) {
        let mut flags = shared.cleanup.subscribe();
        tokio::time::timeout(Duration::from_secs(2), flags.wait_for(|f| f.listener))
            .await
            .expect("listener flag not released")
            .unwrap();
    }

    #[tokio::test]
    async fn test_listener_released_when_worker_disconnects() {
        let (shared, worker) = connect(Bindings::new()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!shared.cleanup.snapshot().listener);

        drop(worker);
        wait_listener_released(&shared).await;
    }

    #[tokio::test]
    async fn test_open_connection_holds_cleanup_after_return() {
        let (shared, mut worker) = connect(Bindings::new()).await;
        let mut events = shared.subscribe();
        let id = shared.id.to_string();
        worker.send(Message::Ready { id: id.clone() }).await;
        worker
            .send(Message::Return {
                id,
                value: json!(42),
            })
            .await;
        assert_eq!(worker.recv().await, Message::Kill);
        wait_for_status(&shared, Status::Finished).await;

        // The worker keeps its socket open and is still heard from
        while events.try_recv().is_ok() {}
        worker
            .send(Message::Notify {
                method: "late".to_string(),
                args: vec![],
            })
            .await;
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ExecutionEvent::Notify {
                method: "late".to_string(),
                args: vec![],
            }
        );

        let barrier = tokio::time::timeout(Duration::from_millis(200), shared.cleanup.wait()).await;
        assert!(barrier.is_err());
        assert!(!shared.cleanup.snapshot().listener);

        drop(worker);
        wait_listener_released(&shared).await;
    }

    #[tokio::test]
    async fn test_connection_closed_after_worker_exit_and_linger() {
        let (shared, mut worker) =
            connect_with_linger(Bindings::new(), Duration::from_millis(100)).await;
        worker
            .send(Message::Ready {
                id: shared.id.to_string(),
            })
            .await;
        wait_for_status(&shared, Status::Ready).await;

        // The process is gone but something still holds its socket
        shared.cleanup.release(Resource::Child);
        wait_listener_released(&shared).await;

        let closed = tokio::time::timeout(Duration::from_secs(2), worker.frames.next_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed, None);
    }

    #[tokio::test]
    async fn test_listener_closed_when_settled_before_connect() {
        let (shared, outbound_rx) = Shared::new(Uuid::new_v4());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let task = tokio::spawn(serve(
            listener,
            shared.clone(),
            Arc::new(Bindings::new()),
            outbound_rx,
            EXIT_GRACE,
        ));

        shared.fail(ExecutionError::Cancelled);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(shared.cleanup.snapshot().listener);
    }
}
