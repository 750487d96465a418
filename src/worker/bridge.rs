use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::WorkerError;
use crate::protocol::Message;

type Reply = Result<Value, String>;

/// Worker end of the host connection, as seen by the script runtime.
///
/// Frames are queued on an unbounded channel drained by the connection's
/// writer task. Requests are correlated with their responses through a
/// pending table keyed by request id, so several can be in flight at once.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

struct Inner {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
}

impl Bridge {
    pub fn new(outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            inner: Arc::new(Inner {
                outbound,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn send(&self, message: Message) -> Result<(), WorkerError> {
        self.inner
            .outbound
            .send(message)
            .map_err(|_| WorkerError::ConnectionClosed)
    }

    /// Fire-and-forget notification to the host. Reserved control names
    /// are refused.
    pub fn notify(&self, method: String, args: Vec<Value>) -> Result<(), WorkerError> {
        if Message::is_reserved(&method) {
            return Err(WorkerError::ReservedMethod(method));
        }
        self.send(Message::Notify { method, args })
    }

    /// Calls a host binding and waits for its response.
    ///
    /// The error string is what the script sees as the rejection message.
    pub async fn request(&self, method: String, args: Vec<Value>) -> Reply {
        let request_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(request_id, tx);

        debug!(request_id, %method, "requesting binding");
        if self
            .send(Message::Request {
                request_id,
                method,
                args,
            })
            .is_err()
        {
            self.pending().remove(&request_id);
            return Err(WorkerError::ConnectionClosed.to_string());
        }

        rx.await
            .unwrap_or_else(|_| Err(WorkerError::ConnectionClosed.to_string()))
    }

    /// Completes the pending request `request_id`. Returns false if no such
    /// request is waiting.
    pub fn resolve(&self, request_id: u64, outcome: Reply) -> bool {
        match self.pending().remove(&request_id) {
            Some(tx) => {
                // The script may have stopped waiting
                let _ = tx.send(outcome);
                true
            }
            None => {
                warn!(request_id, "response for unknown request");
                false
            }
        }
    }

    /// Rejects every in-flight request, e.g. once the host is gone.
    pub fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self.pending().drain().collect();
        for (request_id, tx) in drained {
            debug!(request_id, reason, "rejecting pending request");
            let _ = tx.send(Err(reason.to_string()));
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending().len()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.inner.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_request_sends_frame_and_awaits_response() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(tx);

        let pending = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.request("getName".to_string(), vec![]).await })
        };

        let frame = rx.recv().await.unwrap();
        assert_eq!(
            frame,
            Message::Request {
                request_id: 0,
                method: "getName".to_string(),
                args: vec![],
            }
        );
        assert!(bridge.resolve(0, Ok(json!("Elly"))));
        assert_eq!(pending.await.unwrap(), Ok(json!("Elly")));
        assert_eq!(bridge.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_correlated() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(tx);

        let first = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.request("a".to_string(), vec![]).await })
        };
        rx.recv().await.unwrap();
        let second = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.request("b".to_string(), vec![]).await })
        };
        rx.recv().await.unwrap();

        bridge.resolve(1, Ok(json!("second")));
        bridge.resolve(0, Err("first failed".to_string()));

        assert_eq!(second.await.unwrap(), Ok(json!("second")));
        assert_eq!(first.await.unwrap(), Err("first failed".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_response_is_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(tx);
        assert!(!bridge.resolve(42, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_fail_pending_rejects_waiters() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(tx);
        let pending = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.request("slow".to_string(), vec![]).await })
        };
        rx.recv().await.unwrap();

        bridge.fail_pending("connection to host closed");
        assert_eq!(
            pending.await.unwrap(),
            Err("connection to host closed".to_string())
        );
    }

    #[tokio::test]
    async fn test_request_fails_when_host_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let bridge = Bridge::new(tx);
        let reply = bridge.request("getName".to_string(), vec![]).await;
        assert!(reply.is_err());
        assert_eq!(bridge.in_flight(), 0);
    }

    #[test]
    fn test_notify_refuses_reserved_names() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(tx);

        assert!(matches!(
            bridge.notify("__return".to_string(), vec![]),
            Err(WorkerError::ReservedMethod(_))
        ));
        bridge.notify("progress".to_string(), vec![json!(1)]).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Message::Notify {
                method: "progress".to_string(),
                args: vec![json!(1)],
            }
        );
    }
}
