use std::fmt;

use tokio::sync::watch;

use super::ExecutionError;

/// Lifecycle of an execution.
///
/// `Loading → Ready → Running → {Finished | Failed}`. Transitions only move
/// forward and the two terminal states are final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Worker spawned, handshake not yet received.
    Loading,
    /// Worker connected and reported Ready.
    Ready,
    /// Host sent Run.
    Running,
    /// Worker returned a value, or exited successfully.
    Finished,
    /// Worker failed, timed out, or was cancelled.
    Failed(ExecutionError),
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Finished | Status::Failed(_))
    }

    fn rank(&self) -> u8 {
        match self {
            Status::Loading => 0,
            Status::Ready => 1,
            Status::Running => 2,
            Status::Finished | Status::Failed(_) => 3,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_advance_to(&self, next: &Status) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Status::Loading => "loading",
            Status::Ready => "ready",
            Status::Running => "running",
            Status::Finished => "finished",
            Status::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Failed(err) => write!(f, "failed ({err})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Status holder with replay-on-subscribe semantics.
///
/// New subscribers see the current status immediately, so a worker that
/// reports Ready before anyone observes the execution is not missed.
pub(crate) struct StatusCell {
    tx: watch::Sender<Status>,
}

impl StatusCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(Status::Loading);
        Self { tx }
    }

    pub(crate) fn current(&self) -> Status {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Status> {
        self.tx.subscribe()
    }

    /// Applies `next` if it is a legal transition. Returns whether the
    /// status changed.
    pub(crate) fn advance(&self, next: Status) -> bool {
        self.tx.send_if_modified(|current| {
            if current.can_advance_to(&next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Resolves once the status is terminal, returning it.
    pub(crate) async fn wait_terminal(&self) -> Status {
        let mut rx = self.subscribe();
        let status = match rx.wait_for(Status::is_terminal).await {
            Ok(status) => status.clone(),
            Err(_) => self.current(),
        };
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_forward_transitions() {
        let cell = StatusCell::new();
        assert!(cell.advance(Status::Ready));
        assert!(cell.advance(Status::Running));
        assert!(cell.advance(Status::Finished));
        assert_eq!(cell.current(), Status::Finished);
    }

    #[test]
    fn test_no_backward_transition() {
        let cell = StatusCell::new();
        cell.advance(Status::Running);
        assert!(!cell.advance(Status::Ready));
        assert!(!cell.advance(Status::Running));
        assert_eq!(cell.current(), Status::Running);
    }

    #[test]
    fn test_terminal_is_final() {
        let cell = StatusCell::new();
        assert!(cell.advance(Status::Failed(ExecutionError::Cancelled)));
        assert!(!cell.advance(Status::Finished));
        assert!(!cell.advance(Status::Failed(ExecutionError::Script { code: Some(1) })));
        assert_eq!(cell.current(), Status::Failed(ExecutionError::Cancelled));
    }

    #[test]
    fn test_loading_can_finish_directly() {
        // A worker that exits 0 before the handshake still finishes
        let cell = StatusCell::new();
        assert!(cell.advance(Status::Finished));
    }

    #[test]
    fn test_late_subscriber_sees_current_status() {
        let cell = StatusCell::new();
        cell.advance(Status::Ready);

        let rx = cell.subscribe();
        assert_eq!(*rx.borrow(), Status::Ready);
    }

    #[tokio::test]
    async fn test_wait_terminal_resolves_after_transition() {
        let cell = std::sync::Arc::new(StatusCell::new());
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait_terminal().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cell.advance(Status::Running);
        cell.advance(Status::Finished);

        assert_eq!(waiter.await.unwrap(), Status::Finished);
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::Running.to_string(), "running");
        assert_eq!(
            Status::Failed(ExecutionError::Cancelled).to_string(),
            "failed (execution was cancelled)"
        );
    }
}
