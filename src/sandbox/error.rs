use std::time::Duration;

/// Why an execution failed.
///
/// Cloneable so it can live inside [`super::Status::Failed`] and be
/// observed by every status subscriber.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// The worker process (or its script file) could not be prepared or started.
    #[error("failed to start worker: {0}")]
    Spawn(String),

    /// The rendezvous listener or the worker connection failed.
    #[error("worker connection failed: {0}")]
    Connection(String),

    /// The worker sent a frame that could not be decoded.
    #[error("worker sent an invalid message: {0}")]
    Protocol(String),

    /// The worker exited unsuccessfully; scripts crash the worker, so no
    /// further detail is available than the exit code.
    #[error("script failed: worker exited with {}", describe_exit(.code))]
    Script { code: Option<i32> },

    /// The time limit elapsed and the worker was killed.
    #[error("execution exceeded its time limit of {}s", .limit.as_secs_f64())]
    Timeout { limit: Duration },

    /// The caller cancelled the execution.
    #[error("execution was cancelled")]
    Cancelled,

    /// `run()` was called on an execution that is already running or done.
    #[error("execution already running or finished")]
    AlreadyStarted,
}

impl ExecutionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::Timeout { .. })
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}
