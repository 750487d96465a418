use tokio::sync::watch;
use tracing::debug;

/// OS resources an execution owns until its worker is fully gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Listener,
    Stdout,
    Stderr,
    Child,
}

/// Which resources have been released so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupFlags {
    pub listener: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub child: bool,
}

impl CleanupFlags {
    /// All four flags are set: the listener is closed, both pipes hit EOF
    /// and the process has exited.
    pub fn all_released(&self) -> bool {
        self.listener && self.stdout && self.stderr && self.child
    }

    pub fn is_released(&self, resource: Resource) -> bool {
        match resource {
            Resource::Listener => self.listener,
            Resource::Stdout => self.stdout,
            Resource::Stderr => self.stderr,
            Resource::Child => self.child,
        }
    }

    pub fn pending(&self) -> Vec<Resource> {
        [
            Resource::Listener,
            Resource::Stdout,
            Resource::Stderr,
            Resource::Child,
        ]
        .into_iter()
        .filter(|r| !self.is_released(*r))
        .collect()
    }

    fn release(&mut self, resource: Resource) -> bool {
        let flag = match resource {
            Resource::Listener => &mut self.listener,
            Resource::Stdout => &mut self.stdout,
            Resource::Stderr => &mut self.stderr,
            Resource::Child => &mut self.child,
        };
        !std::mem::replace(flag, true)
    }
}

/// Completion barrier: an execution settles only once every resource it
/// owns has been released.
pub(crate) struct CleanupBarrier {
    flags: watch::Sender<CleanupFlags>,
}

impl CleanupBarrier {
    pub(crate) fn new() -> Self {
        let (flags, _) = watch::channel(CleanupFlags::default());
        Self { flags }
    }

    pub(crate) fn release(&self, resource: Resource) {
        self.flags.send_if_modified(|flags| {
            let changed = flags.release(resource);
            if changed {
                debug!(?resource, pending = ?flags.pending(), "resource released");
            }
            changed
        });
    }

    pub(crate) fn release_all(&self) {
        for resource in [
            Resource::Listener,
            Resource::Stdout,
            Resource::Stderr,
            Resource::Child,
        ] {
            self.release(resource);
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<CleanupFlags> {
        self.flags.subscribe()
    }

    pub(crate) fn snapshot(&self) -> CleanupFlags {
        *self.flags.borrow()
    }

    /// Resolves once every resource is released.
    pub(crate) async fn wait(&self) {
        let mut rx = self.flags.subscribe();
        let _ = rx.wait_for(CleanupFlags::all_released).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_flags_start_unreleased() {
        let flags = CleanupFlags::default();
        assert!(!flags.all_released());
        assert_eq!(flags.pending().len(), 4);
    }

    #[test]
    fn test_release_is_idempotent() {
        let barrier = CleanupBarrier::new();
        barrier.release(Resource::Stdout);
        barrier.release(Resource::Stdout);
        let flags = barrier.snapshot();
        assert!(flags.stdout);
        assert_eq!(
            flags.pending(),
            vec![Resource::Listener, Resource::Stderr, Resource::Child]
        );
    }

    #[tokio::test]
    async fn test_wait_blocks_until_all_released() {
        let barrier = Arc::new(CleanupBarrier::new());
        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait().await })
        };

        barrier.release(Resource::Listener);
        barrier.release(Resource::Stdout);
        barrier.release(Resource::Stderr);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        barrier.release(Resource::Child);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("barrier should open")
            .unwrap();
        assert!(barrier.snapshot().all_released());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_released() {
        let barrier = CleanupBarrier::new();
        barrier.release_all();
        barrier.wait().await;
    }
}
