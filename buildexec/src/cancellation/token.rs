//! Cancellation token threaded through every step of a build run.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    /// Whether cancellation has been requested.
    cancelled: AtomicBool,
    /// The reason for cancellation (first one wins).
    reason: RwLock<Option<String>>,
    /// Wakes tasks parked in `cancelled()`.
    notify: Notify,
    /// Derived tokens that must be cancelled along with this one.
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self, reason: &str) {
        {
            let mut slot = self.reason.write();
            if slot.is_some() {
                return;
            }
            // The reason is in place before anyone can observe the flag.
            *slot = Some(reason.to_string());
            self.cancelled.store(true, Ordering::SeqCst);
        }

        self.notify.notify_waiters();

        let children: Vec<_> = self.children.lock().drain(..).collect();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(reason);
        }
    }
}

/// A cloneable token for cooperative cancellation.
///
/// Cancellation is idempotent and only the first reason is kept. Tokens
/// derived with [`CancellationToken::child_token`] are cancelled whenever
/// their parent is, but cancelling a child leaves the parent untouched. This
/// is how timeouts and fail-fast parallel steps scope cancellation to a
/// subtree without affecting the rest of the build.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that is cancelled when this one is.
    #[must_use]
    pub fn child_token(&self) -> Self {
        let child = Self::new();

        {
            let mut children = self.inner.children.lock();
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }

        // The parent may have been cancelled before the child was registered.
        if self.is_cancelled() {
            child.cancel(self.reason().unwrap_or_default());
        }

        child
    }

    /// Requests cancellation with a reason.
    ///
    /// This is idempotent - only the first reason is kept.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.inner.cancel(&reason.into());
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().clone()
    }

    /// Waits until the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Returns a cancellation error if the token has been cancelled.
    pub fn check(&self) -> crate::errors::Result<()> {
        if self.is_cancelled() {
            return Err(crate::errors::ExecError::Cancelled(
                self.reason().unwrap_or_default(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_token_default_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_token_cancel_idempotent() {
        let token = CancellationToken::new();
        token.cancel("First reason");
        token.cancel("Second reason");

        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("First reason".to_string()));
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel("aborted");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        let grandchild = child.child_token();

        parent.cancel("aborted");

        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert_eq!(grandchild.reason(), Some("aborted".to_string()));
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let parent = CancellationToken::new();
        let child = parent.child_token();

        child.cancel("timeout exceeded");

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let parent = CancellationToken::new();
        parent.cancel("aborted");
        assert!(parent.child_token().is_cancelled());
    }

    #[test]
    fn test_check_returns_cancelled_error() {
        let token = CancellationToken::new();
        token.cancel("aborted");
        let err = token.check().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_observed_cancellation_always_has_reason() {
        for _ in 0..200 {
            let token = CancellationToken::new();
            let canceller = token.clone();
            let handle = std::thread::spawn(move || canceller.cancel("timeout exceeded"));

            let err = loop {
                if let Err(err) = token.check() {
                    break err;
                }
                std::hint::spin_loop();
            };
            handle.join().unwrap();

            assert_eq!(err.cancel_reason(), Some("timeout exceeded"));
        }
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = token.child_token();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            waiter.reason()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("stop");

        let reason = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, Some("stop".to_string()));
    }
}
