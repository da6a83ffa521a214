//! Shared cancellation/deadline scope for a supervised process.
//!
//! One scope is created by the caller and handed to the supervisor at
//! construction. Every launch, including every crash-triggered relaunch,
//! runs under that same scope, so the deadline bounds the total wall-clock
//! time across all retries.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a scope is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel()` was called on the scope (or any clone of it).
    Cancelled,
    /// The scope's deadline passed.
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "scope cancelled"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Cancellable, optionally deadline-bound execution scope.
///
/// Clones share the same token and deadline.
#[derive(Debug, Clone, Default)]
pub struct ExecScope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl ExecScope {
    /// A scope with no deadline; it only ends when cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A scope that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Cancel the scope. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The underlying token, for callers that want to hang their own work off
    /// the same cancellation.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// `Some(reason)` once the scope is cancelled or past its deadline.
    ///
    /// Explicit cancellation wins when both apply.
    pub fn done_reason(&self) -> Option<CancelReason> {
        if self.token.is_cancelled() {
            return Some(CancelReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done_reason().is_some()
    }

    /// Resolves when the scope is cancelled or its deadline passes.
    pub async fn done(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => CancelReason::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                CancelReason::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_scope_is_not_done() {
        let scope = ExecScope::new();
        assert!(!scope.is_done());
        assert_eq!(scope.done_reason(), None);
        assert!(scope.deadline().is_none());
    }

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let scope = ExecScope::with_timeout(Duration::from_secs(100));
        let clone = scope.clone();
        clone.cancel();
        assert_eq!(scope.done_reason(), Some(CancelReason::Cancelled));
        assert!(scope.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_expired_deadline_reports_deadline_exceeded() {
        let scope = ExecScope::with_deadline(Instant::now());
        assert_eq!(scope.done_reason(), Some(CancelReason::DeadlineExceeded));
        assert_eq!(scope.done().await, CancelReason::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_cancel_takes_precedence_over_deadline() {
        let scope = ExecScope::with_deadline(Instant::now());
        scope.cancel();
        assert_eq!(scope.done_reason(), Some(CancelReason::Cancelled));
    }

    #[tokio::test]
    async fn test_done_resolves_on_cancel() {
        let scope = ExecScope::new();
        let waiter = scope.clone();
        let task = tokio::spawn(async move { waiter.done().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        scope.cancel();
        assert_eq!(task.await.unwrap(), CancelReason::Cancelled);
    }

    #[tokio::test]
    async fn test_done_resolves_at_deadline() {
        let scope = ExecScope::with_timeout(Duration::from_millis(20));
        let started = Instant::now();
        assert_eq!(scope.done().await, CancelReason::DeadlineExceeded);
        assert!(started.elapsed() >= Duration::from_millis(15));
    }
}
