//! Per-request cancellation and deadline.
//!
//! A [`Signal`] pairs a [`CancellationToken`] with an optional deadline.
//! Generation checks it before waiting for a render permit, after getting
//! one, and on both sides of the blocking render.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TileError;

#[derive(Debug, Clone, Default)]
pub struct Signal {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Signal {
    /// A signal that only fires when [`Signal::abort`] is called.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that fires `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Wraps an existing token, e.g. one tied to the HTTP connection.
    #[must_use]
    pub const fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A child signal that fires when this one does, or after `timeout`,
    /// whichever is first. Aborting the child does not abort the parent.
    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.check().is_err()
    }

    /// Fails if the signal has fired.
    ///
    /// # Errors
    ///
    /// Returns [`TileError::Cancelled`] after [`Signal::abort`], or
    /// [`TileError::Timeout`] once the deadline has passed.
    pub fn check(&self) -> Result<(), TileError> {
        if self.token.is_cancelled() {
            return Err(TileError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(TileError::Timeout);
        }
        Ok(())
    }

    /// Resolves when the signal fires, yielding the matching error.
    pub async fn aborted(&self) -> TileError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => TileError::Cancelled,
                    () = tokio::time::sleep_until(deadline) => TileError::Timeout,
                }
            }
            None => {
                self.token.cancelled().await;
                TileError::Cancelled
            }
        }
    }

    /// Runs `fut` unless the signal fires first.
    ///
    /// # Errors
    ///
    /// Returns the abort error if the signal fires before `fut` completes.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, TileError> {
        self.check()?;
        tokio::select! {
            biased;
            e = self.aborted() => Err(e),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_signal_passes() {
        assert!(Signal::new().check().is_ok());
    }

    #[test]
    fn aborted_signal_reports_cancelled() {
        let signal = Signal::new();
        signal.abort();
        assert!(matches!(signal.check(), Err(TileError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reports_timeout() {
        let signal = Signal::with_timeout(Duration::from_secs(1));
        assert!(signal.check().is_ok());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(signal.check(), Err(TileError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn child_inherits_parent_cancellation_and_earlier_deadline() {
        let parent = Signal::with_timeout(Duration::from_secs(5));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        child.abort();
        assert!(parent.check().is_ok());

        let child = parent.child_with_timeout(Duration::from_secs(1));
        parent.abort();
        assert!(matches!(child.check(), Err(TileError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn guard_stops_slow_future() {
        let signal = Signal::with_timeout(Duration::from_millis(50));
        let result = signal
            .guard(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert!(matches!(result, Err(TileError::Timeout)));
    }
}
