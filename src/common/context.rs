//! Cancellation and deadline context threaded through every dial

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Carries a cancellation token and an optional absolute deadline.
///
/// Cloning shares the token, so cancelling a parent context cancels every
/// hop that was dialed with a clone of it.
#[derive(Debug, Clone, Default)]
pub struct DialContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl DialContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tighten the deadline to at most `timeout` from now.
    ///
    /// A timeout too large to represent leaves the deadline unchanged.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = earliest(self.deadline, Instant::now().checked_add(timeout));
        self
    }

    /// Context for a nested operation; cancelling `self` cancels the child too.
    pub fn child(&self) -> Self {
        DialContext {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Run `fut`, bounded by `timeout` and by this context's deadline and token.
    ///
    /// `what` names the operation in the timeout error.
    pub async fn run<F, T>(&self, timeout: Duration, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = earliest(self.deadline, Instant::now().checked_add(timeout));
        self.run_until(deadline, what, fut).await
    }

    /// Run `fut`, bounded only by this context's own deadline and token.
    pub async fn run_unbounded<F, T>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.run_until(self.deadline, what, fut).await
    }

    async fn run_until<F, T>(&self, deadline: Option<Instant>, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(Error::Cancelled),
                res = tokio::time::timeout_at(deadline, fut) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(Error::timeout(format!("{} timed out", what))),
                },
            },
            None => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(Error::Cancelled),
                res = fut => res,
            },
        }
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
