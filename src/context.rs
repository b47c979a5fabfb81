//! Cancellation and deadline carrier for dials and tunnels
//!
//! A [`Context`] bundles a [`CancellationToken`] with an optional deadline.
//! Derived contexts share the parent's cancellation: cancelling a parent
//! finishes every child, while cancelling a child leaves the parent alone.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;

#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A root context with no deadline
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derive a context that can be cancelled on its own
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a context that finishes after `timeout`, or earlier if the
    /// parent deadline comes first
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and everything derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns why the context finished, or `None` while it is still live
    pub fn err(&self) -> Option<ProxyError> {
        if self.token.is_cancelled() {
            return Some(ProxyError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ProxyError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Wait until the context is cancelled or its deadline passes
    pub async fn done(&self) -> ProxyError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => ProxyError::Canceled,
                    _ = tokio::time::sleep_until(deadline) => ProxyError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ProxyError::Canceled
            }
        }
    }
}
