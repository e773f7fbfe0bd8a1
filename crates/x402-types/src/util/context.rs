//! Deadline and cancellation carried through facilitator calls.
//!
//! A [`CallContext`] travels with one logical operation (one inbound request, one
//! facilitator call with its retries). It carries an optional absolute deadline and a
//! [`CancellationToken`]. Operations race their work against [`CallContext::done`].

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`CallContext`] stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextDone {
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("operation cancelled")]
    Cancelled,
}

/// Deadline plus cancellation signal for a single logical operation.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl CallContext {
    /// A context with no deadline and a fresh cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an absolute deadline. An earlier existing deadline is kept.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    /// Sets a deadline `timeout` from now. An earlier existing deadline is kept.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a context that expires after `timeout`, unless this one already has a deadline.
    ///
    /// The derived context shares the cancellation token, so cancelling the parent cancels it.
    pub fn or_timeout(&self, timeout: Duration) -> Self {
        let child = self.child();
        match self.deadline {
            Some(_) => child,
            None => child.with_timeout(timeout),
        }
    }

    /// Derives a context with the same deadline and a child cancellation token.
    ///
    /// Cancelling the child does not cancel the parent.
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            cancellation: self.cancellation.child_token(),
        }
    }

    /// The absolute deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Returns the reason if the context is already done, without waiting.
    pub fn done_reason(&self) -> Option<ContextDone> {
        if self.cancellation.is_cancelled() {
            return Some(ContextDone::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(ContextDone::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the deadline passes or the context is cancelled.
    pub async fn done(&self) -> ContextDone {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancellation.cancelled() => ContextDone::Cancelled,
                _ = tokio::time::sleep_until(deadline) => ContextDone::DeadlineExceeded,
            },
            None => {
                self.cancellation.cancelled().await;
                ContextDone::Cancelled
            }
        }
    }

    /// Runs `future` until it completes or the context is done, whichever comes first.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, ContextDone> {
        if let Some(reason) = self.done_reason() {
            return Err(reason);
        }
        tokio::select! {
            biased;
            output = future => Ok(output),
            reason = self.done() => Err(reason),
        }
    }
}
