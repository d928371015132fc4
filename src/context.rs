//! Per-call deadline carried into cart operations.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::StoreError;

/// Deadline scope for one read or update.
///
/// A coordinated update refuses to run without a deadline, since the lock's
/// TTL is derived from it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A context with no deadline.
    pub fn background() -> Self {
        Self { deadline: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, saturating at zero.  `None` when the
    /// context has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Run a store command, failing with [`StoreError::DeadlineExceeded`] if
    /// the deadline has passed or passes while it is in flight.
    pub async fn bound<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let Some(deadline) = self.deadline else {
            return fut.await;
        };
        if Instant::now() >= deadline {
            return Err(StoreError::DeadlineExceeded);
        }
        tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| StoreError::DeadlineExceeded)?
    }
}
