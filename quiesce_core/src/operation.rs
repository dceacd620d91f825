//! Pending results of suspend, resume and registration sync operations.
//!
//! Every controller operation returns an [`OperationHandle`] right away. The
//! handle is the aggregate future of the operation: it can be awaited (it
//! implements `IntoFuture`), polled for its [`OperationStatus`], or cancelled.
//! Cancelling a handle cancels the token every outstanding activity call of
//! the operation was given.

use crate::error::SuspendError;
use crate::utils::time;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub type OperationResult = Result<(), SuspendError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Suspend,
    Resume,
    /// Bringing a newly registered activity in line with a suspended server
    Synchronize,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Suspend => "suspend",
            OperationKind::Resume => "resume",
            OperationKind::Synchronize => "synchronize",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Represents the current state of an operation
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl OperationStatus {
    /// Check if this state represents a finished operation
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Pending)
    }

    fn of(outcome: &OperationResult) -> Self {
        match outcome {
            Ok(()) => OperationStatus::Completed,
            Err(SuspendError::Cancelled(_)) => OperationStatus::Cancelled,
            Err(SuspendError::TimedOut { .. }) => OperationStatus::TimedOut,
            Err(_) => OperationStatus::Failed,
        }
    }
}

#[derive(Debug)]
struct Shared {
    id: u64,
    kind: OperationKind,
    token: CancellationToken,
    outcome: watch::Sender<Option<OperationResult>>,
    started_at: SystemTime,
}

/// Handle to one in-flight (or finished) operation.
///
/// Clones observe the same operation. Each handle may carry its own deadline,
/// which only bounds how long that handle waits: an expired deadline makes
/// [`OperationHandle::wait`] return [`SuspendError::TimedOut`] while the
/// operation itself keeps going.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    shared: Arc<Shared>,
    deadline: Option<(Instant, Duration)>,
}

impl OperationHandle {
    pub(crate) fn new(id: u64, kind: OperationKind, token: CancellationToken) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                id,
                kind,
                token,
                outcome,
                started_at: SystemTime::now(),
            }),
            deadline: None,
        }
    }

    /// A handle for an operation that had nothing to do.
    pub(crate) fn completed(id: u64, kind: OperationKind) -> Self {
        let handle = Self::new(id, kind, CancellationToken::new());
        handle.complete(Ok(()));
        handle
    }

    /// A clone of this handle whose waits give up after `timeout`.
    pub(crate) fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            shared: self.shared.clone(),
            deadline: timeout.map(|t| (Instant::now() + t, t)),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn kind(&self) -> OperationKind {
        self.shared.kind
    }

    pub fn started_at(&self) -> SystemTime {
        self.shared.started_at
    }

    /// Cancel the operation and every activity call it still has outstanding.
    ///
    /// Has no effect once the operation finished.
    pub fn cancel(&self) {
        if self.is_done() || self.is_cancel_requested() {
            return;
        }
        tracing::info!("Cancelling {} operation {}", self.kind(), self.id());
        self.shared.token.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.shared.outcome.borrow().is_some()
    }

    /// Outcome of the operation, if it finished.
    pub fn outcome(&self) -> Option<OperationResult> {
        self.shared.outcome.borrow().clone()
    }

    /// Status as seen through this handle, including its own deadline.
    pub fn status(&self) -> OperationStatus {
        match self.shared.outcome.borrow().as_ref() {
            Some(outcome) => OperationStatus::of(outcome),
            None if self.deadline_expired() => OperationStatus::TimedOut,
            None => OperationStatus::Pending,
        }
    }

    /// Wait for the operation to finish, or for this handle's deadline.
    pub async fn wait(&self) -> OperationResult {
        let Some((deadline, timeout)) = self.deadline else {
            return self.settled().await;
        };
        match tokio::time::timeout_at(deadline, self.settled()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    "{} operation {} still running after {:.1}s",
                    self.kind(),
                    self.id(),
                    timeout.as_secs_f64()
                );
                Err(SuspendError::TimedOut {
                    kind: self.kind(),
                    timeout,
                })
            }
        }
    }

    /// Wait for the operation to finish, ignoring any deadline.
    pub(crate) async fn settled(&self) -> OperationResult {
        let mut rx = self.shared.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            // The sender is owned by `shared`, which we hold
            Err(_) => None,
        };
        outcome.unwrap_or(Err(SuspendError::Cancelled(self.kind())))
    }

    /// Publish the outcome. The first outcome wins; returns false if the
    /// operation had already finished.
    pub(crate) fn complete(&self, outcome: OperationResult) -> bool {
        self.shared.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        })
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.shared.token
    }

    pub(crate) fn record(&self) -> OperationRecord {
        let outcome = self.outcome();
        OperationRecord {
            id: self.id(),
            kind: self.kind(),
            status: outcome
                .as_ref()
                .map_or(OperationStatus::Pending, OperationStatus::of),
            started_at: self.started_at(),
            finished_at: outcome.as_ref().map(|_| SystemTime::now()),
            message: outcome.and_then(Result::err).map(|e| e.to_string()),
        }
    }

    fn deadline_expired(&self) -> bool {
        self.deadline
            .is_some_and(|(deadline, _)| Instant::now() >= deadline)
    }
}

impl IntoFuture for OperationHandle {
    type Output = OperationResult;
    type IntoFuture = BoxFuture<'static, OperationResult>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.wait().await }.boxed()
    }
}

/// Summary of a finished operation, kept in the controller's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: u64,
    pub kind: OperationKind,
    pub status: OperationStatus,
    #[serde(with = "time")]
    pub started_at: SystemTime,
    #[serde(with = "time::option", default)]
    pub finished_at: Option<SystemTime>,
    /// Error message for failed, cancelled or timed-out operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
