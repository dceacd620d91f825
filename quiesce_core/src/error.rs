use crate::activity::{Phase, SuspendPriority};
use crate::operation::OperationKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One activity call that completed with an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFailure {
    pub activity: String,
    pub priority: SuspendPriority,
    /// The full error chain reported by the activity
    pub message: String,
}

/// Errors surfaced by suspend controller operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SuspendError {
    #[error("{phase} phase failed: {}", format_failures(.failures))]
    PhaseFailed {
        phase: Phase,
        failures: Vec<ActivityFailure>,
    },

    #[error("{0} operation was cancelled")]
    Cancelled(OperationKind),

    #[error("{kind} operation did not complete within {:.1}s", .timeout.as_secs_f64())]
    TimedOut {
        kind: OperationKind,
        timeout: Duration,
    },

    #[error("activity '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl SuspendError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SuspendError::Cancelled(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SuspendError::TimedOut { .. })
    }

    /// Failed activity calls, empty for anything but `PhaseFailed`.
    pub fn failures(&self) -> &[ActivityFailure] {
        match self {
            SuspendError::PhaseFailed { failures, .. } => failures,
            _ => &[],
        }
    }
}

/// Format activity failures for error messages
pub(crate) fn format_failures(failures: &[ActivityFailure]) -> String {
    match failures {
        [] => "no activity reported an error".to_string(),
        [single] => format!("activity '{}' failed: {}", single.activity, single.message),
        many => {
            let list: Vec<String> = many
                .iter()
                .map(|f| format!("'{}': {}", f.activity, f.message))
                .collect();
            format!("{} activities failed [{}]", many.len(), list.join("; "))
        }
    }
}
