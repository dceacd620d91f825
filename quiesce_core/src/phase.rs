//! Group traversal for one phase of an operation.
//!
//! A phase visits the execution groups one after another. Each group is
//! snapshotted from the registry when it begins, its members are called
//! concurrently, and the phase only moves on once every call in the group
//! settled. Every call races against the operation's cancellation token; a
//! cancelled call is dropped and reported as cancelled.

use crate::activity::{Phase, ServerResumeContext, ServerSuspendContext, SuspendPriority};
use crate::error::{ActivityFailure, SuspendError};
use crate::operation::OperationKind;
use crate::registry::{ActivityRegistry, RegisteredActivity, RegistrationId};
use futures::future::join_all;
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Phase to run together with the context its calls receive.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Step<'a> {
    Prepare(&'a ServerSuspendContext),
    Suspend(&'a ServerSuspendContext),
    Resume(&'a ServerResumeContext),
}

impl Step<'_> {
    pub fn phase(&self) -> Phase {
        match self {
            Step::Prepare(_) => Phase::Prepare,
            Step::Suspend(_) => Phase::Suspend,
            Step::Resume(_) => Phase::Resume,
        }
    }
}

/// How a single activity call ended.
#[derive(Debug)]
pub(crate) enum CallOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Call one activity for `step`, racing the call against `cancel`.
///
/// When the token fires first the activity's future is dropped before this
/// returns.
pub(crate) async fn invoke(
    registered: &RegisteredActivity,
    step: Step<'_>,
    cancel: &CancellationToken,
) -> CallOutcome {
    let activity = registered.activity.as_ref();
    let token = cancel.clone();
    let call = async {
        match step {
            Step::Prepare(ctx) => activity.prepare(ctx, token).await,
            Step::Suspend(ctx) => activity.suspend(ctx, token).await,
            Step::Resume(ctx) => activity.resume(ctx, token).await,
        }
    };

    if cancel.is_cancelled() {
        return CallOutcome::Cancelled;
    }

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => CallOutcome::Cancelled,
        result = call => match result {
            Ok(()) => CallOutcome::Completed,
            Err(err) => CallOutcome::Failed(format!("{err:#}")),
        },
    };

    match &outcome {
        CallOutcome::Completed => tracing::trace!(
            "{} {} completed {}",
            registered.activity.name(),
            step.phase(),
            registered.id
        ),
        CallOutcome::Failed(message) => tracing::warn!(
            "{} {} failed {}: {}",
            registered.activity.name(),
            step.phase(),
            registered.id,
            message
        ),
        CallOutcome::Cancelled => tracing::debug!(
            "{} {} cancelled {}",
            registered.activity.name(),
            step.phase(),
            registered.id
        ),
    }
    outcome
}

/// Run one phase across every execution group registered before `cutoff`.
///
/// Groups are visited in ascending priority for prepare and suspend, and in
/// descending priority for resume. A group with failures stops the phase once
/// all of its calls settled.
pub(crate) async fn run_phase(
    registry: &Mutex<ActivityRegistry>,
    step: Step<'_>,
    kind: OperationKind,
    cutoff: RegistrationId,
    cancel: &CancellationToken,
) -> Result<(), SuspendError> {
    let phase = step.phase();
    let mut previous: Option<SuspendPriority> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(SuspendError::Cancelled(kind));
        }

        let group = registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_group(previous, phase.is_descending(), cutoff);
        let Some(group) = group else {
            return Ok(());
        };
        previous = Some(group.priority);

        tracing::debug!(
            "Starting {} for execution group {} ({} activities)",
            phase,
            group.priority,
            group.members.len()
        );

        let span = tracing::debug_span!("execution_group", %phase, priority = group.priority.rank());
        let outcomes = join_all(
            group
                .members
                .iter()
                .map(|member| invoke(member, step, cancel)),
        )
        .instrument(span)
        .await;

        if cancel.is_cancelled() {
            return Err(SuspendError::Cancelled(kind));
        }

        let failures: Vec<ActivityFailure> = group
            .members
            .iter()
            .zip(outcomes)
            .filter_map(|(member, outcome)| match outcome {
                CallOutcome::Failed(message) => Some(ActivityFailure {
                    activity: member.activity.name().to_string(),
                    priority: member.priority,
                    message,
                }),
                CallOutcome::Completed | CallOutcome::Cancelled => None,
            })
            .collect();

        if !failures.is_empty() {
            return Err(SuspendError::PhaseFailed { phase, failures });
        }
    }
}
