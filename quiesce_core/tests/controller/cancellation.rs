use crate::common::{init_test_logging, settle, wait_done};
use quiesce_core::{
    OperationKind, OperationStatus, ServerResumeContext, ServerSuspendContext, SuspendController,
    SuspendPriority, SuspendState, activity::Phase, test_utils::ManualActivity,
};
use std::sync::Arc;

/// `first` in group 1 and `second` in group 2, everything blocked.
fn two_groups() -> (SuspendController, Arc<ManualActivity>, Arc<ManualActivity>) {
    let controller = SuspendController::default();
    let first = Arc::new(ManualActivity::new("first"));
    let second = Arc::new(ManualActivity::new("second"));
    controller
        .register_activity_with_priority(first.clone(), SuspendPriority::new(1))
        .unwrap();
    controller
        .register_activity_with_priority(second.clone(), SuspendPriority::new(2))
        .unwrap();
    (controller, first, second)
}

#[tokio::test]
async fn test_cancel_during_prepare() {
    init_test_logging();
    let (controller, first, second) = two_groups();

    let handle = controller.suspend(ServerSuspendContext::new(), None);
    first.wait_invoked(Phase::Prepare, 1).await;
    assert_eq!(controller.state(), SuspendState::PreSuspend);

    handle.cancel();
    let err = settle(handle.clone()).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(handle.status(), OperationStatus::Cancelled);

    assert!(first.was_cancelled(Phase::Prepare));
    assert!(first.last_token(Phase::Prepare).unwrap().is_cancelled());
    assert_eq!(first.completions(Phase::Prepare), 0);
    assert_eq!(second.invocations(Phase::Prepare), 0);
    assert_eq!(first.invocations(Phase::Suspend), 0);
    assert_eq!(controller.state(), SuspendState::PreSuspend);

    // The half-suspended server can still be resumed
    first.release(Phase::Resume);
    second.release(Phase::Resume);
    settle(controller.resume(ServerResumeContext::new()))
        .await
        .unwrap();
    assert_eq!(controller.state(), SuspendState::Running);
    assert_eq!(first.invocations(Phase::Resume), 1);
    assert_eq!(second.invocations(Phase::Resume), 1);
}

#[tokio::test]
async fn test_cancel_during_suspend() {
    init_test_logging();
    let (controller, first, second) = two_groups();
    first.release(Phase::Prepare);
    second.release(Phase::Prepare);

    let handle = controller.suspend(ServerSuspendContext::new(), None);
    first.wait_invoked(Phase::Suspend, 1).await;
    assert_eq!(controller.state(), SuspendState::Suspending);
    assert_eq!(second.completions(Phase::Prepare), 1);

    handle.cancel();
    assert!(settle(handle).await.unwrap_err().is_cancelled());
    assert!(first.was_cancelled(Phase::Suspend));
    assert_eq!(second.invocations(Phase::Suspend), 0);
    assert_eq!(controller.state(), SuspendState::Suspending);

    // A retry restarts from the prepare phase
    first.release(Phase::Suspend);
    second.release(Phase::Suspend);
    settle(controller.suspend(ServerSuspendContext::new(), None))
        .await
        .unwrap();
    assert_eq!(controller.state(), SuspendState::Suspended);
    assert_eq!(first.invocations(Phase::Prepare), 2);
    assert_eq!(second.completions(Phase::Suspend), 1);
}

#[tokio::test]
async fn test_resume_preempts_in_flight_suspend() {
    init_test_logging();
    let (controller, first, second) = two_groups();
    first.release(Phase::Prepare);
    second.release(Phase::Prepare);

    let suspend = controller.suspend(ServerSuspendContext::new(), None);
    first.wait_invoked(Phase::Suspend, 1).await;

    let resume = controller.resume(ServerResumeContext::new());
    assert_eq!(controller.state(), SuspendState::Running);
    assert!(suspend.is_cancel_requested());

    // No resume call is made before the suspend settled
    second.wait_invoked(Phase::Resume, 1).await;
    assert!(suspend.is_done());
    assert_eq!(suspend.status(), OperationStatus::Cancelled);
    assert!(first.was_cancelled(Phase::Suspend));
    assert_eq!(first.invocations(Phase::Resume), 0);

    second.release(Phase::Resume);
    first.wait_invoked(Phase::Resume, 1).await;
    first.release(Phase::Resume);
    settle(resume).await.unwrap();
    assert_eq!(controller.state(), SuspendState::Running);
    assert_eq!(second.invocations(Phase::Suspend), 0);

    let history = controller.operation_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].kind, OperationKind::Suspend);
    assert_eq!(history[0].status, OperationStatus::Cancelled);
    assert_eq!(history[1].kind, OperationKind::Resume);
    assert_eq!(history[1].status, OperationStatus::Completed);
}

#[tokio::test]
async fn test_cancel_during_resume() {
    init_test_logging();
    let (controller, first, second) = two_groups();
    for activity in [&first, &second] {
        activity.release(Phase::Prepare);
        activity.release(Phase::Suspend);
    }
    settle(controller.suspend(ServerSuspendContext::new(), None))
        .await
        .unwrap();

    let resume = controller.resume(ServerResumeContext::new());
    second.wait_invoked(Phase::Resume, 1).await;
    resume.cancel();
    assert!(settle(resume.clone()).await.unwrap_err().is_cancelled());
    assert!(second.was_cancelled(Phase::Resume));
    assert_eq!(first.invocations(Phase::Resume), 0);

    // The resume did not finish, so resuming again runs the phase again
    first.release(Phase::Resume);
    second.release(Phase::Resume);
    let retry = controller.resume(ServerResumeContext::new());
    assert_ne!(retry.id(), resume.id());
    settle(retry).await.unwrap();
    assert_eq!(second.invocations(Phase::Resume), 2);
    assert_eq!(first.completions(Phase::Resume), 1);

    // Now it is a no-op
    let noop = controller.resume(ServerResumeContext::new());
    assert!(noop.is_done());
    assert_eq!(second.invocations(Phase::Resume), 2);
}

#[tokio::test]
async fn test_cancel_after_completion_is_ignored() {
    let (controller, first, second) = two_groups();
    for activity in [&first, &second] {
        activity.release(Phase::Prepare);
        activity.release(Phase::Suspend);
    }
    let handle = controller.suspend(ServerSuspendContext::new(), None);
    assert!(wait_done(&handle).await);

    handle.cancel();
    assert!(!handle.is_cancel_requested());
    assert_eq!(handle.status(), OperationStatus::Completed);
    assert_eq!(controller.state(), SuspendState::Suspended);
}

#[tokio::test]
async fn test_suspend_right_after_cancel_starts_a_new_operation() {
    init_test_logging();
    let (controller, first, second) = two_groups();

    let cancelled = controller.suspend(ServerSuspendContext::new(), None);
    first.wait_invoked(Phase::Prepare, 1).await;
    cancelled.cancel();
    for activity in [&first, &second] {
        activity.release(Phase::Prepare);
        activity.release(Phase::Suspend);
    }

    // The cancelled driver has not finished yet; the retry must not join it
    let retry = controller.suspend(ServerSuspendContext::new(), None);
    assert_ne!(retry.id(), cancelled.id());
    settle(retry).await.unwrap();
    assert!(settle(cancelled.clone()).await.unwrap_err().is_cancelled());

    assert_eq!(controller.state(), SuspendState::Suspended);
    assert!(first.was_cancelled(Phase::Prepare));
    assert_eq!(first.invocations(Phase::Prepare), 2);
    assert_eq!(first.completions(Phase::Prepare), 1);
    assert_eq!(second.completions(Phase::Suspend), 1);

    let history = controller.operation_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, OperationStatus::Cancelled);
    assert_eq!(history[1].status, OperationStatus::Completed);
}

#[tokio::test]
async fn test_resume_right_after_cancel_runs_again() {
    init_test_logging();
    let (controller, first, second) = two_groups();
    for activity in [&first, &second] {
        activity.release(Phase::Prepare);
        activity.release(Phase::Suspend);
    }
    settle(controller.suspend(ServerSuspendContext::new(), None))
        .await
        .unwrap();

    let cancelled = controller.resume(ServerResumeContext::new());
    second.wait_invoked(Phase::Resume, 1).await;
    cancelled.cancel();
    first.release(Phase::Resume);
    second.release(Phase::Resume);

    let retry = controller.resume(ServerResumeContext::new());
    assert_ne!(retry.id(), cancelled.id());
    settle(retry).await.unwrap();
    assert!(settle(cancelled).await.unwrap_err().is_cancelled());

    assert_eq!(controller.state(), SuspendState::Running);
    assert!(second.was_cancelled(Phase::Resume));
    assert_eq!(second.invocations(Phase::Resume), 2);
    assert_eq!(second.completions(Phase::Resume), 1);
    assert_eq!(first.completions(Phase::Resume), 1);
    assert!(controller.resume(ServerResumeContext::new()).is_done());
}
