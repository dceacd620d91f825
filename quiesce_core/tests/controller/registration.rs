use crate::common::{init_test_logging, settle};
use quiesce_core::{
    ControllerConfig, OperationKind, OperationStatus, ServerResumeContext, ServerSuspendContext,
    StartMode, SuspendController, SuspendPriority, SuspendState, SuspendableActivity,
    activity::Phase,
    test_utils::{CounterActivity, ManualActivity},
};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

#[tokio::test]
async fn test_registration_while_running_does_not_synchronize() {
    let controller = SuspendController::default();
    let activity = Arc::new(ManualActivity::new("idle"));
    let registration = controller.register_activity(activity.clone()).unwrap();
    assert!(registration.sync().is_none());
    assert_eq!(activity.invocations(Phase::Prepare), 0);
}

#[tokio::test]
async fn test_registration_while_suspended_prepares_then_suspends() {
    init_test_logging();
    let controller = SuspendController::default();
    settle(controller.suspend(ServerSuspendContext::new(), None))
        .await
        .unwrap();

    let counter = Arc::new(CounterActivity::new("late", Arc::new(AtomicU64::new(0))));
    let registration = controller.register_activity(counter.clone()).unwrap();
    let sync = registration.sync().expect("suspended controller must synchronize").clone();
    assert_eq!(sync.kind(), OperationKind::Synchronize);
    settle(sync).await.unwrap();

    let prepare = counter.records(Phase::Prepare);
    let suspend = counter.records(Phase::Suspend);
    assert_eq!(prepare.len(), 1);
    assert_eq!(suspend.len(), 1);
    assert!(prepare[0].finished < suspend[0].started);
    assert_eq!(controller.state(), SuspendState::Suspended);

    settle(controller.resume(ServerResumeContext::new()))
        .await
        .unwrap();
    assert_eq!(counter.records(Phase::Resume).len(), 1);
}

#[tokio::test]
async fn test_registration_during_suspend_is_synchronized_once() {
    init_test_logging();
    let controller = SuspendController::default();
    let blocker = Arc::new(ManualActivity::released("blocker"));
    blocker.block(Phase::Prepare);
    controller
        .register_activity_with_priority(blocker.clone(), SuspendPriority::new(10))
        .unwrap();

    let suspend = controller.suspend(ServerSuspendContext::new(), None);
    blocker.wait_invoked(Phase::Prepare, 1).await;

    // Registered into a group the traversal already passed, and into one it has not reached
    let clock = Arc::new(AtomicU64::new(0));
    let early = Arc::new(CounterActivity::new("early", clock.clone()));
    let late = Arc::new(CounterActivity::new("late", clock.clone()));
    let early_sync = controller
        .register_activity_with_priority(early.clone(), SuspendPriority::new(0))
        .unwrap();
    let late_sync = controller
        .register_activity_with_priority(late.clone(), SuspendPriority::new(20))
        .unwrap();
    settle(early_sync.sync().unwrap().clone()).await.unwrap();
    settle(late_sync.sync().unwrap().clone()).await.unwrap();

    blocker.release(Phase::Prepare);
    settle(suspend).await.unwrap();
    assert_eq!(controller.state(), SuspendState::Suspended);

    for counter in [&early, &late] {
        let prepare = counter.records(Phase::Prepare);
        let suspend = counter.records(Phase::Suspend);
        assert_eq!(prepare.len(), 1, "{} prepared twice", counter.name());
        assert_eq!(suspend.len(), 1, "{} suspended twice", counter.name());
        assert!(prepare[0].finished < suspend[0].started);
    }
}

#[tokio::test]
async fn test_resume_cancels_pending_synchronization() {
    init_test_logging();
    let controller = SuspendController::default();
    settle(controller.suspend(ServerSuspendContext::new(), None))
        .await
        .unwrap();

    let slow = Arc::new(ManualActivity::new("slow"));
    slow.release(Phase::Resume);
    let registration = controller.register_activity(slow.clone()).unwrap();
    let sync = registration.sync().unwrap().clone();
    slow.wait_invoked(Phase::Prepare, 1).await;

    let resume = controller.resume(ServerResumeContext::new());
    let err = settle(sync.clone()).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(sync.status(), OperationStatus::Cancelled);
    assert!(slow.was_cancelled(Phase::Prepare));

    settle(resume).await.unwrap();
    assert_eq!(slow.invocations(Phase::Suspend), 0);
    assert_eq!(slow.completions(Phase::Resume), 1);
}

#[tokio::test]
async fn test_start_suspended_synchronizes_registrations() {
    let controller =
        SuspendController::new(ControllerConfig::new().with_start_mode(StartMode::Suspended));
    let activity = Arc::new(ManualActivity::released("boot"));
    let registration = controller.register_activity(activity.clone()).unwrap();
    settle(registration.sync().unwrap().clone()).await.unwrap();
    assert_eq!(activity.completions(Phase::Prepare), 1);
    assert_eq!(activity.completions(Phase::Suspend), 1);

    let history = controller.operation_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, OperationKind::Synchronize);
}

#[tokio::test]
async fn test_unregister_mid_traversal() {
    init_test_logging();
    let controller = SuspendController::default();
    let current = Arc::new(ManualActivity::released("current"));
    let upcoming = Arc::new(ManualActivity::released("upcoming"));
    current.block(Phase::Prepare);
    let current_id = controller
        .register_activity_with_priority(current.clone(), SuspendPriority::new(1))
        .unwrap()
        .id();
    controller
        .register_activity_with_priority(upcoming.clone(), SuspendPriority::new(2))
        .unwrap();

    let suspend = controller.suspend(ServerSuspendContext::new(), None);
    current.wait_invoked(Phase::Prepare, 1).await;

    // The in-flight call finishes; neither activity is called again
    assert!(controller.unregister(current_id));
    assert!(controller.unregister_activity(&upcoming));
    current.release(Phase::Prepare);

    settle(suspend).await.unwrap();
    assert_eq!(controller.state(), SuspendState::Suspended);
    assert_eq!(current.completions(Phase::Prepare), 1);
    assert!(!current.was_cancelled(Phase::Prepare));
    assert_eq!(current.invocations(Phase::Suspend), 0);
    assert_eq!(upcoming.invocations(Phase::Prepare), 0);
    assert_eq!(upcoming.invocations(Phase::Suspend), 0);
    assert_eq!(controller.activity_count(), 0);
}
