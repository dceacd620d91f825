#![allow(dead_code)]
use quiesce_core::{
    OperationHandle, SuspendController, SuspendPriority,
    activity::Phase,
    operation::OperationResult,
    test_utils::{CallRecord, CounterActivity, TEST_TIMEOUT, wait_for_condition},
};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

pub fn init_test_logging() {
    quiesce_core::test_utils::init_test_logging();
}

/// Await an operation, failing the test if it hangs.
pub async fn settle(handle: OperationHandle) -> OperationResult {
    tokio::time::timeout(TEST_TIMEOUT, handle.into_future())
        .await
        .expect("operation did not settle in time")
}

/// Wait until the operation finished without consuming the handle.
pub async fn wait_done(handle: &OperationHandle) -> bool {
    let handle = handle.clone();
    wait_for_condition(TEST_TIMEOUT, Duration::from_millis(5), move || {
        let handle = handle.clone();
        async move { handle.is_done() }
    })
    .await
}

/// A counter activity together with the rank it is registered under.
pub struct Ranked {
    pub rank: u32,
    pub counter: Arc<CounterActivity>,
}

/// Six counters on one clock: two per execution group 10, 20 and 30.
pub fn six_counters() -> Vec<Ranked> {
    let clock = Arc::new(AtomicU64::new(0));
    [("a", 10), ("b", 10), ("c", 20), ("d", 20), ("e", 30), ("f", 30)]
        .into_iter()
        .map(|(name, rank)| Ranked {
            rank,
            counter: Arc::new(CounterActivity::new(name, clock.clone())),
        })
        .collect()
}

pub fn register_all(controller: &SuspendController, activities: &[&Ranked]) {
    for ranked in activities {
        controller
            .register_activity_with_priority(
                ranked.counter.clone(),
                SuspendPriority::new(ranked.rank),
            )
            .expect("registration failed");
    }
}

fn record(ranked: &Ranked, phase: Phase) -> CallRecord {
    ranked
        .counter
        .record(phase)
        .unwrap_or_else(|| panic!("{} never ran {}", ranked.rank, phase))
}

/// Check the group ordering of one suspend followed by one resume.
pub fn assert_cycle_order(activities: &[&Ranked]) {
    for a in activities {
        for b in activities {
            if a.rank < b.rank {
                assert!(
                    record(a, Phase::Prepare).finished < record(b, Phase::Prepare).started,
                    "prepare of group {} overlapped group {}",
                    a.rank,
                    b.rank
                );
                assert!(
                    record(a, Phase::Suspend).finished < record(b, Phase::Suspend).started,
                    "suspend of group {} overlapped group {}",
                    a.rank,
                    b.rank
                );
                assert!(
                    record(b, Phase::Resume).finished < record(a, Phase::Resume).started,
                    "resume of group {} did not wait for group {}",
                    a.rank,
                    b.rank
                );
            }
            assert!(
                record(a, Phase::Prepare).finished < record(b, Phase::Suspend).started,
                "suspend started before every prepare completed"
            );
            assert!(
                record(a, Phase::Suspend).finished < record(b, Phase::Resume).started,
                "resume started before the suspend completed"
            );
        }
    }
}

/// Members of one group all start before any of them finishes.
pub fn assert_group_concurrent(activities: &[&Ranked], phase: Phase) {
    for a in activities {
        for b in activities {
            if a.rank == b.rank {
                assert!(
                    record(a, phase).started < record(b, phase).finished,
                    "group {} ran {} sequentially",
                    a.rank,
                    phase
                );
            }
        }
    }
}
