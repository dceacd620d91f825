//! Test helpers for code built on the suspend controller.
//!
//! - [`CounterActivity`] stamps every call with a shared logical clock so tests
//!   can check the order in which execution groups ran.
//! - [`ManualActivity`] blocks each call until the test releases (or fails)
//!   it, and records invocations, completions and cancellations.
//! - [`wait_for_condition`] polls an async predicate with a deadline.
//!
//! These APIs are intended for test-only code paths.

use crate::activity::{Phase, ServerResumeContext, ServerSuspendContext, SuspendableActivity};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Default timeout for waits in tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize verbose logging for tests.
pub fn init_test_logging() {
    crate::utils::logging::init_test_logging();
}

/// Wait for an async condition to become true, polling at a fixed interval.
/// Returns true if the condition succeeds within the timeout.
pub async fn wait_for_condition<F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut condition: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if condition().await {
            return true;
        }

        if start.elapsed() >= timeout {
            return false;
        }

        tokio::time::sleep(interval).await;
    }
}

/// Logical timestamps of one call: when it started and when it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRecord {
    pub started: u64,
    pub finished: u64,
}

/// Activity that records the logical time of every call.
///
/// All counters built on the same clock share one timeline, so comparing
/// records across activities shows which calls happened before which.
pub struct CounterActivity {
    name: String,
    clock: Arc<AtomicU64>,
    records: Mutex<HashMap<Phase, Vec<CallRecord>>>,
}

impl CounterActivity {
    pub fn new(name: impl Into<String>, clock: Arc<AtomicU64>) -> Self {
        Self {
            name: name.into(),
            clock,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Most recent call for `phase`.
    pub fn record(&self, phase: Phase) -> Option<CallRecord> {
        self.records(phase).last().copied()
    }

    pub fn records(&self, phase: Phase) -> Vec<CallRecord> {
        self.lock_records()
            .get(&phase)
            .cloned()
            .unwrap_or_default()
    }

    /// Forget every recorded call.
    pub fn reset(&self) {
        self.lock_records().clear();
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, HashMap<Phase, Vec<CallRecord>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn stamp(&self, phase: Phase) -> anyhow::Result<()> {
        let started = self.tick();
        // Give the rest of the group a chance to start before we finish
        tokio::task::yield_now().await;
        let finished = self.tick();
        self.lock_records()
            .entry(phase)
            .or_default()
            .push(CallRecord { started, finished });
        Ok(())
    }
}

#[async_trait]
impl SuspendableActivity for CounterActivity {
    async fn prepare(&self, _: &ServerSuspendContext, _: CancellationToken) -> anyhow::Result<()> {
        self.stamp(Phase::Prepare).await
    }

    async fn suspend(&self, _: &ServerSuspendContext, _: CancellationToken) -> anyhow::Result<()> {
        self.stamp(Phase::Suspend).await
    }

    async fn resume(&self, _: &ServerResumeContext, _: CancellationToken) -> anyhow::Result<()> {
        self.stamp(Phase::Resume).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct PhaseGate {
    release: watch::Sender<Option<Result<(), String>>>,
    invocations: watch::Sender<usize>,
    completions: AtomicUsize,
    cancellations: AtomicUsize,
    tokens: Mutex<Vec<CancellationToken>>,
}

impl PhaseGate {
    fn new() -> Self {
        Self {
            release: watch::Sender::new(None),
            invocations: watch::Sender::new(0),
            completions: AtomicUsize::new(0),
            cancellations: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
        }
    }
}

/// Counts a call as cancelled if its future is dropped before it returned.
struct DropProbe<'a> {
    cancellations: &'a AtomicUsize,
    armed: bool,
}

impl Drop for DropProbe<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cancellations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Activity whose calls only return when the test says so.
///
/// A release (or failure) set for a phase stays in effect for later calls of
/// that phase until [`ManualActivity::block`] is called.
pub struct ManualActivity {
    name: String,
    gates: HashMap<Phase, PhaseGate>,
}

impl ManualActivity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gates: Phase::ALL.iter().map(|p| (*p, PhaseGate::new())).collect(),
        }
    }

    /// An activity whose calls all complete immediately.
    pub fn released(name: impl Into<String>) -> Self {
        let activity = Self::new(name);
        for phase in Phase::ALL {
            activity.release(phase);
        }
        activity
    }

    /// Let pending and future calls of `phase` complete successfully.
    pub fn release(&self, phase: Phase) {
        self.gate(phase).release.send_replace(Some(Ok(())));
    }

    /// Let pending and future calls of `phase` fail with `message`.
    pub fn fail(&self, phase: Phase, message: impl Into<String>) {
        self.gate(phase).release.send_replace(Some(Err(message.into())));
    }

    /// Make future calls of `phase` block again.
    pub fn block(&self, phase: Phase) {
        self.gate(phase).release.send_replace(None);
    }

    pub fn invocations(&self, phase: Phase) -> usize {
        *self.gate(phase).invocations.borrow()
    }

    /// Calls of `phase` that returned, successfully or not.
    pub fn completions(&self, phase: Phase) -> usize {
        self.gate(phase).completions.load(Ordering::SeqCst)
    }

    /// Calls of `phase` that were dropped before they returned.
    pub fn cancellations(&self, phase: Phase) -> usize {
        self.gate(phase).cancellations.load(Ordering::SeqCst)
    }

    pub fn was_cancelled(&self, phase: Phase) -> bool {
        self.cancellations(phase) > 0
    }

    /// Token handed to the most recent call of `phase`.
    pub fn last_token(&self, phase: Phase) -> Option<CancellationToken> {
        self.gate(phase)
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// Wait until `phase` has been invoked at least `count` times.
    pub async fn wait_invoked(&self, phase: Phase, count: usize) {
        let mut rx = self.gate(phase).invocations.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }

    fn gate(&self, phase: Phase) -> &PhaseGate {
        // Every phase gets a gate in `new`
        &self.gates[&phase]
    }

    async fn run(&self, phase: Phase, token: CancellationToken) -> anyhow::Result<()> {
        let gate = self.gate(phase);
        gate.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(token);
        gate.invocations.send_modify(|n| *n += 1);

        let mut probe = DropProbe {
            cancellations: &gate.cancellations,
            armed: true,
        };
        let mut rx = gate.release.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|released| released.clone())
            .unwrap_or_else(|| Err("release channel closed".to_string()));
        probe.armed = false;

        gate.completions.fetch_add(1, Ordering::SeqCst);
        outcome.map_err(anyhow::Error::msg)
    }
}

#[async_trait]
impl SuspendableActivity for ManualActivity {
    async fn prepare(&self, _: &ServerSuspendContext, cancel: CancellationToken) -> anyhow::Result<()> {
        self.run(Phase::Prepare, cancel).await
    }

    async fn suspend(&self, _: &ServerSuspendContext, cancel: CancellationToken) -> anyhow::Result<()> {
        self.run(Phase::Suspend, cancel).await
    }

    async fn resume(&self, _: &ServerResumeContext, cancel: CancellationToken) -> anyhow::Result<()> {
        self.run(Phase::Resume, cancel).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
