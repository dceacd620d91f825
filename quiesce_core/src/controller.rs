//! # Suspend Controller
//!
//! [`SuspendController`] owns the activity registry and the global suspend
//! state, and drives suspend and resume traversals across every registered
//! activity.
//!
//! ## Operations
//!
//! `suspend` and `resume` return an [`OperationHandle`] immediately and run the
//! traversal on a spawned driver task:
//!
//! 1. **suspend**: the prepare phase visits the execution groups in ascending
//!    priority, then the suspend phase does the same. The state moves
//!    `Running -> PreSuspend -> Suspending -> Suspended`.
//! 2. **resume**: any in-flight suspend and every registration sync is
//!    cancelled and awaited, the state goes back to `Running`, and the resume
//!    phase visits the groups in descending priority.
//!
//! ## Suspend epoch
//!
//! From the moment a suspend starts until the next resume the controller holds
//! an *epoch* token. Suspend operations and registration syncs run on child
//! tokens of the epoch, so a single `cancel` on the epoch stops all of them.
//!
//! ## Locking
//!
//! Coordination state lives in a [`StateMachine`]; the registry has its own
//! mutex which is only ever taken after the coordination lock. Neither lock is
//! held across an `.await`.

use crate::activity::{
    ServerResumeContext, ServerSuspendContext, SuspendPriority, SuspendableActivity,
};
use crate::config::{ControllerConfig, StartMode};
use crate::error::{ActivityFailure, SuspendError};
use crate::operation::{OperationHandle, OperationKind, OperationRecord, OperationResult};
use crate::phase::{self, CallOutcome, Step};
use crate::registry::{ActivityRegistry, RegisteredActivity, RegistrationId, address_of};
use quiesce_common::{StateMachine, SuspendState, SuspendStateMachine};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Result of registering an activity.
///
/// When the controller is not running, the new activity is brought in line
/// with the rest of the server by a synchronize operation whose handle is
/// returned here.
#[derive(Debug, Clone)]
pub struct Registration {
    id: RegistrationId,
    sync: Option<OperationHandle>,
}

impl Registration {
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    /// The synchronize operation started for this registration, if any.
    pub fn sync(&self) -> Option<&OperationHandle> {
        self.sync.as_ref()
    }
}

#[derive(Debug, Default)]
struct Coordination {
    /// The suspend or resume currently driving a traversal
    in_flight: Option<OperationHandle>,
    /// Present from the start of a suspend until the next resume
    epoch: Option<CancellationToken>,
    /// Outstanding registration syncs of the current epoch
    syncs: Vec<OperationHandle>,
    /// Set when a resume starts and cleared when one completes
    resume_pending: bool,
    /// Context of the latest suspend, used to synchronize late registrations
    suspend_context: ServerSuspendContext,
    next_operation_id: u64,
}

impl Coordination {
    fn next_id(&mut self) -> u64 {
        self.next_operation_id += 1;
        self.next_operation_id
    }

    fn is_current(&self, handle: &OperationHandle) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|current| current.id() == handle.id())
    }

    fn take_syncs(&mut self) -> Vec<OperationHandle> {
        self.syncs.drain(..).filter(|h| !h.is_done()).collect()
    }
}

/// What a `suspend` or `resume` call decided to do under the coordination lock.
enum Start {
    /// Nothing to do, or joined an operation that is already running
    Ready(OperationHandle),
    /// A new driver must be spawned
    Spawn {
        handle: OperationHandle,
        preempted: Vec<OperationHandle>,
        cutoff: RegistrationId,
    },
}

#[derive(Debug)]
struct Inner {
    state: SuspendStateMachine,
    registry: Mutex<ActivityRegistry>,
    coordination: StateMachine<Coordination>,
    history: Mutex<VecDeque<OperationRecord>>,
    config: ControllerConfig,
}

/// Coordinates graceful suspend and resume of every registered activity.
///
/// Cloning is cheap; clones drive the same controller.
///
/// `suspend`, `resume`, and registering while the controller is not running
/// spawn tasks and must be called from within a Tokio runtime.
#[derive(Debug, Clone)]
pub struct SuspendController {
    inner: Arc<Inner>,
}

impl Default for SuspendController {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}

impl SuspendController {
    pub fn new(config: ControllerConfig) -> Self {
        let mut coordination = Coordination::default();
        let initial = match config.start_mode {
            StartMode::Running => SuspendState::Running,
            StartMode::Suspended => {
                coordination.epoch = Some(CancellationToken::new());
                coordination.suspend_context = ServerSuspendContext::starting();
                SuspendState::Suspended
            }
        };
        tracing::info!("Suspend controller created in {} state", initial);

        Self {
            inner: Arc::new(Inner {
                state: SuspendStateMachine::new(initial),
                registry: Mutex::new(ActivityRegistry::new()),
                coordination: StateMachine::new(coordination),
                history: Mutex::new(VecDeque::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SuspendState {
        self.inner.state.current()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<SuspendState> {
        self.inner.state.subscribe()
    }

    /// Wait until the controller reaches `state`.
    pub async fn wait_for_state(&self, state: SuspendState) -> SuspendState {
        self.inner.state.wait_for(state).await
    }

    pub fn activity_count(&self) -> usize {
        self.inner.lock_registry().len()
    }

    /// Most recent finished operations, oldest first.
    pub fn operation_history(&self) -> Vec<OperationRecord> {
        self.inner.lock_history().iter().cloned().collect()
    }

    /// Register `activity` in the default execution group.
    pub fn register_activity(
        &self,
        activity: Arc<dyn SuspendableActivity>,
    ) -> Result<Registration, SuspendError> {
        self.register_activity_with_priority(activity, SuspendPriority::DEFAULT)
    }

    /// Register `activity` in the execution group `priority`.
    ///
    /// If the controller is suspended or suspending, the activity is prepared
    /// and suspended on its own; the returned [`Registration`] carries the
    /// handle of that operation. Operations already in flight never call an
    /// activity registered after they started.
    pub fn register_activity_with_priority(
        &self,
        activity: Arc<dyn SuspendableActivity>,
        priority: SuspendPriority,
    ) -> Result<Registration, SuspendError> {
        let name = activity.name().to_string();
        let (registration, sync_target) =
            self.inner
                .coordination
                .transition(|c| -> Result<_, SuspendError> {
                    let id = self
                        .inner
                        .lock_registry()
                        .insert(activity.clone(), priority)
                        .ok_or_else(|| SuspendError::AlreadyRegistered(name.clone()))?;

                    let Some(epoch) = c.epoch.clone() else {
                        return Ok((Registration { id, sync: None }, None));
                    };
                    let handle = OperationHandle::new(
                        c.next_id(),
                        OperationKind::Synchronize,
                        epoch.child_token(),
                    );
                    c.syncs.retain(|h| !h.is_done());
                    c.syncs.push(handle.clone());
                    let target = (
                        RegisteredActivity {
                            id,
                            priority,
                            activity,
                        },
                        c.suspend_context,
                    );
                    Ok((
                        Registration {
                            id,
                            sync: Some(handle),
                        },
                        Some(target),
                    ))
                })?;

        tracing::debug!(
            "Registered activity {} {} in execution group {}",
            name,
            registration.id,
            priority
        );

        if let (Some(handle), Some((target, context))) = (&registration.sync, sync_target) {
            tracing::info!(
                "Synchronizing {} with the suspended server (operation {})",
                name,
                handle.id()
            );
            let inner = self.inner.clone();
            let span = tracing::info_span!("synchronize", operation = handle.id());
            tokio::spawn(
                inner
                    .drive_sync(handle.clone(), target, context)
                    .instrument(span),
            );
        }

        Ok(registration)
    }

    /// Remove the registration `id`. Returns false if it was not registered.
    ///
    /// A call already running for the activity finishes normally; later
    /// execution groups and operations no longer see it.
    pub fn unregister(&self, id: RegistrationId) -> bool {
        let removed = self.inner.lock_registry().remove(id);
        log_unregistered(removed)
    }

    /// Remove the registration of this activity instance.
    pub fn unregister_activity<A>(&self, activity: &Arc<A>) -> bool
    where
        A: SuspendableActivity + ?Sized,
    {
        let removed = self
            .inner
            .lock_registry()
            .remove_activity(address_of(activity));
        log_unregistered(removed)
    }

    /// Start suspending the server.
    ///
    /// `timeout` bounds how long the returned handle waits; see
    /// [`OperationHandle::wait`]. A suspend that is already running is joined
    /// rather than restarted, unless it was cancelled; suspending a suspended
    /// server completes immediately.
    pub fn suspend(
        &self,
        context: ServerSuspendContext,
        timeout: Option<Duration>,
    ) -> OperationHandle {
        let start = self.inner.coordination.transition(|c| {
            if let Some(current) = c.in_flight.as_ref()
                && current.kind() == OperationKind::Suspend
                && !current.is_cancel_requested()
            {
                tracing::debug!("Joining suspend operation {}", current.id());
                return Start::Ready(current.clone());
            }
            if c.in_flight.is_none() && self.inner.state.current() == SuspendState::Suspended {
                return Start::Ready(OperationHandle::completed(
                    c.next_id(),
                    OperationKind::Suspend,
                ));
            }

            // A resume in flight, a cancelled suspend that has not settled yet
            // and stray registration syncs are superseded
            let mut preempted: Vec<OperationHandle> = c.in_flight.take().into_iter().collect();
            preempted.extend(c.take_syncs());
            for handle in &preempted {
                handle.cancel();
            }

            let token = c
                .epoch
                .get_or_insert_with(CancellationToken::new)
                .child_token();
            let handle = OperationHandle::new(c.next_id(), OperationKind::Suspend, token);
            c.suspend_context = context;
            let cutoff = self.inner.lock_registry().cutoff();
            self.inner.set_state(SuspendState::PreSuspend);
            c.in_flight = Some(handle.clone());
            Start::Spawn {
                handle,
                preempted,
                cutoff,
            }
        });

        let handle = match start {
            Start::Ready(handle) => handle,
            Start::Spawn {
                handle,
                preempted,
                cutoff,
            } => {
                tracing::info!("Suspending server (operation {})", handle.id());
                let span = tracing::info_span!("suspend", operation = handle.id());
                tokio::spawn(
                    self.inner
                        .clone()
                        .drive_suspend(handle.clone(), context, preempted, cutoff)
                        .instrument(span),
                );
                handle
            }
        };
        handle.with_timeout(timeout)
    }

    /// Resume the server.
    ///
    /// An in-flight suspend is cancelled and has settled before any `resume`
    /// call is made. Resuming a running server completes immediately unless
    /// the previous resume did not finish.
    pub fn resume(&self, context: ServerResumeContext) -> OperationHandle {
        let start = self.inner.coordination.transition(|c| {
            if let Some(current) = c.in_flight.as_ref()
                && current.kind() == OperationKind::Resume
                && !current.is_cancel_requested()
            {
                tracing::debug!("Joining resume operation {}", current.id());
                return Start::Ready(current.clone());
            }
            if c.in_flight.is_none()
                && !c.resume_pending
                && self.inner.state.current() == SuspendState::Running
            {
                return Start::Ready(OperationHandle::completed(
                    c.next_id(),
                    OperationKind::Resume,
                ));
            }

            // Includes a cancelled resume that has not settled yet
            let mut preempted: Vec<OperationHandle> = c.in_flight.take().into_iter().collect();
            preempted.extend(c.take_syncs());
            for handle in &preempted {
                handle.cancel();
            }
            if let Some(epoch) = c.epoch.take() {
                epoch.cancel();
            }

            let handle =
                OperationHandle::new(c.next_id(), OperationKind::Resume, CancellationToken::new());
            let cutoff = self.inner.lock_registry().cutoff();
            self.inner.set_state(SuspendState::Running);
            c.resume_pending = true;
            c.in_flight = Some(handle.clone());
            Start::Spawn {
                handle,
                preempted,
                cutoff,
            }
        });

        match start {
            Start::Ready(handle) => handle,
            Start::Spawn {
                handle,
                preempted,
                cutoff,
            } => {
                tracing::info!("Resuming server (operation {})", handle.id());
                let span = tracing::info_span!("resume", operation = handle.id());
                tokio::spawn(
                    self.inner
                        .clone()
                        .drive_resume(handle.clone(), context, preempted, cutoff)
                        .instrument(span),
                );
                handle
            }
        }
    }
}

fn log_unregistered(removed: Option<RegisteredActivity>) -> bool {
    match removed {
        Some(registered) => {
            tracing::debug!(
                "Unregistered activity {} {}",
                registered.activity.name(),
                registered.id
            );
            true
        }
        None => false,
    }
}

impl Inner {
    fn lock_registry(&self) -> MutexGuard<'_, ActivityRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_history(&self) -> MutexGuard<'_, VecDeque<OperationRecord>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called with the coordination lock held.
    fn set_state(&self, next: SuspendState) {
        let previous = self.state.current();
        match self.state.transition_to(next) {
            Ok(_) if previous != next => {
                tracing::info!("Suspend state {} -> {}", previous, next)
            }
            Ok(_) => {}
            Err(err) => tracing::warn!("{}", err),
        }
    }

    async fn drive_suspend(
        self: Arc<Self>,
        handle: OperationHandle,
        context: ServerSuspendContext,
        preempted: Vec<OperationHandle>,
        cutoff: RegistrationId,
    ) {
        settle_all(&preempted).await;

        let token = handle.token().clone();
        let outcome: OperationResult = async {
            phase::run_phase(
                &self.registry,
                Step::Prepare(&context),
                OperationKind::Suspend,
                cutoff,
                &token,
            )
            .await?;

            self.coordination.transition(|c| {
                if c.is_current(&handle) {
                    self.set_state(SuspendState::Suspending);
                }
            });

            phase::run_phase(
                &self.registry,
                Step::Suspend(&context),
                OperationKind::Suspend,
                cutoff,
                &token,
            )
            .await
        }
        .await;

        self.finish(&handle, outcome);
    }

    async fn drive_resume(
        self: Arc<Self>,
        handle: OperationHandle,
        context: ServerResumeContext,
        preempted: Vec<OperationHandle>,
        cutoff: RegistrationId,
    ) {
        settle_all(&preempted).await;

        let outcome = phase::run_phase(
            &self.registry,
            Step::Resume(&context),
            OperationKind::Resume,
            cutoff,
            handle.token(),
        )
        .await;

        self.finish(&handle, outcome);
    }

    async fn drive_sync(
        self: Arc<Self>,
        handle: OperationHandle,
        target: RegisteredActivity,
        context: ServerSuspendContext,
    ) {
        let token = handle.token().clone();
        let mut outcome = Ok(());
        for step in [Step::Prepare(&context), Step::Suspend(&context)] {
            let failure = match phase::invoke(&target, step, &token).await {
                CallOutcome::Completed => continue,
                CallOutcome::Cancelled => SuspendError::Cancelled(OperationKind::Synchronize),
                CallOutcome::Failed(message) => SuspendError::PhaseFailed {
                    phase: step.phase(),
                    failures: vec![ActivityFailure {
                        activity: target.activity.name().to_string(),
                        priority: target.priority,
                        message,
                    }],
                },
            };
            outcome = Err(failure);
            break;
        }

        self.coordination.transition(|c| {
            c.syncs.retain(|h| h.id() != handle.id());
            handle.complete(outcome);
        });
        self.report(&handle);
    }

    /// Publish the outcome of a suspend or resume and update the state if the
    /// operation was not superseded in the meantime.
    fn finish(&self, handle: &OperationHandle, outcome: OperationResult) {
        self.coordination.transition(|c| {
            if c.is_current(handle) {
                c.in_flight = None;
                if outcome.is_ok() {
                    match handle.kind() {
                        OperationKind::Suspend => self.set_state(SuspendState::Suspended),
                        OperationKind::Resume => c.resume_pending = false,
                        OperationKind::Synchronize => {}
                    }
                }
            }
            // Published under the lock so waiters observe the final state
            handle.complete(outcome);
        });
        self.report(handle);
    }

    fn report(&self, handle: &OperationHandle) {
        let record = handle.record();
        match &record.message {
            None => tracing::info!("{} operation {} completed", record.kind, record.id),
            Some(message) => tracing::warn!(
                "{} operation {} ended as {:?}: {}",
                record.kind,
                record.id,
                record.status,
                message
            ),
        }

        let limit = self.config.history_limit;
        let mut history = self.lock_history();
        history.push_back(record);
        while history.len() > limit {
            history.pop_front();
        }
    }
}

async fn settle_all(handles: &[OperationHandle]) {
    for handle in handles {
        let _ = handle.settled().await;
    }
}
