//! Observable suspend state of a server.
//!
//! [`SuspendStateMachine`] is the single source of truth for where the server is
//! in its suspend/resume lifecycle. It is backed by a `tokio::sync::watch`
//! channel, so any number of observers can wait for a state without polling.
//!
//! # Example
//!
//! ```rust,ignore
//! use quiesce_common::suspend_state::{SuspendState, SuspendStateMachine};
//!
//! let sm = SuspendStateMachine::new(SuspendState::Running);
//!
//! sm.transition_to(SuspendState::PreSuspend).unwrap();
//! sm.transition_to(SuspendState::Suspending).unwrap();
//! sm.transition_to(SuspendState::Suspended).unwrap();
//!
//! // Wakes up as soon as the state is published, no polling.
//! sm.wait_for(SuspendState::Suspended).await;
//! ```

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Global lifecycle state of a suspendable server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuspendState {
    /// Accepting and processing work normally
    Running,

    /// Prepare phase in progress: activities stop accepting new work
    PreSuspend,

    /// Suspend phase in progress: activities finish or abort remaining work
    Suspending,

    /// Every activity completed its suspend phase
    Suspended,
}

impl SuspendState {
    /// Returns true while a suspend traversal is between start and completion.
    pub fn is_suspending(&self) -> bool {
        matches!(self, SuspendState::PreSuspend | SuspendState::Suspending)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// `PreSuspend` may also be re-entered from a half-finished suspend, which
    /// happens when a suspend is retried after a failure or cancellation.
    pub fn can_transition_to(&self, next: SuspendState) -> bool {
        use SuspendState::*;
        matches!(
            (self, next),
            (Running, PreSuspend)
                | (PreSuspend, PreSuspend)
                | (Suspending, PreSuspend)
                | (PreSuspend, Suspending)
                | (Suspending, Suspended)
                | (PreSuspend, Running)
                | (Suspending, Running)
                | (Suspended, Running)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SuspendState::Running => "RUNNING",
            SuspendState::PreSuspend => "PRE_SUSPEND",
            SuspendState::Suspending => "SUSPENDING",
            SuspendState::Suspended => "SUSPENDED",
        }
    }
}

impl fmt::Display for SuspendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition rejected by [`SuspendStateMachine::transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid suspend state transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: SuspendState,
    pub to: SuspendState,
}

/// Observable suspend state backed by a watch channel.
///
/// Clones share the same underlying state.
#[derive(Debug, Clone)]
pub struct SuspendStateMachine {
    sender: Arc<watch::Sender<SuspendState>>,
    // Keeps the channel open even when nobody is subscribed
    _receiver: watch::Receiver<SuspendState>,
}

impl SuspendStateMachine {
    /// Create a state machine starting in `initial`.
    pub fn new(initial: SuspendState) -> Self {
        let (sender, receiver) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
            _receiver: receiver,
        }
    }

    /// Current state, without blocking.
    pub fn current(&self) -> SuspendState {
        *self.sender.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<SuspendState> {
        self.sender.subscribe()
    }

    /// Move to `next` if that is a legal transition from the current state.
    ///
    /// Re-entering the current state is a no-op for `Running` and `Suspended`
    /// and does not notify subscribers.
    pub fn transition_to(&self, next: SuspendState) -> Result<SuspendState, InvalidTransition> {
        let mut outcome = Ok(next);
        self.sender.send_if_modified(|state| {
            if *state == next && next != SuspendState::PreSuspend {
                return false;
            }
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                outcome = Err(InvalidTransition {
                    from: *state,
                    to: next,
                });
                false
            }
        });
        outcome
    }

    /// Wait until the state equals `target`. Returns immediately if it already does.
    pub async fn wait_for(&self, target: SuspendState) -> SuspendState {
        let mut rx = self.sender.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        match rx.wait_for(|state| *state == target).await {
            Ok(state) => *state,
            Err(_) => self.current(),
        }
    }
}

impl Default for SuspendStateMachine {
    fn default() -> Self {
        Self::new(SuspendState::Running)
    }
}
