use std::sync::{Mutex, MutexGuard, PoisonError};

/// A thread-safe wrapper that serializes every transition of a state `S`.
///
/// The suspend controller keeps all of its coordination bookkeeping (the
/// in-flight operation, the suspend epoch, ...) behind one `StateMachine` so
/// that a decision and the mutation it implies happen under the same lock.
///
/// A panic inside a transition poisons the inner mutex; the state is still
/// handed out afterwards, since every transition leaves it consistent before
/// it can panic.
///
/// # Example
///
/// ```rust
/// use quiesce_common::state_machine::StateMachine;
///
/// enum Gate {
///     Open,
///     Closed,
/// }
///
/// let machine = StateMachine::new(Gate::Open);
///
/// let outcome = machine.transition(|gate| match gate {
///     Gate::Open => {
///         *gate = Gate::Closed;
///         "closed"
///     }
///     Gate::Closed => "already closed",
/// });
/// assert_eq!(outcome, "closed");
/// ```
#[derive(Debug, Default)]
pub struct StateMachine<S> {
    state: Mutex<S>,
}

impl<S> StateMachine<S> {
    /// Creates a new `StateMachine` in the given initial state.
    pub fn new(initial_state: S) -> Self {
        Self {
            state: Mutex::new(initial_state),
        }
    }

    /// Lock the state for a plain read.
    ///
    /// For anything that decides and then mutates, prefer [`StateMachine::transition`].
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the current state while holding the lock and return its result.
    pub fn transition<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut state = self.lock();
        f(&mut state)
    }
}
