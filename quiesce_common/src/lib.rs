//! Lifecycle primitives shared by the quiesce crates.
//!
//! - [`state_machine`]: a mutex-guarded wrapper for atomic state transitions.
//! - [`suspend_state`]: the observable global suspend state of a server.

pub mod state_machine;
pub mod suspend_state;

pub use state_machine::StateMachine;
pub use suspend_state::{InvalidTransition, SuspendState, SuspendStateMachine};
