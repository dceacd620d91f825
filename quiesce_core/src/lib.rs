//! # Quiesce Core
//!
//! Graceful suspend and resume for servers made of many independent
//! subsystems. Each subsystem implements [`SuspendableActivity`] and registers
//! with a [`SuspendController`]; the controller then walks every activity
//! through a two-phase suspend (stop accepting work, then finish remaining
//! work) and a reverse-order resume.
//!
//! ## Key Concepts
//!
//! - **Execution groups**: activities are grouped by [`SuspendPriority`]. Groups
//!   run strictly one after another, ascending for suspend and descending for
//!   resume; members of one group are called concurrently.
//! - **Operation handles**: `suspend` and `resume` return an
//!   [`OperationHandle`] at once. Await it, poll its status, or cancel it.
//!   Cancelling reaches every outstanding activity call through a
//!   `CancellationToken`.
//! - **Preemption**: `resume` cancels an in-flight suspend and only starts
//!   calling `resume` once the suspend settled.
//! - **Late registration**: an activity registered while the server is
//!   suspended (or suspending) is prepared and suspended on its own.
//!
//! ## Modules
//!
//! - **`activity`**: the activity trait, contexts and priorities.
//! - **`controller`**: the suspend controller.
//! - **`operation`**: operation handles and history records.
//! - **`registry`**: registration ids.
//! - **`request_gate`**: a ready-made activity for request admission.
//! - **`shutdown`**: graceful shutdown helpers.
//! - **`config`**: TOML-backed controller configuration.
//! - **`utils`**: logging setup and time serialization.

pub mod activity;
pub mod config;
pub mod controller;
pub mod error;
pub mod operation;
mod phase;
pub mod registry;
pub mod request_gate;
pub mod shutdown;
pub mod utils;

// Test utilities
pub mod test_utils;

// Re-export main types for easier use
pub use activity::{ServerResumeContext, ServerSuspendContext, SuspendPriority, SuspendableActivity};
pub use config::{ControllerConfig, StartMode};
pub use controller::{Registration, SuspendController};
pub use error::{ActivityFailure, SuspendError};
pub use operation::{OperationHandle, OperationKind, OperationRecord, OperationStatus};
pub use quiesce_common::{SuspendState, SuspendStateMachine};
pub use request_gate::{RequestGate, RequestGuard};
