//! The suspendable activity capability and the values handed to it.
//!
//! Any subsystem that must take part in a graceful suspend implements
//! [`SuspendableActivity`] and registers itself with the
//! [`SuspendController`](crate::controller::SuspendController), together with a
//! [`SuspendPriority`] that decides which execution group it belongs to.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use quiesce_core::activity::{ServerResumeContext, ServerSuspendContext, SuspendableActivity};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Connector;
//!
//! #[async_trait]
//! impl SuspendableActivity for Connector {
//!     async fn prepare(&self, _ctx: &ServerSuspendContext, _cancel: CancellationToken) -> anyhow::Result<()> {
//!         // stop accepting new connections
//!         Ok(())
//!     }
//!
//!     async fn suspend(&self, _ctx: &ServerSuspendContext, _cancel: CancellationToken) -> anyhow::Result<()> {
//!         // wait for open exchanges to finish
//!         Ok(())
//!     }
//!
//!     async fn resume(&self, _ctx: &ServerResumeContext, _cancel: CancellationToken) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Context for one suspend operation, handed unchanged to every `prepare` and `suspend` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerSuspendContext {
    starting: bool,
    stopping: bool,
}

impl ServerSuspendContext {
    /// A suspend requested by an administrator while the server keeps running.
    pub fn new() -> Self {
        Self::default()
    }

    /// A suspend issued while the server is booting in suspended mode.
    pub fn starting() -> Self {
        Self {
            starting: true,
            stopping: false,
        }
    }

    /// A suspend issued as the first step of a graceful shutdown.
    pub fn stopping() -> Self {
        Self {
            starting: false,
            stopping: true,
        }
    }

    pub fn is_starting(&self) -> bool {
        self.starting
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }
}

/// Context for one resume operation, handed unchanged to every `resume` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerResumeContext {
    starting: bool,
}

impl ServerResumeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The resume that ends a boot in suspended mode.
    pub fn starting() -> Self {
        Self { starting: true }
    }

    pub fn is_starting(&self) -> bool {
        self.starting
    }
}

/// The three calls an activity receives over a suspend/resume cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Prepare,
    Suspend,
    Resume,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Prepare, Phase::Suspend, Phase::Resume];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::Suspend => "suspend",
            Phase::Resume => "resume",
        }
    }

    /// Resume walks the execution groups in the reverse of suspend order.
    pub(crate) fn is_descending(&self) -> bool {
        matches!(self, Phase::Resume)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution group of an activity.
///
/// Lower ranks are suspended first and resumed last. Activities sharing a rank
/// form one group and are called concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SuspendPriority(u32);

impl SuspendPriority {
    pub const FIRST: SuspendPriority = SuspendPriority(0);
    pub const EARLY: SuspendPriority = SuspendPriority(25);
    pub const DEFAULT: SuspendPriority = SuspendPriority(50);
    pub const LATE: SuspendPriority = SuspendPriority(75);
    pub const LAST: SuspendPriority = SuspendPriority(100);

    pub const fn new(rank: u32) -> Self {
        Self(rank)
    }

    pub const fn rank(&self) -> u32 {
        self.0
    }
}

impl Default for SuspendPriority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<u32> for SuspendPriority {
    fn from(rank: u32) -> Self {
        Self(rank)
    }
}

impl fmt::Display for SuspendPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A participant in graceful suspend and resume.
///
/// Every call receives the token of the operation it belongs to. When the
/// operation is cancelled (by its caller, or by a `resume` preempting a
/// `suspend`) the token is cancelled and the pending call is dropped by the
/// controller. Implementations that hand work to other tasks should watch the
/// token there.
///
/// Errors are reported to the caller of the operation; the controller never
/// retries a call.
#[async_trait]
pub trait SuspendableActivity: Send + Sync + 'static {
    /// Stop accepting new work. In-flight work may keep running.
    async fn prepare(
        &self,
        _context: &ServerSuspendContext,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Finish or abort whatever work remains.
    async fn suspend(
        &self,
        context: &ServerSuspendContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;

    /// Start accepting work again.
    async fn resume(
        &self,
        context: &ServerResumeContext,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;

    /// Name used in logs and failure reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}
