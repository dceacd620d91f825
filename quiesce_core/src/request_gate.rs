//! Admission control for incoming requests.
//!
//! [`RequestGate`] is a ready-made [`SuspendableActivity`] for the part of a
//! server that admits requests. Handlers call [`RequestGate::try_begin`] and
//! hold the returned [`RequestGuard`] for the duration of the request.
//!
//! - `prepare` closes the gate: new requests are refused.
//! - `suspend` waits until every admitted request dropped its guard.
//! - `resume` opens the gate again.

use crate::activity::{ServerResumeContext, ServerSuspendContext, SuspendableActivity};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GateState {
    accepting: bool,
    in_flight: usize,
}

#[derive(Debug)]
pub struct RequestGate {
    name: String,
    state: Arc<watch::Sender<GateState>>,
}

/// Marks one admitted request. Dropping it ends the request.
#[derive(Debug)]
#[must_use = "the request ends as soon as the guard is dropped"]
pub struct RequestGuard {
    state: Arc<watch::Sender<GateState>>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.state
            .send_modify(|state| state.in_flight = state.in_flight.saturating_sub(1));
    }
}

impl RequestGate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(watch::Sender::new(GateState {
                accepting: true,
                in_flight: 0,
            })),
        }
    }

    /// Admit a request, or return `None` while the gate is closed.
    pub fn try_begin(&self) -> Option<RequestGuard> {
        let admitted = self.state.send_if_modified(|state| {
            if !state.accepting {
                return false;
            }
            state.in_flight += 1;
            true
        });
        admitted.then(|| RequestGuard {
            state: self.state.clone(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.state.borrow().in_flight
    }

    pub fn is_accepting(&self) -> bool {
        self.state.borrow().accepting
    }

    fn set_accepting(&self, accepting: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.accepting != accepting;
            state.accepting = accepting;
            changed
        });
    }
}

#[async_trait]
impl SuspendableActivity for RequestGate {
    async fn prepare(&self, _: &ServerSuspendContext, _: CancellationToken) -> anyhow::Result<()> {
        self.set_accepting(false);
        tracing::debug!(
            "{} stopped admitting requests ({} in flight)",
            self.name,
            self.in_flight()
        );
        Ok(())
    }

    async fn suspend(&self, _: &ServerSuspendContext, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut rx = self.state.subscribe();
        let drained = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            result = rx.wait_for(|state| state.in_flight == 0) => result.is_ok(),
        };
        if !drained {
            anyhow::bail!(
                "{} stopped draining with {} requests in flight",
                self.name,
                self.in_flight()
            );
        }
        tracing::debug!("{} drained", self.name);
        Ok(())
    }

    async fn resume(&self, _: &ServerResumeContext, _: CancellationToken) -> anyhow::Result<()> {
        self.set_accepting(true);
        tracing::debug!("{} admitting requests again", self.name);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
